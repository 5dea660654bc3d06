//! Detection of objects lying on the clean borders between neighboring tiles.
//!
//! For every interior clean border, the one pixel wide line at the border is read from the full
//! mask of each of the two tiles sharing it, restricted to the clean range of their row (for
//! vertical borders) or column (for horizontal borders). Every non-zero value on such a line is
//! a border cell of that tile.

use crate::indices::{AxisIndices, GridIndices};
use ndarray::{ArrayView1, ArrayView2, Axis};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

pub(crate) type BorderCells = BTreeMap<(usize, usize), BTreeSet<u32>>;

/// Collect the labels touching the clean borders inside each tile, keyed by tile.
pub(crate) fn find_border_cells(
    masks: &BTreeMap<(usize, usize), ArrayView2<u32>>,
    indices: &GridIndices,
) -> BorderCells {
    let mut cells = BorderCells::new();
    let (rows, cols) = indices.tiling();

    // Vertical borders between columns of tiles
    for i in 0..rows {
        let span = indices.rows.clean(i);
        for j in 0..cols.saturating_sub(1) {
            let border = indices.cols.borders[j + 1];
            for tile in [(i, j), (i, j + 1)] {
                let Some(mask) = masks.get(&tile) else {
                    continue;
                };
                let line = line_in_tile(*mask, Axis(1), border, &indices.cols, tile.1);
                scan(&mut cells, tile, line, &span, &indices.rows, tile.0);
            }
        }
    }

    // Horizontal borders between rows of tiles
    for j in 0..cols {
        let span = indices.cols.clean(j);
        for i in 0..rows.saturating_sub(1) {
            let border = indices.rows.borders[i + 1];
            for tile in [(i, j), (i + 1, j)] {
                let Some(mask) = masks.get(&tile) else {
                    continue;
                };
                let line = line_in_tile(*mask, Axis(0), border, &indices.rows, tile.0);
                scan(&mut cells, tile, line, &span, &indices.cols, tile.1);
            }
        }
    }

    cells
}

/// The line of a tile's mask at image position `border` along `axis`, if the tile covers it.
fn line_in_tile<'a>(
    mask: ArrayView2<'a, u32>,
    axis: Axis,
    border: usize,
    along: &AxisIndices,
    k: usize,
) -> Option<ArrayView1<'a, u32>> {
    let local = border.checked_sub(along.tile(k).start)?;
    (local < mask.len_of(axis)).then(|| mask.index_axis_move(axis, local))
}

fn scan(
    cells: &mut BorderCells,
    tile: (usize, usize),
    line: Option<ArrayView1<u32>>,
    span: &Range<usize>,
    across: &AxisIndices,
    k: usize,
) {
    let Some(line) = line else {
        return;
    };
    let origin = across.tile(k).start;
    let start = span.start.saturating_sub(origin).min(line.len());
    let end = span.end.saturating_sub(origin).min(line.len());

    let found = line
        .iter()
        .skip(start)
        .take(end.saturating_sub(start))
        .filter(|&&v| v != 0)
        .copied()
        .collect::<BTreeSet<_>>();
    if !found.is_empty() {
        cells.entry(tile).or_default().extend(found);
    }
}
