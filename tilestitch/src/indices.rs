//! This module contains the pure index arithmetic behind tiling: how many tiles fit along an axis
//! for a given tile size and overlap fraction, the pixel range covered by every tile, and the
//! "clean" border points which assign every pixel of the full image to exactly one tile when the
//! tiles are stitched back together.
//!
//! All ranges are half-open, `[start, end)`. Everything here is deterministic, so results for a
//! given set of parameters can be cached freely.

use crate::errors::TileError;
use crate::Result;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::warn;

/// Tiling of a single axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisIndices {
    /// The number of tiles along the axis
    pub tiling: usize,

    /// The `[start, end)` bounds of every tile, overlap included
    pub tile_ranges: Vec<[usize; 2]>,

    /// The `tiling + 1` clean cut points, starting at 0 and ending at the axis size
    pub borders: Vec<usize>,
}

impl AxisIndices {
    pub fn axis_size(&self) -> usize {
        self.borders.last().copied().unwrap_or(0)
    }

    /// The full pixel range of tile `k` along this axis.
    pub fn tile(&self, k: usize) -> Range<usize> {
        self.tile_ranges[k][0]..self.tile_ranges[k][1]
    }

    /// The clean (non-overlapping) pixel range owned by tile `k` along this axis.
    pub fn clean(&self, k: usize) -> Range<usize> {
        self.borders[k]..self.borders[k + 1]
    }

    /// Rescale every index by `scale`, rounding to the nearest integer with ties to even.
    fn scaled(&self, scale: f64, axis_size: usize) -> AxisIndices {
        let s = |v: usize| (v as f64 * scale).round_ties_even() as usize;
        let tile_ranges = self
            .tile_ranges
            .iter()
            .map(|[a, b]| [s(*a), s(*b)])
            .collect();
        let mut borders: Vec<usize> = self.borders.iter().map(|v| s(*v)).collect();
        if let Some(last) = borders.last_mut() {
            *last = axis_size;
        }

        AxisIndices {
            tiling: self.tiling,
            tile_ranges,
            borders,
        }
    }
}

/// The number of overlapping pixels between two neighboring tiles of `tile_size` pixels.
pub fn overlap_size(tile_size: usize, overlap: f64) -> usize {
    (tile_size as f64 * overlap).round_ties_even() as usize
}

fn check_overlap(overlap: f64) -> Result<()> {
    if !overlap.is_finite() || !(0.0..1.0).contains(&overlap) {
        return Err(TileError::InvalidGeometry(format!(
            "overlap fraction {overlap} must lie in [0, 1)"
        )));
    }
    Ok(())
}

/// Compute the tiling of a single axis.
///
/// # Arguments
///
/// * `axis_size`: the number of pixels along the axis
/// * `tile_size`: the nominal number of pixels in each tile, overlap included
/// * `overlap`: the fraction of `tile_size` shared between neighboring tiles
///
/// returns: Result<AxisIndices, TileError>
///
/// # Examples
///
/// ```
/// use tilestitch::indices::compute_1d;
/// let axis = compute_1d(100, 60, 0.1).unwrap();
/// assert_eq!(axis.tiling, 2);
/// assert_eq!(axis.tile_ranges, vec![[0, 60], [54, 100]]);
/// assert_eq!(axis.borders, vec![0, 57, 100]);
/// ```
pub fn compute_1d(axis_size: usize, tile_size: usize, overlap: f64) -> Result<AxisIndices> {
    if axis_size == 0 || tile_size == 0 {
        return Err(TileError::InvalidGeometry(format!(
            "axis size ({axis_size}) and tile size ({tile_size}) must be positive"
        )));
    }
    check_overlap(overlap)?;

    let overlap_px = overlap_size(tile_size, overlap);
    if tile_size <= overlap_px {
        return Err(TileError::InvalidGeometry(format!(
            "tile size {tile_size} must exceed the overlap size {overlap_px}"
        )));
    }

    let step = tile_size - overlap_px;
    let tiling = if axis_size <= overlap_px {
        1
    } else {
        (axis_size - overlap_px).div_ceil(step).max(1)
    };

    let tile_ranges: Vec<[usize; 2]> = (0..tiling)
        .map(|k| {
            let start = k * step;
            let end = if k + 1 == tiling { axis_size } else { start + tile_size };
            [start, end]
        })
        .collect();

    let half = (overlap_px as f64 / 2.0).round_ties_even() as usize;
    let mut borders = Vec::with_capacity(tiling + 1);
    borders.push(0);
    for k in 1..tiling {
        let cut = place_border(k, k * step + half, &tile_ranges, borders[k - 1], axis_size)?;
        borders.push(cut);
    }
    borders.push(axis_size);

    Ok(AxisIndices {
        tiling,
        tile_ranges,
        borders,
    })
}

/// Place the clean border `k` between tiles `k - 1` and `k`. The cut must stay inside the overlap
/// of the two tiles and never step back past the previous border, so `raw` is clamped into that
/// window.
fn place_border(
    k: usize,
    raw: usize,
    tile_ranges: &[[usize; 2]],
    previous: usize,
    axis_size: usize,
) -> Result<usize> {
    let lo = tile_ranges[k][0].max(previous);
    let hi = tile_ranges[k - 1][1].min(axis_size);
    if lo > hi {
        return Err(TileError::InternalConsistency(format!(
            "no room for border {k} between {lo} and {hi}"
        )));
    }

    let cut = raw.clamp(lo, hi);
    if cut != raw {
        warn!(border = k, raw, cut, "clamped border point into tile overlap");
    }
    Ok(cut)
}

/// The tiling of both spatial axes of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridIndices {
    pub rows: AxisIndices,
    pub cols: AxisIndices,
}

impl GridIndices {
    pub fn tiling(&self) -> (usize, usize) {
        (self.rows.tiling, self.cols.tiling)
    }

    /// The (height, width) of the image these indices partition.
    pub fn image_size(&self) -> (usize, usize) {
        (self.rows.axis_size(), self.cols.axis_size())
    }

    /// The (height, width) of the region covered by tile `(i, j)`.
    pub fn tile_extent(&self, index: (usize, usize)) -> (usize, usize) {
        (self.rows.tile(index.0).len(), self.cols.tile(index.1).len())
    }

    /// Rescale the indices to an image whose tiles were resampled by `scale` (rows, cols). The
    /// image size is rounded first and the effective scale is recomputed from it, so that the
    /// last border lands exactly on the new image edge.
    ///
    /// returns: GridIndices
    pub fn scaled(&self, scale: (f64, f64)) -> GridIndices {
        let (h, w) = self.image_size();
        let new_h = (h as f64 * scale.0).round_ties_even() as usize;
        let new_w = (w as f64 * scale.1).round_ties_even() as usize;
        let sr = if h > 0 { new_h as f64 / h as f64 } else { scale.0 };
        let sc = if w > 0 { new_w as f64 / w as f64 } else { scale.1 };

        GridIndices {
            rows: self.rows.scaled(sr, new_h),
            cols: self.cols.scaled(sc, new_w),
        }
    }
}

/// Compute the tiling of the two trailing (spatial) axes of `image_shape`. Leading axes are free
/// stack dimensions and are not tiled.
pub fn compute_2d(
    image_shape: &[usize],
    tile_size: (usize, usize),
    overlap: (f64, f64),
) -> Result<GridIndices> {
    let (h, w) = spatial_shape(image_shape)?;
    Ok(GridIndices {
        rows: compute_1d(h, tile_size.0, overlap.0)?,
        cols: compute_1d(w, tile_size.1, overlap.1)?,
    })
}

/// Extract the (height, width) from the two trailing axes of a shape.
pub fn spatial_shape(shape: &[usize]) -> Result<(usize, usize)> {
    match shape {
        [.., h, w] => Ok((*h, *w)),
        _ => Err(TileError::InvalidGeometry(format!(
            "shape {shape:?} needs at least two spatial dimensions"
        ))),
    }
}

/// The tile size that splits an axis into `tiling` tiles sharing `overlap` of their size with
/// their neighbors, `ceil(axis / (tiling - (tiling - 1) * overlap))`.
pub fn tile_size_for_tiling(axis_size: usize, tiling: usize, overlap: f64) -> Result<usize> {
    if axis_size == 0 || tiling == 0 {
        return Err(TileError::InvalidGeometry(format!(
            "axis size ({axis_size}) and tiling ({tiling}) must be positive"
        )));
    }
    check_overlap(overlap)?;

    let n = tiling as f64;
    Ok((axis_size as f64 / (n - (n - 1.0) * overlap)).ceil() as usize)
}

/// Coordinates of every occupied cell of a grid, in row-major order.
pub fn nonempty_from_grid<T>(grid: &Array2<Option<T>>) -> Vec<(usize, usize)> {
    grid.indexed_iter()
        .filter_map(|(index, cell)| cell.as_ref().map(|_| index))
        .collect()
}

/// Maps the clean-border rectangle of one tile between image coordinates and the coordinates
/// local to that tile's own array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StitchIndex {
    pub image_rows: Range<usize>,
    pub image_cols: Range<usize>,
    pub tile_rows: Range<usize>,
    pub tile_cols: Range<usize>,
}

/// Build the stitch map for every nonempty tile. Fails with an internal consistency error if a
/// clean rectangle is not contained in its own tile, which the index computation guarantees.
pub fn stitch_indices(
    indices: &GridIndices,
    nonempty: &[(usize, usize)],
) -> Result<BTreeMap<(usize, usize), StitchIndex>> {
    let mut map = BTreeMap::new();
    for &(i, j) in nonempty {
        let image_rows = indices.rows.clean(i);
        let image_cols = indices.cols.clean(j);
        let tile_rows = indices.rows.tile(i);
        let tile_cols = indices.cols.tile(j);

        let contained = |clean: &Range<usize>, tile: &Range<usize>| {
            clean.start >= tile.start && clean.end <= tile.end
        };
        if !contained(&image_rows, &tile_rows) || !contained(&image_cols, &tile_cols) {
            return Err(TileError::InternalConsistency(format!(
                "clean region {image_rows:?} x {image_cols:?} of tile ({i}, {j}) escapes its \
                 extent {tile_rows:?} x {tile_cols:?}"
            )));
        }

        let local = |r: &Range<usize>, origin: usize| (r.start - origin)..(r.end - origin);
        map.insert(
            (i, j),
            StitchIndex {
                tile_rows: local(&image_rows, tile_rows.start),
                tile_cols: local(&image_cols, tile_cols.start),
                image_rows,
                image_cols,
            },
        );
    }

    Ok(map)
}
