//! Enumeration of the units of work in a processing call and assembly of the per-call views of
//! tile arrays.

use crate::errors::TileError;
use crate::payload::Payload;
use crate::tiles::TileArray;
use crate::Result;
use itertools::Itertools;

/// One unit of work: a grid cell, and for inputs carrying a batch axis, the entry along that axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkItem {
    pub index: (usize, usize),
    pub sub: Option<usize>,
}

/// List every unit of work for a set of compatible tile arrays, in row-major grid order. When any
/// input carries a batch axis, each cell expands into one item per entry along that axis, and all
/// such inputs must agree on its length.
pub(crate) fn work_items(inputs: &[&TileArray]) -> Result<Vec<WorkItem>> {
    let Some(first) = inputs.first() else {
        return Ok(Vec::new());
    };
    let batched = inputs
        .iter()
        .filter(|t| t.meta().batch_axis)
        .collect::<Vec<_>>();

    let mut items = Vec::new();
    for index in first.nonempty_indices() {
        if batched.is_empty() {
            items.push(WorkItem { index, sub: None });
            continue;
        }

        let lengths = batched
            .iter()
            .map(|t| t.get(index).map(|p| p.len()).unwrap_or(0))
            .collect::<Vec<_>>();
        let count = match lengths.iter().all_equal_value() {
            Ok(count) => *count,
            Err(None) => 0,
            Err(Some((a, b))) => {
                return Err(TileError::BatchMismatch {
                    expected: *a,
                    found: *b,
                });
            }
        };
        items.extend((0..count).map(|sub| WorkItem {
            index,
            sub: Some(sub),
        }));
    }

    Ok(items)
}

/// The payload an input contributes for one unit of work.
pub(crate) fn select(tiles: &TileArray, item: &WorkItem) -> Result<Payload> {
    let tile = tiles.get(item.index).ok_or_else(|| {
        TileError::InternalConsistency(format!("no tile at cell {:?}", item.index))
    })?;
    match item.sub {
        Some(sub) if tiles.meta().batch_axis => tile.index_axis0(sub),
        _ => Ok(tile.clone()),
    }
}

/// The payload an input contributes for a batch of work items. Stackable tiles are stacked along
/// a new leading axis, and the stack is zero-padded up to `pad_to` entries if requested. Other
/// tiles are passed as a list.
pub(crate) fn gather(
    tiles: &TileArray,
    batch: &[WorkItem],
    pad_to: Option<usize>,
) -> Result<Payload> {
    let selected = batch
        .iter()
        .map(|item| select(tiles, item))
        .collect::<Result<Vec<_>>>()?;

    if !tiles.meta().stackable {
        return Ok(Payload::List(selected));
    }

    let stacked = Payload::stack(&selected)?;
    match pad_to {
        Some(size) if size > batch.len() => stacked.pad_axis0(size - batch.len()),
        _ => Ok(stacked),
    }
}
