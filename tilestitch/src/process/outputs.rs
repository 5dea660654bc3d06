//! Collection of processing results into output tile grids.
//!
//! The structure of the result tree is fixed by the first result, and one output grid is created
//! for each of its leaves. Each result is validated and staged completely before any cell is
//! written, so a failing call never leaves an output half-updated.

use super::Output;
use super::batching::WorkItem;
use crate::errors::TileError;
use crate::payload::Payload;
use crate::profile::{DataKind, Job, Profile};
use crate::tiles::{TileArray, TileGrid, TileMeta};
use crate::tree::{Tree, TreePath};
use crate::Result;
use ndarray::Array2;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct OutputGrid {
    grid: TileGrid,
    meta: TileMeta,
}

pub(crate) struct OutputCollector {
    tiling: (usize, usize),
    batch_axis: bool,
    layout: Option<(Tree<()>, Vec<TreePath>)>,
    outputs: Vec<OutputGrid>,
}

impl OutputCollector {
    pub fn new(tiling: (usize, usize), batch_axis: bool) -> Self {
        Self {
            tiling,
            batch_axis,
            layout: None,
            outputs: Vec::new(),
        }
    }

    /// Scatter one result into the output grids.
    ///
    /// # Arguments
    ///
    /// * `result`: the tree returned by the processing function
    /// * `items`: the work items the result was computed for
    /// * `batched`: whether every leaf holds one entry per work item along its leading axis,
    ///   rather than the result for a single item
    ///
    /// returns: Result<(), TileError>
    pub fn scatter(
        &mut self,
        result: Tree<Output>,
        items: &[WorkItem],
        batched: bool,
    ) -> Result<()> {
        let paths = result.leaf_paths();
        match &self.layout {
            None => self.initialize(&result, paths)?,
            Some((_, expected)) if *expected != paths => {
                return Err(TileError::TreeShapeMismatch {
                    expected: expected.clone(),
                    found: paths,
                });
            }
            Some(_) => {}
        }

        let leaves = result.into_leaves();
        let mut staged = Vec::with_capacity(leaves.len());
        for (k, leaf) in leaves.into_iter().enumerate() {
            let pieces = split(leaf.data, items.len(), batched)?;
            staged.push(self.stage(k, items, pieces)?);
        }

        for (output, cells) in self.outputs.iter_mut().zip(staged) {
            for (index, payload) in cells {
                output.grid[index] = Some(payload);
            }
        }

        Ok(())
    }

    fn initialize(&mut self, result: &Tree<Output>, paths: Vec<TreePath>) -> Result<()> {
        let outputs = result
            .leaves()
            .into_iter()
            .map(|leaf| {
                let mut meta = leaf.meta.unwrap_or_default();
                if !meta.kind.is_tiled() {
                    return Err(TileError::InvalidOptions(format!(
                        "a processing result cannot be tagged as {:?}",
                        meta.kind
                    )));
                }
                meta.batch_axis |= self.batch_axis;
                Ok(OutputGrid {
                    grid: Array2::from_elem(self.tiling, None),
                    meta,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(leaves = outputs.len(), "initialized output tree");
        let template = result.try_map_ref(&mut |_| Ok::<(), TileError>(()))?;
        self.layout = Some((template, paths));
        self.outputs = outputs;

        Ok(())
    }

    /// Compute the new contents of every cell touched by one output leaf, without writing them.
    fn stage(
        &self,
        k: usize,
        items: &[WorkItem],
        pieces: Vec<Payload>,
    ) -> Result<HashMap<(usize, usize), Payload>> {
        let output = &self.outputs[k];
        let mut cells: HashMap<(usize, usize), Payload> = HashMap::new();

        for (item, piece) in items.iter().zip(pieces) {
            let existing = cells
                .get(&item.index)
                .or_else(|| output.grid.get(item.index).and_then(|c| c.as_ref()));

            let value = if output.meta.batch_axis {
                let piece = piece.insert_axis0();
                match existing {
                    Some(current) => current.concat_axis0(&piece)?,
                    None => piece,
                }
            } else {
                if existing.is_some() {
                    return Err(TileError::InternalConsistency(format!(
                        "cell {:?} of output {k} was written twice",
                        item.index
                    )));
                }
                piece
            };
            cells.insert(item.index, value);
        }

        Ok(cells)
    }

    /// Turn the collected grids into tile arrays with the structure of the result tree. Also
    /// returns the leaf paths and data kinds for the job record.
    pub fn finish(
        self,
        profile: &Arc<Profile>,
        job: &Arc<Job>,
    ) -> Result<(Tree<TileArray>, Vec<(TreePath, DataKind)>)> {
        let Some((template, paths)) = self.layout else {
            debug!("no work items, returning an empty result");
            return Ok((Tree::List(Vec::new()), Vec::new()));
        };

        let record = paths
            .into_iter()
            .zip(self.outputs.iter().map(|o| o.meta.kind))
            .collect::<Vec<_>>();

        let mut outputs = self.outputs.into_iter();
        let tree = template.try_map_leaves(&mut |_| {
            let output = outputs.next().ok_or_else(|| {
                TileError::InternalConsistency("fewer output grids than result leaves".into())
            })?;
            TileArray::new(output.grid, output.meta, profile.clone(), job.clone())
        })?;

        Ok((tree, record))
    }
}

/// Split a leaf into the pieces belonging to each of `count` work items.
fn split(data: Payload, count: usize, batched: bool) -> Result<Vec<Payload>> {
    if !batched {
        return Ok(vec![data]);
    }
    if data.shape().is_empty() || data.len() < count {
        return Err(TileError::BatchMismatch {
            expected: count,
            found: data.len(),
        });
    }
    (0..count).map(|i| data.index_axis0(i)).collect()
}
