//! Applying user functions to tiles.
//!
//! [`process`] takes a set of arguments in which any leaf may be a [`TileArray`], and calls a
//! function once per tile, or once per batch of tiles, with every tile array leaf replaced by the
//! tile (or stacked batch of tiles) for that call. The function may return a single payload or a
//! tree of them; each leaf of the returned tree becomes a new tile array on the same profile.

mod batching;
mod outputs;

use crate::errors::TileError;
use crate::payload::Payload;
use crate::profile::{JobKind, JobOutput};
use crate::tiles::{TileArray, TileMeta, check_compatibility};
use crate::tree::{Args, Tree};
use batching::{gather, select, work_items};
use outputs::OutputCollector;
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, trace};

/// A leaf of the arguments handed to [`process`].
#[derive(Debug, Clone)]
pub enum Arg {
    /// Tiles which are split up between calls
    Tiles(TileArray),

    /// Data passed unchanged to every call
    Data(Payload),

    /// A parameter passed unchanged to every call
    Param(serde_json::Value),
}

impl From<TileArray> for Arg {
    fn from(value: TileArray) -> Self {
        Arg::Tiles(value)
    }
}

impl From<Payload> for Arg {
    fn from(value: Payload) -> Self {
        Arg::Data(value)
    }
}

impl From<serde_json::Value> for Arg {
    fn from(value: serde_json::Value) -> Self {
        Arg::Param(value)
    }
}

impl From<TileArray> for Tree<Arg> {
    fn from(value: TileArray) -> Self {
        Tree::Leaf(Arg::Tiles(value))
    }
}

impl From<Payload> for Tree<Arg> {
    fn from(value: Payload) -> Self {
        Tree::Leaf(Arg::Data(value))
    }
}

impl From<serde_json::Value> for Tree<Arg> {
    fn from(value: serde_json::Value) -> Self {
        Tree::Leaf(Arg::Param(value))
    }
}

/// A leaf of the arguments a processing function receives on one call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArg<'a> {
    /// The tile, or the batch of tiles, taken from a tile array argument
    Tile(Payload),
    Data(&'a Payload),
    Param(&'a serde_json::Value),
}

impl CallArg<'_> {
    pub fn as_tile(&self) -> Option<&Payload> {
        match self {
            CallArg::Tile(p) => Some(p),
            _ => None,
        }
    }

    /// The payload of a tile or data argument.
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            CallArg::Tile(p) => Some(p),
            CallArg::Data(p) => Some(p),
            CallArg::Param(_) => None,
        }
    }

    pub fn as_param(&self) -> Option<&serde_json::Value> {
        match self {
            CallArg::Param(v) => Some(v),
            _ => None,
        }
    }
}

impl Args<CallArg<'_>> {
    /// The tile or batch of tiles passed as the bare positional argument `i`.
    pub fn tile(&self, i: usize) -> Option<&Payload> {
        self.positional(i)?.get_leaf(&[])?.as_tile()
    }
}

/// A leaf of a processing function's result: the data, and optionally metadata for the tile
/// array it will be stored in. Without metadata the output holds stackable image tiles.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub data: Payload,
    pub meta: Option<TileMeta>,
}

impl Output {
    pub fn annotated(data: impl Into<Payload>, meta: TileMeta) -> Self {
        Self {
            data: data.into(),
            meta: Some(meta),
        }
    }
}

impl From<Payload> for Output {
    fn from(value: Payload) -> Self {
        Self {
            data: value,
            meta: None,
        }
    }
}

impl From<Payload> for Tree<Output> {
    fn from(value: Payload) -> Self {
        Tree::Leaf(Output::from(value))
    }
}

/// How [`process`] calls the processing function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessOptions {
    /// Call the function on batches of tiles stacked along a new leading axis instead of on
    /// one tile at a time
    pub vectorized: bool,

    /// The number of tiles in each batch when vectorized
    pub batch_size: usize,

    /// Zero-pad a short final batch up to `batch_size`
    pub pad_final_batch: bool,

    /// Accumulate results along a leading axis of each output tile rather than writing each
    /// output tile once
    pub batch_axis: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            vectorized: false,
            batch_size: 8,
            pad_final_batch: false,
            batch_axis: false,
        }
    }
}

impl ProcessOptions {
    pub fn validate(&self) -> crate::Result<()> {
        if self.vectorized && self.batch_size == 0 {
            return Err(TileError::InvalidOptions(
                "batch size must be positive when vectorized".into(),
            ));
        }
        Ok(())
    }
}

/// Apply a function to the tiles of every tile array in `args`.
///
/// All tile arrays must share one profile and presence mask. Everything that can be checked
/// without calling `f` is checked before the first call. Errors returned by `f` end the call
/// immediately and are returned unchanged.
///
/// # Arguments
///
/// * `args`: the positional and keyword arguments, in which tile array leaves are split up
/// * `options`: whether to batch calls, and how results are placed
/// * `f`: the processing function
///
/// returns: Result<Tree<TileArray>, E>
///
/// # Examples
///
/// ```
/// use ndarray::Array2;
/// use tilestitch::{get_tiles, process, Args, ArraySource, ProcessOptions, Tree, TileError};
///
/// let image = Array2::<f32>::ones((100, 100)).into_dyn();
/// let tiles = get_tiles(&ArraySource::new(image), (2, 2), (0.1, 0.1), false).unwrap();
/// let args = Args::new().arg(tiles);
/// let doubled = process(&args, &ProcessOptions::default(), |call| {
///     let tile = call.tile(0).unwrap();
///     let tilestitch::Payload::F32(a) = tile else { unreachable!() };
///     Ok::<_, TileError>(Tree::from(tilestitch::Payload::F32(a * 2.0)))
/// })
/// .unwrap();
/// assert_eq!(doubled.into_leaf().unwrap().nonempty_indices().len(), 4);
/// ```
pub fn process<'a, F, E>(
    args: &'a Args<Arg>,
    options: &ProcessOptions,
    mut f: F,
) -> Result<Tree<TileArray>, E>
where
    F: FnMut(Args<CallArg<'a>>) -> Result<Tree<Output>, E>,
    E: From<TileError>,
{
    let inputs = args
        .leaves()
        .into_iter()
        .filter_map(|a| match a {
            Arg::Tiles(t) => Some(t),
            _ => None,
        })
        .collect::<Vec<_>>();
    check_compatibility(&inputs)?;
    options.validate()?;
    if !options.batch_axis && inputs.iter().any(|t| t.meta().batch_axis) {
        return Err(TileError::InvalidOptions(
            "tile arrays with a batch axis can only be processed with the batch_axis option".into(),
        )
        .into());
    }

    let profile = inputs[0].profile().clone();
    let items = work_items(&inputs)?;
    let params = serde_json::to_value(options)
        .map_err(|e| TileError::InvalidOptions(e.to_string()))?;
    let retained = inputs.iter().map(|t| (*t).clone()).collect();
    let job = profile.register_job(JobKind::Process, params, Some(retained));

    let _span = debug_span!("process", profile = %profile.id(), job = job.id()).entered();
    let mut collector = OutputCollector::new(profile.tiling(), options.batch_axis);

    if options.vectorized {
        let pad_to = options.pad_final_batch.then_some(options.batch_size);
        for (n, batch) in items.chunks(options.batch_size).enumerate() {
            debug!(batch = n, size = batch.len(), "dispatching batch");
            let call = args.try_map_ref(&mut |arg| call_arg(arg, |t| gather(t, batch, pad_to)))?;
            let result = f(call)?;
            collector.scatter(result, batch, true)?;
        }
    } else {
        for item in &items {
            trace!(cell = ?item.index, sub = ?item.sub, "dispatching tile");
            let call = args.try_map_ref(&mut |arg| call_arg(arg, |t| select(t, item)))?;
            let result = f(call)?;
            collector.scatter(result, std::slice::from_ref(item), false)?;
        }
    }

    let (tree, record) = collector.finish(&profile, &job)?;
    job.set_output(JobOutput::Tiled(record))?;

    Ok(tree)
}

fn call_arg<'a>(
    arg: &'a Arg,
    tiles: impl FnOnce(&TileArray) -> crate::Result<Payload>,
) -> crate::Result<CallArg<'a>> {
    Ok(match arg {
        Arg::Tiles(t) => CallArg::Tile(tiles(t)?),
        Arg::Data(p) => CallArg::Data(p),
        Arg::Param(v) => CallArg::Param(v),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::DataKind;
    use crate::tiles::TileGrid;
    use crate::tiles::test_support::{attach, tile_array_from_grid};
    use crate::tree::PathSegment;
    use crate::Result;
    use approx::assert_relative_eq;
    use ndarray::{Array1, Array2, Array3, Array4, ArrayD};
    use serde_json::json;

    fn tile(value: f32) -> Payload {
        Payload::F32(Array2::from_elem((2, 2), value).into_dyn())
    }

    fn f32_data(p: &Payload) -> &ArrayD<f32> {
        match p {
            Payload::F32(a) => a,
            other => panic!("expected f32 payload, got {}", other.type_name()),
        }
    }

    /// A 2 x 3 grid with five tiles, the cell (0, 1) being absent.
    fn five_tiles() -> TileArray {
        let grid = Array2::from_shape_fn((2, 3), |(i, j)| {
            ((i, j) != (0, 1)).then(|| tile((i * 3 + j) as f32))
        });
        tile_array_from_grid(&[100, 150], (0.1, 0.1), grid, TileMeta::image())
    }

    #[test]
    fn single_present_cell_calls_once() {
        let mut grid: TileGrid = Array2::from_elem((2, 2), None);
        grid[(1, 0)] = Some(tile(7.0));
        let tiles = tile_array_from_grid(&[100, 100], (0.1, 0.1), grid, TileMeta::image());
        let args = Args::new().arg(tiles);

        let mut calls = 0;
        let out = process(&args, &ProcessOptions::default(), |call| -> Result<Tree<Output>> {
            calls += 1;
            Ok(call.tile(0).unwrap().clone().into())
        })
        .unwrap();

        assert_eq!(calls, 1);
        let out = out.into_leaf().unwrap();
        assert_eq!(out.nonempty_indices(), vec![(1, 0)]);
        assert_eq!(out.get((1, 0)), Some(&tile(7.0)));
    }

    #[test]
    fn padded_final_batch_is_stripped() {
        let tiles = five_tiles();
        let args = Args::new().arg(tiles.clone());
        let options = ProcessOptions {
            vectorized: true,
            batch_size: 4,
            pad_final_batch: true,
            ..Default::default()
        };

        let mut batch_shapes = Vec::new();
        let out = process(&args, &options, |call| -> Result<Tree<Output>> {
            let batch = f32_data(call.tile(0).unwrap());
            batch_shapes.push(batch.shape().to_vec());
            Ok(Payload::F32(batch * 2.0).into())
        })
        .unwrap()
        .into_leaf()
        .unwrap();

        assert_eq!(batch_shapes, vec![vec![4, 2, 2], vec![4, 2, 2]]);
        assert_eq!(out.nonempty_indices(), tiles.nonempty_indices());
        for (index, original) in tiles.iter_nonempty() {
            let doubled = f32_data(out.get(index).unwrap());
            assert_eq!(doubled, &(f32_data(original) * 2.0));
        }
    }

    #[test]
    fn short_final_batch_without_padding() {
        let args = Args::new().arg(five_tiles());
        let options = ProcessOptions {
            vectorized: true,
            batch_size: 4,
            ..Default::default()
        };

        let mut sizes = Vec::new();
        process(&args, &options, |call| -> Result<Tree<Output>> {
            sizes.push(call.tile(0).unwrap().len());
            Ok(call.tile(0).unwrap().clone().into())
        })
        .unwrap();
        assert_eq!(sizes, vec![4, 1]);
    }

    #[test]
    fn tree_results_build_tree_of_outputs() {
        let tiles = five_tiles();
        let args = Args::new().arg(tiles.clone()).kwarg("scale", json!(3.0));

        let out = process(&args, &ProcessOptions::default(), |call| -> Result<Tree<Output>> {
            let scale = call.keyword("scale").unwrap().get_leaf(&[]).unwrap();
            let scale = scale.as_param().unwrap().as_f64().unwrap() as f32;
            let data = f32_data(call.tile(0).unwrap());
            let points = Array2::<f64>::zeros((3, 2)).into_dyn();
            Ok(Tree::map([
                ("image", Tree::leaf(Output::from(Payload::F32(data * scale)))),
                ("points", Tree::leaf(Output::annotated(points, TileMeta::coords()))),
            ]))
        })
        .unwrap();

        assert_eq!(
            out.leaf_paths(),
            vec![
                vec![PathSegment::Key("image".into())],
                vec![PathSegment::Key("points".into())]
            ]
        );
        let image = out.get_leaf(&[PathSegment::Key("image".into())]).unwrap();
        let points = out.get_leaf(&[PathSegment::Key("points".into())]).unwrap();
        assert!(std::sync::Arc::ptr_eq(image.profile(), tiles.profile()));
        assert!(std::sync::Arc::ptr_eq(image.job(), points.job()));
        assert_eq!(image.meta(), &TileMeta::image());
        assert_eq!(points.meta(), &TileMeta::coords());
        assert_eq!(points.get((1, 2)).unwrap().shape(), vec![3, 2]);

        let record = image.job().output().unwrap();
        let JobOutput::Tiled(record) = record else { panic!("expected tiled output") };
        assert_eq!(record[1].1, DataKind::TiledCoords);
    }

    #[test]
    fn changing_result_shape_fails() {
        let args = Args::new().arg(five_tiles());
        let mut calls = 0;
        let result = process(&args, &ProcessOptions::default(), |call| -> Result<Tree<Output>> {
            calls += 1;
            let t = call.tile(0).unwrap().clone();
            if calls == 1 {
                Ok(t.into())
            } else {
                Ok(Tree::map([("masks", Tree::from(t))]))
            }
        });
        assert!(matches!(result, Err(TileError::TreeShapeMismatch { .. })));
        assert_eq!(calls, 2);
    }

    #[test]
    fn changing_batch_result_shape_fails() {
        let args = Args::new().arg(five_tiles());
        let options = ProcessOptions {
            vectorized: true,
            batch_size: 2,
            ..Default::default()
        };
        let mut calls = 0;
        let result = process(&args, &options, |call| -> Result<Tree<Output>> {
            calls += 1;
            let batch = call.tile(0).unwrap().clone();
            if calls == 1 {
                Ok(batch.into())
            } else {
                Ok(Tree::list([Tree::from(batch.clone()), Tree::from(batch)]))
            }
        });
        assert!(matches!(result, Err(TileError::TreeShapeMismatch { .. })));
        assert_eq!(calls, 2);
    }

    #[test]
    fn mismatched_profiles_fail_before_calling() {
        let a = five_tiles();
        let b = five_tiles();
        let args = Args::new().arg(a).arg(b);
        let mut calls = 0;
        let result = process(&args, &ProcessOptions::default(), |call| -> Result<Tree<Output>> {
            calls += 1;
            Ok(call.tile(0).unwrap().clone().into())
        });
        assert!(matches!(result, Err(TileError::ProfileMismatch(_))));
        assert_eq!(calls, 0);
    }

    #[derive(Debug)]
    enum ModelError {
        Failed(usize),
        Tiles(TileError),
    }

    impl From<TileError> for ModelError {
        fn from(value: TileError) -> Self {
            ModelError::Tiles(value)
        }
    }

    #[test]
    fn user_errors_pass_through() {
        let args = Args::new().arg(five_tiles());
        let mut calls = 0;
        let result = process(&args, &ProcessOptions::default(), |_call| {
            calls += 1;
            if calls == 3 {
                Err(ModelError::Failed(calls))
            } else {
                Ok(Tree::from(tile(0.0)))
            }
        });
        assert!(matches!(result, Err(ModelError::Failed(3))));
        assert_eq!(calls, 3);

        let bad = ProcessOptions {
            vectorized: true,
            batch_size: 0,
            ..Default::default()
        };
        let result = process(&args, &bad, |_| Ok::<_, ModelError>(Tree::from(tile(0.0))));
        assert!(matches!(
            result,
            Err(ModelError::Tiles(TileError::InvalidOptions(_)))
        ));
    }

    #[test]
    fn short_batched_result_is_rejected() {
        let args = Args::new().arg(five_tiles());
        let options = ProcessOptions {
            vectorized: true,
            batch_size: 4,
            ..Default::default()
        };
        let result = process(&args, &options, |_| -> Result<Tree<Output>> {
            Ok(Payload::F32(Array3::zeros((2, 2, 2)).into_dyn()).into())
        });
        assert!(matches!(
            result,
            Err(TileError::BatchMismatch {
                expected: 4,
                found: 2
            })
        ));
    }

    #[test]
    fn batch_axis_accumulates_sub_results() {
        let tiles = five_tiles();
        let options = ProcessOptions {
            batch_axis: true,
            ..Default::default()
        };

        // Each call's result is stacked onto a new leading axis of its cell
        let frames = Args::new().arg(tiles.clone());
        let counter = process(&frames, &options, |call| -> Result<Tree<Output>> {
            let t = f32_data(call.tile(0).unwrap());
            Ok(Payload::F32(Array3::from_elem((3, 2, 2), t[[0, 0]]).into_dyn()).into())
        })
        .unwrap()
        .into_leaf()
        .unwrap();
        assert!(counter.meta().batch_axis);
        assert_eq!(counter.get((1, 1)).unwrap().shape(), vec![1, 3, 2, 2]);

        // Feeding the result back iterates over its leading axis
        let args = Args::new().arg(counter.clone());
        let mut calls = 0;
        let summed = process(&args, &options, |call| -> Result<Tree<Output>> {
            calls += 1;
            let sub = f32_data(call.tile(0).unwrap());
            assert_eq!(sub.shape(), &[3, 2, 2]);
            Ok(Payload::F32(Array1::from_elem(1, sub.sum()).into_dyn()).into())
        })
        .unwrap()
        .into_leaf()
        .unwrap();
        assert_eq!(calls, 5);
        assert_eq!(summed.get((1, 2)).unwrap().shape(), vec![1, 1]);
        assert_relative_eq!(f32_data(summed.get((1, 2)).unwrap())[[0, 0]], 5.0 * 12.0);
    }

    #[test]
    fn batched_batch_axis_accumulates_padded_results() {
        let tiles = five_tiles();
        let options = ProcessOptions {
            vectorized: true,
            batch_size: 4,
            pad_final_batch: true,
            batch_axis: true,
        };

        let mut batch_shapes = Vec::new();
        let frames = process(&Args::new().arg(tiles.clone()), &options, |call| {
            let batch = f32_data(call.tile(0).unwrap());
            let n = batch.shape()[0];
            let frames = Array4::from_shape_fn((n, 3, 2, 2), |(b, ..)| batch[[b, 0, 0]]);
            batch_shapes.push(frames.shape().to_vec());
            Ok::<_, TileError>(Tree::from(Payload::F32(frames.into_dyn())))
        })
        .unwrap()
        .into_leaf()
        .unwrap();

        assert_eq!(batch_shapes, vec![vec![4, 3, 2, 2], vec![4, 3, 2, 2]]);
        assert!(frames.meta().batch_axis);
        assert_eq!(frames.nonempty_indices(), tiles.nonempty_indices());
        for (index, cell) in frames.iter_nonempty() {
            assert_eq!(cell.shape(), vec![1, 3, 2, 2]);
            let expected = f32_data(tiles.get(index).unwrap())[[0, 0]];
            assert_relative_eq!(f32_data(cell)[[0, 2, 1, 1]], expected);
        }
    }

    #[test]
    fn batch_axis_input_requires_option() {
        let tiles = five_tiles();
        let meta = TileMeta {
            batch_axis: true,
            ..TileMeta::image()
        };
        let grid = tiles.tiles().map(|c| c.as_ref().map(|t| t.clone().insert_axis0()));
        let batched = attach(grid, meta, tiles.profile());
        let args = Args::new().arg(batched);
        let result = process(&args, &ProcessOptions::default(), |call| -> Result<Tree<Output>> {
            Ok(call.tile(0).unwrap().clone().into())
        });
        assert!(matches!(result, Err(TileError::InvalidOptions(_))));
    }

    #[test]
    fn coords_are_batched_as_lists() {
        let tiles = five_tiles();
        let args = Args::new().arg(tiles);
        let coords = process(&args, &ProcessOptions::default(), |call| -> Result<Tree<Output>> {
            let n = f32_data(call.tile(0).unwrap())[[0, 0]] as usize;
            let points = Array2::<f64>::zeros((n, 2)).into_dyn();
            Ok(Tree::leaf(Output::annotated(points, TileMeta::coords())))
        })
        .unwrap()
        .into_leaf()
        .unwrap();

        let args = Args::new().arg(coords);
        let options = ProcessOptions {
            vectorized: true,
            batch_size: 8,
            pad_final_batch: true,
            ..Default::default()
        };
        let mut seen = Vec::new();
        let counts = process(&args, &options, |call| -> Result<Tree<Output>> {
            let Some(Payload::List(items)) = call.tile(0) else {
                panic!("expected a list batch");
            };
            seen.push(items.len());
            let counts = items.iter().map(|p| p.len() as u32).collect::<Vec<_>>();
            Ok(Payload::U32(Array1::from_vec(counts).into_dyn()).into())
        })
        .unwrap()
        .into_leaf()
        .unwrap();

        assert_eq!(seen, vec![5]);
        let Payload::U32(last) = counts.get((1, 2)).unwrap() else { panic!("expected u32") };
        assert_eq!(last.shape(), &[] as &[usize]);
        assert_eq!(last.iter().next(), Some(&5));
    }

    #[test]
    fn data_and_params_are_shared() {
        let offset = Payload::F32(Array2::from_elem((2, 2), 10.0).into_dyn());
        let args = Args::new()
            .arg(five_tiles())
            .arg(offset.clone())
            .kwarg("label", json!("shift"));
        let out = process(&args, &ProcessOptions::default(), |call| -> Result<Tree<Output>> {
            let data = call.positional(1).unwrap().get_leaf(&[]).unwrap();
            assert!(matches!(data, CallArg::Data(_)));
            let t = f32_data(call.tile(0).unwrap());
            let o = f32_data(data.payload().unwrap());
            Ok(Payload::F32(t + o).into())
        })
        .unwrap()
        .into_leaf()
        .unwrap();
        assert_relative_eq!(f32_data(out.get((1, 2)).unwrap())[[0, 0]], 15.0);
    }

    #[test]
    fn process_records_job() {
        let tiles = five_tiles();
        let args = Args::new().arg(tiles.clone());
        let options = ProcessOptions {
            vectorized: true,
            batch_size: 2,
            ..Default::default()
        };
        let out = process(&args, &options, |call| -> Result<Tree<Output>> {
            Ok(call.tile(0).unwrap().clone().into())
        })
        .unwrap()
        .into_leaf()
        .unwrap();

        let job = out.job();
        assert_eq!(job.kind(), JobKind::Process);
        assert_eq!(job.id(), 1);
        assert_eq!(job.params()["batch_size"], 2);
        assert!(job.input().is_none());
        assert_eq!(tiles.profile().jobs().len(), 2);
    }

    #[test]
    fn options_from_json() {
        let options: ProcessOptions =
            serde_json::from_str(r#"{"vectorized": true, "pad_final_batch": true}"#).unwrap();
        assert!(options.vectorized);
        assert_eq!(options.batch_size, 8);
        assert!(!options.batch_axis);
    }
}
