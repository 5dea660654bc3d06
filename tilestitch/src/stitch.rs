//! Reassembly of tiled results into a single image.
//!
//! [`stitch_image`] copies the clean region of every tile into place. [`stitch_masks`] does the
//! same for instance label masks, but also relabels every object so that labels are unique over
//! the whole image, and reconciles objects that cross the clean borders between tiles so that
//! each one is labeled once.

mod borders;
mod labeling;
mod roi;

pub use labeling::{Connectivity, LabeledRegions, label_components};
pub use roi::{RasterRoi, value_regions};

use crate::errors::TileError;
use crate::indices::{GridIndices, StitchIndex, spatial_shape, stitch_indices};
use crate::payload::Payload;
use crate::profile::{DataKind, Job, JobKind, JobOutput, Profile};
use crate::tiles::TileArray;
use crate::Result;
use borders::{BorderCells, find_border_cells};
use ndarray::{Array2, Array3, ArrayView2, Axis, IxDyn, Order, Zip, s};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, debug_span, trace};

/// Options for [`stitch_masks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StitchOptions {
    /// Remove objects touching a clean border from the interior pass, so that they are placed
    /// whole by the border pass
    pub clear_border: bool,

    /// Run the border pass, which places objects found on clean borders
    pub reconcile_borders: bool,
}

impl Default for StitchOptions {
    fn default() -> Self {
        Self {
            clear_border: true,
            reconcile_borders: true,
        }
    }
}

/// A stitched result covering the whole image, tagged with the profile and job it came from.
#[derive(Debug, Clone)]
pub struct Stitched {
    data: Payload,
    kind: DataKind,
    profile: Arc<Profile>,
    job: Arc<Job>,
}

impl Stitched {
    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn into_data(self) -> Payload {
        self.data
    }

    pub fn kind(&self) -> DataKind {
        self.kind
    }

    pub fn profile(&self) -> &Arc<Profile> {
        &self.profile
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn shape(&self) -> Vec<usize> {
        self.data.shape()
    }
}

/// The geometry a tile array is stitched with.
struct Layout {
    indices: GridIndices,
    map: BTreeMap<(usize, usize), StitchIndex>,
    lead: Vec<usize>,
}

impl Layout {
    /// Work out the geometry from the profile and the shape of the first tile. When tiles come
    /// at a different resolution than the profile describes, every index is rescaled by the
    /// ratio of the observed to the nominal tile size.
    fn for_tiles(tiles: &TileArray) -> Result<Self> {
        let profile = tiles.profile();
        let Some((index, first)) = tiles.iter_nonempty().next() else {
            return Err(TileError::PayloadMismatch("there are no tiles to stitch".into()));
        };
        let shape = first.shape();
        let observed = spatial_shape(&shape)?;
        let lead = shape[..shape.len() - 2].to_vec();

        let nominal = profile.tile_size();
        let nonempty = tiles.nonempty_indices();
        let unscaled = observed == profile.indices().tile_extent(index) || observed == nominal;
        if unscaled && nonempty == profile.nonempty_indices() {
            return Ok(Self {
                indices: profile.indices().clone(),
                map: profile.stitch_indices()?.clone(),
                lead,
            });
        }

        let indices = if unscaled {
            profile.indices().clone()
        } else {
            let scale = (
                observed.0 as f64 / nominal.0 as f64,
                observed.1 as f64 / nominal.1 as f64,
            );
            debug!(?observed, ?nominal, ?scale, "rescaling stitch indices");
            profile.indices().scaled(scale)
        };
        let map = stitch_indices(&indices, &nonempty)?;

        Ok(Self { indices, map, lead })
    }

    fn output_shape(&self) -> Vec<usize> {
        let (h, w) = self.indices.image_size();
        let mut shape = self.lead.clone();
        shape.extend([h, w]);
        shape
    }

    fn entry(&self, index: (usize, usize)) -> Result<&StitchIndex> {
        self.map.get(&index).ok_or_else(|| {
            TileError::InternalConsistency(format!("no stitch index for tile {index:?}"))
        })
    }
}

/// Assemble the clean region of every tile into an image covering the whole profile. Tiles may
/// hold any array payload with any number of leading axes, as long as all tiles agree on them.
///
/// returns: Result<Stitched, TileError>
pub fn stitch_image(tiles: &TileArray) -> Result<Stitched> {
    let _span = debug_span!("stitch_image", profile = %tiles.profile().id()).entered();
    let layout = Layout::for_tiles(tiles)?;

    let (_, first) = tiles.iter_nonempty().next().ok_or_else(|| {
        TileError::InternalConsistency("a stitch layout was built without tiles".into())
    })?;
    let mut canvas = first.zeros_like(&layout.output_shape())?;
    for (index, tile) in tiles.iter_nonempty() {
        let entry = layout.entry(index)?;
        let crop = tile.crop_spatial(entry.tile_rows.clone(), entry.tile_cols.clone())?;
        canvas.assign_spatial(entry.image_rows.clone(), entry.image_cols.clone(), &crop)?;
    }

    finish(tiles, JobKind::StitchImage, serde_json::json!({}), canvas)
}

/// Stitch a tile array of integer instance label masks into one label image.
///
/// Each stack slice is stitched independently. The clean region of every tile is relabeled and
/// written into the canvas with labels offset past those of earlier tiles. Objects found on a
/// clean border are then placed from the full tile mask, receiving a new label unless they
/// overlap a labeled pixel already in the canvas. A final pass relabels the canvas so labels
/// run from 1 without gaps, in raster order.
///
/// # Arguments
///
/// * `tiles`: tiles holding `u32` label masks, all with the same leading axes
/// * `options`: which of the border handling steps to run
///
/// returns: Result<Stitched, TileError>
///
/// # Examples
///
/// ```
/// use ndarray::Array2;
/// use tilestitch::{get_tiles, stitch_masks, ArraySource, Payload, StitchOptions};
///
/// let mut mask = Array2::<u32>::zeros((100, 100));
/// mask.slice_mut(ndarray::s![70..80, 70..80]).fill(3);
/// let tiles = get_tiles(&ArraySource::new(mask.into_dyn()), (2, 2), (0.1, 0.1), false).unwrap();
/// let stitched = stitch_masks(&tiles, &StitchOptions::default()).unwrap();
///
/// let Payload::U32(labels) = stitched.data() else { unreachable!() };
/// assert_eq!(labels.iter().copied().max(), Some(1));
/// assert_eq!(labels.iter().filter(|&&v| v == 1).count(), 100);
/// ```
pub fn stitch_masks(tiles: &TileArray, options: &StitchOptions) -> Result<Stitched> {
    let _span = debug_span!("stitch_masks", profile = %tiles.profile().id()).entered();
    let layout = Layout::for_tiles(tiles)?;
    let nz = layout.lead.iter().product::<usize>();

    let masks = tiles
        .iter_nonempty()
        .map(|(index, payload)| {
            let labels = payload.as_labels().ok_or_else(|| {
                TileError::PayloadMismatch(format!(
                    "masks must hold u32 labels, tile {index:?} holds {}",
                    payload.type_name()
                ))
            })?;
            let (th, tw) = spatial_shape(labels.shape())?;
            if labels.shape()[..labels.ndim() - 2] != layout.lead[..] {
                return Err(TileError::PayloadMismatch(format!(
                    "tile {index:?} has shape {:?}, expected leading axes {:?}",
                    labels.shape(),
                    layout.lead
                )));
            }
            Ok((index, labels.to_shape(((nz, th, tw), Order::RowMajor))?))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;

    let (h, w) = layout.indices.image_size();
    let slices = (0..nz)
        .into_par_iter()
        .map(|z| {
            let views = masks
                .iter()
                .map(|(index, m)| (*index, m.index_axis(Axis(0), z)))
                .collect::<BTreeMap<_, _>>();
            stitch_slice(&views, &layout, options, z)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut stacked = Array3::<u32>::zeros((nz, h, w));
    for (z, slice) in slices.into_iter().enumerate() {
        stacked.index_axis_mut(Axis(0), z).assign(&slice);
    }
    let labels = stacked.into_shape_with_order(IxDyn(&layout.output_shape()))?;

    let params = serde_json::to_value(options)
        .map_err(|e| TileError::InvalidOptions(e.to_string()))?;
    finish(tiles, JobKind::StitchMasks, params, Payload::U32(labels))
}

fn stitch_slice(
    masks: &BTreeMap<(usize, usize), ArrayView2<u32>>,
    layout: &Layout,
    options: &StitchOptions,
    z: usize,
) -> Result<Array2<u32>> {
    let (h, w) = layout.indices.image_size();
    let mut canvas = Array2::<u32>::zeros((h, w));
    let border_cells = if options.clear_border || options.reconcile_borders {
        find_border_cells(masks, &layout.indices)
    } else {
        BorderCells::new()
    };

    let mut total = 0u32;
    for (index, entry) in &layout.map {
        let Some(mask) = masks.get(index) else {
            continue;
        };
        let (th, tw) = mask.dim();
        if entry.tile_rows.end > th || entry.tile_cols.end > tw {
            return Err(TileError::PayloadMismatch(format!(
                "tile {index:?} of shape {:?} does not hold its clean region {:?} x {:?}",
                mask.dim(),
                entry.tile_rows,
                entry.tile_cols
            )));
        }

        let mut crop = mask
            .slice(s![entry.tile_rows.clone(), entry.tile_cols.clone()])
            .to_owned();
        if options.clear_border {
            if let Some(cells) = border_cells.get(index) {
                crop.mapv_inplace(|v| if cells.contains(&v) { 0 } else { v });
            }
        }

        let labeled = label_components(crop.view());
        let offset = total;
        canvas
            .slice_mut(s![entry.image_rows.clone(), entry.image_cols.clone()])
            .zip_mut_with(labeled.buffer(), |c, &v| *c = if v > 0 { v + offset } else { 0 });
        total += labeled.count();
    }
    let interior = total;

    let mut stamped = 0usize;
    if options.reconcile_borders {
        for (index, cells) in &border_cells {
            let Some(mask) = masks.get(index) else {
                continue;
            };
            let regions = value_regions(*mask);
            let origin = (
                layout.indices.rows.tile(index.0).start,
                layout.indices.cols.tile(index.1).start,
            );

            for cell in cells {
                let Some(roi) = regions.get(cell) else {
                    continue;
                };
                let target = roi.translated(origin).clipped((h, w));
                if target.is_empty() {
                    continue;
                }
                let (eh, ew) = target.extent();
                let (r0, c0) = roi.min;
                let footprint = mask.slice(s![r0..r0 + eh, c0..c0 + ew]);
                let mut region = canvas.slice_mut(s![target.rows(), target.cols()]);

                let free = Zip::from(&footprint)
                    .and(&region)
                    .all(|&f, &c| f != *cell || c == 0);
                if free {
                    total += 1;
                    let label = total;
                    Zip::from(&footprint)
                        .and(&mut region)
                        .for_each(|&f, c| {
                            if f == *cell {
                                *c = label;
                            }
                        });
                    stamped += 1;
                }
            }
        }
    }

    let labeled = label_components(canvas.view());
    trace!(
        z,
        interior,
        candidates = border_cells.values().map(|c| c.len()).sum::<usize>(),
        stamped,
        labels = labeled.count(),
        "stitched slice"
    );

    Ok(labeled.into_buffer())
}

fn finish(
    tiles: &TileArray,
    kind: JobKind,
    params: serde_json::Value,
    data: Payload,
) -> Result<Stitched> {
    let profile = tiles.profile().clone();
    let job = profile.register_job(kind, params, Some(vec![tiles.clone()]));
    job.set_output(JobOutput::Stitched {
        kind: DataKind::StitchedImage,
        shape: data.shape(),
    })?;
    debug!(job = job.id(), shape = ?data.shape(), "stitched");

    Ok(Stitched {
        data,
        kind: DataKind::StitchedImage,
        profile,
        job,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ArraySource, GridSource, get_tiles};
    use crate::tiles::TileGrid;
    use ndarray::{Array, ArrayD};
    use rand::Rng;
    use std::collections::BTreeSet;
    use test_case::test_case;

    fn labels(stitched: &Stitched) -> &ArrayD<u32> {
        stitched.data().as_labels().unwrap()
    }

    fn mask_tiles(mask: Array2<u32>) -> TileArray {
        get_tiles(&ArraySource::new(mask.into_dyn()), (2, 2), (0.1, 0.1), false).unwrap()
    }

    fn without_borders() -> StitchOptions {
        StitchOptions {
            clear_border: false,
            reconcile_borders: false,
        }
    }

    /// Three objects inside clean regions, labeled in raster order of first appearance
    fn interior_objects() -> Array2<u32> {
        let mut mask = Array2::<u32>::zeros((100, 100));
        mask.slice_mut(s![5..15, 60..75]).fill(1);
        mask.slice_mut(s![20..30, 10..20]).fill(2);
        mask.slice_mut(s![80..95, 55..70]).fill(3);
        mask
    }

    #[test_case(StitchOptions::default())]
    #[test_case(without_borders())]
    fn interior_objects_round_trip(options: StitchOptions) {
        let mask = interior_objects();
        let stitched = stitch_masks(&mask_tiles(mask.clone()), &options).unwrap();
        assert_eq!(labels(&stitched), &mask.into_dyn());
    }

    #[test]
    fn labels_are_relabeled_globally() {
        // Values are reused between tiles and do not follow raster order
        let mut mask = Array2::<u32>::zeros((100, 100));
        mask.slice_mut(s![5..15, 5..15]).fill(7);
        mask.slice_mut(s![5..15, 60..70]).fill(7);
        mask.slice_mut(s![60..70, 5..15]).fill(2);
        let stitched = stitch_masks(&mask_tiles(mask), &StitchOptions::default()).unwrap();
        let out = labels(&stitched);

        assert_eq!(out[[10, 10]], 1);
        assert_eq!(out[[10, 65]], 2);
        assert_eq!(out[[65, 10]], 3);
    }

    #[test]
    fn straddling_object_gets_one_label() {
        // Crosses the horizontal clean border at row 50 inside tile column 1
        let mut mask = Array2::<u32>::zeros((100, 100));
        mask.slice_mut(s![46..54, 70..78]).fill(5);
        let stitched = stitch_masks(&mask_tiles(mask), &StitchOptions::default()).unwrap();
        let out = labels(&stitched);

        assert_eq!(out.iter().copied().max(), Some(1));
        // Placed from the upper tile, which only reaches row 53
        assert_eq!(out.iter().filter(|&&v| v == 1).count(), 7 * 8);
        assert_eq!(out[[46, 70]], 1);
    }

    #[test]
    fn straddling_object_is_split_without_border_clearing() {
        let mut mask = Array2::<u32>::zeros((100, 100));
        mask.slice_mut(s![46..54, 70..78]).fill(5);
        let options = StitchOptions {
            clear_border: false,
            ..Default::default()
        };
        let stitched = stitch_masks(&mask_tiles(mask), &options).unwrap();
        let out = labels(&stitched);

        assert_eq!(out.iter().copied().max(), Some(2));
        assert_eq!(out[[46, 70]], 1);
        assert_eq!(out[[53, 77]], 2);
    }

    #[test]
    fn disjoint_halves_keep_separate_labels() {
        // A 40 x 100 image in two tiles: columns [0, 53) and [48, 100), clean border at 50
        let mut left = Array2::<u32>::zeros((40, 53));
        left.slice_mut(s![10..20, 45..51]).fill(1);
        let mut right = Array2::<u32>::zeros((40, 52));
        right.slice_mut(s![10..20, 3..10]).fill(1);

        let mut grid: TileGrid = Array2::from_elem((1, 2), None);
        grid[(0, 0)] = Some(Payload::U32(left.into_dyn()));
        grid[(0, 1)] = Some(Payload::U32(right.into_dyn()));
        let tiles = get_tiles(&GridSource::new(grid, vec![40, 100]), (1, 2), (0.1, 0.1), false)
            .unwrap();

        let stitched = stitch_masks(&tiles, &StitchOptions::default()).unwrap();
        let out = labels(&stitched);
        assert_eq!(out.iter().copied().max(), Some(2));
        assert_eq!(out[[10, 45]], 1);
        assert_eq!(out[[10, 51]], 2);
        assert_eq!(out.iter().filter(|&&v| v > 0).count(), 60 + 70);
    }

    #[test]
    fn corner_object_in_overlap_is_kept() {
        // Straddles both clean borders around (50, 50)
        let mut mask = Array2::<u32>::zeros((100, 100));
        mask.slice_mut(s![49..52, 49..52]).fill(1);
        let stitched = stitch_masks(&mask_tiles(mask), &StitchOptions::default()).unwrap();
        let out = labels(&stitched);
        assert_eq!(out.iter().copied().max(), Some(1));
        assert_eq!(out.iter().filter(|&&v| v == 1).count(), 9);
    }

    #[test]
    fn random_masks_have_consecutive_labels() {
        let mut rng = rand::rng();
        for _ in 0..10 {
            let mut mask = Array2::<u32>::zeros((120, 90));
            for v in 1..=25 {
                let r = rng.random_range(0..112);
                let c = rng.random_range(0..82);
                let h = rng.random_range(1..9);
                let w = rng.random_range(1..9);
                mask.slice_mut(s![r..r + h, c..c + w]).fill(v);
            }

            let source = ArraySource::new(mask.clone().into_dyn());
            let tiles = get_tiles(&source, (3, 2), (0.2, 0.2), false).unwrap();
            let stitched = stitch_masks(&tiles, &StitchOptions::default()).unwrap();
            let out = labels(&stitched);

            let found = out.iter().copied().filter(|&v| v > 0).collect::<BTreeSet<_>>();
            let max = out.iter().copied().max().unwrap_or(0);
            assert_eq!(found, (1..=max).collect::<BTreeSet<_>>());
            for (o, m) in out.iter().zip(mask.iter()) {
                assert!(*o == 0 || *m > 0);
            }
        }
    }

    #[test]
    fn stack_axes_are_stitched_independently() {
        let mut mask = Array::<u32, _>::zeros((2, 3, 100, 100));
        mask.slice_mut(s![0, 1, 5..15, 5..15]).fill(4);
        mask.slice_mut(s![1, 2, 60..70, 60..70]).fill(4);
        mask.slice_mut(s![1, 2, 5..15, 60..70]).fill(9);
        let tiles =
            get_tiles(&ArraySource::new(mask.into_dyn()), (2, 2), (0.1, 0.1), false).unwrap();

        let stitched = stitch_masks(&tiles, &StitchOptions::default()).unwrap();
        let out = labels(&stitched);
        assert_eq!(out.shape(), &[2, 3, 100, 100]);
        assert_eq!(out[[0, 1, 10, 10]], 1);
        assert_eq!(out[[1, 2, 10, 65]], 1);
        assert_eq!(out[[1, 2, 65, 65]], 2);
        assert_eq!(out[[0, 0, 10, 10]], 0);
    }

    #[test]
    fn half_resolution_masks_are_rescaled() {
        // 100 x 100 split into four 50 x 50 tiles without overlap, each downsampled to 25 x 25
        let profile_tiles = get_tiles(
            &ArraySource::new(Array2::<u32>::zeros((100, 100)).into_dyn()),
            (2, 2),
            (0.0, 0.0),
            false,
        )
        .unwrap();
        let grid = Array2::from_shape_fn((2, 2), |(i, j)| {
            let mut tile = Array2::<u32>::zeros((25, 25));
            tile.slice_mut(s![5..10, 5..10]).fill((i * 2 + j + 1) as u32);
            Some(Payload::U32(tile.into_dyn()))
        });
        let small = crate::tiles::test_support::attach(
            grid,
            crate::tiles::TileMeta::image(),
            profile_tiles.profile(),
        );

        let stitched = stitch_masks(&small, &StitchOptions::default()).unwrap();
        let out = labels(&stitched);
        assert_eq!(out.shape(), &[50, 50]);
        assert_eq!(out[[7, 7]], 1);
        assert_eq!(out[[7, 32]], 2);
        assert_eq!(out[[32, 7]], 3);
        assert_eq!(out[[32, 32]], 4);
    }

    #[test]
    fn masks_must_be_labels() {
        let tiles = get_tiles(
            &ArraySource::new(Array2::<f32>::zeros((100, 100)).into_dyn()),
            (2, 2),
            (0.1, 0.1),
            false,
        )
        .unwrap();
        let result = stitch_masks(&tiles, &StitchOptions::default());
        assert!(matches!(result, Err(TileError::PayloadMismatch(_))));
    }

    #[test]
    fn stitch_image_reassembles_source() {
        let n = 3 * 100 * 120;
        let image = ArrayD::from_shape_vec(vec![3, 100, 120], (0..n).map(|v| v as f64).collect())
            .unwrap();
        for pad in [false, true] {
            let source = ArraySource::new(image.clone()).with_padding(pad);
            let tiles = get_tiles(&source, (3, 2), (0.15, 0.1), false).unwrap();
            let stitched = stitch_image(&tiles).unwrap();
            assert_eq!(stitched.data(), &Payload::F64(image.clone()));
            assert_eq!(stitched.kind(), DataKind::StitchedImage);
        }
    }

    #[test]
    fn stitching_records_job() {
        let tiles = mask_tiles(interior_objects());
        let stitched = stitch_masks(&tiles, &StitchOptions::default()).unwrap();
        let job = stitched.job();
        assert_eq!(job.kind(), JobKind::StitchMasks);
        assert_eq!(job.params()["clear_border"], true);
        assert_eq!(
            job.output(),
            Some(&JobOutput::Stitched {
                kind: DataKind::StitchedImage,
                shape: vec![100, 100]
            })
        );
        assert!(Arc::ptr_eq(stitched.profile(), tiles.profile()));
    }

    #[test]
    fn options_from_json() {
        let options: StitchOptions = serde_json::from_str(r#"{"clear_border": false}"#).unwrap();
        assert!(!options.clear_border);
        assert!(options.reconcile_borders);
    }
}
