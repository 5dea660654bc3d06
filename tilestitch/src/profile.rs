//! Profiles and jobs. A `Profile` is the immutable geometry shared by every tile array derived
//! from a single tiling request, and a `Job` records one operation (reading tiles, processing
//! them, stitching them) performed under that profile.

use crate::errors::TileError;
use crate::indices::{GridIndices, StitchIndex, compute_2d, stitch_indices, tile_size_for_tiling};
use crate::tiles::TileArray;
use crate::tree::TreePath;
use crate::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;
use uuid::Uuid;

/// Tags what a piece of data is: a grid of tiles, or a stitched whole-image result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    TiledImage,
    TiledCoords,
    StitchedImage,
}

impl DataKind {
    pub fn is_tiled(&self) -> bool {
        matches!(self, DataKind::TiledImage | DataKind::TiledCoords)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    GetTiles,
    Process,
    StitchMasks,
    StitchImage,
}

/// A record of what a job produced. The data itself is owned by whoever holds the output.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Tiled(Vec<(TreePath, DataKind)>),
    Stitched { kind: DataKind, shape: Vec<usize> },
}

/// One operation performed under a profile. Everything but `output` is fixed at creation, and
/// `output` is written exactly once when the operation completes.
pub struct Job {
    id: usize,
    profile_id: Uuid,
    kind: JobKind,
    params: serde_json::Value,
    input: Option<Vec<TileArray>>,
    output: OnceLock<JobOutput>,
}

impl Job {
    /// The position of this job in its profile's job list
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn profile_id(&self) -> Uuid {
        self.profile_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// The parameters the job was run with
    pub fn params(&self) -> &serde_json::Value {
        &self.params
    }

    /// The tile arrays the job consumed, retained only when the profile links data.
    pub fn input(&self) -> Option<&[TileArray]> {
        self.input.as_deref()
    }

    pub fn output(&self) -> Option<&JobOutput> {
        self.output.get()
    }

    pub(crate) fn set_output(&self, output: JobOutput) -> Result<()> {
        self.output.set(output).map_err(|_| {
            TileError::InternalConsistency(format!("output of job {} set twice", self.id))
        })
    }
}

impl Debug for Job {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("profile_id", &self.profile_id)
            .field("kind", &self.kind)
            .field("params", &self.params)
            .field("inputs", &self.input.as_ref().map(|v| v.len()))
            .field("output", &self.output.get())
            .finish()
    }
}

/// The immutable geometry of one tiling request: the image shape, tile grid, overlap, the tile
/// and clean-border indices along both spatial axes and which grid cells hold a tile.
///
/// Profiles are shared behind an `Arc`. Two tile arrays are only compatible when they point at
/// the *same* profile, so identity rather than structural equality is what matters.
///
/// The profile keeps an append-only list of the jobs run under it. The list holds weak
/// references: a job lives as long as the data it produced is referenced somewhere.
pub struct Profile {
    id: Uuid,
    image_shape: Vec<usize>,
    tile_size: (usize, usize),
    overlap: (f64, f64),
    indices: GridIndices,
    nonempty: Vec<(usize, usize)>,
    link_data: bool,
    stitch_map: OnceLock<BTreeMap<(usize, usize), StitchIndex>>,
    jobs: RwLock<Vec<Weak<Job>>>,
}

impl Debug for Profile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profile")
            .field("id", &self.id)
            .field("image_shape", &self.image_shape)
            .field("tiling", &self.tiling())
            .field("tile_size", &self.tile_size)
            .field("overlap", &self.overlap)
            .field("nonempty", &self.nonempty.len())
            .field("jobs", &self.jobs.read().len())
            .finish()
    }
}

impl Profile {
    /// Create a profile for a tiling of `image_shape` into a `tiling` grid whose neighbors share
    /// `overlap` of their size.
    ///
    /// # Arguments
    ///
    /// * `image_shape`: the full image shape; the trailing two axes are height and width
    /// * `tiling`: the number of tiles along (rows, cols)
    /// * `overlap`: the overlap fraction along (rows, cols), each in `[0, 1)`
    /// * `nonempty`: the occupied grid cells in row-major order, or `None` if all are occupied
    /// * `link_data`: whether jobs run under this profile retain their inputs
    ///
    /// returns: Result<Arc<Profile>, TileError>
    pub fn from_tiling(
        image_shape: &[usize],
        tiling: (usize, usize),
        overlap: (f64, f64),
        nonempty: Option<Vec<(usize, usize)>>,
        link_data: bool,
    ) -> Result<Arc<Profile>> {
        let (tile_size, indices) = plan_grid(image_shape, tiling, overlap)?;

        let nonempty = match nonempty {
            Some(cells) => {
                if let Some(bad) = cells.iter().find(|(i, j)| *i >= tiling.0 || *j >= tiling.1) {
                    return Err(TileError::InvalidGeometry(format!(
                        "cell {bad:?} lies outside the {tiling:?} tile grid"
                    )));
                }
                cells
            }
            None => (0..tiling.0)
                .flat_map(|i| (0..tiling.1).map(move |j| (i, j)))
                .collect(),
        };

        let profile = Profile {
            id: Uuid::new_v4(),
            image_shape: image_shape.to_vec(),
            tile_size,
            overlap,
            indices,
            nonempty,
            link_data,
            stitch_map: OnceLock::new(),
            jobs: RwLock::new(Vec::new()),
        };
        debug!(
            profile = %profile.id,
            ?tiling,
            ?tile_size,
            nonempty = profile.nonempty.len(),
            "created profile"
        );

        Ok(Arc::new(profile))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn image_shape(&self) -> &[usize] {
        &self.image_shape
    }

    /// The tile grid dimensions (rows, cols)
    pub fn tiling(&self) -> (usize, usize) {
        self.indices.tiling()
    }

    /// The nominal tile size (rows, cols), overlap included
    pub fn tile_size(&self) -> (usize, usize) {
        self.tile_size
    }

    pub fn overlap(&self) -> (f64, f64) {
        self.overlap
    }

    /// The tile ranges and clean borders along both spatial axes
    pub fn indices(&self) -> &GridIndices {
        &self.indices
    }

    /// The occupied grid cells, in row-major order
    pub fn nonempty_indices(&self) -> &[(usize, usize)] {
        &self.nonempty
    }

    pub fn link_data(&self) -> bool {
        self.link_data
    }

    /// The stitch map for every occupied cell, derived on first use and kept for the lifetime
    /// of the profile.
    pub fn stitch_indices(&self) -> Result<&BTreeMap<(usize, usize), StitchIndex>> {
        if let Some(map) = self.stitch_map.get() {
            return Ok(map);
        }
        let map = stitch_indices(&self.indices, &self.nonempty)?;
        Ok(self.stitch_map.get_or_init(|| map))
    }

    /// The number of jobs ever registered under this profile.
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// The jobs registered under this profile whose output is still alive, in creation order.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.read().iter().filter_map(Weak::upgrade).collect()
    }

    /// Append a new job to this profile. The job id is its position in the job list.
    pub(crate) fn register_job(
        &self,
        kind: JobKind,
        params: serde_json::Value,
        input: Option<Vec<TileArray>>,
    ) -> Arc<Job> {
        let mut jobs = self.jobs.write();
        let job = Arc::new(Job {
            id: jobs.len(),
            profile_id: self.id,
            kind,
            params,
            input: input.filter(|_| self.link_data),
            output: OnceLock::new(),
        });
        jobs.push(Arc::downgrade(&job));
        debug!(profile = %self.id, job = job.id, ?kind, "registered job");

        job
    }
}

/// Derive the tile size for a requested tiling and compute the tile and border indices it
/// produces. Fails if the derived tile size does not reproduce the requested tiling.
pub(crate) fn plan_grid(
    image_shape: &[usize],
    tiling: (usize, usize),
    overlap: (f64, f64),
) -> Result<((usize, usize), GridIndices)> {
    let (h, w) = crate::indices::spatial_shape(image_shape)?;
    let tile_size = (
        tile_size_for_tiling(h, tiling.0, overlap.0)?,
        tile_size_for_tiling(w, tiling.1, overlap.1)?,
    );
    let indices = compute_2d(image_shape, tile_size, overlap)?;
    if indices.tiling() != tiling {
        return Err(TileError::InvalidGeometry(format!(
            "a {tiling:?} tiling of {image_shape:?} with overlap {overlap:?} is not \
             realizable; tile size {tile_size:?} yields {:?}",
            indices.tiling()
        )));
    }

    Ok((tile_size, indices))
}

/// Build a profile for an image of `image_shape` split into a `tiling` grid with the given
/// fractional `overlap`, with every cell occupied.
///
/// # Examples
///
/// ```
/// use tilestitch::build_profile;
/// let profile = build_profile(&[100, 100], (2, 2), (0.1, 0.1)).unwrap();
/// assert_eq!(profile.tile_size(), (53, 53));
/// assert_eq!(profile.indices().rows.borders, vec![0, 50, 100]);
/// ```
pub fn build_profile(
    image_shape: &[usize],
    tiling: (usize, usize),
    overlap: (f64, f64),
) -> Result<Arc<Profile>> {
    Profile::from_tiling(image_shape, tiling, overlap, None, false)
}
