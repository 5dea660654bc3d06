//! The `TileArray`, a 2D grid of tile payloads tied to the profile that describes its geometry
//! and to the job that produced it.

use crate::errors::TileError;
use crate::payload::Payload;
use crate::profile::{DataKind, Job, Profile};
use crate::Result;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// A grid of optional tile payloads, indexed by (row, col) of the tile grid.
pub type TileGrid = Array2<Option<Payload>>;

/// Metadata describing the payloads of a tile array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileMeta {
    pub kind: DataKind,

    /// Whether several tiles can be stacked along a new leading axis to form a batch
    pub stackable: bool,

    /// Whether each tile carries a leading axis of sub-results accumulated across calls
    pub batch_axis: bool,
}

impl TileMeta {
    pub fn image() -> Self {
        Self {
            kind: DataKind::TiledImage,
            stackable: true,
            batch_axis: false,
        }
    }

    pub fn coords() -> Self {
        Self {
            kind: DataKind::TiledCoords,
            stackable: false,
            batch_axis: false,
        }
    }
}

impl Default for TileMeta {
    fn default() -> Self {
        Self::image()
    }
}

/// A grid of tiles with the shape of its profile's tiling. Each cell either holds a payload or
/// is `None` for an absent tile. Tile arrays are immutable once built, and cloning one only
/// clones references to the shared grid.
#[derive(Clone)]
pub struct TileArray {
    tiles: Arc<TileGrid>,
    meta: TileMeta,
    profile: Arc<Profile>,
    job: Arc<Job>,
}

impl Debug for TileArray {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileArray")
            .field("tiling", &self.tiles.dim())
            .field("meta", &self.meta)
            .field("profile", &self.profile.id())
            .field("job", &self.job.id())
            .field("nonempty", &self.nonempty_indices().len())
            .finish()
    }
}

impl TileArray {
    pub(crate) fn new(
        tiles: TileGrid,
        meta: TileMeta,
        profile: Arc<Profile>,
        job: Arc<Job>,
    ) -> Result<Self> {
        if !meta.kind.is_tiled() {
            return Err(TileError::InvalidOptions(format!(
                "a tile array cannot carry {:?} data",
                meta.kind
            )));
        }
        if tiles.dim() != profile.tiling() {
            return Err(TileError::InternalConsistency(format!(
                "tile grid {:?} does not match the profile tiling {:?}",
                tiles.dim(),
                profile.tiling()
            )));
        }

        Ok(Self {
            tiles: Arc::new(tiles),
            meta,
            profile,
            job,
        })
    }

    pub fn tiles(&self) -> &TileGrid {
        &self.tiles
    }

    /// The payload at grid cell `(i, j)`, if the cell exists and holds a tile.
    pub fn get(&self, index: (usize, usize)) -> Option<&Payload> {
        self.tiles.get(index).and_then(|t| t.as_ref())
    }

    pub fn meta(&self) -> &TileMeta {
        &self.meta
    }

    pub fn profile(&self) -> &Arc<Profile> {
        &self.profile
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn tiling(&self) -> (usize, usize) {
        self.tiles.dim()
    }

    /// Which grid cells hold a tile.
    pub fn presence(&self) -> Array2<bool> {
        self.tiles.map(|t| t.is_some())
    }

    /// The occupied grid cells, in row-major order.
    pub fn nonempty_indices(&self) -> Vec<(usize, usize)> {
        crate::indices::nonempty_from_grid(&self.tiles)
    }

    /// Iterate the occupied cells and their payloads in row-major order.
    pub fn iter_nonempty(&self) -> impl Iterator<Item = ((usize, usize), &Payload)> {
        self.tiles
            .indexed_iter()
            .filter_map(|(index, cell)| cell.as_ref().map(|t| (index, t)))
    }
}

/// Verify that tile arrays can be processed together: there is at least one, they all share the
/// same profile object, and the same cells are occupied in all of them.
pub fn check_compatibility(tiles: &[&TileArray]) -> Result<()> {
    let Some((first, rest)) = tiles.split_first() else {
        return Err(TileError::ProfileMismatch("no tile arrays were given".into()));
    };

    for other in rest {
        if !Arc::ptr_eq(first.profile(), other.profile()) {
            return Err(TileError::ProfileMismatch(format!(
                "tile arrays belong to different profiles ({} and {})",
                first.profile().id(),
                other.profile().id()
            )));
        }

        let same_mask = first
            .tiles()
            .iter()
            .zip(other.tiles().iter())
            .all(|(a, b)| a.is_some() == b.is_some());
        if !same_mask {
            return Err(TileError::ProfileMismatch(
                "tile arrays do not share a common presence mask".into(),
            ));
        }
    }

    Ok(())
}
