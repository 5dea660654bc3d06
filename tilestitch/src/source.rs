//! Tile sources produce the initial grid of tiles for a tiling request. Reading image files is
//! left to the embedding application; the sources here work from data that is already in memory.

use crate::errors::TileError;
use crate::indices::{GridIndices, nonempty_from_grid};
use crate::payload::Payload;
use crate::profile::{DataKind, JobKind, JobOutput, Profile, plan_grid};
use crate::tiles::{TileArray, TileGrid, TileMeta};
use crate::Result;
use itertools::iproduct;
use ndarray::Array2;
use rayon::prelude::*;
use serde_json::json;
use tracing::debug;

/// Something that can be split into a grid of tiles.
pub trait TileSource {
    /// The full image shape. The two trailing axes are the spatial height and width.
    fn image_shape(&self) -> Vec<usize>;

    /// Produce the grid of tiles described by `indices`, whose nominal tile size is `tile_size`.
    /// The returned grid must have the dimensions of `indices.tiling()`; absent tiles are `None`.
    fn read_tiles(&self, indices: &GridIndices, tile_size: (usize, usize)) -> Result<TileGrid>;
}

/// An in-memory image of shape `(..., H, W)`. Every grid cell is present.
#[derive(Debug, Clone)]
pub struct ArraySource {
    image: Payload,
    pad_tiles: bool,
}

impl ArraySource {
    pub fn new(image: impl Into<Payload>) -> Self {
        Self {
            image: image.into(),
            pad_tiles: false,
        }
    }

    /// Zero-pad the tiles of the last row and column up to the nominal tile size, so that every
    /// tile has the same spatial shape and can be stacked into a batch.
    pub fn with_padding(mut self, pad_tiles: bool) -> Self {
        self.pad_tiles = pad_tiles;
        self
    }
}

impl TileSource for ArraySource {
    fn image_shape(&self) -> Vec<usize> {
        self.image.shape()
    }

    fn read_tiles(&self, indices: &GridIndices, tile_size: (usize, usize)) -> Result<TileGrid> {
        let (rows, cols) = indices.tiling();
        let ndim = self.image.shape().len();
        let cells = iproduct!(0..rows, 0..cols).collect::<Vec<_>>();

        let tiles = cells
            .par_iter()
            .map(|&(i, j)| {
                let tile = self
                    .image
                    .crop_spatial(indices.rows.tile(i), indices.cols.tile(j))?;
                if !self.pad_tiles {
                    return Ok(Some(tile));
                }
                let (h, w) = indices.tile_extent((i, j));
                let tile = tile
                    .pad_axis(ndim - 2, tile_size.0.saturating_sub(h))?
                    .pad_axis(ndim - 1, tile_size.1.saturating_sub(w))?;
                Ok(Some(tile))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Array2::from_shape_vec((rows, cols), tiles)?)
    }
}

/// A grid of tiles that was acquired already split, such as a stage scan, along with the shape
/// of the image the tiles cover.
#[derive(Debug, Clone)]
pub struct GridSource {
    tiles: TileGrid,
    image_shape: Vec<usize>,
}

impl GridSource {
    pub fn new(tiles: TileGrid, image_shape: Vec<usize>) -> Self {
        Self { tiles, image_shape }
    }
}

impl TileSource for GridSource {
    fn image_shape(&self) -> Vec<usize> {
        self.image_shape.clone()
    }

    fn read_tiles(&self, indices: &GridIndices, _tile_size: (usize, usize)) -> Result<TileGrid> {
        if self.tiles.dim() != indices.tiling() {
            return Err(TileError::InvalidGeometry(format!(
                "the source holds a {:?} grid of tiles but the tiling is {:?}",
                self.tiles.dim(),
                indices.tiling()
            )));
        }
        Ok(self.tiles.clone())
    }
}

/// Split a source into a `tiling` grid of tiles overlapping by the fractions in `overlap`. A new
/// profile is created for the tiles and a `GetTiles` job is recorded under it.
///
/// # Arguments
///
/// * `source`: the data to split
/// * `tiling`: the number of tiles along (rows, cols)
/// * `overlap`: the overlap fraction along (rows, cols)
/// * `link_data`: whether jobs run on these tiles keep a reference to their inputs
///
/// returns: Result<TileArray, TileError>
pub fn get_tiles(
    source: &impl TileSource,
    tiling: (usize, usize),
    overlap: (f64, f64),
    link_data: bool,
) -> Result<TileArray> {
    let image_shape = source.image_shape();
    let (tile_size, indices) = plan_grid(&image_shape, tiling, overlap)?;
    let grid = source.read_tiles(&indices, tile_size)?;
    if grid.dim() != tiling {
        return Err(TileError::InvalidGeometry(format!(
            "the source returned a {:?} grid for a {tiling:?} tiling",
            grid.dim()
        )));
    }

    let nonempty = nonempty_from_grid(&grid);
    debug!(?tiling, ?tile_size, present = nonempty.len(), "read tiles");
    let profile = Profile::from_tiling(&image_shape, tiling, overlap, Some(nonempty), link_data)?;
    let params = json!({
        "tiling": tiling,
        "overlap": overlap,
        "link_data": link_data,
    });
    let job = profile.register_job(JobKind::GetTiles, params, None);
    let tiles = TileArray::new(grid, TileMeta::image(), profile, job.clone())?;
    job.set_output(JobOutput::Tiled(vec![(Vec::new(), DataKind::TiledImage)]))?;

    Ok(tiles)
}
