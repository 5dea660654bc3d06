//! Overlapping tiling of large images, batched processing of the tiles with arbitrary user
//! functions, and border-aware stitching of the per-tile results back into one image.
//!
//! A typical pipeline reads tiles from a [`TileSource`] with [`get_tiles`], runs a model over
//! them with [`process`], and reassembles the resulting instance masks with [`stitch_masks`].

pub mod errors;
pub mod indices;
pub mod payload;
pub mod process;
pub mod profile;
pub mod source;
pub mod stitch;
pub mod tiles;
pub mod tree;

pub use errors::TileError;
pub use payload::Payload;
pub use process::{Arg, CallArg, Output, ProcessOptions, process};
pub use profile::{DataKind, Job, JobKind, JobOutput, Profile, build_profile};
pub use source::{ArraySource, GridSource, TileSource, get_tiles};
pub use stitch::{StitchOptions, Stitched, stitch_image, stitch_masks};
pub use tiles::{TileArray, TileGrid, TileMeta, check_compatibility};
pub use tree::{Args, PathSegment, Tree, TreePath};

pub type Result<T> = std::result::Result<T, TileError>;
