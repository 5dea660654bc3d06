use crate::tree::TreePath;
use thiserror::Error;

/// Errors raised by the tiling, processing and stitching machinery. Errors produced by a user
/// processing function are never wrapped in this type; they are handed back to the caller as-is.
#[derive(Debug, Error)]
pub enum TileError {
    /// Tiling, tile size or overlap parameters that cannot describe a valid tile grid.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Tile arrays passed to one call do not share a profile or a presence mask.
    #[error("profile mismatch: {0}")]
    ProfileMismatch(String),

    /// A processing function returned a differently shaped result tree than on its first call.
    #[error("result tree shape changed: expected leaves {expected:?}, found {found:?}")]
    TreeShapeMismatch {
        expected: Vec<TreePath>,
        found: Vec<TreePath>,
    },

    /// A batched result had fewer entries along its leading axis than the batch it came from.
    #[error("batched result holds {found} entries but the batch has {expected} tiles")]
    BatchMismatch { expected: usize, found: usize },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Payloads of different element types or shapes were combined.
    #[error("payload mismatch: {0}")]
    PayloadMismatch(String),

    /// A geometry invariant was violated. This indicates a defect, not bad user input.
    #[error("internal consistency error: {0}")]
    InternalConsistency(String),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}
