//! Error taxonomy for the analysis core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the analysis core.
///
/// Input and configuration errors abort the pipeline before any sweep work
/// starts; compute errors abort the current sweep and leave already-completed
/// records intact.
#[derive(Debug, Error)]
pub enum Error {
    /// Input folder does not exist or is not a directory.
    #[error("input folder does not exist or is not a directory: {0:?}")]
    FolderMissing(PathBuf),

    /// The input folder contains no slice files with an accepted extension.
    #[error("no slice files matching {extensions:?} found in {folder:?}")]
    NoMatchingFiles {
        folder: PathBuf,
        extensions: Vec<String>,
    },

    /// A slice file could not be opened or decoded.
    #[error("failed to read slice {path:?}: {reason}")]
    UnreadableSlice { path: PathBuf, reason: String },

    /// A slice does not match the (rows, cols) established by the first slice.
    #[error(
        "slice {path:?} has shape {actual_rows}x{actual_cols}, expected {expected_rows}x{expected_cols}"
    )]
    ShapeMismatch {
        expected_rows: usize,
        expected_cols: usize,
        actual_rows: usize,
        actual_cols: usize,
        path: PathBuf,
    },

    /// A slice does not match the bit depth established by the first slice.
    #[error("slice {path:?} has bit depth {actual}, expected {expected}")]
    BitDepthMismatch {
        expected: u8,
        actual: u8,
        path: PathBuf,
    },

    /// Erosion radius outside the valid range.
    #[error("erosion radius must be >= 1, got {0}")]
    InvalidRadius(i64),

    /// Connectivity other than 6 or 26.
    #[error("connectivity must be 6 or 26, got {0}")]
    InvalidConnectivity(u32),

    /// Contacts range where the lower bound exceeds the upper bound.
    #[error("invalid contacts range: min {0} > max {1}")]
    InvalidContactsRange(f64, f64),

    /// Polarity string that is not one of auto/bright/dark.
    #[error("unsupported polarity: {0:?} (expected auto, bright, or dark)")]
    UnsupportedPolarity(String),

    /// Threshold method string that is not one of otsu/triangle.
    #[error("unsupported threshold method: {0:?} (expected otsu or triangle)")]
    UnsupportedThresholdMethod(String),

    /// Cooperative cancellation observed at a progress boundary.
    #[error("analysis cancelled")]
    Cancelled,

    /// Filesystem failure while persisting results.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure while writing the tabular sweep report.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;
