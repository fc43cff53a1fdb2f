use std::time::Duration;

use thiserror::Error;

/// Per-slice ingestion failure. Non-fatal to a batch load: rejected slices
/// are reported in the [`LoadSummary`](crate::ingest::LoadSummary) and the
/// rest of the batch proceeds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("slice has no pixel data")]
    EmptyPixelData,

    #[error("pixel payload length {actual} does not match declared dimensions ({expected})")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("declared image dimensions are zero")]
    ZeroDimensions,
}

/// Fatal series assembly failure. Irregular inter-slice spacing is *not*
/// one of these: it is logged as a warning and assembly continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    #[error("series contains no validated slices")]
    NoValidSlices,

    #[error("inconsistent slice dimensions within series")]
    InconsistentDimensions,
}

/// Failure of a single render request. Aborts only that request; cached
/// entries for other parameters are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    #[error("unknown series")]
    UnknownSeries,

    #[error("index {index} out of bounds (extent {extent})")]
    IndexOutOfBounds { index: usize, extent: usize },

    #[error("volume assembly failed: {0}")]
    Assembly(#[from] AssembleError),

    #[error("operation exceeded its time budget of {budget:?}")]
    Timeout { budget: Duration },

    #[error("operation was cancelled by the caller")]
    Cancelled,

    #[error("raster encoding failed: {0}")]
    Encoding(String),
}

impl ComputeError {
    /// Timeouts are recoverable: the caller may retry with a reduced scope
    /// (thinner slab, coarser sampling step).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ComputeError::Timeout { .. })
    }
}
