use std::path::PathBuf;

/// Errors surfaced by the segmentation engine.
///
/// Invariant violations (incompatible constraints, descriptor mismatches) abort the current run
/// by bubbling up to the caller. Expected degeneracies never show up here; they are logged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("indices ({0}, {1}) out of bounds")]
    IndicesOutOfBounds(usize, usize),
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("regions {0} and {1} carry different constraints and can not be merged")]
    IncompatibleConstraints(usize, usize),
    #[error("descriptor count mismatch: expected {expected}, got {actual}")]
    DescriptorCountMismatch { expected: usize, actual: usize },
    #[error("can not compare {lhs} descriptor against {rhs} descriptor")]
    DescriptorKindMismatch {
        lhs: &'static str,
        rhs: &'static str,
    },
    #[error("frame {0} is not available")]
    MissingFrame(usize),
    #[error("hierarchy level {0} does not exist")]
    MissingLevel(usize),
    #[error("operation not valid in state {0}")]
    InvalidState(&'static str),
    #[error("container format error: {0}")]
    Format(String),
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("swap: {0}")]
    Swap(#[from] SwapError),
}

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("waiting for item {0} timed out")]
    Timeout(String),
    #[error("issued two identical read notices for {0}")]
    DuplicateReadNotice(String),
    #[error("item {0} is already swapped out")]
    AlreadySwappedOut(String),
    #[error("job {0} is not registered")]
    UnknownJob(String),
    #[error("no read notice issued for {0}")]
    MissingReadNotice(String),
    #[error("paging {0} failed: {1}")]
    Failed(String, String),
    #[error("swap service is not running")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;
