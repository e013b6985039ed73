use std::path::PathBuf;

use thiserror::Error;

/// Errors callers are expected to match on.
///
/// Everything else is propagated as `anyhow::Error`.
#[derive(Error, Debug)]
pub enum FacesError {
    #[error("worker canceled")]
    Canceled,
    #[error("face recognition is disabled")]
    Disabled,
    #[error("no detection engine configured")]
    EngineUnavailable,
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("invalid image {path}: {reason}")]
    InvalidImage { path: PathBuf, reason: String },
    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),
    #[error("invalid cascade {name}: {reason}")]
    InvalidCascade { name: String, reason: String },
    #[error("cannot unmarshal embeddings: {0}")]
    Unmarshal(String),
}

impl FacesError {
    /// True if the error is the cancellation sentinel.
    pub fn is_canceled(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<FacesError>(), Some(FacesError::Canceled))
    }
}
