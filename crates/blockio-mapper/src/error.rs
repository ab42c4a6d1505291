//! Mapper error types

use blockio_common::VolumeId;
use blockio_metafs::MetafsError;
use thiserror::Error;

/// Mapper error
#[derive(Error, Debug)]
pub enum MapperError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata I/O failure
    #[error("meta I/O error: {0}")]
    Metafs(#[from] MetafsError),

    /// Map load just issued or still in flight; caller retries
    #[error("volume map loading, retry")]
    NeedRetry,

    /// Volume does not exist or is being deleted
    #[error("volume {0} not accessible")]
    VolumeNotAccessible(VolumeId),

    /// Block address outside the volume
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// On-disk map failed its header check. Fatal.
    #[error("corrupt map for volume {volume_id}: {detail}")]
    CorruptMap { volume_id: VolumeId, detail: String },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl MapperError {
    /// True for the contention sentinel a caller is expected to retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, MapperError::NeedRetry)
    }
}

/// Result type for mapper operations
pub type MapperResult<T> = Result<T, MapperError>;

/// Outcome of a volume lifecycle event. Invalid transitions leave the
/// slot unchanged and report `Fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum VolumeEventResult {
    Ok,
    Fail,
}

impl VolumeEventResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, VolumeEventResult::Ok)
    }
}
