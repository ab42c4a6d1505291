//! MetaFS error types

use blockio_common::MetaLpn;
use thiserror::Error;

/// MetaFS error
#[derive(Error, Debug)]
pub enum MetafsError {
    /// I/O error from the backing file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file's owner has begun shutdown; no new I/O is accepted
    #[error("I/O rejected: file is in stop state")]
    StopState,

    /// A valid page whose control info does not match the request
    #[error("end-to-end check failed at lpn {lpn}: {detail}")]
    E2eMismatch { lpn: MetaLpn, detail: String },

    /// Backing file missing on open
    #[error("meta file not found: {0}")]
    FileNotFound(String),

    /// Request outside the file, or zero-length
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl MetafsError {
    /// True for the shutdown rejection, which callers treat as quiet.
    #[must_use]
    pub fn is_stop_state(&self) -> bool {
        matches!(self, MetafsError::StopState)
    }
}

/// Result type for metafs operations
pub type MetafsResult<T> = Result<T, MetafsError>;
