//! Allocator error types

use blockio_metafs::MetafsError;
use thiserror::Error;

/// Allocator error
#[derive(Error, Debug)]
pub enum AllocatorError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata I/O failure
    #[error("meta I/O error: {0}")]
    Metafs(#[from] MetafsError),

    /// A whole-context flush is already running
    #[error("context flush already in progress")]
    FlushInProgress,

    /// A load or flush on this engine is already outstanding
    #[error("context I/O already pending for {0}")]
    IoPending(&'static str),

    /// Caller should back off and retry (rebuild target lock busy)
    #[error("busy, retry")]
    NeedRetry,

    /// On-disk context failed its signature or shape check. Fatal.
    #[error("corrupt {owner} context: {detail}")]
    CorruptContext { owner: &'static str, detail: String },

    /// Section index outside the owner's layout
    #[error("invalid section: {0}")]
    InvalidSection(String),

    /// No free segment to allocate
    #[error("no free segment")]
    NoFreeSegment,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl AllocatorError {
    /// True for contention sentinels a caller is expected to retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AllocatorError::FlushInProgress | AllocatorError::NeedRetry
        )
    }
}

/// Result type for allocator operations
pub type AllocatorResult<T> = Result<T, AllocatorError>;
