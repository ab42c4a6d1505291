//! BlockIO Allocator - context persistence
//!
//! The allocator's durable state lives in three context files, one per
//! owner: the segment context (valid-block counters and segment
//! states), the allocator context (stripe cursor and active tails), and
//! the rebuild context (the set of segments still owed a rebuild).
//! Each owner serializes into a section-addressed file through its own
//! `ContextFileIo` engine; `ContextIoManager` brings the three up in a
//! fixed order and gates whole-context flushes.

pub mod allocator_ctx;
pub mod client;
pub mod error;
pub mod file_io;
pub mod manager;
pub mod rebuild;
pub mod section;
pub mod segment_ctx;

pub use allocator_ctx::AllocatorCtx;
pub use client::ContextClient;
pub use error::{AllocatorError, AllocatorResult};
pub use file_io::{ContextFileIo, FlushCallback, IoWaitKind, LoadState};
pub use manager::{BringupFailurePolicy, ContextIoManager, ContextIoManagerConfig};
pub use rebuild::RebuildCtx;
pub use section::{ContextOwner, ContextSection, SectionLayout};
pub use segment_ctx::{SegmentCtx, SegmentState};
