//! Context owner trait
//!
//! Each context owner (`SegmentCtx`, `AllocatorCtx`, `RebuildCtx`)
//! plugs into a `ContextFileIo` engine through this trait. The engine
//! calls `before_flush` on the issuing path and `after_load` /
//! `after_flush` on completion; the owner never touches the file
//! itself. Versions are read back from the buffer that actually went to
//! (or came from) disk, never assumed.

use crate::error::AllocatorResult;
use crate::section::ContextOwner;

/// A context owner persisted through a `ContextFileIo` engine.
pub trait ContextClient: Send + Sync {
    /// Which owner this is.
    fn owner(&self) -> ContextOwner;

    /// The owner's on-disk magic.
    fn signature(&self) -> u32 {
        self.owner().signature()
    }

    /// Section sizes in registration order; fixed after init.
    fn section_sizes(&self) -> Vec<u64>;

    /// Serialize current state into the full file image. `external`
    /// optionally supplies freshly computed content for one section,
    /// overriding whatever the owner would have written there.
    fn before_flush(&self, buf: &mut [u8], external: Option<(usize, &[u8])>)
        -> AllocatorResult<()>;

    /// Validate and adopt a loaded file image. A signature mismatch is
    /// fatal corruption.
    fn after_load(&self, buf: &[u8]) -> AllocatorResult<()>;

    /// Observe the image that was actually written.
    fn after_flush(&self, buf: &[u8]) -> AllocatorResult<()>;

    /// Version currently persisted on disk, as last observed.
    fn stored_version(&self) -> u64;
}
