//! Rebuild context
//!
//! The durable set of segment ids still owed a rebuild after a device
//! failure. Every mutation rewrites the whole (small) file through the
//! owner's engine; the version bump happens in `before_flush`, so the
//! image on disk always carries the version of the state it holds. If
//! the engine is mid-flush when a mutation lands, the flush is deferred
//! and re-issued once the in-flight one drains, so no mutation is left
//! without a covering flush.
//!
//! File image:
//!
//! ```text
//! section 0 (RC_HEADER, 64 B):      sig(4) version(8) target_count(4)
//! section 1 (RC_SEGMENT_LIST):      u32 per user-area segment, dense
//!                                   prefix of target_count entries
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use blockio_common::{ArrayConfig, SegmentId};
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::client::ContextClient;
use crate::error::{AllocatorError, AllocatorResult};
use crate::file_io::ContextFileIo;
use crate::section::{ContextOwner, SectionLayout};

const HEADER_SIZE: u64 = 64;

struct RebuildInner {
    dirty_version: u64,
    stored_version: u64,
    targets: BTreeSet<SegmentId>,
    /// Dense staging copy serialized by `before_flush`
    list: Vec<SegmentId>,
}

/// Versioned set of segments under rebuild.
pub struct RebuildCtx {
    segment_count: u32,
    inner: Mutex<RebuildInner>,
    engine: OnceLock<Arc<ContextFileIo>>,
    /// Set when a mutation found the engine mid-flush; the completing
    /// flush re-issues one covering flush.
    flush_owed: AtomicBool,
}

impl RebuildCtx {
    #[must_use]
    pub fn new(config: &ArrayConfig) -> Self {
        Self {
            segment_count: config.segment_count,
            inner: Mutex::new(RebuildInner {
                dirty_version: 0,
                stored_version: 0,
                targets: BTreeSet::new(),
                list: Vec::new(),
            }),
            engine: OnceLock::new(),
            flush_owed: AtomicBool::new(false),
        }
    }

    /// Bind the engine that persists this context. Called once during
    /// manager construction.
    pub fn attach_engine(&self, engine: Arc<ContextFileIo>) {
        let _ = self.engine.set(engine);
    }

    fn engine(&self) -> AllocatorResult<&Arc<ContextFileIo>> {
        self.engine
            .get()
            .ok_or_else(|| AllocatorError::Internal("rebuild engine not attached".into()))
    }

    fn flush_async(self: &Arc<Self>) -> AllocatorResult<()> {
        loop {
            let this = self.clone();
            let submitted = self.engine()?.flush(
                None,
                Box::new(move |result| {
                    if let Err(err) = result {
                        error!(%err, "rebuild context flush failed");
                    }
                    this.resume_deferred_flush();
                }),
            );
            match submitted {
                Err(AllocatorError::IoPending(_)) => {
                    if self.flush_owed.swap(true, Ordering::AcqRel) {
                        // an owed flush is already queued; it serializes
                        // the current state, this mutation included
                        return Ok(());
                    }
                    // the in-flight flush may have drained before the
                    // owed flag became visible to its completion; if the
                    // engine is idle now, reclaim the flag and resubmit
                    if self.engine()?.pending_flush_count() == 0
                        && self.flush_owed.swap(false, Ordering::AcqRel)
                    {
                        continue;
                    }
                    return Ok(());
                }
                other => return other,
            }
        }
    }

    fn resume_deferred_flush(self: &Arc<Self>) {
        if self.flush_owed.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.flush_async() {
                error!(%err, "deferred rebuild flush failed to submit");
            }
        }
    }

    /// Replace the target set and persist it. Fire-and-forget: the
    /// flush result is logged, not returned. A busy engine defers the
    /// flush until the in-flight one drains.
    pub fn flush_rebuild_segment_list(
        self: &Arc<Self>,
        targets: &BTreeSet<SegmentId>,
    ) -> AllocatorResult<()> {
        {
            let mut inner = self.inner.lock();
            inner.targets = targets.clone();
            inner.list = targets.iter().copied().collect();
        }
        info!(count = targets.len(), "rebuild target list updated");
        self.flush_async()
    }

    /// Point-in-time snapshot of the target set.
    #[must_use]
    pub fn get_list(&self) -> BTreeSet<SegmentId> {
        self.inner.lock().targets.clone()
    }

    #[must_use]
    pub fn is_target(&self, segment_id: SegmentId) -> bool {
        self.inner.lock().targets.contains(&segment_id)
    }

    #[must_use]
    pub fn remaining_count(&self) -> usize {
        self.inner.lock().targets.len()
    }

    /// True while any segment still needs rebuilding.
    #[must_use]
    pub fn need_rebuild_again(&self) -> bool {
        !self.inner.lock().targets.is_empty()
    }

    /// Pick the next segment to rebuild. `Ok(None)` when the set is
    /// empty; `NeedRetry` when the set is momentarily locked.
    pub fn get_rebuild_target_segment(&self) -> AllocatorResult<Option<SegmentId>> {
        let inner = self.inner.try_lock().ok_or(AllocatorError::NeedRetry)?;
        Ok(inner.targets.iter().next().copied())
    }

    /// Drop a finished segment from the set and persist the shrink.
    pub fn release_rebuild_segment(self: &Arc<Self>, segment_id: SegmentId) -> AllocatorResult<()> {
        {
            let mut inner = self.inner.try_lock().ok_or(AllocatorError::NeedRetry)?;
            if !inner.targets.remove(&segment_id) {
                debug!(segment_id, "released segment was not a rebuild target");
                return Ok(());
            }
            inner.list = inner.targets.iter().copied().collect();
        }
        self.flush_async()
    }

    /// Remove a target without rebuilding it (segment was freed).
    pub fn erase_target(self: &Arc<Self>, segment_id: SegmentId) -> AllocatorResult<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.targets.remove(&segment_id) {
                return Ok(());
            }
            inner.list = inner.targets.iter().copied().collect();
        }
        self.flush_async()
    }
}

impl ContextClient for RebuildCtx {
    fn owner(&self) -> ContextOwner {
        ContextOwner::RebuildCtx
    }

    fn section_sizes(&self) -> Vec<u64> {
        vec![HEADER_SIZE, 4 * u64::from(self.segment_count)]
    }

    fn before_flush(&self, buf: &mut [u8], external: Option<(usize, &[u8])>)
        -> AllocatorResult<()> {
        let layout = SectionLayout::compute(&self.section_sizes());
        let mut inner = self.inner.lock();
        let version = inner.dirty_version;
        inner.dirty_version += 1;

        let mut header = &mut buf[layout.section(0)?.range()];
        header.put_u32_le(self.signature());
        header.put_u64_le(version);
        header.put_u32_le(inner.list.len() as u32);

        let mut list = &mut buf[layout.section(1)?.range()];
        for segment_id in &inner.list {
            list.put_u32_le(*segment_id);
        }

        if let Some((idx, bytes)) = external {
            let section = layout.section(idx)?;
            if bytes.len() as u64 != section.size {
                return Err(AllocatorError::InvalidSection(format!(
                    "external content is {} bytes, section {} is {}",
                    bytes.len(),
                    idx,
                    section.size
                )));
            }
            buf[section.range()].copy_from_slice(bytes);
        }
        Ok(())
    }

    fn after_load(&self, buf: &[u8]) -> AllocatorResult<()> {
        let layout = SectionLayout::compute(&self.section_sizes());
        let mut header = &buf[layout.section(0)?.range()];
        let sig = header.get_u32_le();
        if sig != self.signature() {
            return Err(AllocatorError::CorruptContext {
                owner: "rebuild",
                detail: format!("signature {sig:#010x}, expected {:#010x}", self.signature()),
            });
        }
        let version = header.get_u64_le();
        let count = header.get_u32_le();
        if count > self.segment_count {
            return Err(AllocatorError::CorruptContext {
                owner: "rebuild",
                detail: format!("{} targets, array has {} segments", count, self.segment_count),
            });
        }

        let mut inner = self.inner.lock();
        let mut list_buf = &buf[layout.section(1)?.range()];
        inner.list.clear();
        inner.targets.clear();
        for _ in 0..count {
            let segment_id = list_buf.get_u32_le();
            inner.list.push(segment_id);
            inner.targets.insert(segment_id);
        }
        inner.stored_version = version;
        inner.dirty_version = version + 1;
        if !inner.targets.is_empty() {
            info!(
                count = inner.targets.len(),
                "rebuild targets pending from previous run"
            );
        }
        Ok(())
    }

    fn after_flush(&self, buf: &[u8]) -> AllocatorResult<()> {
        let mut header = &buf[4..12];
        let version = header.get_u64_le();
        self.inner.lock().stored_version = version;
        Ok(())
    }

    fn stored_version(&self) -> u64 {
        self.inner.lock().stored_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ArrayConfig {
        ArrayConfig {
            segment_count: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_serialize_dense_prefix() {
        let ctx = RebuildCtx::new(&config());
        {
            let mut inner = ctx.inner.lock();
            inner.targets = BTreeSet::from([3, 5, 7]);
            inner.list = vec![3, 5, 7];
        }
        let size = SectionLayout::compute(&ctx.section_sizes()).file_size() as usize;
        let mut image = vec![0u8; size];
        ctx.before_flush(&mut image, None).unwrap();
        ctx.after_flush(&image).unwrap();

        let restored = RebuildCtx::new(&config());
        restored.after_load(&image).unwrap();
        assert_eq!(restored.get_list(), BTreeSet::from([3, 5, 7]));
        assert_eq!(restored.stored_version(), 0);
        assert!(restored.need_rebuild_again());
    }

    #[test]
    fn test_dirty_stays_ahead_of_stored() {
        let ctx = RebuildCtx::new(&config());
        let size = SectionLayout::compute(&ctx.section_sizes()).file_size() as usize;
        let mut image = vec![0u8; size];
        for expected in 0..3u64 {
            ctx.before_flush(&mut image, None).unwrap();
            ctx.after_flush(&image).unwrap();
            assert_eq!(ctx.stored_version(), expected);
            let dirty = ctx.inner.lock().dirty_version;
            assert!(dirty > ctx.stored_version());
        }
    }

    #[test]
    fn test_target_selection_and_release_set_shape() {
        let ctx = RebuildCtx::new(&config());
        {
            let mut inner = ctx.inner.lock();
            inner.targets = BTreeSet::from([2, 4]);
            inner.list = vec![2, 4];
        }
        assert_eq!(ctx.get_rebuild_target_segment().unwrap(), Some(2));
        assert!(ctx.is_target(4));
        assert!(!ctx.is_target(3));
        assert_eq!(ctx.remaining_count(), 2);
    }

    #[test]
    fn test_selection_under_held_lock_needs_retry() {
        let ctx = RebuildCtx::new(&config());
        let _guard = ctx.inner.lock();
        assert!(matches!(
            ctx.get_rebuild_target_segment(),
            Err(AllocatorError::NeedRetry)
        ));
    }

    #[test]
    fn test_load_rejects_overlong_count() {
        let ctx = RebuildCtx::new(&config());
        let size = SectionLayout::compute(&ctx.section_sizes()).file_size() as usize;
        let mut image = vec![0u8; size];
        ctx.before_flush(&mut image, None).unwrap();
        // corrupt the target count past the segment count
        let mut header = &mut image[12..16];
        header.put_u32_le(99);
        assert!(matches!(
            ctx.after_load(&image),
            Err(AllocatorError::CorruptContext { owner: "rebuild", .. })
        ));
    }
}
