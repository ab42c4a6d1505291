//! ContextIoManager - three-owner context orchestration
//!
//! Owns the segment, allocator, and rebuild context engines and brings
//! them up in that fixed order. A whole-context flush covers the
//! segment and allocator owners behind a single in-progress gate; the
//! rebuild context flushes independently. The caller's flush callback
//! fires exactly once, from whichever engine completes last.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use blockio_common::{ArrayConfig, ArrayId, MetricsCollector};
use blockio_metafs::MetaIoManager;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::allocator_ctx::AllocatorCtx;
use crate::error::{AllocatorError, AllocatorResult};
use crate::file_io::{ContextFileIo, FlushCallback, IoWaitKind, LoadState};
use crate::rebuild::RebuildCtx;
use crate::section::{ContextOwner, ContextSection};
use crate::segment_ctx::SegmentCtx;

/// What to do when an owner fails to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BringupFailurePolicy {
    /// Return the error to the caller.
    #[default]
    FailFast,
    /// Hold the process for diagnosis; released by `dispose`.
    Halt,
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ContextIoManagerConfig {
    /// Directory holding the array's context files
    pub dir: PathBuf,
    pub array_id: ArrayId,
    pub bringup_policy: BringupFailurePolicy,
}

/// Orchestrates the three context engines.
pub struct ContextIoManager {
    segment_ctx: Arc<SegmentCtx>,
    allocator_ctx: Arc<AllocatorCtx>,
    rebuild_ctx: Arc<RebuildCtx>,
    segment_engine: Arc<ContextFileIo>,
    allocator_engine: Arc<ContextFileIo>,
    rebuild_engine: Arc<ContextFileIo>,
    policy: BringupFailurePolicy,
    flush_in_progress: Arc<AtomicBool>,
    flush_drained: Arc<Notify>,
    metrics: Arc<MetricsCollector>,
    shutdown: Arc<Notify>,
}

impl ContextIoManager {
    #[must_use]
    pub fn new(
        config: ContextIoManagerConfig,
        array_config: &ArrayConfig,
        io: Arc<MetaIoManager>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let segment_ctx = Arc::new(SegmentCtx::new(array_config));
        let allocator_ctx = Arc::new(AllocatorCtx::new(array_config));
        let rebuild_ctx = Arc::new(RebuildCtx::new(array_config));

        let segment_engine = Arc::new(ContextFileIo::new(
            segment_ctx.clone(),
            io.clone(),
            metrics.clone(),
            &config.dir,
            config.array_id,
        ));
        let allocator_engine = Arc::new(ContextFileIo::new(
            allocator_ctx.clone(),
            io.clone(),
            metrics.clone(),
            &config.dir,
            config.array_id,
        ));
        let rebuild_engine = Arc::new(ContextFileIo::new(
            rebuild_ctx.clone(),
            io,
            metrics.clone(),
            &config.dir,
            config.array_id,
        ));
        rebuild_ctx.attach_engine(rebuild_engine.clone());

        Self {
            segment_ctx,
            allocator_ctx,
            rebuild_ctx,
            segment_engine,
            allocator_engine,
            rebuild_engine,
            policy: config.bringup_policy,
            flush_in_progress: Arc::new(AtomicBool::new(false)),
            flush_drained: Arc::new(Notify::new()),
            metrics,
            shutdown: Arc::new(Notify::new()),
        }
    }

    #[must_use]
    pub fn segment_ctx(&self) -> &Arc<SegmentCtx> {
        &self.segment_ctx
    }

    #[must_use]
    pub fn allocator_ctx(&self) -> &Arc<AllocatorCtx> {
        &self.allocator_ctx
    }

    #[must_use]
    pub fn rebuild_ctx(&self) -> &Arc<RebuildCtx> {
        &self.rebuild_ctx
    }

    fn engine(&self, owner: ContextOwner) -> &Arc<ContextFileIo> {
        match owner {
            ContextOwner::SegmentCtx => &self.segment_engine,
            ContextOwner::AllocatorCtx => &self.allocator_engine,
            ContextOwner::RebuildCtx => &self.rebuild_engine,
        }
    }

    async fn flush_one_sync(engine: &Arc<ContextFileIo>) -> AllocatorResult<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        engine.flush(
            None,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        rx.await
            .map_err(|_| AllocatorError::Internal("flush callback dropped".into()))?
    }

    async fn bring_up_one(&self, owner: ContextOwner) -> AllocatorResult<()> {
        let engine = self.engine(owner);
        engine.init()?;
        match engine.load_context()? {
            LoadState::FreshFile => {
                // a fresh file has no version on disk yet
                Self::flush_one_sync(engine).await?;
                info!(owner = owner.as_str(), "initial context version flushed");
            }
            LoadState::Issued => {
                engine.wait_pending(IoWaitKind::Read).await;
                if let Some(err) = engine.take_async_error() {
                    return Err(err);
                }
                info!(
                    owner = owner.as_str(),
                    version = engine.stored_version(),
                    "context loaded"
                );
            }
        }
        Ok(())
    }

    /// Bring up all three owners in order. A fresh file gets an
    /// immediate initial flush; a load failure aborts per policy.
    pub async fn init(&self) -> AllocatorResult<()> {
        for owner in [
            ContextOwner::SegmentCtx,
            ContextOwner::AllocatorCtx,
            ContextOwner::RebuildCtx,
        ] {
            if let Err(err) = self.bring_up_one(owner).await {
                error!(owner = owner.as_str(), %err, "context bring-up failed");
                match self.policy {
                    BringupFailurePolicy::FailFast => return Err(err),
                    BringupFailurePolicy::Halt => {
                        self.shutdown.notified().await;
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    /// Flush segment and allocator contexts. At most one whole-context
    /// flush runs at a time; `on_complete` fires exactly once, after
    /// the last engine completes, with the first error if any.
    pub async fn flush_contexts(
        &self,
        on_complete: Option<FlushCallback>,
        sync: bool,
    ) -> AllocatorResult<()> {
        if self
            .flush_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AllocatorError::FlushInProgress);
        }

        let engines = [&self.segment_engine, &self.allocator_engine];
        let remaining = Arc::new(AtomicU64::new(engines.len() as u64));
        let first_error: Arc<Mutex<Option<AllocatorError>>> = Arc::new(Mutex::new(None));
        let callback = Arc::new(Mutex::new(on_complete));
        self.metrics.set_pending_context_flushes(engines.len() as u64);

        let complete_one = {
            let remaining = remaining.clone();
            let first_error = first_error.clone();
            let callback = callback.clone();
            let in_progress = self.flush_in_progress.clone();
            let drained = self.flush_drained.clone();
            let metrics = self.metrics.clone();
            move |result: AllocatorResult<()>| {
                if let Err(err) = result {
                    let mut guard = first_error.lock();
                    if guard.is_none() {
                        *guard = Some(err);
                    }
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    in_progress.store(false, Ordering::Release);
                    metrics.set_pending_context_flushes(0);
                    if let Some(cb) = callback.lock().take() {
                        let aggregate = match first_error.lock().take() {
                            Some(err) => Err(err),
                            None => Ok(()),
                        };
                        cb(aggregate);
                    }
                    drained.notify_waiters();
                }
            }
        };

        for engine in engines {
            let complete = complete_one.clone();
            let submitted = engine.flush(None, Box::new(complete.clone()));
            if let Err(err) = submitted {
                warn!(
                    owner = engine.owner().as_str(),
                    %err,
                    "context flush submission failed"
                );
                complete(Err(err));
            }
        }

        if sync {
            self.wait_flush_drained().await;
        }
        Ok(())
    }

    async fn wait_flush_drained(&self) {
        loop {
            if !self.flush_in_progress.load(Ordering::Acquire) {
                return;
            }
            let notified = self.flush_drained.notified();
            if !self.flush_in_progress.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Flush the rebuild context on its own pending counter.
    pub async fn flush_rebuild_context(
        &self,
        on_complete: Option<FlushCallback>,
        sync: bool,
    ) -> AllocatorResult<()> {
        let callback: FlushCallback = match on_complete {
            Some(cb) => cb,
            None => Box::new(|result| {
                if let Err(err) = result {
                    error!(%err, "rebuild context flush failed");
                }
            }),
        };
        self.rebuild_engine.flush(None, callback)?;
        if sync {
            self.rebuild_engine.wait_pending(IoWaitKind::Flush).await;
        }
        Ok(())
    }

    /// Wait for the given class of pending I/O across all engines.
    pub async fn wait_pending_io(&self, kind: IoWaitKind) {
        self.segment_engine.wait_pending(kind).await;
        self.allocator_engine.wait_pending(kind).await;
        self.rebuild_engine.wait_pending(kind).await;
        if matches!(kind, IoWaitKind::All | IoWaitKind::Flush) {
            self.wait_flush_drained().await;
        }
    }

    #[must_use]
    pub fn get_stored_context_version(&self, owner: ContextOwner) -> u64 {
        self.engine(owner).stored_version()
    }

    pub fn section(&self, owner: ContextOwner, index: usize) -> AllocatorResult<ContextSection> {
        self.engine(owner).section(index)
    }

    /// Close every engine. Releases a halted bring-up, then fails any
    /// late I/O quietly with stop state.
    pub fn dispose(&self) {
        self.shutdown.notify_waiters();
        self.rebuild_engine.dispose();
        self.allocator_engine.dispose();
        self.segment_engine.dispose();
        info!("context io manager disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    // RUST_LOG=debug cargo test -p blockio-allocator -- --nocapture
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn io_manager() -> Arc<MetaIoManager> {
        Arc::new(MetaIoManager::with_config(
            16,
            &array_config(),
            Arc::new(MetricsCollector::new()),
        ))
    }

    fn array_config() -> ArrayConfig {
        ArrayConfig {
            segment_count: 8,
            volume_slot_count: 8,
            ..Default::default()
        }
    }

    fn manager(dir: &std::path::Path, io: Arc<MetaIoManager>) -> ContextIoManager {
        ContextIoManager::new(
            ContextIoManagerConfig {
                dir: dir.to_path_buf(),
                array_id: 0,
                bringup_policy: BringupFailurePolicy::FailFast,
            },
            &array_config(),
            io,
            Arc::new(MetricsCollector::new()),
        )
    }

    #[tokio::test]
    async fn test_fresh_bringup_writes_initial_versions() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), io_manager());
        mgr.init().await.unwrap();

        assert_eq!(mgr.get_stored_context_version(ContextOwner::SegmentCtx), 0);
        assert_eq!(mgr.get_stored_context_version(ContextOwner::AllocatorCtx), 0);
        assert_eq!(mgr.get_stored_context_version(ContextOwner::RebuildCtx), 0);
        mgr.dispose();
    }

    #[tokio::test]
    async fn test_restart_reloads_mutated_state() {
        init_tracing();
        let dir = tempdir().unwrap();
        let io = io_manager();

        {
            let mgr = manager(dir.path(), io.clone());
            mgr.init().await.unwrap();

            let seg = mgr.segment_ctx().allocate_free_segment().unwrap();
            mgr.segment_ctx().validate_blocks(seg, 17).unwrap();
            mgr.allocator_ctx().alloc_ssd_stripe().unwrap();
            mgr.flush_contexts(None, true).await.unwrap();
            mgr.dispose();
        }

        let mgr = manager(dir.path(), io);
        mgr.init().await.unwrap();
        assert_eq!(mgr.segment_ctx().valid_block_count(0).unwrap(), 17);
        assert_eq!(mgr.allocator_ctx().current_ssd_stripe(), 1);
        // one initial flush plus one explicit flush
        assert_eq!(mgr.get_stored_context_version(ContextOwner::SegmentCtx), 1);
        mgr.dispose();
    }

    #[tokio::test]
    async fn test_flush_gate_rejects_concurrent_whole_flush() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), io_manager());
        mgr.init().await.unwrap();

        // on a current-thread runtime the spawned writes have not run
        // yet, so the first flush is still in flight here
        mgr.flush_contexts(None, false).await.unwrap();
        assert_eq!(mgr.segment_engine.pending_flush_count(), 1);
        assert_eq!(mgr.allocator_engine.pending_flush_count(), 1);

        let err = mgr.flush_contexts(None, false).await.unwrap_err();
        assert!(matches!(err, AllocatorError::FlushInProgress));
        // the rejected call submitted nothing
        assert_eq!(mgr.segment_engine.pending_flush_count(), 1);
        assert_eq!(mgr.allocator_engine.pending_flush_count(), 1);

        mgr.wait_pending_io(IoWaitKind::Flush).await;
        assert!(!mgr.flush_in_progress.load(Ordering::Acquire));
        // one initial flush plus the single accepted whole flush
        assert_eq!(mgr.get_stored_context_version(ContextOwner::SegmentCtx), 1);
        assert_eq!(mgr.get_stored_context_version(ContextOwner::AllocatorCtx), 1);
        mgr.dispose();
    }

    #[tokio::test]
    async fn test_flush_callback_fires_exactly_once() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), io_manager());
        mgr.init().await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        mgr.flush_contexts(
            Some(Box::new(move |result| {
                result.unwrap();
                seen.fetch_add(1, Ordering::SeqCst);
            })),
            true,
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!mgr.flush_in_progress.load(Ordering::Acquire));
        mgr.dispose();
    }

    #[tokio::test]
    async fn test_rebuild_flush_runs_independently() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path(), io_manager());
        mgr.init().await.unwrap();

        let targets = std::collections::BTreeSet::from([1u32, 4, 6]);
        mgr.rebuild_ctx().flush_rebuild_segment_list(&targets).unwrap();
        mgr.wait_pending_io(IoWaitKind::Flush).await;
        assert!(mgr.get_stored_context_version(ContextOwner::RebuildCtx) >= 1);
        assert_eq!(mgr.rebuild_ctx().get_list(), targets);
        mgr.dispose();
    }

    #[tokio::test]
    async fn test_rebuild_targets_survive_restart() {
        let dir = tempdir().unwrap();
        let io = io_manager();
        let targets = std::collections::BTreeSet::from([2u32, 3]);

        {
            let mgr = manager(dir.path(), io.clone());
            mgr.init().await.unwrap();
            mgr.rebuild_ctx().flush_rebuild_segment_list(&targets).unwrap();
            mgr.wait_pending_io(IoWaitKind::All).await;
            mgr.dispose();
        }

        let mgr = manager(dir.path(), io);
        mgr.init().await.unwrap();
        assert_eq!(mgr.rebuild_ctx().get_list(), targets);
        assert!(mgr.rebuild_ctx().need_rebuild_again());

        mgr.rebuild_ctx().release_rebuild_segment(2).unwrap();
        mgr.wait_pending_io(IoWaitKind::Flush).await;
        assert_eq!(
            mgr.rebuild_ctx().get_list(),
            std::collections::BTreeSet::from([3u32])
        );
        mgr.dispose();
    }

    #[tokio::test]
    async fn test_overlapping_rebuild_releases_all_reach_disk() {
        let dir = tempdir().unwrap();
        let io = io_manager();

        {
            let mgr = manager(dir.path(), io.clone());
            mgr.init().await.unwrap();
            let targets = std::collections::BTreeSet::from([1u32, 2, 3]);
            mgr.rebuild_ctx().flush_rebuild_segment_list(&targets).unwrap();
            mgr.wait_pending_io(IoWaitKind::Flush).await;

            // the second shrink lands while the first one's flush may
            // still be in flight; both must end up on disk
            mgr.rebuild_ctx().release_rebuild_segment(1).unwrap();
            mgr.rebuild_ctx().release_rebuild_segment(2).unwrap();
            while mgr.get_stored_context_version(ContextOwner::RebuildCtx) < 3 {
                tokio::task::yield_now().await;
            }
            mgr.dispose();
        }

        let mgr = manager(dir.path(), io);
        mgr.init().await.unwrap();
        assert_eq!(
            mgr.rebuild_ctx().get_list(),
            std::collections::BTreeSet::from([3u32])
        );
        mgr.dispose();
    }
}
