//! Per-owner context file engine
//!
//! One `ContextFileIo` binds one context owner to one backing meta
//! file. At most one load and one flush may be outstanding at a time;
//! the pending counters are 0-or-1 and each decrement wakes the drain
//! waiters. Serialization happens on the issuing path (`before_flush`),
//! so the bytes written are the owner's state at issue time, not at
//! completion time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use blockio_common::{ArrayId, MediaType, MetricsCollector};
use blockio_metafs::{MetaFile, MetaIoManager};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::client::ContextClient;
use crate::error::{AllocatorError, AllocatorResult};
use crate::section::{ContextOwner, ContextSection, SectionLayout};

/// Outcome of `load_context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// File was just created; caller must flush an initial version.
    FreshFile,
    /// Async read in flight; `after_load` runs on completion.
    Issued,
}

/// Which pending I/O class to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoWaitKind {
    All,
    Read,
    Flush,
}

/// Invoked exactly once with the flush result.
pub type FlushCallback = Box<dyn FnOnce(AllocatorResult<()>) + Send>;

/// Load/flush engine for one context owner.
pub struct ContextFileIo {
    client: Arc<dyn ContextClient>,
    io: Arc<MetaIoManager>,
    metrics: Arc<MetricsCollector>,
    path: PathBuf,
    array_id: ArrayId,
    layout: SectionLayout,
    file: Mutex<Option<Arc<MetaFile>>>,
    fresh: AtomicBool,
    pending_reads: AtomicU64,
    pending_flushes: AtomicU64,
    drained: Notify,
    async_error: Mutex<Option<AllocatorError>>,
}

impl ContextFileIo {
    #[must_use]
    pub fn new(
        client: Arc<dyn ContextClient>,
        io: Arc<MetaIoManager>,
        metrics: Arc<MetricsCollector>,
        dir: &Path,
        array_id: ArrayId,
    ) -> Self {
        let layout = SectionLayout::compute(&client.section_sizes());
        let path = dir.join(client.owner().file_name());
        Self {
            client,
            io,
            metrics,
            path,
            array_id,
            layout,
            file: Mutex::new(None),
            fresh: AtomicBool::new(false),
            pending_reads: AtomicU64::new(0),
            pending_flushes: AtomicU64::new(0),
            drained: Notify::new(),
            async_error: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn owner(&self) -> ContextOwner {
        self.client.owner()
    }

    /// Open the backing file, creating it if absent. Idempotent.
    pub fn init(&self) -> AllocatorResult<()> {
        let mut guard = self.file.lock();
        if guard.is_some() {
            return Ok(());
        }
        let page_count = self.io.pages_needed(self.layout.file_size()).max(1);
        let file_id = self.owner().file_id();
        let file = if MetaFile::exists(&self.path) {
            MetaFile::open(
                &self.path,
                file_id,
                self.array_id,
                MediaType::Ssd,
                self.io.page_size(),
            )?
        } else {
            self.fresh.store(true, Ordering::Release);
            MetaFile::create(
                &self.path,
                file_id,
                self.array_id,
                MediaType::Ssd,
                self.io.page_size(),
                page_count,
            )?
        };
        info!(
            owner = self.owner().as_str(),
            fresh = self.fresh.load(Ordering::Acquire),
            file_size = self.layout.file_size(),
            "context engine initialized"
        );
        *guard = Some(Arc::new(file));
        Ok(())
    }

    fn file_handle(&self) -> AllocatorResult<Arc<MetaFile>> {
        self.file
            .lock()
            .clone()
            .ok_or_else(|| AllocatorError::Internal("context engine not initialized".into()))
    }

    /// Start loading the owner's state from disk.
    pub fn load_context(self: &Arc<Self>) -> AllocatorResult<LoadState> {
        let file = self.file_handle()?;
        if self.fresh.load(Ordering::Acquire) {
            return Ok(LoadState::FreshFile);
        }
        if self
            .pending_reads
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AllocatorError::IoPending(self.owner().as_str()));
        }
        self.metrics.context_read_started();

        let this = self.clone();
        let size = self.layout.file_size() as usize;
        tokio::spawn(async move {
            let mut buf = vec![0u8; size];
            let result = match this.io.read(&file, 0, &mut buf).await {
                Ok(()) => this.client.after_load(&buf),
                Err(e) => Err(e.into()),
            };
            if let Err(err) = result {
                error!(
                    owner = this.owner().as_str(),
                    %err,
                    "context load failed"
                );
                *this.async_error.lock() = Some(err);
            } else {
                debug!(
                    owner = this.owner().as_str(),
                    version = this.client.stored_version(),
                    "context loaded"
                );
            }
            this.pending_reads.store(0, Ordering::Release);
            this.metrics.context_read_finished();
            this.drained.notify_waiters();
        });
        Ok(LoadState::Issued)
    }

    /// Serialize and write the owner's state. `on_complete` fires
    /// exactly once with the I/O result; a submission failure returns
    /// `Err` instead and the callback never fires.
    pub fn flush(
        self: &Arc<Self>,
        external: Option<(usize, Vec<u8>)>,
        on_complete: FlushCallback,
    ) -> AllocatorResult<()> {
        let file = self.file_handle()?;
        if self
            .pending_flushes
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AllocatorError::IoPending(self.owner().as_str()));
        }

        let mut buf = vec![0u8; self.layout.file_size() as usize];
        let serialized = self.client.before_flush(
            &mut buf,
            external.as_ref().map(|(idx, bytes)| (*idx, bytes.as_slice())),
        );
        if let Err(err) = serialized {
            self.pending_flushes.store(0, Ordering::Release);
            self.drained.notify_waiters();
            return Err(err);
        }
        self.metrics.context_flush_started();
        self.fresh.store(false, Ordering::Release);

        let this = self.clone();
        tokio::spawn(async move {
            let result = match this.io.write(&file, 0, &buf).await {
                Ok(()) => this.client.after_flush(&buf),
                Err(e) => Err(e.into()),
            };
            match &result {
                Ok(()) => debug!(
                    owner = this.owner().as_str(),
                    version = this.client.stored_version(),
                    "context flushed"
                ),
                Err(err) => error!(owner = this.owner().as_str(), %err, "context flush failed"),
            }
            this.pending_flushes.store(0, Ordering::Release);
            this.metrics.context_flush_finished();
            this.drained.notify_waiters();
            on_complete(result);
        });
        Ok(())
    }

    fn pending(&self, kind: IoWaitKind) -> u64 {
        match kind {
            IoWaitKind::Read => self.pending_reads.load(Ordering::Acquire),
            IoWaitKind::Flush => self.pending_flushes.load(Ordering::Acquire),
            IoWaitKind::All => {
                self.pending_reads.load(Ordering::Acquire)
                    + self.pending_flushes.load(Ordering::Acquire)
            }
        }
    }

    /// Wait until the given I/O class has drained.
    pub async fn wait_pending(&self, kind: IoWaitKind) {
        loop {
            if self.pending(kind) == 0 {
                return;
            }
            let notified = self.drained.notified();
            if self.pending(kind) == 0 {
                return;
            }
            notified.await;
        }
    }

    #[must_use]
    pub fn pending_read_count(&self) -> u64 {
        self.pending_reads.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pending_flush_count(&self) -> u64 {
        self.pending_flushes.load(Ordering::Acquire)
    }

    /// True until the first flush of a newly created file.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.fresh.load(Ordering::Acquire)
    }

    /// Error captured by an async load, if any.
    pub fn take_async_error(&self) -> Option<AllocatorError> {
        self.async_error.lock().take()
    }

    #[must_use]
    pub fn stored_version(&self) -> u64 {
        self.client.stored_version()
    }

    pub fn section(&self, index: usize) -> AllocatorResult<ContextSection> {
        self.layout.section(index)
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.layout.file_size()
    }

    /// Close the engine. In-flight I/O fails quietly with stop state.
    pub fn dispose(&self) {
        if let Some(file) = self.file.lock().take() {
            file.set_stop_state();
            debug!(owner = self.owner().as_str(), "context engine disposed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Buf, BufMut};
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    /// Minimal owner: one 64-byte header section and one data section.
    struct BlobClient {
        state: Mutex<BlobState>,
    }

    struct BlobState {
        dirty_version: u64,
        stored_version: u64,
        payload: Vec<u8>,
    }

    impl BlobClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(BlobState {
                    dirty_version: 0,
                    stored_version: 0,
                    payload: vec![0u8; 128],
                }),
            })
        }

        fn set_payload(&self, data: &[u8]) {
            self.state.lock().payload[..data.len()].copy_from_slice(data);
        }
    }

    impl ContextClient for BlobClient {
        fn owner(&self) -> ContextOwner {
            ContextOwner::SegmentCtx
        }

        fn section_sizes(&self) -> Vec<u64> {
            vec![64, 128]
        }

        fn before_flush(
            &self,
            buf: &mut [u8],
            external: Option<(usize, &[u8])>,
        ) -> AllocatorResult<()> {
            let mut state = self.state.lock();
            let version = state.dirty_version;
            state.dirty_version += 1;
            let mut header = &mut buf[..64];
            header.put_u32_le(self.signature());
            header.put_u64_le(version);
            buf[64..192].copy_from_slice(&state.payload);
            if let Some((1, bytes)) = external {
                buf[64..64 + bytes.len()].copy_from_slice(bytes);
            }
            Ok(())
        }

        fn after_load(&self, buf: &[u8]) -> AllocatorResult<()> {
            let mut header = &buf[..64];
            let sig = header.get_u32_le();
            if sig != self.signature() {
                return Err(AllocatorError::CorruptContext {
                    owner: "segment",
                    detail: format!("signature {sig:#x}"),
                });
            }
            let version = header.get_u64_le();
            let mut state = self.state.lock();
            state.stored_version = version;
            state.dirty_version = version + 1;
            state.payload.copy_from_slice(&buf[64..192]);
            Ok(())
        }

        fn after_flush(&self, buf: &[u8]) -> AllocatorResult<()> {
            let mut header = &buf[4..12];
            self.state.lock().stored_version = header.get_u64_le();
            Ok(())
        }

        fn stored_version(&self) -> u64 {
            self.state.lock().stored_version
        }
    }

    fn io_manager() -> Arc<MetaIoManager> {
        Arc::new(MetaIoManager::new(
            8,
            4096,
            Arc::new(MetricsCollector::new()),
        ))
    }

    fn engine(client: Arc<BlobClient>, io: Arc<MetaIoManager>, dir: &Path) -> Arc<ContextFileIo> {
        Arc::new(ContextFileIo::new(
            client,
            io,
            Arc::new(MetricsCollector::new()),
            dir,
            0,
        ))
    }

    async fn flush_sync(engine: &Arc<ContextFileIo>) -> AllocatorResult<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        engine.flush(
            None,
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        )?;
        rx.await.map_err(|_| AllocatorError::Internal("flush callback dropped".into()))?
    }

    #[tokio::test]
    async fn test_fresh_file_then_restart_reloads() {
        let dir = tempdir().unwrap();
        let io = io_manager();

        let client = BlobClient::new();
        client.set_payload(b"first boot state");
        let eng = engine(client.clone(), io.clone(), dir.path());
        eng.init().unwrap();
        assert_eq!(eng.load_context().unwrap(), LoadState::FreshFile);
        flush_sync(&eng).await.unwrap();
        assert_eq!(eng.stored_version(), 0);
        eng.dispose();

        // restart: same directory, new engine and owner
        let client2 = BlobClient::new();
        let eng2 = engine(client2.clone(), io, dir.path());
        eng2.init().unwrap();
        assert_eq!(eng2.load_context().unwrap(), LoadState::Issued);
        eng2.wait_pending(IoWaitKind::Read).await;
        assert!(eng2.take_async_error().is_none());
        assert_eq!(eng2.stored_version(), 0);
        assert_eq!(&client2.state.lock().payload[..16], b"first boot state");
    }

    #[tokio::test]
    async fn test_versions_climb_across_flushes() {
        let dir = tempdir().unwrap();
        let io = io_manager();
        let client = BlobClient::new();
        let eng = engine(client, io, dir.path());
        eng.init().unwrap();

        flush_sync(&eng).await.unwrap();
        assert_eq!(eng.stored_version(), 0);
        flush_sync(&eng).await.unwrap();
        assert_eq!(eng.stored_version(), 1);
        flush_sync(&eng).await.unwrap();
        assert_eq!(eng.stored_version(), 2);
    }

    #[tokio::test]
    async fn test_external_section_content_wins() {
        let dir = tempdir().unwrap();
        let io = io_manager();

        let client = BlobClient::new();
        client.set_payload(b"stale");
        let eng = engine(client, io.clone(), dir.path());
        eng.init().unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        eng.flush(
            Some((1, b"external".to_vec())),
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        )
        .unwrap();
        rx.await.unwrap().unwrap();

        let client2 = BlobClient::new();
        let eng2 = engine(client2.clone(), io, dir.path());
        eng2.init().unwrap();
        eng2.load_context().unwrap();
        eng2.wait_pending(IoWaitKind::Read).await;
        assert_eq!(&client2.state.lock().payload[..8], b"external");
    }

    #[tokio::test]
    async fn test_second_flush_while_pending_is_rejected() {
        let dir = tempdir().unwrap();
        let io = io_manager();
        let eng = engine(BlobClient::new(), io, dir.path());
        eng.init().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        eng.flush(None, Box::new(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        // engine allows one outstanding flush
        let second = eng.flush(None, Box::new(|_| {}));
        if let Err(err) = second {
            assert!(matches!(err, AllocatorError::IoPending(_)));
        }

        eng.wait_pending(IoWaitKind::Flush).await;
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_dispose_makes_flush_fail_quietly() {
        let dir = tempdir().unwrap();
        let io = io_manager();
        let eng = engine(BlobClient::new(), io, dir.path());
        eng.init().unwrap();
        eng.dispose();

        let err = flush_sync(&eng).await.unwrap_err();
        assert!(matches!(err, AllocatorError::Internal(_)));
    }
}
