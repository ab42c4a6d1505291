//! MetaIoManager - byte-granular I/O over page-granular mpios
//!
//! A read or write request names a file, a byte offset, and a length.
//! The manager splits it into one mpio per logical page (the first and
//! last page of a request may be partial; partial writes read-modify-
//! write), issues the device work on blocking tasks, and funnels every
//! completion through the `MpioHandler` bottom-half. The caller's
//! borrowed request is converted to owned data before entering the
//! async path; synchronous callers await the request's own
//! `RequestTracker`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use blockio_common::{ArrayConfig, MetaLpn, MetricsCollector};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{MetafsError, MetafsResult};
use crate::file::{MetaFile, MetaStorage};
use crate::handler::{CompletedMpio, MpioHandler};
use crate::mpio::{MpioIoInfo, MpioOpcode};
use crate::page;
use crate::pool::MpioPool;

static NEXT_TAG_ID: AtomicU64 = AtomicU64::new(1);

/// Completion state shared by a request's mpios.
pub struct RequestTracker {
    tag_id: u64,
    remaining: AtomicUsize,
    error: Mutex<Option<MetafsError>>,
    stop_state: AtomicBool,
    read_buf: Option<Mutex<Vec<u8>>>,
    done: Notify,
}

impl RequestTracker {
    fn new(tag_id: u64, total: usize, read_len: Option<usize>) -> Self {
        Self {
            tag_id,
            remaining: AtomicUsize::new(total),
            error: Mutex::new(None),
            stop_state: AtomicBool::new(false),
            read_buf: read_len.map(|len| Mutex::new(vec![0u8; len])),
            done: Notify::new(),
        }
    }

    #[must_use]
    pub fn tag_id(&self) -> u64 {
        self.tag_id
    }

    /// Copy a completed read mpio's window into the request buffer.
    pub(crate) fn copy_read_window(&self, buf_offset: usize, mpio: &mut crate::mpio::Mpio) {
        if let Some(buf) = &self.read_buf {
            let len = mpio.io_info().length;
            let mut guard = buf.lock();
            mpio.copy_out(&mut guard[buf_offset..buf_offset + len]);
        }
    }

    /// Record one mpio completion. The first error wins; the last
    /// completion wakes the waiter.
    pub(crate) fn complete_one(&self, error: Option<MetafsError>, stop_state: bool) {
        if stop_state {
            self.stop_state.store(true, Ordering::Release);
        }
        if let Some(err) = error {
            let mut guard = self.error.lock();
            if guard.is_none() {
                *guard = Some(err);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.notify_waiters();
        }
    }

    /// Wait until every mpio of the request has completed.
    pub async fn wait(&self) {
        loop {
            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.done.notified();
            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// The request's result. Stop-state rejection takes priority so
    /// shutdown flushes are reported as such, not as disk failure.
    pub fn result(&self) -> MetafsResult<()> {
        if self.stop_state.load(Ordering::Acquire) {
            return Err(MetafsError::StopState);
        }
        match self.error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// One page-aligned window of a byte request.
struct PageWindow {
    lpn: MetaLpn,
    start_offset: usize,
    length: usize,
    buf_offset: usize,
}

/// Byte-granular metadata I/O entry point.
pub struct MetaIoManager {
    pool: Arc<MpioPool>,
    handler: MpioHandler,
    metrics: Arc<MetricsCollector>,
}

impl MetaIoManager {
    /// Create the manager and start its bottom-half task. Must run
    /// inside a tokio runtime.
    #[must_use]
    pub fn new(pool_capacity: usize, page_size: usize, metrics: Arc<MetricsCollector>) -> Self {
        let pool = Arc::new(MpioPool::new(pool_capacity, page_size));
        let handler = MpioHandler::start(pool.clone(), metrics.clone());
        Self {
            pool,
            handler,
            metrics,
        }
    }

    /// Like `new`, with the page size taken from the array geometry.
    #[must_use]
    pub fn with_config(
        pool_capacity: usize,
        config: &ArrayConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self::new(pool_capacity, config.meta_page_size, metrics)
    }

    /// Full page size, control info included.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.pool.page_size()
    }

    /// Usable bytes per page.
    #[must_use]
    pub fn data_chunk_size(&self) -> usize {
        page::data_chunk_size(self.pool.page_size())
    }

    /// Pages needed to hold `bytes` of content.
    #[must_use]
    pub fn pages_needed(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.data_chunk_size() as u64)
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    fn split(&self, offset: u64, len: usize) -> Vec<PageWindow> {
        let chunk = self.data_chunk_size() as u64;
        let mut windows = Vec::new();
        let mut pos = offset;
        let end = offset + len as u64;
        while pos < end {
            let lpn = pos / chunk;
            let start_offset = (pos % chunk) as usize;
            let length = ((end - pos).min(chunk - start_offset as u64)) as usize;
            windows.push(PageWindow {
                lpn,
                start_offset,
                length,
                buf_offset: (pos - offset) as usize,
            });
            pos += length as u64;
        }
        windows
    }

    fn check_request(&self, file: &MetaFile, offset: u64, len: usize) -> MetafsResult<()> {
        if len == 0 {
            return Err(MetafsError::InvalidRequest("zero-length request".into()));
        }
        let capacity = file.page_count() * self.data_chunk_size() as u64;
        if offset + len as u64 > capacity {
            return Err(MetafsError::InvalidRequest(format!(
                "request [{}, {}) beyond file capacity {}",
                offset,
                offset + len as u64,
                capacity
            )));
        }
        Ok(())
    }

    /// Read `buf.len()` bytes starting at byte `offset` of `file`.
    pub async fn read(&self, file: &Arc<MetaFile>, offset: u64, buf: &mut [u8]) -> MetafsResult<()> {
        self.check_request(file, offset, buf.len())?;

        let windows = self.split(offset, buf.len());
        let tag_id = NEXT_TAG_ID.fetch_add(1, Ordering::Relaxed);
        let tracker = Arc::new(RequestTracker::new(tag_id, windows.len(), Some(buf.len())));
        let chunk = self.data_chunk_size();

        debug!(tag_id, offset, len = buf.len(), pages = windows.len(), "meta read");

        for window in windows {
            let mut mpio = self.pool.alloc_wait().await;
            mpio.setup(
                MpioIoInfo {
                    opcode: MpioOpcode::Read,
                    array_id: file.array_id(),
                    media: file.media_type(),
                    file_id: file.file_id(),
                    meta_lpn: window.lpn,
                    start_offset: window.start_offset,
                    length: window.length,
                    tag_id,
                },
                window.length != chunk,
            );

            let storage = file.clone();
            let sender = self.handler.sender();
            let tracker_ref = tracker.clone();
            let buf_offset = window.buf_offset;
            tokio::task::spawn_blocking(move || {
                mpio.do_read(storage.as_ref());
                // the bottom-half finishes the state machine and releases
                let _ = sender.send(CompletedMpio {
                    mpio,
                    buf_offset,
                    tracker: tracker_ref,
                });
            });
        }

        tracker.wait().await;
        tracker.result()?;
        if let Some(data) = &tracker.read_buf {
            buf.copy_from_slice(&data.lock());
        }
        Ok(())
    }

    /// Write `data` starting at byte `offset` of `file`, then sync.
    pub async fn write(&self, file: &Arc<MetaFile>, offset: u64, data: &[u8]) -> MetafsResult<()> {
        self.check_request(file, offset, data.len())?;

        let windows = self.split(offset, data.len());
        let tag_id = NEXT_TAG_ID.fetch_add(1, Ordering::Relaxed);
        let tracker = Arc::new(RequestTracker::new(tag_id, windows.len(), None));
        let chunk = self.data_chunk_size();

        debug!(tag_id, offset, len = data.len(), pages = windows.len(), "meta write");

        for window in windows {
            let partial = window.length != chunk;
            let mut mpio = self.pool.alloc_wait().await;
            mpio.setup(
                MpioIoInfo {
                    opcode: MpioOpcode::Write,
                    array_id: file.array_id(),
                    media: file.media_type(),
                    file_id: file.file_id(),
                    meta_lpn: window.lpn,
                    start_offset: window.start_offset,
                    length: window.length,
                    tag_id,
                },
                partial,
            );

            // owned copy of the caller's window; the borrow never
            // crosses into the async path
            let window_data = data[window.buf_offset..window.buf_offset + window.length].to_vec();
            let storage = file.clone();
            let sender = self.handler.sender();
            let tracker_ref = tracker.clone();
            tokio::task::spawn_blocking(move || {
                if partial {
                    // read-modify-write for the torn edge of the request
                    mpio.do_read(storage.as_ref());
                    if mpio.state() == crate::mpio::MpioState::E2eCheck
                        && mpio.do_e2e_check().is_ok()
                    {
                        mpio.merge_data(&window_data);
                        mpio.do_write(storage.as_ref());
                    }
                } else {
                    mpio.merge_data(&window_data);
                    mpio.do_write(storage.as_ref());
                }
                let _ = sender.send(CompletedMpio {
                    mpio,
                    buf_offset: 0,
                    tracker: tracker_ref,
                });
            });
        }

        tracker.wait().await;
        tracker.result()?;

        let storage = file.clone();
        let synced = tokio::task::spawn_blocking(move || storage.sync())
            .await
            .map_err(|e| MetafsError::Internal(format!("sync task failed: {e}")))?;
        if let Err(ref err) = synced {
            if err.is_stop_state() {
                warn!(tag_id, "sync skipped, file in stop state");
            }
        }
        synced
    }
}
