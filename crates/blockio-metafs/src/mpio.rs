//! Mpio - one in-flight metadata page I/O
//!
//! An mpio carries exactly one page through a small state machine:
//!
//! ```text
//! read:          Init -> Read -> E2eCheck -> MemCopy -> Done
//! full write:    Init -> MemCopy -> Write -> Done
//! partial write: Init -> Read -> E2eCheck -> MemCopy -> Write -> Done
//! ```
//!
//! `Error` absorbs from any step. There is no cancellation; a set-up
//! mpio always reaches `Done` or `Error` and is then released through
//! the bottom-half handler. A read that lands on an invalid page
//! zero-fills the data chunk (sparse files decode as zero on first
//! touch) unless the media supports direct access, in which case the
//! raw bytes are left alone. A *valid* page whose lpn or file id does
//! not match the request is corruption.

use std::sync::atomic::{AtomicU64, Ordering};

use blockio_common::{ArrayId, MediaType, MetaLpn};
use tracing::{error, trace};

use crate::error::{MetafsError, MetafsResult};
use crate::file::{FileId, MetaStorage};
use crate::page;

static NEXT_MPIO_ID: AtomicU64 = AtomicU64::new(1);

/// What the parent request wants from this page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpioOpcode {
    Read,
    Write,
}

/// Mpio state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpioState {
    Init,
    Read,
    Write,
    MemCopy,
    E2eCheck,
    Done,
    Error,
}

/// Per-page request description.
#[derive(Debug, Clone)]
pub struct MpioIoInfo {
    pub opcode: MpioOpcode,
    pub array_id: ArrayId,
    pub media: MediaType,
    pub file_id: FileId,
    pub meta_lpn: MetaLpn,
    /// Byte offset of the window within the page's data chunk
    pub start_offset: usize,
    /// Byte length of the window
    pub length: usize,
    /// Parent request id, for tracing
    pub tag_id: u64,
}

/// One in-flight page I/O.
pub struct Mpio {
    id: u64,
    state: MpioState,
    io_info: Option<MpioIoInfo>,
    buffer: Vec<u8>,
    partial: bool,
    error: Option<MetafsError>,
    error_stop_state: bool,
}

impl Mpio {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            id: 0,
            state: MpioState::Init,
            io_info: None,
            buffer: vec![0u8; page_size],
            partial: false,
            error: None,
            error_stop_state: false,
        }
    }

    /// Bind a request to this mpio and assign a fresh unique id.
    pub fn setup(&mut self, io_info: MpioIoInfo, partial: bool) {
        self.id = NEXT_MPIO_ID.fetch_add(1, Ordering::Relaxed);
        self.state = MpioState::Init;
        self.partial = partial;
        self.error = None;
        self.error_stop_state = false;
        trace!(
            mpio_id = self.id,
            tag_id = io_info.tag_id,
            lpn = io_info.meta_lpn,
            ?io_info.opcode,
            partial,
            "mpio setup"
        );
        self.io_info = Some(io_info);
    }

    /// Clear request binding so the pool can recycle the buffer.
    pub(crate) fn reset(&mut self) {
        self.id = 0;
        self.state = MpioState::Init;
        self.io_info = None;
        self.partial = false;
        self.error = None;
        self.error_stop_state = false;
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> MpioState {
        self.state
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self.state, MpioState::Done | MpioState::Error)
    }

    #[must_use]
    pub fn error_stop_state(&self) -> bool {
        self.error_stop_state
    }

    #[must_use]
    pub fn error_status(&self) -> Option<&MetafsError> {
        self.error.as_ref()
    }

    /// Take the error out for the request tracker; leaves `Error` state.
    pub fn take_error(&mut self) -> Option<MetafsError> {
        self.error.take()
    }

    /// Request description. Panics only if called before `setup`, which
    /// the pool discipline rules out.
    #[must_use]
    pub fn io_info(&self) -> &MpioIoInfo {
        self.io_info.as_ref().expect("mpio used before setup")
    }

    fn fail(&mut self, err: MetafsError) {
        if err.is_stop_state() {
            self.error_stop_state = true;
        }
        self.error = Some(err);
        self.state = MpioState::Error;
    }

    /// Read the page from storage. `Init -> Read -> E2eCheck` on
    /// success; stop-state and I/O failures sever to `Error`.
    pub fn do_read(&mut self, storage: &dyn MetaStorage) {
        self.state = MpioState::Read;
        let lpn = self.io_info().meta_lpn;
        match storage.read_page(lpn, &mut self.buffer) {
            Ok(()) => self.state = MpioState::E2eCheck,
            Err(e) => self.fail(e),
        }
    }

    /// Validate control info after a read. Invalid pages zero-fill the
    /// data chunk unless the media is direct-access; a valid page bound
    /// to the wrong lpn or file is corruption.
    pub fn do_e2e_check(&mut self) -> MetafsResult<()> {
        debug_assert_eq!(self.state, MpioState::E2eCheck);
        let info = self.io_info().clone();
        if page::is_valid_for(&self.buffer, info.array_id) {
            let ctrl = page::parse_control(&self.buffer);
            if !ctrl.lpn_matches(info.meta_lpn) || !ctrl.file_matches(info.file_id) {
                error!(
                    mpio_id = self.id,
                    expected_lpn = info.meta_lpn,
                    stored_lpn = ctrl.meta_lpn,
                    expected_file = info.file_id,
                    stored_file = ctrl.file_id,
                    "end-to-end check failed"
                );
                let detail = format!(
                    "page stamped lpn={} file={}, request lpn={} file={}",
                    ctrl.meta_lpn, ctrl.file_id, info.meta_lpn, info.file_id
                );
                self.state = MpioState::Error;
                self.error = Some(MetafsError::E2eMismatch {
                    lpn: info.meta_lpn,
                    detail: detail.clone(),
                });
                return Err(MetafsError::E2eMismatch {
                    lpn: info.meta_lpn,
                    detail,
                });
            }
        } else if !info.media.supports_direct_access() {
            // empty or torn page; treat as all-zero content
            page::zero_data_chunk(&mut self.buffer);
        }
        self.state = MpioState::MemCopy;
        Ok(())
    }

    /// Copy this page's window out to the request buffer (read path).
    /// `MemCopy -> Done`.
    pub fn copy_out(&mut self, dst: &mut [u8]) {
        debug_assert_eq!(self.state, MpioState::MemCopy);
        let info = self.io_info();
        let (start, len) = (info.start_offset, info.length);
        dst.copy_from_slice(&self.buffer[start..start + len]);
        self.state = MpioState::Done;
    }

    /// Merge the request's window into the page (write path).
    /// `Init|MemCopy -> MemCopy`, ready for `do_write`.
    pub fn merge_data(&mut self, src: &[u8]) {
        let info = self.io_info();
        let (start, len) = (info.start_offset, info.length);
        self.buffer[start..start + len].copy_from_slice(src);
        self.state = MpioState::MemCopy;
    }

    /// Stamp control info and write the page. `MemCopy -> Write -> Done`.
    pub fn do_write(&mut self, storage: &dyn MetaStorage) {
        debug_assert_eq!(self.state, MpioState::MemCopy);
        self.state = MpioState::Write;
        let info = self.io_info().clone();
        page::make_control(&mut self.buffer, info.meta_lpn, info.file_id, info.array_id);
        match storage.write_page(info.meta_lpn, &self.buffer) {
            Ok(()) => self.state = MpioState::Done,
            Err(e) => self.fail(e),
        }
    }
}
