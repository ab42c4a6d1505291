//! Page-addressed metadata backing files
//!
//! A `MetaFile` is an ordinary file addressed in whole metadata pages.
//! Durability comes from an explicit `sync` after a batch of page
//! writes. Once `set_stop_state` is called, all new page I/O is
//! rejected with `MetafsError::StopState` so shutdown-time flushes fail
//! quietly instead of looking like disk errors.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use blockio_common::{ArrayId, MediaType, MetaLpn};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{MetafsError, MetafsResult};

/// File descriptor-like id assigned by the owner of the file
pub type FileId = u32;

/// Page-granular storage a metadata I/O can dispatch to.
pub trait MetaStorage: Send + Sync {
    fn media_type(&self) -> MediaType;
    fn read_page(&self, lpn: MetaLpn, buf: &mut [u8]) -> MetafsResult<()>;
    fn write_page(&self, lpn: MetaLpn, buf: &[u8]) -> MetafsResult<()>;
    fn sync(&self) -> MetafsResult<()>;
}

/// A page-addressed metadata file.
pub struct MetaFile {
    file: Mutex<File>,
    path: PathBuf,
    file_id: FileId,
    array_id: ArrayId,
    media: MediaType,
    page_size: usize,
    page_count: u64,
    stop_state: AtomicBool,
}

impl MetaFile {
    /// Create a new file sized to `page_count` pages. Truncates any
    /// existing file at the path.
    pub fn create(
        path: impl AsRef<Path>,
        file_id: FileId,
        array_id: ArrayId,
        media: MediaType,
        page_size: usize,
        page_count: u64,
    ) -> MetafsResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(page_count * page_size as u64)?;

        info!(
            path = %path.display(),
            file_id,
            page_count,
            "created meta file"
        );

        Ok(Self {
            file: Mutex::new(file),
            path,
            file_id,
            array_id,
            media,
            page_size,
            page_count,
            stop_state: AtomicBool::new(false),
        })
    }

    /// Open an existing file; the page count is derived from its length.
    pub fn open(
        path: impl AsRef<Path>,
        file_id: FileId,
        array_id: ArrayId,
        media: MediaType,
        page_size: usize,
    ) -> MetafsResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(MetafsError::FileNotFound(path.display().to_string()));
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        let page_count = len / page_size as u64;

        debug!(path = %path.display(), file_id, page_count, "opened meta file");

        Ok(Self {
            file: Mutex::new(file),
            path,
            file_id,
            array_id,
            media,
            page_size,
            page_count,
            stop_state: AtomicBool::new(false),
        })
    }

    /// True if a file already exists at the path.
    #[must_use]
    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }

    /// Remove the backing file. Consumes the handle.
    pub fn delete(self) -> MetafsResult<()> {
        std::fs::remove_file(&self.path)?;
        info!(path = %self.path.display(), "deleted meta file");
        Ok(())
    }

    /// Reject all subsequent page I/O with `StopState`.
    pub fn set_stop_state(&self) {
        self.stop_state.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stop_state(&self) -> bool {
        self.stop_state.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    #[must_use]
    pub fn array_id(&self) -> ArrayId {
        self.array_id
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_access(&self, lpn: MetaLpn, buf_len: usize) -> MetafsResult<()> {
        if self.is_stop_state() {
            return Err(MetafsError::StopState);
        }
        if lpn >= self.page_count {
            return Err(MetafsError::InvalidRequest(format!(
                "lpn {} beyond file end ({} pages)",
                lpn, self.page_count
            )));
        }
        if buf_len != self.page_size {
            return Err(MetafsError::InvalidRequest(format!(
                "page buffer is {} bytes, page size is {}",
                buf_len, self.page_size
            )));
        }
        Ok(())
    }
}

impl MetaStorage for MetaFile {
    fn media_type(&self) -> MediaType {
        self.media
    }

    fn read_page(&self, lpn: MetaLpn, buf: &mut [u8]) -> MetafsResult<()> {
        self.check_access(lpn, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(lpn * self.page_size as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_page(&self, lpn: MetaLpn, buf: &[u8]) -> MetafsResult<()> {
        self.check_access(lpn, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(lpn * self.page_size as u64))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn sync(&self) -> MetafsResult<()> {
        if self.is_stop_state() {
            return Err(MetafsError::StopState);
        }
        self.file.lock().sync_all()?;
        Ok(())
    }
}
