//! Metadata page control info
//!
//! Each metadata page carries a trailing control block used for
//! end-to-end validation on read:
//!
//! ```text
//! +---------------------------+------------------------------------+
//! | data chunk                | control info                       |
//! | page_size - 24 bytes      | sig(4) lpn(8) file(4) array(4)     |
//! |                           | crc(4)                             |
//! +---------------------------+------------------------------------+
//! ```
//!
//! The crc covers everything before the crc field itself. A page whose
//! signature is zero has never been written (sparse files read back as
//! zero) and is *clean*, not corrupt.

use blockio_common::{ArrayId, MetaLpn};
use bytes::{Buf, BufMut};

use crate::file::FileId;

/// Magic for a written metadata page ("MDPG")
pub const MDPAGE_SIGNATURE: u32 = 0x4D44_5047;

/// Bytes of control info at the tail of every page
pub const CONTROL_INFO_SIZE: usize = 24;

/// Usable bytes per page
#[must_use]
pub const fn data_chunk_size(page_size: usize) -> usize {
    page_size - CONTROL_INFO_SIZE
}

/// Parsed control info from a page tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageControl {
    pub signature: u32,
    pub meta_lpn: MetaLpn,
    pub file_id: FileId,
    pub array_id: ArrayId,
    pub crc: u32,
}

impl PageControl {
    /// True if the page was never written.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.signature == 0
    }

    #[must_use]
    pub fn lpn_matches(&self, lpn: MetaLpn) -> bool {
        self.meta_lpn == lpn
    }

    #[must_use]
    pub fn file_matches(&self, file_id: FileId) -> bool {
        self.file_id == file_id
    }
}

/// Stamp control info onto a page before it is written.
pub fn make_control(page: &mut [u8], lpn: MetaLpn, file_id: FileId, array_id: ArrayId) {
    let crc_offset = page.len() - 4;
    let mut tail = &mut page[crc_offset + 4 - CONTROL_INFO_SIZE..];
    tail.put_u32_le(MDPAGE_SIGNATURE);
    tail.put_u64_le(lpn);
    tail.put_u32_le(file_id);
    tail.put_u32_le(array_id);
    let crc = crc32c::crc32c(&page[..crc_offset]);
    (&mut page[crc_offset..]).put_u32_le(crc);
}

/// Parse the control info at the tail of a page.
#[must_use]
pub fn parse_control(page: &[u8]) -> PageControl {
    let mut tail = &page[page.len() - CONTROL_INFO_SIZE..];
    PageControl {
        signature: tail.get_u32_le(),
        meta_lpn: tail.get_u64_le(),
        file_id: tail.get_u32_le(),
        array_id: tail.get_u32_le(),
        crc: tail.get_u32_le(),
    }
}

/// True if the page carries a valid signature for this array and its
/// crc matches the stored contents. Clean pages are not valid.
#[must_use]
pub fn is_valid_for(page: &[u8], array_id: ArrayId) -> bool {
    let ctrl = parse_control(page);
    if ctrl.signature != MDPAGE_SIGNATURE || ctrl.array_id != array_id {
        return false;
    }
    crc32c::crc32c(&page[..page.len() - 4]) == ctrl.crc
}

/// Zero the data chunk, leaving the control tail alone.
pub fn zero_data_chunk(page: &mut [u8]) {
    let chunk = data_chunk_size(page.len());
    page[..chunk].fill(0);
}
