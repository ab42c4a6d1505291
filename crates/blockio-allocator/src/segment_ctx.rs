//! Segment context
//!
//! Durable per-segment accounting: how many live blocks each segment
//! holds and what lifecycle state it is in. A segment whose valid-block
//! count drops to zero is returned to `Free` immediately.
//!
//! File image:
//!
//! ```text
//! section 0 (header, 64 B): sig(4) version(8) segment_count(4) pad
//! section 1 (valid counts): u32 per segment
//! section 2 (states):       u8 per segment
//! ```

use blockio_common::{ArrayConfig, SegmentId};
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::ContextClient;
use crate::error::{AllocatorError, AllocatorResult};
use crate::section::{ContextOwner, SectionLayout};

const HEADER_SIZE: u64 = 64;

/// Lifecycle state of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentState {
    Free = 0,
    NvramUsed = 1,
    SsdUsed = 2,
    Victim = 3,
}

impl TryFrom<u8> for SegmentState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SegmentState::Free),
            1 => Ok(SegmentState::NvramUsed),
            2 => Ok(SegmentState::SsdUsed),
            3 => Ok(SegmentState::Victim),
            other => Err(other),
        }
    }
}

struct SegmentInner {
    dirty_version: u64,
    stored_version: u64,
    valid_counts: Vec<u32>,
    states: Vec<SegmentState>,
}

/// Valid-block counters and segment states for one array.
pub struct SegmentCtx {
    segment_count: u32,
    blocks_per_segment: u64,
    inner: Mutex<SegmentInner>,
}

impl SegmentCtx {
    #[must_use]
    pub fn new(config: &ArrayConfig) -> Self {
        let n = config.segment_count as usize;
        Self {
            segment_count: config.segment_count,
            blocks_per_segment: config.blocks_per_segment(),
            inner: Mutex::new(SegmentInner {
                dirty_version: 0,
                stored_version: 0,
                valid_counts: vec![0; n],
                states: vec![SegmentState::Free; n],
            }),
        }
    }

    fn check_segment(&self, segment_id: SegmentId) -> AllocatorResult<usize> {
        if segment_id >= self.segment_count {
            return Err(AllocatorError::Internal(format!(
                "segment {} out of range ({})",
                segment_id, self.segment_count
            )));
        }
        Ok(segment_id as usize)
    }

    /// Take the first free segment for new NVRAM-buffered writes.
    pub fn allocate_free_segment(&self) -> AllocatorResult<SegmentId> {
        let mut inner = self.inner.lock();
        for (idx, state) in inner.states.iter_mut().enumerate() {
            if *state == SegmentState::Free {
                *state = SegmentState::NvramUsed;
                debug!(segment_id = idx, "segment allocated");
                return Ok(idx as SegmentId);
            }
        }
        Err(AllocatorError::NoFreeSegment)
    }

    pub fn set_segment_state(&self, segment_id: SegmentId, state: SegmentState) -> AllocatorResult<()> {
        let idx = self.check_segment(segment_id)?;
        self.inner.lock().states[idx] = state;
        Ok(())
    }

    pub fn segment_state(&self, segment_id: SegmentId) -> AllocatorResult<SegmentState> {
        let idx = self.check_segment(segment_id)?;
        Ok(self.inner.lock().states[idx])
    }

    /// Account newly written blocks against a segment.
    pub fn validate_blocks(&self, segment_id: SegmentId, count: u32) -> AllocatorResult<()> {
        let idx = self.check_segment(segment_id)?;
        let mut inner = self.inner.lock();
        let next = u64::from(inner.valid_counts[idx]) + u64::from(count);
        if next > self.blocks_per_segment {
            return Err(AllocatorError::Internal(format!(
                "segment {} valid count {} exceeds capacity {}",
                segment_id, next, self.blocks_per_segment
            )));
        }
        inner.valid_counts[idx] = next as u32;
        Ok(())
    }

    /// Release blocks; returns true when the segment became free.
    pub fn invalidate_blocks(&self, segment_id: SegmentId, count: u32) -> AllocatorResult<bool> {
        let idx = self.check_segment(segment_id)?;
        let mut inner = self.inner.lock();
        let current = inner.valid_counts[idx];
        if count > current {
            return Err(AllocatorError::Internal(format!(
                "segment {} invalidating {} of {} valid blocks",
                segment_id, count, current
            )));
        }
        inner.valid_counts[idx] = current - count;
        if inner.valid_counts[idx] == 0 && inner.states[idx] != SegmentState::Free {
            inner.states[idx] = SegmentState::Free;
            debug!(segment_id, "segment freed on zero valid count");
            return Ok(true);
        }
        Ok(false)
    }

    pub fn valid_block_count(&self, segment_id: SegmentId) -> AllocatorResult<u32> {
        let idx = self.check_segment(segment_id)?;
        Ok(self.inner.lock().valid_counts[idx])
    }

    #[must_use]
    pub fn free_segment_count(&self) -> u32 {
        self.inner
            .lock()
            .states
            .iter()
            .filter(|s| **s == SegmentState::Free)
            .count() as u32
    }

    #[must_use]
    pub fn used_segment_count(&self) -> u32 {
        self.segment_count - self.free_segment_count()
    }

    #[must_use]
    pub fn segment_count(&self) -> u32 {
        self.segment_count
    }
}

impl ContextClient for SegmentCtx {
    fn owner(&self) -> ContextOwner {
        ContextOwner::SegmentCtx
    }

    fn section_sizes(&self) -> Vec<u64> {
        vec![
            HEADER_SIZE,
            4 * u64::from(self.segment_count),
            u64::from(self.segment_count),
        ]
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
        header.put_u32_le(self.segment_count);

        let mut counts = &mut buf[layout.section(1)?.range()];
        for count in &inner.valid_counts {
            counts.put_u32_le(*count);
        }
        let states = layout.section(2)?.range();
        for (dst, state) in buf[states].iter_mut().zip(&inner.states) {
            *dst = *state as u8;
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
                owner: "segment",
                detail: format!("signature {sig:#010x}, expected {:#010x}", self.signature()),
            });
        }
        let version = header.get_u64_le();
        let segment_count = header.get_u32_le();
        if segment_count != self.segment_count {
            return Err(AllocatorError::CorruptContext {
                owner: "segment",
                detail: format!(
                    "file has {} segments, array has {}",
                    segment_count, self.segment_count
                ),
            });
        }

        let mut inner = self.inner.lock();
        let mut counts = &buf[layout.section(1)?.range()];
        for slot in inner.valid_counts.iter_mut() {
            *slot = counts.get_u32_le();
        }
        let states = &buf[layout.section(2)?.range()];
        for (slot, raw) in inner.states.iter_mut().zip(states) {
            *slot = SegmentState::try_from(*raw).map_err(|bad| {
                AllocatorError::CorruptContext {
                    owner: "segment",
                    detail: format!("unknown segment state {bad}"),
                }
            })?;
        }
        inner.stored_version = version;
        inner.dirty_version = version + 1;
        Ok(())
    }

    fn after_flush(&self, buf: &[u8]) -> AllocatorResult<()> {
        // the version that actually reached disk
        let mut header = &buf[4..12];
        let version = header.get_u64_le();
        let mut inner = self.inner.lock();
        if version < inner.stored_version {
            warn!(
                stored = inner.stored_version,
                flushed = version,
                "segment context flush observed older version"
            );
        }
        inner.stored_version = version;
        Ok(())
    }

    fn stored_version(&self) -> u64 {
        self.inner.lock().stored_version
    }
}
