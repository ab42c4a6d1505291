//! Allocator context
//!
//! The write path's durable cursors: the next SSD stripe to hand out
//! and the active stripe tail per volume slot. Small but versioned and
//! flushed with the segment context on every whole-context flush.
//!
//! File image:
//!
//! ```text
//! section 0 (header, 64 B): sig(4) version(8) slot_count(4) pad
//! section 1 (cursor, 8 B):  next ssd stripe id (u64)
//! section 2 (tails):        16 B per volume slot: stripe(4) pad(4) offset(8)
//! ```

use blockio_common::{ArrayConfig, StripeId, VirtualBlkAddr, UNMAP_VSA};
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::client::ContextClient;
use crate::error::{AllocatorError, AllocatorResult};
use crate::section::{ContextOwner, SectionLayout};

const HEADER_SIZE: u64 = 64;
const TAIL_ENTRY_SIZE: u64 = 16;

struct AllocatorInner {
    dirty_version: u64,
    stored_version: u64,
    current_ssd_stripe: u64,
    active_tails: Vec<VirtualBlkAddr>,
}

/// Stripe cursor and active stripe tails.
pub struct AllocatorCtx {
    slot_count: u32,
    user_area_stripes: u64,
    inner: Mutex<AllocatorInner>,
}

impl AllocatorCtx {
    #[must_use]
    pub fn new(config: &ArrayConfig) -> Self {
        Self {
            slot_count: config.volume_slot_count,
            user_area_stripes: u64::from(config.user_area_stripe_count()),
            inner: Mutex::new(AllocatorInner {
                dirty_version: 0,
                stored_version: 0,
                current_ssd_stripe: 0,
                active_tails: vec![UNMAP_VSA; config.volume_slot_count as usize],
            }),
        }
    }

    /// Hand out the next SSD stripe, or `None` when the user area is
    /// exhausted.
    #[must_use]
    pub fn alloc_ssd_stripe(&self) -> Option<StripeId> {
        let mut inner = self.inner.lock();
        if inner.current_ssd_stripe >= self.user_area_stripes {
            return None;
        }
        let stripe = inner.current_ssd_stripe as StripeId;
        inner.current_ssd_stripe += 1;
        debug!(stripe_id = stripe, "ssd stripe allocated");
        Some(stripe)
    }

    #[must_use]
    pub fn current_ssd_stripe(&self) -> u64 {
        self.inner.lock().current_ssd_stripe
    }

    fn check_slot(&self, slot: u32) -> AllocatorResult<usize> {
        if slot >= self.slot_count {
            return Err(AllocatorError::Internal(format!(
                "tail slot {} out of range ({})",
                slot, self.slot_count
            )));
        }
        Ok(slot as usize)
    }

    pub fn active_stripe_tail(&self, slot: u32) -> AllocatorResult<VirtualBlkAddr> {
        let idx = self.check_slot(slot)?;
        Ok(self.inner.lock().active_tails[idx])
    }

    pub fn set_active_stripe_tail(&self, slot: u32, tail: VirtualBlkAddr) -> AllocatorResult<()> {
        let idx = self.check_slot(slot)?;
        self.inner.lock().active_tails[idx] = tail;
        Ok(())
    }
}

impl ContextClient for AllocatorCtx {
    fn owner(&self) -> ContextOwner {
        ContextOwner::AllocatorCtx
    }

    fn section_sizes(&self) -> Vec<u64> {
        vec![HEADER_SIZE, 8, TAIL_ENTRY_SIZE * u64::from(self.slot_count)]
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
        header.put_u32_le(self.slot_count);

        let mut cursor = &mut buf[layout.section(1)?.range()];
        cursor.put_u64_le(inner.current_ssd_stripe);

        let mut tails = &mut buf[layout.section(2)?.range()];
        for tail in &inner.active_tails {
            tails.put_u32_le(tail.stripe_id);
            tails.put_u32_le(0);
            tails.put_u64_le(tail.offset);
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
                owner: "allocator",
                detail: format!("signature {sig:#010x}, expected {:#010x}", self.signature()),
            });
        }
        let version = header.get_u64_le();
        let slot_count = header.get_u32_le();
        if slot_count != self.slot_count {
            return Err(AllocatorError::CorruptContext {
                owner: "allocator",
                detail: format!("file has {} tail slots, array has {}", slot_count, self.slot_count),
            });
        }

        let mut inner = self.inner.lock();
        let mut cursor = &buf[layout.section(1)?.range()];
        inner.current_ssd_stripe = cursor.get_u64_le();

        let mut tails = &buf[layout.section(2)?.range()];
        for slot in inner.active_tails.iter_mut() {
            let stripe_id = tails.get_u32_le();
            let _pad = tails.get_u32_le();
            let offset = tails.get_u64_le();
            *slot = VirtualBlkAddr { stripe_id, offset };
        }
        inner.stored_version = version;
        inner.dirty_version = version + 1;
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
