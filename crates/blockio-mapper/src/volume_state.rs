//! Per-volume mount state machine
//!
//! ```text
//! NotExist -> BackgroundMounted        (created; the fresh map is resident)
//! NotExist -> ExistUnloaded            (discovered at boot)
//! ExistUnloaded -> VolumeLoading       (first internal access)
//! VolumeLoading -> BackgroundMounted   (async load landed)
//! ExistUnloaded|BackgroundMounted -> ForegroundMounted   (mount)
//! ForegroundMounted -> BackgroundMounted                 (unmount/detach)
//! ExistUnloaded|*Mounted -> VolumeDeleting -> NotExist   (delete)
//! ```
//!
//! A failed load leaves the slot in `VolumeLoading`; waiters are woken
//! so they can observe the state and keep retrying.

use blockio_common::VolumeId;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{MapperError, MapperResult};

/// Mount state of one volume slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolState {
    NotExist,
    ExistUnloaded,
    VolumeLoading,
    BackgroundMounted,
    ForegroundMounted,
    VolumeDeleting,
}

impl VolState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            VolState::NotExist => "not_exist",
            VolState::ExistUnloaded => "exist_unloaded",
            VolState::VolumeLoading => "volume_loading",
            VolState::BackgroundMounted => "background_mounted",
            VolState::ForegroundMounted => "foreground_mounted",
            VolState::VolumeDeleting => "volume_deleting",
        }
    }

    /// Map loaded and usable by internal callers.
    #[must_use]
    pub fn is_accessible(&self) -> bool {
        matches!(
            self,
            VolState::BackgroundMounted | VolState::ForegroundMounted
        )
    }
}

/// One volume slot: state plus the volume's size in blocks.
#[derive(Debug, Clone, Copy)]
pub struct VolumeSlot {
    pub state: VolState,
    pub size_blocks: u64,
}

struct SlotCell {
    slot: Mutex<VolumeSlot>,
    load_done: Notify,
}

/// The array's volume slot table.
pub struct VolumeSlots {
    cells: Vec<SlotCell>,
}

impl VolumeSlots {
    #[must_use]
    pub fn new(count: u32) -> Self {
        let cells = (0..count)
            .map(|_| SlotCell {
                slot: Mutex::new(VolumeSlot {
                    state: VolState::NotExist,
                    size_blocks: 0,
                }),
                load_done: Notify::new(),
            })
            .collect();
        Self { cells }
    }

    fn cell(&self, volume_id: VolumeId) -> MapperResult<&SlotCell> {
        self.cells.get(volume_id as usize).ok_or_else(|| {
            MapperError::Internal(format!(
                "volume {} beyond slot count {}",
                volume_id,
                self.cells.len()
            ))
        })
    }

    /// Run `f` with the slot locked.
    pub fn with_slot<R>(
        &self,
        volume_id: VolumeId,
        f: impl FnOnce(&mut VolumeSlot) -> R,
    ) -> MapperResult<R> {
        let cell = self.cell(volume_id)?;
        let mut slot = cell.slot.lock();
        Ok(f(&mut slot))
    }

    pub fn state(&self, volume_id: VolumeId) -> MapperResult<VolState> {
        Ok(self.cell(volume_id)?.slot.lock().state)
    }

    /// Wake callers parked on this slot's load.
    pub fn notify_load_done(&self, volume_id: VolumeId) {
        if let Ok(cell) = self.cell(volume_id) {
            cell.load_done.notify_waiters();
        }
    }

    /// Park until the slot's load completes (or fails); callers recheck
    /// the state afterwards.
    pub async fn wait_load_done(&self, volume_id: VolumeId) -> MapperResult<()> {
        let cell = self.cell(volume_id)?;
        let notified = cell.load_done.notified();
        if cell.slot.lock().state != VolState::VolumeLoading {
            return Ok(());
        }
        notified.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_start_not_exist() {
        let slots = VolumeSlots::new(4);
        assert_eq!(slots.state(0).unwrap(), VolState::NotExist);
        assert!(slots.state(4).is_err());
    }

    #[test]
    fn test_accessibility() {
        assert!(VolState::BackgroundMounted.is_accessible());
        assert!(VolState::ForegroundMounted.is_accessible());
        assert!(!VolState::VolumeLoading.is_accessible());
        assert!(!VolState::ExistUnloaded.is_accessible());
    }

    #[tokio::test]
    async fn test_wait_returns_when_not_loading() {
        let slots = VolumeSlots::new(1);
        slots
            .with_slot(0, |slot| slot.state = VolState::BackgroundMounted)
            .unwrap();
        slots.wait_load_done(0).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_parks_until_notified() {
        use std::sync::Arc;
        let slots = Arc::new(VolumeSlots::new(1));
        slots
            .with_slot(0, |slot| slot.state = VolState::VolumeLoading)
            .unwrap();

        let s = slots.clone();
        let waiter = tokio::spawn(async move { s.wait_load_done(0).await });
        tokio::task::yield_now().await;

        slots
            .with_slot(0, |slot| slot.state = VolState::BackgroundMounted)
            .unwrap();
        slots.notify_load_done(0);
        waiter.await.unwrap().unwrap();
    }
}
