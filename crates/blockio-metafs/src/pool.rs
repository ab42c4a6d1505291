//! Fixed-capacity pool of recycled mpio buffers

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::mpio::Mpio;

/// Recycles `Mpio` page buffers. `alloc` returns `None` when the pool
/// is exhausted; `alloc_wait` parks until a release makes one free.
/// Releasing consumes the mpio, so an mpio can only be returned once.
pub struct MpioPool {
    free: Mutex<Vec<Mpio>>,
    capacity: usize,
    page_size: usize,
    released: Notify,
}

impl MpioPool {
    #[must_use]
    pub fn new(capacity: usize, page_size: usize) -> Self {
        let free = (0..capacity).map(|_| Mpio::new(page_size)).collect();
        Self {
            free: Mutex::new(free),
            capacity,
            page_size,
            released: Notify::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Take an mpio, or `None` if the pool is empty.
    #[must_use]
    pub fn alloc(&self) -> Option<Mpio> {
        self.free.lock().pop()
    }

    /// Take an mpio, waiting for a release if the pool is empty.
    pub async fn alloc_wait(&self) -> Mpio {
        loop {
            if let Some(mpio) = self.alloc() {
                return mpio;
            }
            let notified = self.released.notified();
            if let Some(mpio) = self.alloc() {
                return mpio;
            }
            notified.await;
        }
    }

    /// Return an mpio. Resets its state for the next user.
    pub fn release(&self, mut mpio: Mpio) {
        mpio.reset();
        self.free.lock().push(mpio);
        self.released.notify_waiters();
    }
}
