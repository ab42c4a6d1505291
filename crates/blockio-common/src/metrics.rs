//! Metrics collection for BlockIO
//!
//! A `MetricsCollector` is a bag of atomic gauges and counters shared by
//! the metafs, allocator, and mapper components. Updates are lock-free
//! fire-and-forget; `snapshot()` reads a point-in-time copy for tests and
//! diagnostics. No exporter lives here.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared atomic gauges/counters.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    /// Context file reads currently in flight
    pending_context_reads: AtomicU64,
    /// Context file flushes currently in flight
    pending_context_flushes: AtomicU64,
    /// Total context flushes completed
    context_flushes_done: AtomicU64,
    /// Mpios completed through the bottom-half handler
    mpios_done: AtomicU64,
    /// Mpios that completed with an error
    mpio_errors: AtomicU64,
    /// Volumes currently mounted (foreground or background)
    mounted_volumes: AtomicU64,
    /// Volume maps currently loaded in memory
    loaded_volumes: AtomicU64,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context_read_started(&self) {
        self.pending_context_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn context_read_finished(&self) {
        self.pending_context_reads.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn context_flush_started(&self) {
        self.pending_context_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn context_flush_finished(&self) {
        self.pending_context_flushes.fetch_sub(1, Ordering::Relaxed);
        self.context_flushes_done.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish the number of flushes a multi-file flush just issued.
    pub fn set_pending_context_flushes(&self, count: u64) {
        self.pending_context_flushes.store(count, Ordering::Relaxed);
    }

    pub fn mpio_done(&self, had_error: bool) {
        self.mpios_done.fetch_add(1, Ordering::Relaxed);
        if had_error {
            self.mpio_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn volume_mounted(&self) {
        self.mounted_volumes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn volume_unmounted(&self) {
        self.mounted_volumes.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn volume_loaded(&self) {
        self.loaded_volumes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn volume_unloaded(&self) {
        self.loaded_volumes.fetch_sub(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every gauge and counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pending_context_reads: self.pending_context_reads.load(Ordering::Relaxed),
            pending_context_flushes: self.pending_context_flushes.load(Ordering::Relaxed),
            context_flushes_done: self.context_flushes_done.load(Ordering::Relaxed),
            mpios_done: self.mpios_done.load(Ordering::Relaxed),
            mpio_errors: self.mpio_errors.load(Ordering::Relaxed),
            mounted_volumes: self.mounted_volumes.load(Ordering::Relaxed),
            loaded_volumes: self.loaded_volumes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time metrics values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub pending_context_reads: u64,
    pub pending_context_flushes: u64,
    pub context_flushes_done: u64,
    pub mpios_done: u64,
    pub mpio_errors: u64,
    pub mounted_volumes: u64,
    pub loaded_volumes: u64,
}
