//! MpioHandler - the bottom-half of the mpio pipeline
//!
//! Every mpio, read or write, partial or full, ends its life here: a
//! single tokio task drains the completion queue, finishes the read
//! state machine (end-to-end check plus copy-out), notifies the parent
//! request tracker, updates done-count telemetry, and releases the mpio
//! back to the pool. Nothing else may release an mpio.

use std::sync::Arc;

use blockio_common::MetricsCollector;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::io_manager::RequestTracker;
use crate::mpio::{Mpio, MpioOpcode, MpioState};
use crate::pool::MpioPool;

/// A completed (or failed) mpio headed for the bottom-half.
pub struct CompletedMpio {
    pub mpio: Mpio,
    /// Offset of this page's window within the request buffer
    pub buf_offset: usize,
    pub tracker: Arc<RequestTracker>,
}

/// Handle to the bottom-half task.
pub struct MpioHandler {
    tx: mpsc::UnboundedSender<CompletedMpio>,
}

impl MpioHandler {
    /// Spawn the bottom-half task. Must run inside a tokio runtime.
    #[must_use]
    pub fn start(pool: Arc<MpioPool>, metrics: Arc<MetricsCollector>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CompletedMpio>();

        tokio::spawn(async move {
            while let Some(completed) = rx.recv().await {
                let CompletedMpio {
                    mut mpio,
                    buf_offset,
                    tracker,
                } = completed;

                if mpio.io_info().opcode == MpioOpcode::Read
                    && mpio.state() == MpioState::E2eCheck
                    && mpio.do_e2e_check().is_ok()
                {
                    tracker.copy_read_window(buf_offset, &mut mpio);
                }

                let stop_state = mpio.error_stop_state();
                let error = mpio.take_error();
                if let Some(ref err) = error {
                    if stop_state {
                        debug!(mpio_id = mpio.id(), "mpio dropped in stop state");
                    } else {
                        warn!(mpio_id = mpio.id(), %err, "mpio completed with error");
                    }
                }

                metrics.mpio_done(error.is_some());
                tracker.complete_one(error, stop_state);
                pool.release(mpio);
            }
            debug!("mpio handler drained and exiting");
        });

        Self { tx }
    }

    /// Sender used by issuing tasks to enqueue completed mpios.
    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<CompletedMpio> {
        self.tx.clone()
    }
}
