//! BlockIO MetaFS - metadata page I/O
//!
//! Every metadata reader and writer in the array funnels through this
//! crate. A byte-granular request is split into per-page `Mpio` units,
//! each of which runs a small state machine (read, end-to-end check,
//! copy, write), completes through the `MpioHandler` bottom-half, and is
//! recycled into the `MpioPool`. `MetaIoManager` is the public entry
//! point; `MetaFile` is the page-addressed backing store.

pub mod error;
pub mod file;
pub mod handler;
pub mod io_manager;
pub mod mpio;
pub mod page;
pub mod pool;

pub use error::{MetafsError, MetafsResult};
pub use file::{FileId, MetaFile, MetaStorage};
pub use handler::MpioHandler;
pub use io_manager::MetaIoManager;
pub use mpio::{Mpio, MpioIoInfo, MpioOpcode, MpioState};
pub use pool::MpioPool;
