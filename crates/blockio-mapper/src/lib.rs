//! BlockIO Mapper - logical-to-physical translation
//!
//! Two maps per array: a per-volume VSA map translating volume-relative
//! block addresses to virtual stripe addresses, and one stripe map
//! translating virtual stripe ids to their physical location. Each
//! volume slot runs a small mount state machine; internal callers (GC,
//! journal replay) are admitted through `enable_internal_access`, which
//! loads an unloaded map on first touch and bounces callers with
//! `NeedRetry` until the load lands.

pub mod error;
pub mod mapper;
pub mod stripe_map;
pub mod volume_state;
pub mod vsa_map;

pub use error::{MapperError, MapperResult, VolumeEventResult};
pub use mapper::Mapper;
pub use stripe_map::StripeMap;
pub use volume_state::{VolState, VolumeSlot, VolumeSlots};
pub use vsa_map::VsaMap;
