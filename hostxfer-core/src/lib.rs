//! Host-transfer core
//!
//! Runtime-agnostic building blocks for the host-transfer collective engine:
//! - Pinned, page-locked host allocation (`pinned`)
//! - Device-event pooling (`event_pool`)
//! - Cross-device/host sync primitive (`sync_flag`)
//! - Element datatype tag + transport-type lookup (`datatype`)
//! - Engine configuration (`options`)
//! - Error types (`error`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]

pub mod datatype;
pub mod error;
pub mod event_pool;
pub mod options;
pub mod pinned;
pub mod sync_flag;

/// A small prelude to make downstream crates ergonomic. Kept minimal to
/// avoid API lock-in.
pub mod prelude {
    pub use crate::datatype::{Datatype, HostElement, TransportTypeCode};
    pub use crate::error::{EngineError, Result};
    pub use crate::event_pool::{DeviceEventToken, EventPool};
    pub use crate::options::EngineOptions;
    pub use crate::pinned::{PinnedBuffer, PinnedPool};
    pub use crate::sync_flag::SyncFlag;
}
