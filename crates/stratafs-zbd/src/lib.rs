#![warn(missing_docs)]

//! StrataFS zoned-block-device zone manager.
//!
//! This crate manages the pool of writable zones on a zoned block device
//! for the StrataFS backend: it allocates zones to file write streams,
//! steers data of similar write-lifetime into the same zones to minimise
//! reclamation cost, enforces the device's open/active zone caps through a
//! token discipline, and coordinates the dedicated zones used as garbage
//! collection targets. The file layer above it maps files to zone extents;
//! the [`backend::ZoneBackend`] trait below it abstracts the device.

pub mod backend;
pub mod config;
pub mod error;
pub mod lifetime;
pub mod manager;
pub mod migrate;
pub mod zone;

mod allocator;
mod pool;

pub use allocator::IoZoneHandle;
pub use backend::{DeviceCaps, MockZonedDevice, ResetOutcome, ZoneBackend, ZoneDescriptor};
pub use config::{ZbdConfig, META_ZONE_COUNT, MIN_ZONE_COUNT, RESERVED_ZONE_TOKENS};
pub use error::{ZbdError, ZbdResult};
pub use lifetime::{IoType, WriteLifetime};
pub use manager::{ZoneManager, ZoneStats};
pub use migrate::MigrateZone;
pub use zone::{Zone, ZoneLease, ZoneSnapshot};
