//! Migration channel for garbage collection.
//!
//! Live data is moved out of victim zones into a dedicated GC zone, with a
//! second, pre-staged aux zone promoted when the primary fills. Victim
//! selection and migration scheduling belong to the GC policy outside this
//! crate; only one GC worker migrates at a time.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ZbdResult;
use crate::manager::ZoneManager;
use crate::zone::{Zone, ZoneLease};

/// GC destination slots, guarded by the manager's migration mutex.
#[derive(Default)]
pub(crate) struct MigrateSlots {
    /// The current migration target, leased across migrations.
    pub gc: Option<ZoneLease>,
    /// Start offset of the current migration target, kept while the zone
    /// is checked out to the GC worker.
    pub gc_start: Option<u64>,
    /// Pre-staged next target.
    pub aux: Option<ZoneLease>,
    /// Whether the channel holds its open/active token pair. Charged by
    /// the first primary reservation and kept for the manager's lifetime;
    /// promoted and restaged zones inherit it.
    pub tokens_charged: bool,
}

/// The migration target checked out by [`ZoneManager::take_migrate_zone`].
///
/// Dropping (or passing to [`ZoneManager::release_migrate_zone`]) returns
/// the zone to the GC slot; the current target stays leased across many
/// migrations.
pub struct MigrateZone<'a> {
    manager: &'a ZoneManager,
    lease: Option<ZoneLease>,
}

impl MigrateZone<'_> {
    fn lease(&self) -> &ZoneLease {
        self.lease.as_ref().expect("migrate lease present until drop")
    }

    /// The held zone.
    pub fn zone(&self) -> &Arc<Zone> {
        self.lease().zone()
    }

    /// Appends migrated data at the zone's write pointer.
    pub fn append(&self, data: &[u8]) -> ZbdResult<()> {
        self.lease().append(data)
    }
}

impl std::ops::Deref for MigrateZone<'_> {
    type Target = Zone;

    fn deref(&self) -> &Zone {
        self.lease()
    }
}

impl Drop for MigrateZone<'_> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.manager.return_migrate_lease(lease);
        }
    }
}

impl ZoneManager {
    /// Reserves an empty zone as a GC destination.
    ///
    /// The first primary reservation charges one open and one active
    /// token; the channel keeps the pair for the manager's lifetime, so
    /// later restagings, aux zones and promotions charge nothing. Blocks
    /// until an empty zone is available.
    pub fn allocate_gc_zone(&self, aux: bool) -> ZbdResult<()> {
        let charge = if aux {
            false
        } else {
            let mut slots = self.migrate.lock().unwrap();
            !std::mem::replace(&mut slots.tokens_charged, true)
        };
        if charge {
            self.pool.wait_for_open_token(false);
            self.pool.wait_for_active_token();
        }

        let lease = {
            let mut inner = self.pool.lock();
            loop {
                if let Some(lease) = self.allocate_empty_zone() {
                    break lease;
                }
                inner = self.pool.wait_on(inner);
            }
        };
        lease.set_lifetime(self.config.gc_class());
        info!(
            zone = lease.number(),
            aux, "reserved zone for gc migration"
        );

        let mut slots = self.migrate.lock().unwrap();
        if aux {
            slots.aux = Some(lease);
        } else {
            slots.gc_start = Some(lease.start());
            slots.gc = Some(lease);
        }
        Ok(())
    }

    /// Returns the migration target if it has at least `min_capacity`
    /// bytes of room.
    ///
    /// A primary without enough room is finished and the aux zone is
    /// promoted in its place. `Ok(None)` signals an exhausted channel: no
    /// target is staged and the caller is expected to stage one with
    /// [`ZoneManager::allocate_gc_zone`].
    pub fn take_migrate_zone(&self, min_capacity: u64) -> ZbdResult<Option<MigrateZone<'_>>> {
        let mut slots = self.migrate.lock().unwrap();
        let Some(lease) = slots.gc.take() else {
            info!("gc migration channel exhausted");
            return Ok(None);
        };

        if lease.capacity() < min_capacity {
            debug!(
                zone = lease.number(),
                capacity = lease.capacity(),
                min_capacity,
                "finishing exhausted gc zone"
            );
            if let Err(e) = lease.finish() {
                warn!(zone = lease.number(), error = %e, "failed to finish gc zone");
                slots.gc_start = None;
                return Err(e);
            }
            drop(lease);
            slots.gc_start = None;

            match slots.aux.take() {
                Some(aux) => {
                    info!(zone = aux.number(), "promoted aux gc zone");
                    slots.gc_start = Some(aux.start());
                    Ok(Some(MigrateZone {
                        manager: self,
                        lease: Some(aux),
                    }))
                }
                None => {
                    info!("gc migration channel exhausted");
                    Ok(None)
                }
            }
        } else {
            debug!(zone = lease.number(), "took migrate zone");
            Ok(Some(MigrateZone {
                manager: self,
                lease: Some(lease),
            }))
        }
    }

    /// Returns a migration target taken with
    /// [`ZoneManager::take_migrate_zone`]. The current GC zone goes back
    /// to its slot and stays leased; any other zone is released.
    pub fn release_migrate_zone(&self, zone: MigrateZone<'_>) {
        drop(zone);
    }

    pub(crate) fn return_migrate_lease(&self, lease: ZoneLease) {
        let mut slots = self.migrate.lock().unwrap();
        if slots.gc.is_none() && slots.gc_start == Some(lease.start()) {
            slots.gc = Some(lease);
        } else {
            debug!(zone = lease.number(), "released migrate zone");
            drop(lease);
        }
    }
}
