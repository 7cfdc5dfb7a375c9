//! Lifetime-bucketed I/O zone allocation.
//!
//! Each lifetime class owns a bucket of zones. The allocator leases idle
//! bucket zones to writers, opens fresh zones when a bucket has none to
//! spare and the token caps allow it, and runs the two maintenance passes
//! (finish threshold, reset of fully-invalidated zones) that keep the
//! open/active budget from pooling in zones that no longer need it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ZbdError, ZbdResult};
use crate::lifetime::{target_class, IoType, WriteLifetime};
use crate::manager::ZoneManager;
use crate::pool::PoolInner;
use crate::zone::{Zone, ZoneLease};

/// Exclusively-held I/O zone handed out by
/// [`ZoneManager::allocate_io_zone`].
///
/// Dropping the handle returns the zone to its lifetime bucket; a zone
/// that filled up while held is retired in place and reclaimed by the next
/// reset pass once the upper layer invalidates its extents.
pub struct IoZoneHandle<'a> {
    manager: &'a ZoneManager,
    lease: Option<ZoneLease>,
}

impl std::fmt::Debug for IoZoneHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoZoneHandle")
            .field("lease", &self.lease)
            .finish()
    }
}

impl IoZoneHandle<'_> {
    fn lease(&self) -> &ZoneLease {
        self.lease.as_ref().expect("zone lease present until drop")
    }

    /// The held zone.
    pub fn zone(&self) -> &Arc<Zone> {
        self.lease().zone()
    }

    /// Appends `data` at the zone's write pointer.
    pub fn append(&self, data: &[u8]) -> ZbdResult<()> {
        self.lease().append(data)
    }

    /// Transitions the zone to full, giving up its remaining capacity.
    pub fn finish(&self) -> ZbdResult<()> {
        self.lease().finish()
    }
}

impl std::ops::Deref for IoZoneHandle<'_> {
    type Target = Zone;

    fn deref(&self) -> &Zone {
        self.lease()
    }
}

impl Drop for IoZoneHandle<'_> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.manager.release_io_zone(lease);
        }
    }
}

impl ZoneManager {
    /// Returns a zone the caller may append to, bound to the lifetime
    /// class derived from `hint` and `file_id`.
    ///
    /// Blocks until the class's bucket has an idle zone or the token caps
    /// allow opening a fresh one. WAL allocations skip maintenance and may
    /// consume the reserved open token.
    pub fn allocate_io_zone(
        &self,
        hint: WriteLifetime,
        io_type: IoType,
        file_id: u64,
    ) -> ZbdResult<IoZoneHandle<'_>> {
        self.deferred_status()?;

        let wal = io_type == IoType::Wal;
        if !wal {
            self.apply_finish_threshold()?;
            self.reset_unused_io_zones()?;
        }

        let class = target_class(&self.config, hint, file_id);
        let level = self
            .config
            .bucket_of(class)
            .ok_or_else(|| ZbdError::corruption(format!("lifetime class {class} out of range")))?;
        let open_limit = self.pool.open_limit(wal);

        let mut inner = self.pool.lock();
        let lease = loop {
            if inner.available[level] > 0 {
                if let Some(lease) = self.lease_idle_zone(&mut inner, level) {
                    break lease;
                }
                // An idle zone exists but is transiently held; wait for it.
            } else if inner.open_io_zones < open_limit
                && inner.active_io_zones < self.pool.max_active
            {
                inner.open_io_zones += 1;
                inner.active_io_zones += 1;
                let lease = loop {
                    if let Some(lease) = self.allocate_empty_zone() {
                        break lease;
                    }
                    inner = self.pool.wait_on(inner);
                };
                lease.set_lifetime(class);
                lease.set_leased(true);
                inner.buckets[level].push(lease.index());
                debug!(
                    zone = lease.number(),
                    class = %class,
                    "bound new zone to lifetime class"
                );
                break lease;
            }
            inner = self.pool.wait_on(inner);
        };
        drop(inner);

        debug!(
            zone = lease.number(),
            wp = lease.wp(),
            class = %class,
            ?io_type,
            file_id,
            "allocated io zone"
        );
        if !wal {
            self.log_zone_stats();
        }
        Ok(IoZoneHandle {
            manager: self,
            lease: Some(lease),
        })
    }

    /// Seeds every lifetime bucket with one empty zone, consuming one open
    /// and one active token per bucket.
    pub(crate) fn seed_level_zones(&self) -> ZbdResult<()> {
        let mut inner = self.pool.lock();
        for level in 0..self.config.levels() {
            let lease = self.allocate_empty_zone().ok_or_else(|| {
                ZbdError::no_space("no empty zone left to seed lifetime buckets")
            })?;
            inner.open_io_zones += 1;
            inner.active_io_zones += 1;
            let class = WriteLifetime::new(self.config.lifetime_begin + level as u8);
            lease.set_lifetime(class);
            lease.set_leased(false);
            inner.buckets[level].push(lease.index());
            inner.available[level] += 1;
            debug!(zone = lease.number(), class = %class, "seeded lifetime bucket");
        }
        Ok(())
    }

    /// Picks an idle zone out of bucket `level` and marks it leased.
    /// Caller holds the pool lock.
    fn lease_idle_zone(&self, inner: &mut PoolInner, level: usize) -> Option<ZoneLease> {
        for &idx in &inner.buckets[level] {
            let zone = &self.io_zones[idx as usize];
            if zone.is_leased() {
                continue;
            }
            if let Some(lease) = zone.try_acquire() {
                zone.set_leased(true);
                inner.available[level] -= 1;
                return Some(lease);
            }
        }
        None
    }

    /// Returns a writer's zone to the manager.
    ///
    /// A zone with capacity left becomes idle in its bucket again; a full
    /// zone is retired in place until the reset pass emits it.
    pub(crate) fn release_io_zone(&self, lease: ZoneLease) {
        let zone = Arc::clone(lease.zone());
        {
            let mut inner = self.pool.lock();
            if let Some(level) = bucket_level_of(&inner, zone.index()) {
                if zone.is_full() {
                    debug!(zone = zone.number(), "full zone retired in bucket");
                } else {
                    zone.set_leased(false);
                    inner.available[level] += 1;
                    debug!(zone = zone.number(), "zone returned to lifetime bucket");
                }
            }
        }
        drop(lease);
        self.pool.notify_all();
    }

    /// Linear scan for an acquirable empty zone. Does not charge tokens;
    /// callers hold whatever tokens the zone will consume.
    pub(crate) fn allocate_empty_zone(&self) -> Option<ZoneLease> {
        for zone in &self.io_zones {
            if let Some(lease) = zone.try_acquire() {
                if zone.is_empty() && !zone.is_offline() && !zone.lifetime().is_set() {
                    return Some(lease);
                }
            }
        }
        None
    }

    /// Finishes idle zones whose remaining capacity has dropped below the
    /// configured percentage of their maximum, freeing active-zone budget
    /// that near-full zones would otherwise pin.
    pub fn apply_finish_threshold(&self) -> ZbdResult<()> {
        let threshold = self.config.finish_threshold as u64;
        if threshold == 0 {
            return Ok(());
        }
        for zone in &self.io_zones {
            let Some(lease) = zone.try_acquire() else {
                continue;
            };
            let below = zone.capacity() < zone.max_capacity() * threshold / 100;
            if !(zone.is_empty() || zone.is_full()) && below {
                debug!(
                    zone = zone.number(),
                    capacity = zone.capacity(),
                    "finishing zone below threshold"
                );
                if let Err(e) = lease.finish() {
                    warn!(zone = zone.number(), error = %e, "failed to finish zone");
                    return Err(e);
                }
                if !self.emit_zone(lease) {
                    self.pool.put_active_token();
                }
            }
        }
        self.pool.notify_all();
        Ok(())
    }

    /// Resets every idle zone whose extents have all been invalidated.
    ///
    /// Bucket zones are emitted (reseeding their bucket or refunding their
    /// tokens); a non-full zone outside the buckets was a recovered active
    /// zone and refunds its active token.
    pub fn reset_unused_io_zones(&self) -> ZbdResult<()> {
        for zone in &self.io_zones {
            let Some(lease) = zone.try_acquire() else {
                continue;
            };
            if !zone.is_empty() && !zone.is_used() {
                let was_full = zone.is_full();
                debug!(zone = zone.number(), "resetting unused zone");
                lease.reset()?;
                if !self.emit_zone(lease) && !was_full {
                    self.pool.put_active_token();
                }
            }
        }
        self.pool.notify_all();
        Ok(())
    }

    /// Removes a zone from its lifetime bucket, consuming the caller's
    /// lease. Returns `false` (after dropping the lease) if the zone was
    /// not bucketed.
    ///
    /// If the bucket would become empty, the emitted zone's open and
    /// active tokens transfer to a freshly seeded replacement; otherwise
    /// both tokens are refunded.
    fn emit_zone(&self, lease: ZoneLease) -> bool {
        let zone = Arc::clone(lease.zone());
        let mut inner = self.pool.lock();
        let Some(level) = bucket_level_of(&inner, zone.index()) else {
            drop(inner);
            drop(lease);
            return false;
        };

        inner.buckets[level].retain(|&i| i != zone.index());
        if zone.is_leased() {
            // Retired-full zone; it was never idle, so `available` is
            // untouched.
            zone.set_leased(false);
        } else {
            inner.available[level] -= 1;
        }
        debug!(zone = zone.number(), level, "emitted zone from lifetime bucket");

        if inner.buckets[level].is_empty() {
            // Keep every bucket populated: the emitted zone's tokens move
            // to a replacement. Release the emitted zone first so it can
            // serve as its own replacement after a reset.
            drop(lease);
            let replacement = loop {
                if let Some(replacement) = self.allocate_empty_zone() {
                    break replacement;
                }
                inner = self.pool.wait_on(inner);
            };
            let class = WriteLifetime::new(self.config.lifetime_begin + level as u8);
            replacement.set_lifetime(class);
            replacement.set_leased(false);
            inner.buckets[level].push(replacement.index());
            inner.available[level] += 1;
            debug!(
                zone = replacement.number(),
                class = %class,
                "reseeded lifetime bucket"
            );
            drop(inner);
            drop(replacement);
        } else {
            inner.open_io_zones -= 1;
            inner.active_io_zones -= 1;
            drop(inner);
            drop(lease);
        }
        self.pool.notify_all();
        true
    }
}

fn bucket_level_of(inner: &PoolInner, index: u32) -> Option<usize> {
    inner
        .buckets
        .iter()
        .position(|bucket| bucket.contains(&index))
}
