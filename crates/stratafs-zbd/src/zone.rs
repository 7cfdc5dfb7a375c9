//! Per-zone state and operations.
//!
//! A [`Zone`] mirrors one physical zone of the device. All fields that
//! change over time are atomics, so monitoring can take a consistent-enough
//! snapshot without locking. Mutation is gated by the zone's `busy` flag:
//! [`Zone::try_acquire`] hands out a [`ZoneLease`], the only type carrying
//! the mutating operations, and dropping the lease releases the flag on
//! every exit path.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{ZoneBackend, ZoneDescriptor};
use crate::error::{ZbdError, ZbdResult};
use crate::lifetime::WriteLifetime;

/// One physical zone.
pub struct Zone {
    index: u32,
    start: u64,
    zone_size: u64,
    block_size: u32,
    busy: AtomicBool,
    leased: AtomicBool,
    wp: AtomicU64,
    capacity: AtomicU64,
    max_capacity: AtomicU64,
    used_capacity: AtomicU64,
    lifetime: AtomicU8,
    backend: Arc<dyn ZoneBackend>,
    bytes_written: Arc<AtomicU64>,
}

impl Zone {
    pub(crate) fn new(
        index: u32,
        desc: &ZoneDescriptor,
        backend: Arc<dyn ZoneBackend>,
        bytes_written: Arc<AtomicU64>,
    ) -> Self {
        let written = desc.wp.saturating_sub(desc.start);
        let writable = !desc.is_offline && written < desc.max_capacity;
        let capacity = if writable {
            desc.max_capacity - written
        } else {
            0
        };
        Self {
            index,
            start: desc.start,
            zone_size: backend.zone_size(),
            block_size: backend.block_size(),
            busy: AtomicBool::new(false),
            leased: AtomicBool::new(false),
            wp: AtomicU64::new(desc.wp),
            capacity: AtomicU64::new(capacity),
            max_capacity: AtomicU64::new(desc.max_capacity),
            used_capacity: AtomicU64::new(0),
            lifetime: AtomicU8::new(WriteLifetime::NOT_SET.as_u8()),
            backend,
            bytes_written,
        }
    }

    /// Byte offset of the zone's first block; stable identity.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Ordinal of this zone on the device.
    pub fn number(&self) -> u64 {
        self.start / self.zone_size
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// Current write pointer.
    pub fn wp(&self) -> u64 {
        self.wp.load(Ordering::Relaxed)
    }

    /// Bytes still writable before the zone becomes full.
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Writable bytes in the zone when empty.
    pub fn max_capacity(&self) -> u64 {
        self.max_capacity.load(Ordering::Relaxed)
    }

    /// Bytes currently considered live by the upper layer.
    pub fn used_capacity(&self) -> u64 {
        self.used_capacity.load(Ordering::Relaxed)
    }

    /// The lifetime class this zone is bound to.
    pub fn lifetime(&self) -> WriteLifetime {
        WriteLifetime::new(self.lifetime.load(Ordering::Relaxed))
    }

    pub(crate) fn set_lifetime(&self, lifetime: WriteLifetime) {
        self.lifetime.store(lifetime.as_u8(), Ordering::Relaxed);
    }

    /// Nothing has been written since the last reset.
    pub fn is_empty(&self) -> bool {
        self.wp() == self.start
    }

    /// No writable bytes remain.
    pub fn is_full(&self) -> bool {
        self.capacity() == 0
    }

    /// The upper layer still holds live extents in this zone.
    pub fn is_used(&self) -> bool {
        self.used_capacity() > 0
    }

    /// The zone went offline and is permanently unusable.
    pub fn is_offline(&self) -> bool {
        self.max_capacity() == 0
    }

    /// Whether the zone is currently held by an exclusive owner.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    pub(crate) fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Relaxed)
    }

    pub(crate) fn set_leased(&self, leased: bool) {
        self.leased.store(leased, Ordering::Relaxed);
    }

    /// Records `bytes` of new live data in this zone.
    pub fn add_used(&self, bytes: u64) {
        self.used_capacity.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Removes `bytes` of live data after the upper layer invalidates
    /// extents.
    pub fn sub_used(&self, bytes: u64) {
        let _ = self
            .used_capacity
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    /// Attempts to take exclusive ownership of the zone.
    ///
    /// Returns `None` if another owner holds it. The returned lease is the
    /// only way to mutate the zone; dropping it releases ownership.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ZoneLease> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(ZoneLease {
                zone: Arc::clone(self),
            })
        } else {
            None
        }
    }

    /// Point-in-time copy of the zone's state for monitoring.
    pub fn snapshot(&self) -> ZoneSnapshot {
        ZoneSnapshot {
            start: self.start,
            wp: self.wp(),
            capacity: self.capacity(),
            max_capacity: self.max_capacity(),
            used_capacity: self.used_capacity(),
            lifetime: self.lifetime(),
        }
    }
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("number", &self.number())
            .field("start", &self.start)
            .field("wp", &self.wp())
            .field("capacity", &self.capacity())
            .field("max_capacity", &self.max_capacity())
            .field("used_capacity", &self.used_capacity())
            .field("lifetime", &self.lifetime())
            .field("busy", &self.is_busy())
            .finish()
    }
}

/// Point-in-time view of one zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    /// Byte offset of the zone's first block.
    pub start: u64,
    /// Write pointer at snapshot time.
    pub wp: u64,
    /// Remaining writable bytes.
    pub capacity: u64,
    /// Writable bytes when empty.
    pub max_capacity: u64,
    /// Live bytes.
    pub used_capacity: u64,
    /// Bound lifetime class.
    pub lifetime: WriteLifetime,
}

/// Exclusive lease on a [`Zone`].
///
/// Carries the operations that mutate zone state. Dropping the lease
/// releases the zone.
#[derive(Debug)]
pub struct ZoneLease {
    zone: Arc<Zone>,
}

impl ZoneLease {
    pub(crate) fn zone(&self) -> &Arc<Zone> {
        &self.zone
    }

    /// Appends `data` at the write pointer.
    ///
    /// `data` must be non-empty and a multiple of the device block size.
    /// Fails with `NoSpace` before touching the device if the zone cannot
    /// hold it. Short device writes are retried until all bytes are
    /// placed; a device error surfaces as `Io` with the write pointer
    /// reflecting whatever the device accepted.
    pub fn append(&self, data: &[u8]) -> ZbdResult<()> {
        let zone = &self.zone;
        if data.is_empty() {
            return Err(ZbdError::invalid_argument("append of zero bytes"));
        }
        if data.len() % zone.block_size as usize != 0 {
            return Err(ZbdError::invalid_argument(format!(
                "append of {} bytes is not a multiple of the {} byte block size",
                data.len(),
                zone.block_size
            )));
        }
        if zone.capacity() < data.len() as u64 {
            return Err(ZbdError::no_space(format!(
                "zone {} has {} bytes left, append is {}",
                zone.number(),
                zone.capacity(),
                data.len()
            )));
        }

        let mut written = 0usize;
        while written < data.len() {
            let wp = zone.wp.load(Ordering::Relaxed);
            match zone.backend.write(&data[written..], wp) {
                Ok(0) => {
                    return Err(ZbdError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "backend accepted no bytes",
                    )))
                }
                Ok(n) => {
                    zone.wp.fetch_add(n as u64, Ordering::Relaxed);
                    zone.capacity.fetch_sub(n as u64, Ordering::Relaxed);
                    zone.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                    written += n;
                }
                Err(e) => return Err(ZbdError::Io(e)),
            }
        }
        Ok(())
    }

    /// Transitions a non-full zone to full.
    pub fn finish(&self) -> ZbdResult<()> {
        let zone = &self.zone;
        zone.backend.finish(zone.start)?;
        zone.capacity.store(0, Ordering::Relaxed);
        zone.wp
            .store(zone.start + zone.zone_size, Ordering::Relaxed);
        Ok(())
    }

    /// Resets the zone, making it empty and unbinding its lifetime.
    ///
    /// Legal only once the upper layer has invalidated every extent.
    pub fn reset(&self) -> ZbdResult<()> {
        let zone = &self.zone;
        if zone.is_used() {
            return Err(ZbdError::corruption(format!(
                "reset of zone {} with {} live bytes",
                zone.number(),
                zone.used_capacity()
            )));
        }
        let outcome = zone.backend.reset(zone.start)?;
        if outcome.offline {
            warn!(zone = zone.number(), "zone went offline during reset");
            zone.max_capacity.store(0, Ordering::Relaxed);
            zone.capacity.store(0, Ordering::Relaxed);
        } else {
            zone.max_capacity
                .store(outcome.max_capacity, Ordering::Relaxed);
            zone.capacity.store(outcome.max_capacity, Ordering::Relaxed);
        }
        zone.wp.store(zone.start, Ordering::Relaxed);
        zone.set_lifetime(WriteLifetime::NOT_SET);
        debug!(zone = zone.number(), "zone reset");
        Ok(())
    }

    /// Transitions an open zone to closed without finishing it.
    ///
    /// No-op on empty or full zones. Used during open-time recovery.
    pub fn close(&self) -> ZbdResult<()> {
        let zone = &self.zone;
        if !(zone.is_empty() || zone.is_full()) {
            zone.backend.close(zone.start)?;
        }
        Ok(())
    }
}

impl std::ops::Deref for ZoneLease {
    type Target = Zone;

    fn deref(&self) -> &Zone {
        &self.zone
    }
}

impl Drop for ZoneLease {
    fn drop(&mut self) {
        let was_busy = self.zone.busy.swap(false, Ordering::Release);
        if !was_busy {
            // Every lease is created by a successful acquire; reaching this
            // point means the flag was cleared behind our back.
            warn!(
                zone = self.zone.number(),
                "released a zone that was not busy"
            );
            debug_assert!(was_busy, "zone lease dropped while not busy");
        }
    }
}
