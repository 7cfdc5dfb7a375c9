//! The zone manager.
//!
//! A [`ZoneManager`] owns every zone of one zoned block device for the
//! process lifetime: the meta zones reserved for the metadata layer, the
//! I/O zone registry, the open/active token accounting, the lifetime
//! buckets, and the migration channel. It is fully thread-safe; the upper
//! file layer and GC workers call it concurrently.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::ZoneBackend;
use crate::config::{ZbdConfig, META_ZONE_COUNT, MIN_ZONE_COUNT, RESERVED_ZONE_TOKENS};
use crate::error::{ZbdError, ZbdResult};
use crate::lifetime::WriteLifetime;
use crate::migrate::MigrateSlots;
use crate::pool::ZonePool;
use crate::zone::{Zone, ZoneLease, ZoneSnapshot};

/// Aggregate counters over the I/O zone registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneStats {
    /// Live bytes across all I/O zones.
    pub used_capacity: u64,
    /// Dead bytes in zones that still hold live data.
    pub reclaimable_capacity: u64,
    /// Zones that are neither empty nor full.
    pub partial_zones: u64,
    /// Zones counted against the open cap.
    pub open_io_zones: u32,
    /// Zones counted against the active cap.
    pub active_io_zones: u32,
}

/// Manager for the writable zones of one zoned block device.
pub struct ZoneManager {
    pub(crate) backend: Arc<dyn ZoneBackend>,
    pub(crate) config: ZbdConfig,
    pub(crate) meta_zones: Vec<Arc<Zone>>,
    pub(crate) io_zones: Vec<Arc<Zone>>,
    pub(crate) pool: ZonePool,
    pub(crate) deferred: Mutex<Option<ZbdError>>,
    pub(crate) migrate: Mutex<MigrateSlots>,
    pub(crate) bytes_written: Arc<AtomicU64>,
    pub(crate) gc_bytes: Vec<AtomicU64>,
    readonly: bool,
    start_time: Instant,
}

impl std::fmt::Debug for ZoneManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneManager")
            .field("config", &self.config)
            .field("meta_zones", &self.meta_zones.len())
            .field("io_zones", &self.io_zones.len())
            .field("readonly", &self.readonly)
            .finish()
    }
}

impl ZoneManager {
    /// Opens the device and builds the zone registry.
    ///
    /// Write opens must be exclusive. The first three sequential-write-
    /// required slots become meta zones (offline ones consume a slot
    /// without being registered); the remaining usable zones form the I/O
    /// registry. On a writable open, device-open zones are normalised to
    /// closed and every lifetime bucket is seeded with one empty zone.
    pub fn open(
        backend: Arc<dyn ZoneBackend>,
        config: ZbdConfig,
        readonly: bool,
        exclusive: bool,
    ) -> ZbdResult<ZoneManager> {
        config.validate()?;
        if !readonly && !exclusive {
            return Err(ZbdError::invalid_argument("write opens must be exclusive"));
        }

        let caps = backend.open(readonly, exclusive)?;
        let nr_zones = backend.nr_zones();
        if nr_zones < MIN_ZONE_COUNT {
            return Err(ZbdError::not_supported(format!(
                "too few zones on zoned backend ({MIN_ZONE_COUNT} required, {nr_zones} found)"
            )));
        }

        // A cap of 0 means unlimited; otherwise hold back the budget the
        // metadata layer and the migration channel need.
        let max_active = match caps.max_active_zones {
            0 => nr_zones,
            n => n.checked_sub(RESERVED_ZONE_TOKENS).ok_or_else(|| {
                ZbdError::not_supported(format!("device active-zone cap {n} below the reserve"))
            })?,
        };
        let max_open = match caps.max_open_zones {
            0 => nr_zones,
            n => n.checked_sub(RESERVED_ZONE_TOKENS).ok_or_else(|| {
                ZbdError::not_supported(format!("device open-zone cap {n} below the reserve"))
            })?,
        };
        if !readonly && (config.levels() as u32 > max_open || config.levels() as u32 > max_active)
        {
            return Err(ZbdError::not_supported(format!(
                "{} lifetime buckets do not fit the device caps (open {max_open}, active {max_active})",
                config.levels()
            )));
        }

        info!(
            path = backend.path(),
            nr_zones,
            max_active_zones = caps.max_active_zones,
            max_open_zones = caps.max_open_zones,
            "opening zoned block device"
        );

        let descs = backend.list_zones()?;
        if descs.len() != nr_zones as usize {
            return Err(ZbdError::Io(io::Error::new(
                io::ErrorKind::Other,
                "failed to list zones",
            )));
        }

        let bytes_written = Arc::new(AtomicU64::new(0));
        let mut meta_zones = Vec::with_capacity(META_ZONE_COUNT);
        let mut io_zones = Vec::new();
        let mut discovered_active = 0u32;

        // Only sequential-write-required zones are used. Offline zones in
        // the meta range consume a slot (the spare exists for exactly that)
        // but are not registered.
        let mut i = 0usize;
        let mut m = 0usize;
        while m < META_ZONE_COUNT && i < descs.len() {
            let desc = &descs[i];
            if desc.is_swr {
                if !desc.is_offline {
                    meta_zones.push(Arc::new(Zone::new(
                        m as u32,
                        desc,
                        Arc::clone(&backend),
                        Arc::clone(&bytes_written),
                    )));
                }
                m += 1;
            }
            i += 1;
        }

        for desc in &descs[i..] {
            if !desc.is_swr || desc.is_offline {
                continue;
            }
            let idx = io_zones.len() as u32;
            let zone = Arc::new(Zone::new(
                idx,
                desc,
                Arc::clone(&backend),
                Arc::clone(&bytes_written),
            ));
            let lease = zone.try_acquire().ok_or_else(|| {
                ZbdError::corruption(format!(
                    "failed to set busy flag of zone {}",
                    zone.number()
                ))
            })?;
            if desc.is_active {
                discovered_active += 1;
                if desc.is_open && !readonly {
                    lease.close()?;
                }
            }
            drop(lease);
            io_zones.push(zone);
        }

        let buckets = config.bucket_count();
        let gc_bytes = (0..buckets).map(|_| AtomicU64::new(0)).collect();
        let manager = ZoneManager {
            backend,
            pool: ZonePool::new(buckets, max_open, max_active, discovered_active),
            config,
            meta_zones,
            io_zones,
            deferred: Mutex::new(None),
            migrate: Mutex::new(MigrateSlots::default()),
            bytes_written,
            gc_bytes,
            readonly,
            start_time: Instant::now(),
        };

        if !readonly {
            manager.seed_level_zones()?;
        }

        info!(
            meta_zones = manager.meta_zones.len(),
            io_zones = manager.io_zones.len(),
            max_open,
            max_active,
            "zoned block device ready"
        );
        Ok(manager)
    }

    /// Whether the device was opened read-only.
    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// Returns an unused meta zone with exclusive ownership, resetting it
    /// first if it holds stale data.
    ///
    /// Fails with `NoSpace` when every meta zone still holds live data;
    /// the upper layer is expected to go read-only.
    pub fn allocate_meta_zone(&self) -> ZbdResult<ZoneLease> {
        for zone in &self.meta_zones {
            if let Some(lease) = zone.try_acquire() {
                if zone.is_used() {
                    continue;
                }
                if !zone.is_empty() {
                    if let Err(e) = lease.reset() {
                        warn!(zone = zone.number(), error = %e, "failed to reset meta zone");
                        continue;
                    }
                }
                return Ok(lease);
            }
        }
        warn!("out of metadata zones, upper layer should go read-only now");
        Err(ZbdError::no_space("out of metadata zones"))
    }

    /// Fails with the latched deferred error, if any.
    pub fn deferred_status(&self) -> ZbdResult<()> {
        match &*self.deferred.lock().unwrap() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Latches an error discovered by a background operation. The first
    /// error wins; subsequent allocations fail with it until teardown.
    pub fn set_deferred_status(&self, err: ZbdError) {
        let mut slot = self.deferred.lock().unwrap();
        if slot.is_none() {
            warn!(error = %err, "deferred I/O error latched, going read-only");
            *slot = Some(err);
        }
    }

    /// Locates the I/O zone containing `offset`.
    pub fn io_zone_at(&self, offset: u64) -> Option<Arc<Zone>> {
        let zone_size = self.backend.zone_size();
        self.io_zones
            .iter()
            .find(|z| z.start() <= offset && offset < z.start() + zone_size)
            .map(Arc::clone)
    }

    /// Reads into `buf` at `offset`, retrying short and interrupted reads.
    /// Returns the number of bytes read.
    pub fn read(&self, buf: &mut [u8], offset: u64, direct: bool) -> ZbdResult<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            match self
                .backend
                .read(&mut buf[done..], offset + done as u64, direct)
            {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    /// Drops OS-cached data for the given range, for O_DIRECT consumers.
    pub fn invalidate_cache(&self, offset: u64, len: u64) -> ZbdResult<()> {
        self.backend
            .invalidate_cache(offset, len)
            .map_err(ZbdError::from)
    }

    /// Total writable bytes left across all I/O zones.
    pub fn free_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.capacity()).sum()
    }

    /// Total live bytes across all I/O zones.
    pub fn used_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.used_capacity()).sum()
    }

    /// Dead bytes in full zones, reclaimable by migrating the remaining
    /// live data and resetting.
    pub fn reclaimable_space(&self) -> u64 {
        self.io_zones
            .iter()
            .filter(|z| z.is_full())
            .map(|z| z.max_capacity() - z.used_capacity())
            .sum()
    }

    /// Total bytes appended through this manager.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Snapshot of every I/O zone. No lock is held while copying; each
    /// zone is internally consistent, the set as a whole is best-effort.
    pub fn zone_snapshot(&self) -> Vec<ZoneSnapshot> {
        self.io_zones.iter().map(|z| z.snapshot()).collect()
    }

    /// Zones counted against the open cap.
    pub fn open_io_zone_count(&self) -> u32 {
        self.pool.open_count()
    }

    /// Zones counted against the active cap.
    pub fn active_io_zone_count(&self) -> u32 {
        self.pool.active_count()
    }

    /// Number of I/O zones in the registry.
    pub fn io_zone_count(&self) -> usize {
        self.io_zones.len()
    }

    /// Number of registered meta zones.
    pub fn meta_zone_count(&self) -> usize {
        self.meta_zones.len()
    }

    /// Idle zones in the bucket for `class`, if the class is in range.
    pub fn bucket_idle_count(&self, class: WriteLifetime) -> Option<u32> {
        let level = self.config.bucket_of(class)?;
        Some(self.pool.lock().available[level])
    }

    /// Zones bound to the bucket for `class`, if the class is in range.
    pub fn bucket_len(&self, class: WriteLifetime) -> Option<usize> {
        let level = self.config.bucket_of(class)?;
        Some(self.pool.lock().buckets[level].len())
    }

    /// Refunds an open token taken outside the allocator paths.
    pub fn put_open_io_zone_token(&self) {
        self.pool.put_open_token();
    }

    /// Refunds an active token taken outside the allocator paths.
    pub fn put_active_io_zone_token(&self) {
        self.pool.put_active_token();
    }

    /// Aggregate counters over the registry.
    pub fn zone_stats(&self) -> ZoneStats {
        let mut stats = ZoneStats {
            open_io_zones: self.pool.open_count(),
            active_io_zones: self.pool.active_count(),
            ..Default::default()
        };
        for z in &self.io_zones {
            let used = z.used_capacity();
            stats.used_capacity += used;
            if used > 0 {
                stats.reclaimable_capacity += z.max_capacity() - used;
            }
            if !(z.is_full() || z.is_empty()) {
                stats.partial_zones += 1;
            }
        }
        stats
    }

    /// Logs the aggregate zone counters.
    pub fn log_zone_stats(&self) {
        let stats = self.zone_stats();
        info!(
            uptime_secs = self.start_time.elapsed().as_secs(),
            used_mb = stats.used_capacity >> 20,
            reclaimable_mb = stats.reclaimable_capacity >> 20,
            partial_zones = stats.partial_zones,
            open_io_zones = stats.open_io_zones,
            active_io_zones = stats.active_io_zones,
            "zone stats"
        );
    }

    /// Logs per-zone live-byte counts for zones that hold data.
    pub fn log_zone_usage(&self) {
        for z in &self.io_zones {
            let used = z.used_capacity();
            if used > 0 {
                debug!(
                    zone = z.number(),
                    used_bytes = used,
                    used_mb = used >> 20,
                    "zone usage"
                );
            }
        }
    }

    /// Histogram of per-zone garbage ratios.
    ///
    /// Bin 0 counts empty zones; bins 1..=11 count zones with up to 10%,
    /// 20%, … garbage, with fully-invalidated full zones in the top bin.
    /// Busy zones are skipped; the result is advisory.
    pub fn garbage_histogram(&self) -> [u32; 12] {
        let mut bins = [0u32; 12];
        for z in &self.io_zones {
            let Some(lease) = z.try_acquire() else {
                continue;
            };
            if z.is_empty() {
                bins[0] += 1;
                drop(lease);
                continue;
            }
            let max = z.max_capacity();
            if max == 0 {
                continue;
            }
            let dead = if z.is_full() {
                max - z.used_capacity()
            } else {
                (z.wp() - z.start()).saturating_sub(z.used_capacity())
            };
            let rate = dead as f64 / max as f64;
            let idx = ((rate + 0.1) * 10.0) as usize;
            bins[idx.min(11)] += 1;
            drop(lease);
        }
        bins
    }

    /// Records bytes moved by the GC worker for `class` data.
    pub fn record_gc_bytes(&self, class: WriteLifetime, bytes: u64) {
        if let Some(level) = self.config.bucket_of(class) {
            self.gc_bytes[level].fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// Bytes moved by the GC worker, per lifetime bucket.
    pub fn gc_data_movement(&self) -> Vec<u64> {
        self.gc_bytes
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    /// Logs final statistics. Must not be called while an allocator is
    /// blocked.
    pub fn close(&self) {
        let moved = self.gc_data_movement();
        let total: u64 = moved.iter().sum();
        for (level, bytes) in moved.iter().enumerate() {
            if *bytes > 0 {
                info!(
                    class = self.config.lifetime_begin as usize + level,
                    moved_mb = bytes >> 20,
                    "gc data movement"
                );
            }
        }
        info!(
            total_moved_mb = total >> 20,
            bytes_written = self.bytes_written(),
            "zone manager closed"
        );
    }

    /// Device block size.
    pub fn block_size(&self) -> u32 {
        self.backend.block_size()
    }

    /// Device zone size.
    pub fn zone_size(&self) -> u64 {
        self.backend.zone_size()
    }

    /// Number of zones on the device.
    pub fn nr_zones(&self) -> u32 {
        self.backend.nr_zones()
    }

    /// Device path.
    pub fn path(&self) -> &str {
        self.backend.path()
    }
}
