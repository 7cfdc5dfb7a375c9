//! Backend adapter for zoned block devices.
//!
//! The manager drives the device through the [`ZoneBackend`] trait: zone
//! enumeration, sequential writes at the write pointer, reads, and the zone
//! state commands (finish, reset, close). Implementations exist for raw
//! zoned block devices and zonefs-style mounts; [`MockZonedDevice`] is an
//! in-memory implementation used by tests.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ZbdError, ZbdResult};

/// Simultaneous-zone caps reported by the device at open.
///
/// A cap of 0 means the device does not limit that resource; the manager
/// treats it as the zone count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeviceCaps {
    /// Maximum number of active (written but not full or reset) zones.
    pub max_active_zones: u32,
    /// Maximum number of open (accepting writes) zones.
    pub max_open_zones: u32,
}

/// One zone as reported by the device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ZoneDescriptor {
    /// Byte offset of the zone's first block.
    pub start: u64,
    /// Current write pointer.
    pub wp: u64,
    /// Writable bytes in the zone (may be less than the zone size).
    pub max_capacity: u64,
    /// Whether the zone is sequential-write-required.
    pub is_swr: bool,
    /// Whether the zone is offline.
    pub is_offline: bool,
    /// Whether the zone is active (written, not yet full or reset).
    pub is_active: bool,
    /// Whether the zone is open (accepting writes).
    pub is_open: bool,
}

/// Result of a zone reset.
#[derive(Debug, Clone, Copy)]
pub struct ResetOutcome {
    /// The zone went offline during the reset and is unusable.
    pub offline: bool,
    /// The zone's writable capacity after the reset.
    pub max_capacity: u64,
}

/// Device-facing surface consumed by the zone manager.
///
/// `write` and `read` follow the syscall contract: they may transfer fewer
/// bytes than requested and report failures as `io::Error`. All other
/// operations either fully succeed or fail.
pub trait ZoneBackend: Send + Sync {
    /// Opens the device and returns its simultaneous-zone caps.
    fn open(&self, readonly: bool, exclusive: bool) -> ZbdResult<DeviceCaps>;

    /// Enumerates all zones on the device.
    fn list_zones(&self) -> ZbdResult<Vec<ZoneDescriptor>>;

    /// Writes sequentially at `offset`, which must equal the containing
    /// zone's write pointer. Short writes are allowed.
    fn write(&self, data: &[u8], offset: u64) -> io::Result<usize>;

    /// Reads from `offset`. Short reads are allowed; `direct` requests an
    /// uncached read.
    fn read(&self, buf: &mut [u8], offset: u64, direct: bool) -> io::Result<usize>;

    /// Transitions the zone starting at `start` to full.
    fn finish(&self, start: u64) -> ZbdResult<()>;

    /// Resets the zone starting at `start`, making it empty again.
    fn reset(&self, start: u64) -> ZbdResult<ResetOutcome>;

    /// Transitions an open zone to closed without finishing it.
    fn close(&self, start: u64) -> ZbdResult<()>;

    /// Drops any OS-cached data for the given range.
    fn invalidate_cache(&self, offset: u64, len: u64) -> io::Result<()>;

    /// Device block size; writes must be multiples of this.
    fn block_size(&self) -> u32;

    /// Distance between zone start offsets.
    fn zone_size(&self) -> u64;

    /// Number of zones on the device.
    fn nr_zones(&self) -> u32;

    /// Device path, for logging.
    fn path(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockZoneCond {
    Empty,
    Open,
    Closed,
    Full,
    Offline,
}

#[derive(Debug)]
struct MockZoneState {
    start: u64,
    wp: u64,
    max_capacity: u64,
    cond: MockZoneCond,
    swr: bool,
    offline_on_reset: bool,
}

/// In-memory zoned device for tests.
///
/// Emulates the per-zone write-pointer state machine, rejects
/// non-sequential writes, and offers fault injection: capped transfer
/// sizes (short reads/writes), one-shot `EINTR` on read, and write
/// failures.
pub struct MockZonedDevice {
    nr_zones: u32,
    zone_size: u64,
    block_size: u32,
    caps: DeviceCaps,
    zones: Mutex<Vec<MockZoneState>>,
    data: Mutex<Vec<u8>>,
    max_io_chunk: AtomicU64,
    fail_writes: AtomicBool,
    interrupt_next_read: AtomicBool,
    path: String,
}

impl MockZonedDevice {
    /// Creates a device with `nr_zones` sequential-write-required zones of
    /// `zone_size` bytes, all empty, with capacity equal to the zone size.
    pub fn new(nr_zones: u32, zone_size: u64, block_size: u32) -> Self {
        let zones = (0..nr_zones)
            .map(|i| MockZoneState {
                start: i as u64 * zone_size,
                wp: i as u64 * zone_size,
                max_capacity: zone_size,
                cond: MockZoneCond::Empty,
                swr: true,
                offline_on_reset: false,
            })
            .collect();
        Self {
            nr_zones,
            zone_size,
            block_size,
            caps: DeviceCaps {
                max_active_zones: 0,
                max_open_zones: 0,
            },
            zones: Mutex::new(zones),
            data: Mutex::new(vec![0u8; (nr_zones as u64 * zone_size) as usize]),
            max_io_chunk: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
            interrupt_next_read: AtomicBool::new(false),
            path: "mock:zbd".to_string(),
        }
    }

    /// Sets the simultaneous-zone caps reported at open.
    pub fn with_caps(self, max_active_zones: u32, max_open_zones: u32) -> Self {
        Self {
            caps: DeviceCaps {
                max_active_zones,
                max_open_zones,
            },
            ..self
        }
    }

    /// Caps every read/write transfer at `chunk` bytes (0 = unlimited).
    pub fn set_max_io_chunk(&self, chunk: u64) {
        self.max_io_chunk.store(chunk, Ordering::Relaxed);
    }

    /// Makes every subsequent write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Makes the next read fail with `Interrupted` once.
    pub fn interrupt_next_read(&self) {
        self.interrupt_next_read.store(true, Ordering::Relaxed);
    }

    /// Marks a zone conventional (not sequential-write-required).
    pub fn mark_conventional(&self, zone_idx: u32) {
        let mut zones = self.zones.lock().unwrap();
        zones[zone_idx as usize].swr = false;
    }

    /// Marks a zone offline.
    pub fn mark_offline(&self, zone_idx: u32) {
        let mut zones = self.zones.lock().unwrap();
        zones[zone_idx as usize].cond = MockZoneCond::Offline;
    }

    /// Makes the next reset of a zone report it offline.
    pub fn mark_offline_on_reset(&self, zone_idx: u32) {
        let mut zones = self.zones.lock().unwrap();
        zones[zone_idx as usize].offline_on_reset = true;
    }

    /// Test helper: appends `len` filler bytes at a zone's write pointer,
    /// leaving the zone in the open state the device would report after a
    /// host write.
    pub fn fill_zone(&self, zone_idx: u32, len: u64) {
        let offset = {
            let zones = self.zones.lock().unwrap();
            zones[zone_idx as usize].wp
        };
        let filler = vec![0xA5u8; len as usize];
        let mut written = 0;
        while written < filler.len() {
            let n = self
                .write(&filler[written..], offset + written as u64)
                .expect("fill_zone write");
            written += n;
        }
    }

    fn zone_index_of(&self, offset: u64) -> io::Result<usize> {
        let idx = offset / self.zone_size;
        if idx >= self.nr_zones as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("offset {offset} beyond device"),
            ));
        }
        Ok(idx as usize)
    }

    fn chunked(&self, len: usize) -> usize {
        let chunk = self.max_io_chunk.load(Ordering::Relaxed);
        if chunk == 0 {
            len
        } else {
            len.min(chunk as usize)
        }
    }
}

impl ZoneBackend for MockZonedDevice {
    fn open(&self, readonly: bool, exclusive: bool) -> ZbdResult<DeviceCaps> {
        debug!(readonly, exclusive, path = %self.path, "mock device opened");
        Ok(self.caps)
    }

    fn list_zones(&self) -> ZbdResult<Vec<ZoneDescriptor>> {
        let zones = self.zones.lock().unwrap();
        Ok(zones
            .iter()
            .map(|z| ZoneDescriptor {
                start: z.start,
                wp: z.wp,
                max_capacity: z.max_capacity,
                is_swr: z.swr,
                is_offline: z.cond == MockZoneCond::Offline,
                is_active: matches!(z.cond, MockZoneCond::Open | MockZoneCond::Closed),
                is_open: z.cond == MockZoneCond::Open,
            })
            .collect())
    }

    fn write(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        let idx = self.zone_index_of(offset)?;
        let mut zones = self.zones.lock().unwrap();
        let zone = &mut zones[idx];
        match zone.cond {
            MockZoneCond::Offline => {
                return Err(io::Error::new(io::ErrorKind::Other, "zone offline"))
            }
            MockZoneCond::Full => {
                return Err(io::Error::new(io::ErrorKind::Other, "zone full"))
            }
            _ => {}
        }
        if offset != zone.wp {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "non-sequential write at {offset}, write pointer is {}",
                    zone.wp
                ),
            ));
        }
        let writable = zone.start + zone.max_capacity - zone.wp;
        if writable == 0 || data.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "no writable bytes"));
        }
        let n = self.chunked(data.len()).min(writable as usize);
        {
            let mut buf = self.data.lock().unwrap();
            buf[offset as usize..offset as usize + n].copy_from_slice(&data[..n]);
        }
        zone.wp += n as u64;
        if zone.cond == MockZoneCond::Empty || zone.cond == MockZoneCond::Closed {
            zone.cond = MockZoneCond::Open;
        }
        if zone.wp == zone.start + zone.max_capacity {
            zone.cond = MockZoneCond::Full;
        }
        Ok(n)
    }

    fn read(&self, buf: &mut [u8], offset: u64, _direct: bool) -> io::Result<usize> {
        if self.interrupt_next_read.swap(false, Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "interrupted"));
        }
        let data = self.data.lock().unwrap();
        if offset as usize >= data.len() {
            return Ok(0);
        }
        let avail = data.len() - offset as usize;
        let n = self.chunked(buf.len()).min(avail);
        buf[..n].copy_from_slice(&data[offset as usize..offset as usize + n]);
        Ok(n)
    }

    fn finish(&self, start: u64) -> ZbdResult<()> {
        let idx = self.zone_index_of(start).map_err(ZbdError::from)?;
        let mut zones = self.zones.lock().unwrap();
        let zone = &mut zones[idx];
        if zone.cond == MockZoneCond::Offline {
            return Err(ZbdError::Io(io::Error::new(
                io::ErrorKind::Other,
                "zone offline",
            )));
        }
        zone.cond = MockZoneCond::Full;
        zone.wp = zone.start + self.zone_size;
        Ok(())
    }

    fn reset(&self, start: u64) -> ZbdResult<ResetOutcome> {
        let idx = self.zone_index_of(start).map_err(ZbdError::from)?;
        let mut zones = self.zones.lock().unwrap();
        let zone = &mut zones[idx];
        if zone.offline_on_reset {
            zone.offline_on_reset = false;
            zone.cond = MockZoneCond::Offline;
            return Ok(ResetOutcome {
                offline: true,
                max_capacity: 0,
            });
        }
        zone.cond = MockZoneCond::Empty;
        zone.wp = zone.start;
        Ok(ResetOutcome {
            offline: false,
            max_capacity: zone.max_capacity,
        })
    }

    fn close(&self, start: u64) -> ZbdResult<()> {
        let idx = self.zone_index_of(start).map_err(ZbdError::from)?;
        let mut zones = self.zones.lock().unwrap();
        let zone = &mut zones[idx];
        if zone.cond == MockZoneCond::Open {
            zone.cond = MockZoneCond::Closed;
        }
        Ok(())
    }

    fn invalidate_cache(&self, _offset: u64, _len: u64) -> io::Result<()> {
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn zone_size(&self) -> u64 {
        self.zone_size
    }

    fn nr_zones(&self) -> u32 {
        self.nr_zones
    }

    fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_device() -> MockZonedDevice {
        MockZonedDevice::new(4, 4096 * 16, 4096)
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dev = small_device();
        let data = vec![0x5Au8; 4096];
        let n = dev.write(&data, 0).unwrap();
        assert_eq!(n, 4096);

        let mut buf = vec![0u8; 4096];
        let n = dev.read(&mut buf, 0, false).unwrap();
        assert_eq!(n, 4096);
        assert_eq!(buf, data);
    }

    #[test]
    fn test_non_sequential_write_rejected() {
        let dev = small_device();
        let data = vec![0u8; 4096];
        let err = dev.write(&data, 4096).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_write_advances_wp_and_fills_zone() {
        let dev = small_device();
        let data = vec![1u8; 4096 * 16];
        let mut written = 0;
        while written < data.len() {
            written += dev.write(&data[written..], written as u64).unwrap();
        }
        let zones = dev.list_zones().unwrap();
        assert_eq!(zones[0].wp, 4096 * 16);
        assert!(!zones[0].is_active, "full zone is not active");
        let err = dev.write(&[0u8; 4096], 4096 * 16 - 4096).unwrap_err();
        assert!(err.to_string().contains("full") || err.kind() == io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_short_writes_when_chunked() {
        let dev = small_device();
        dev.set_max_io_chunk(1024);
        let data = vec![2u8; 4096];
        let n = dev.write(&data, 0).unwrap();
        assert_eq!(n, 1024);
    }

    #[test]
    fn test_finish_and_reset() {
        let dev = small_device();
        dev.write(&[3u8; 4096], 0).unwrap();
        dev.finish(0).unwrap();
        let zones = dev.list_zones().unwrap();
        assert_eq!(zones[0].wp, dev.zone_size());
        assert!(!zones[0].is_active);

        let outcome = dev.reset(0).unwrap();
        assert!(!outcome.offline);
        assert_eq!(outcome.max_capacity, dev.zone_size());
        let zones = dev.list_zones().unwrap();
        assert_eq!(zones[0].wp, 0);
    }

    #[test]
    fn test_reset_reports_offline() {
        let dev = small_device();
        dev.write(&[4u8; 4096], 0).unwrap();
        dev.mark_offline_on_reset(0);
        let outcome = dev.reset(0).unwrap();
        assert!(outcome.offline);
        assert_eq!(outcome.max_capacity, 0);
    }

    #[test]
    fn test_close_transitions_open_to_closed() {
        let dev = small_device();
        dev.write(&[5u8; 4096], 0).unwrap();
        let zones = dev.list_zones().unwrap();
        assert!(zones[0].is_open);

        dev.close(0).unwrap();
        let zones = dev.list_zones().unwrap();
        assert!(!zones[0].is_open);
        assert!(zones[0].is_active, "closed zone is still active");
    }

    #[test]
    fn test_interrupted_read_fires_once() {
        let dev = small_device();
        dev.write(&[6u8; 4096], 0).unwrap();
        dev.interrupt_next_read();

        let mut buf = vec![0u8; 4096];
        let err = dev.read(&mut buf, 0, false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        let n = dev.read(&mut buf, 0, false).unwrap();
        assert_eq!(n, 4096);
    }
}
