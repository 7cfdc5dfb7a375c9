//! Open/active token accounting and lifetime-bucket state.
//!
//! One mutex guards the token counters, the per-bucket idle counters and
//! bucket membership; one condition variable serves every wait in the
//! crate. Any state change that could unblock a waiter broadcasts, at the
//! cost of spurious wakeups.

use std::sync::{Condvar, Mutex, MutexGuard};

use tracing::debug;

/// State guarded by the pool mutex.
pub(crate) struct PoolInner {
    /// Zones currently counted against the device's open cap.
    pub open_io_zones: u32,
    /// Zones currently counted against the device's active cap.
    pub active_io_zones: u32,
    /// Idle (not leased to a writer) zones per lifetime bucket.
    pub available: Vec<u32>,
    /// Registry indices of the zones bound to each lifetime bucket.
    pub buckets: Vec<Vec<u32>>,
}

/// Token counters, lifetime buckets, and the crate-wide condition variable.
pub(crate) struct ZonePool {
    pub max_open: u32,
    pub max_active: u32,
    inner: Mutex<PoolInner>,
    resources: Condvar,
}

impl ZonePool {
    pub(crate) fn new(buckets: usize, max_open: u32, max_active: u32, discovered_active: u32) -> Self {
        Self {
            max_open,
            max_active,
            inner: Mutex::new(PoolInner {
                open_io_zones: 0,
                active_io_zones: discovered_active,
                available: vec![0; buckets],
                buckets: vec![Vec::new(); buckets],
            }),
            resources: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap()
    }

    pub(crate) fn wait_on<'a>(&self, guard: MutexGuard<'a, PoolInner>) -> MutexGuard<'a, PoolInner> {
        self.resources.wait(guard).unwrap()
    }

    pub(crate) fn notify_all(&self) {
        self.resources.notify_all();
    }

    /// Open-token limit seen by an allocator.
    ///
    /// Non-prioritized callers leave one token in reserve so they cannot
    /// starve the prioritized (write-ahead log) path.
    pub(crate) fn open_limit(&self, prioritized: bool) -> u32 {
        if prioritized {
            self.max_open
        } else {
            self.max_open.saturating_sub(1)
        }
    }

    /// Blocks until an open token is available, then takes it.
    pub(crate) fn wait_for_open_token(&self, prioritized: bool) {
        let limit = self.open_limit(prioritized);
        let mut inner = self.lock();
        while inner.open_io_zones >= limit {
            inner = self.wait_on(inner);
        }
        inner.open_io_zones += 1;
    }

    /// Takes an active token if one is available.
    pub(crate) fn try_take_active_token(&self) -> bool {
        let mut inner = self.lock();
        if inner.active_io_zones < self.max_active {
            inner.active_io_zones += 1;
            true
        } else {
            false
        }
    }

    /// Blocks until an active token is available, then takes it.
    pub(crate) fn wait_for_active_token(&self) {
        let mut inner = self.lock();
        while inner.active_io_zones >= self.max_active {
            inner = self.wait_on(inner);
        }
        inner.active_io_zones += 1;
    }

    /// Returns an open token and wakes waiters.
    pub(crate) fn put_open_token(&self) {
        {
            let mut inner = self.lock();
            debug_assert!(inner.open_io_zones > 0, "open token refund underflow");
            inner.open_io_zones = inner.open_io_zones.saturating_sub(1);
        }
        self.notify_all();
    }

    /// Returns an active token and wakes waiters.
    pub(crate) fn put_active_token(&self) {
        {
            let mut inner = self.lock();
            debug_assert!(inner.active_io_zones > 0, "active token refund underflow");
            inner.active_io_zones = inner.active_io_zones.saturating_sub(1);
        }
        self.notify_all();
        debug!("returned active zone token");
    }

    pub(crate) fn open_count(&self) -> u32 {
        self.lock().open_io_zones
    }

    pub(crate) fn active_count(&self) -> u32 {
        self.lock().active_io_zones
    }
}
