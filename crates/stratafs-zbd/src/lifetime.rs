//! Write-lifetime classes and I/O stream kinds.
//!
//! The upper file layer tags each write stream with a lifetime hint, an
//! integer approximating how long the data will stay live before it is
//! invalidated. The allocator steers streams of the same class into the
//! same zone so resets reclaim whole zones.

use serde::{Deserialize, Serialize};

use crate::config::ZbdConfig;

/// A write-lifetime class.
///
/// The low values mirror the conventional hint scale (`NOT_SET` through
/// `EXTREME`); classes above `EXTREME` are used by log-structured upper
/// layers that map their own level numbers directly onto classes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct WriteLifetime(u8);

impl WriteLifetime {
    /// No lifetime assigned. Zones carry this class when unbound.
    pub const NOT_SET: WriteLifetime = WriteLifetime(0);
    /// The caller declined to provide a hint.
    pub const NONE: WriteLifetime = WriteLifetime(1);
    /// Shortest-lived data.
    pub const SHORT: WriteLifetime = WriteLifetime(2);
    /// Medium-lived data (e.g. first-level flushes).
    pub const MEDIUM: WriteLifetime = WriteLifetime(3);
    /// Long-lived data.
    pub const LONG: WriteLifetime = WriteLifetime(4);
    /// Longest-lived data on the conventional hint scale.
    pub const EXTREME: WriteLifetime = WriteLifetime(5);
    /// Top of the class scale. Log-structured upper layers map their
    /// deepest level here, and low-hint data with no other placement
    /// signal is steered to it.
    pub const TOP: WriteLifetime = WriteLifetime(8);

    /// Creates a lifetime class from its numeric value.
    pub const fn new(class: u8) -> Self {
        WriteLifetime(class)
    }

    /// Returns the numeric class value.
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Whether a concrete class has been assigned.
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for WriteLifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            WriteLifetime::NOT_SET => write!(f, "not-set"),
            WriteLifetime::NONE => write!(f, "none"),
            other => write!(f, "{}", other.0),
        }
    }
}

/// Kind of I/O stream requesting a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoType {
    /// Write-ahead log appends. Allocated with priority and without
    /// triggering zone maintenance.
    Wal,
    /// Memtable flush output.
    Flush,
    /// Compaction output.
    Compaction,
    /// Anything else.
    Other,
}

/// Derives the lifetime class a file's writes are steered to.
///
/// Hints below `SHORT` carry no placement information and are rewritten:
/// the WAL file is pinned to the lowest class so log data is never
/// co-located with anything else, and every other low-hint file goes to
/// [`WriteLifetime::TOP`], the fixed top of the scale, independent of how
/// many classes are configured. Usable hints are taken as classes
/// directly, clamped into the bucket space.
pub(crate) fn target_class(config: &ZbdConfig, hint: WriteLifetime, file_id: u64) -> WriteLifetime {
    if hint < WriteLifetime::SHORT {
        if file_id == config.wal_file_id {
            config.begin_class()
        } else {
            WriteLifetime::TOP.max(config.begin_class())
        }
    } else {
        hint.max(config.begin_class()).min(config.highest_class())
    }
}
