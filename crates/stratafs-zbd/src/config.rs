//! Configuration for the zone manager.

use serde::{Deserialize, Serialize};

use crate::error::{ZbdError, ZbdResult};
use crate::lifetime::WriteLifetime;

/// Number of zones reserved for the metadata layer.
///
/// Two non-offline meta zones are needed to roll the metadata log safely;
/// one extra covers a zone going offline.
pub const META_ZONE_COUNT: usize = 3;

/// Minimum number of zones on a device that makes sense to manage.
pub const MIN_ZONE_COUNT: u32 = 32;

/// Open/active budget held back from the device caps for the metadata
/// layer and the migration channel.
pub const RESERVED_ZONE_TOKENS: u32 = 2;

/// Configuration for a [`ZoneManager`](crate::manager::ZoneManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZbdConfig {
    /// Finish zones whose remaining capacity is below this percentage of
    /// their maximum capacity. 0 disables the pass. Default: 0.
    pub finish_threshold: u32,
    /// Lowest write-lifetime class served by the lifetime buckets.
    /// Default: 3.
    pub lifetime_begin: u8,
    /// Number of consecutive lifetime classes (and buckets). Default: 6.
    pub lifetime_levels: u8,
    /// File id the upper layer assigns to the write-ahead log. Low-hint
    /// writes from this file are pinned to the lowest lifetime class.
    /// Default: 5.
    pub wal_file_id: u64,
}

impl Default for ZbdConfig {
    fn default() -> Self {
        Self {
            finish_threshold: 0,
            lifetime_begin: 3,
            lifetime_levels: 6,
            wal_file_id: 5,
        }
    }
}

impl ZbdConfig {
    /// Validates field ranges.
    pub fn validate(&self) -> ZbdResult<()> {
        if self.finish_threshold > 100 {
            return Err(ZbdError::invalid_argument(format!(
                "finish_threshold {} exceeds 100",
                self.finish_threshold
            )));
        }
        if self.lifetime_levels == 0 {
            return Err(ZbdError::invalid_argument(
                "lifetime_levels must be at least 1",
            ));
        }
        if self.lifetime_begin.checked_add(self.lifetime_levels).is_none() {
            return Err(ZbdError::invalid_argument(
                "lifetime class range overflows",
            ));
        }
        Ok(())
    }

    /// Number of lifetime buckets.
    pub fn levels(&self) -> usize {
        self.lifetime_levels as usize
    }

    /// The lowest lifetime class.
    pub fn begin_class(&self) -> WriteLifetime {
        WriteLifetime::new(self.lifetime_begin)
    }

    /// The highest configured lifetime class.
    pub fn top_class(&self) -> WriteLifetime {
        WriteLifetime::new(self.lifetime_begin + self.lifetime_levels - 1)
    }

    /// The highest class the bucket space spans: the configured range,
    /// extended through [`WriteLifetime::TOP`] so the low-hint rewrite
    /// always lands in a bucket.
    pub fn highest_class(&self) -> WriteLifetime {
        self.top_class().max(WriteLifetime::TOP)
    }

    /// Number of lifetime buckets the manager holds. Only the configured
    /// [`ZbdConfig::levels`] buckets are pre-seeded; any buckets beyond
    /// them are populated on first use.
    pub fn bucket_count(&self) -> usize {
        (self.highest_class().as_u8() - self.lifetime_begin + 1) as usize
    }

    /// The class migration destinations are pinned to.
    pub fn gc_class(&self) -> WriteLifetime {
        WriteLifetime::new(self.lifetime_begin.saturating_add(2))
    }

    /// Maps a lifetime class to its bucket index, if the class is within
    /// the bucket space.
    pub fn bucket_of(&self, class: WriteLifetime) -> Option<usize> {
        let c = class.as_u8();
        if c >= self.lifetime_begin && c <= self.highest_class().as_u8() {
            Some((c - self.lifetime_begin) as usize)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_class_range() {
        let config = ZbdConfig::default();
        assert_eq!(config.begin_class(), WriteLifetime::new(3));
        assert_eq!(config.top_class(), WriteLifetime::new(8));
        assert_eq!(config.levels(), 6);
        config.validate().unwrap();
    }

    #[test]
    fn test_bucket_mapping() {
        let config = ZbdConfig::default();
        assert_eq!(config.bucket_of(WriteLifetime::new(3)), Some(0));
        assert_eq!(config.bucket_of(WriteLifetime::new(8)), Some(5));
        assert_eq!(config.bucket_of(WriteLifetime::new(2)), None);
        assert_eq!(config.bucket_of(WriteLifetime::new(9)), None);
    }

    #[test]
    fn test_bucket_space_extends_to_scale_top() {
        let config = ZbdConfig {
            lifetime_levels: 5,
            ..Default::default()
        };
        assert_eq!(config.top_class(), WriteLifetime::new(7));
        assert_eq!(config.highest_class(), WriteLifetime::TOP);
        assert_eq!(config.bucket_count(), 6);
        assert_eq!(config.bucket_of(WriteLifetime::new(8)), Some(5));
        assert_eq!(config.bucket_of(WriteLifetime::new(9)), None);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let config = ZbdConfig {
            finish_threshold: 101,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_levels() {
        let config = ZbdConfig {
            lifetime_levels: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
