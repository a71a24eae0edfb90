//! Configuration
//!
//! Plain structs with sensible defaults. Every struct that has constraints
//! between its fields exposes `validate()`, which constructors call before
//! touching any off-heap memory.

use crate::error::{Error, Result};
use std::time::Duration;

/// Sizing and limits of a [`crate::storage::SegmentedSet`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Segments created eagerly at startup.
    pub min_segments: usize,

    /// Size of the segment slot array. Keys are routed by probing it.
    pub max_segments: usize,

    /// Initial (and minimum) slot capacity of each segment. Power of two.
    pub segment_capacity: usize,

    /// Nominal item capacity used to derive the rehash thresholds.
    pub nominal_capacity: usize,

    /// Reject puts once this many header+payload bytes are stored.
    pub max_bytes: Option<usize>,

    /// Reject puts of new keys once this many entries are stored.
    pub max_items: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            min_segments: 16,
            max_segments: 256,
            segment_capacity: 16,
            nominal_capacity: 65_536,
            max_bytes: None,
            max_items: None,
        }
    }
}

impl StoreConfig {
    /// Upper item count that marks a grow-rehash as due.
    pub fn upper_threshold(&self) -> usize {
        self.nominal_capacity / 4 * 3
    }

    /// Lower item count that marks a shrink-rehash as due.
    pub fn lower_threshold(&self) -> usize {
        self.nominal_capacity * 15 / 100
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_segments == 0 {
            return Err(Error::InvalidConfig("min_segments must be > 0".into()));
        }
        if self.min_segments > self.max_segments {
            return Err(Error::InvalidConfig(format!(
                "min_segments {} exceeds max_segments {}",
                self.min_segments, self.max_segments
            )));
        }
        if self.segment_capacity < 2 || !self.segment_capacity.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "segment_capacity {} must be a power of two >= 2",
                self.segment_capacity
            )));
        }
        if self.nominal_capacity == 0 {
            return Err(Error::InvalidConfig("nominal_capacity must be > 0".into()));
        }
        if self.max_items == Some(0) || self.max_bytes == Some(0) {
            return Err(Error::InvalidConfig("limits must be > 0 when set".into()));
        }
        Ok(())
    }
}

/// Configuration for the background expiry sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Base interval between sweeps (default: 100ms)
    pub base_interval: Duration,

    /// Minimum interval between sweeps (default: 10ms)
    pub min_interval: Duration,

    /// Maximum interval between sweeps (default: 1s)
    pub max_interval: Duration,

    /// If this fraction of entries expired in one sweep, speed up
    pub speedup_threshold: f64,

    /// If this fraction of entries expired in one sweep, slow down
    pub slowdown_threshold: f64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            speedup_threshold: 0.25,
            slowdown_threshold: 0.01,
        }
    }
}

impl SweeperConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_interval.is_zero() || self.min_interval > self.max_interval {
            return Err(Error::InvalidConfig(
                "sweeper intervals must satisfy 0 < min <= max".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.speedup_threshold)
            || !(0.0..=1.0).contains(&self.slowdown_threshold)
        {
            return Err(Error::InvalidConfig(
                "sweeper thresholds must be fractions".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the queued expiry notification executor.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Events buffered before new ones are dropped.
    pub queue_depth: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self { queue_depth: 1024 }
    }
}

impl NotifierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(Error::InvalidConfig("queue_depth must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(StoreConfig::default().validate().is_ok());
        assert!(SweeperConfig::default().validate().is_ok());
        assert!(NotifierConfig::default().validate().is_ok());
    }

    #[test]
    fn test_thresholds() {
        let config = StoreConfig {
            nominal_capacity: 1000,
            ..Default::default()
        };
        assert_eq!(config.upper_threshold(), 750);
        assert_eq!(config.lower_threshold(), 150);
    }

    #[test]
    fn test_invalid_store_configs() {
        let bad = [
            StoreConfig {
                min_segments: 0,
                ..Default::default()
            },
            StoreConfig {
                min_segments: 10,
                max_segments: 4,
                ..Default::default()
            },
            StoreConfig {
                segment_capacity: 12,
                ..Default::default()
            },
            StoreConfig {
                segment_capacity: 1,
                ..Default::default()
            },
            StoreConfig {
                max_items: Some(0),
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_invalid_sweeper_config() {
        let config = SweeperConfig {
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
