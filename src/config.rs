//! Detector configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::MAX_STACK_DEPTH;

// Hard ceiling on the number of size classes a configuration may create;
// the bucket array is allocated up front and must stay small.
const MAX_SIZE_CLASSES: usize = 65_536;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("size granularity must be nonzero")]
    ZeroGranularity,
    #[error("max alloc size {max} is not a nonzero multiple of granularity {granularity}")]
    MaxSizeNotAligned { max: usize, granularity: usize },
    #[error("{classes} size classes exceed the supported limit")]
    TooManySizeClasses { classes: usize },
    #[error("ranking size must be at least 2, got {0}")]
    RankingSizeTooSmall(usize),
    #[error("suspicion thresholds must be nonzero")]
    ZeroThreshold,
    #[error("history depth must be nonzero")]
    ZeroHistoryDepth,
    #[error("cooldown must last at least one analysis period")]
    ZeroCooldown,
}

/// Tunables for a [`LeakDetector`](crate::LeakDetector).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Base address of the instrumented mapping; report frames are offsets
    /// from it.
    pub mapping_base_address: usize,
    /// Extent of the instrumented mapping in bytes.
    pub mapping_size: usize,
    /// Suspicion score a size class must accumulate before its call stacks
    /// are tracked.
    pub size_suspicion_threshold: u32,
    /// Suspicion score a call stack must accumulate before it is reported.
    pub call_stack_suspicion_threshold: u32,
    /// Width of one size class in bytes.
    pub size_granularity: usize,
    /// Allocations above this size collapse into a single overflow class.
    pub max_alloc_size: usize,
    /// Capacity of every ranked top-N snapshot.
    pub ranking_size: usize,
    /// Analysis periods of breakdown history kept for reports.
    pub history_depth: usize,
    /// Analysis periods a reported (size, stack) pair stays suppressed.
    pub cooldown_periods: u32,
    /// Deepest raw stack a host should record per allocation.
    pub max_stack_depth: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            mapping_base_address: 0,
            mapping_size: usize::MAX,
            size_suspicion_threshold: 4,
            call_stack_suspicion_threshold: 4,
            size_granularity: 16,
            max_alloc_size: 4096,
            ranking_size: 16,
            history_depth: 30,
            cooldown_periods: 30,
            max_stack_depth: MAX_STACK_DEPTH,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_granularity == 0 {
            return Err(ConfigError::ZeroGranularity);
        }
        if self.max_alloc_size == 0 || self.max_alloc_size % self.size_granularity != 0 {
            return Err(ConfigError::MaxSizeNotAligned {
                max: self.max_alloc_size,
                granularity: self.size_granularity,
            });
        }
        let classes = self.num_buckets();
        if classes > MAX_SIZE_CLASSES {
            return Err(ConfigError::TooManySizeClasses { classes });
        }
        if self.ranking_size < 2 {
            return Err(ConfigError::RankingSizeTooSmall(self.ranking_size));
        }
        if self.size_suspicion_threshold == 0 || self.call_stack_suspicion_threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        if self.history_depth == 0 {
            return Err(ConfigError::ZeroHistoryDepth);
        }
        if self.cooldown_periods == 0 {
            return Err(ConfigError::ZeroCooldown);
        }
        Ok(())
    }

    // Size-class buckets covering 0..=max_alloc_size, plus the overflow
    // class.
    pub(crate) fn num_buckets(&self) -> usize {
        self.max_alloc_size / self.size_granularity + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(DetectorConfig::default().validate(), Ok(()));
    }

    #[test]
    fn invalid_tunables_are_rejected() {
        let mut config = DetectorConfig {
            size_granularity: 0,
            ..DetectorConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroGranularity));

        config.size_granularity = 16;
        config.max_alloc_size = 40;
        assert_eq!(
            config.validate(),
            Err(ConfigError::MaxSizeNotAligned {
                max: 40,
                granularity: 16
            })
        );

        config.max_alloc_size = 16 * 1024 * 1024;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooManySizeClasses { .. })
        ));

        config.max_alloc_size = 4096;
        config.ranking_size = 1;
        assert_eq!(config.validate(), Err(ConfigError::RankingSizeTooSmall(1)));

        config.ranking_size = 16;
        config.call_stack_suspicion_threshold = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroThreshold));

        config.call_stack_suspicion_threshold = 4;
        config.cooldown_periods = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroCooldown));
    }
}
