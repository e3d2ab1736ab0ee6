//! Configuration management for the accumulator.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::{CachedClock, Clock, SystemClock};
use crate::error::{AccumulatorError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccumulatorConfig {
    /// Limiter sizing and eviction
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Time source
    #[serde(default)]
    pub clock: ClockConfig,
}

/// Limiter sizing and eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Number of shards (non-zero power of two)
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Maximum entries per shard; unbounded when unset
    #[serde(default)]
    pub max_entries_per_shard: Option<usize>,

    /// Stale entry sweep interval in milliseconds; zero disables sweeping
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            max_entries_per_shard: None,
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl LimiterConfig {
    /// The sweep interval, or `None` when sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }
}

fn default_shard_count() -> usize {
    crate::ratelimit::DEFAULT_SHARD_COUNT
}

fn default_sweep_interval() -> u64 {
    60_000
}

/// Which clock implementation backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    /// Read the system clock on every check
    System,
    /// Background-refreshed coarse clock
    #[default]
    Cached,
}

/// Clock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    #[serde(default)]
    pub source: ClockSource,

    /// Cached clock upkeep interval in milliseconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            source: ClockSource::default(),
            refresh_interval_ms: default_refresh_interval(),
        }
    }
}

fn default_refresh_interval() -> u64 {
    20
}

impl ClockConfig {
    /// Build the configured clock.
    pub fn build(&self) -> Result<Arc<dyn Clock>> {
        if self.source == ClockSource::Cached && self.refresh_interval_ms == 0 {
            return Err(AccumulatorError::Config(
                "refresh_interval_ms must be greater than zero".to_string(),
            ));
        }
        let clock: Arc<dyn Clock> = match self.source {
            ClockSource::System => Arc::new(SystemClock),
            ClockSource::Cached => Arc::new(CachedClock::with_refresh(Duration::from_millis(
                self.refresh_interval_ms,
            ))),
        };
        Ok(clock)
    }
}

impl AccumulatorConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading accumulator configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AccumulatorConfig = serde_yaml::from_str(yaml)
            .map_err(|e| AccumulatorError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        let shards = self.limiter.shard_count;
        if shards == 0 || !shards.is_power_of_two() {
            return Err(AccumulatorError::InvalidShardCount(shards));
        }
        if self.limiter.max_entries_per_shard == Some(0) {
            return Err(AccumulatorError::Config(
                "max_entries_per_shard must be greater than zero".to_string(),
            ));
        }
        if self.clock.source == ClockSource::Cached && self.clock.refresh_interval_ms == 0 {
            return Err(AccumulatorError::Config(
                "refresh_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
