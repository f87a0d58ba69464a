//! Configuration system for pipeline tuning
//!
//! This module provides a hierarchical configuration system that allows users
//! to configure caching, networking, retry behavior, worker threads and tile
//! retention through presets or custom configurations. Every section can be
//! (de)serialized with serde; missing fields fall back to the balanced
//! defaults.

use crate::core::constants::{
    DEFAULT_CACHE_BYTES, DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_RETAINED_TILES, USER_AGENT,
};
use crate::{MapError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineProfile {
    Balanced,
    LowResource,
    HighPerformance,
    Custom(PipelineConfig),
}

impl PipelineProfile {
    pub fn resolve(&self) -> PipelineConfig {
        match self {
            Self::Balanced => PipelineConfig {
                cache: CacheConfig {
                    max_bytes: DEFAULT_CACHE_BYTES,
                    disk_path: None,
                    disk_max_bytes: 4 * DEFAULT_CACHE_BYTES,
                },
                network: NetworkConfig {
                    max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
                    request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
                    io_threads: 2,
                    user_agent: USER_AGENT.to_string(),
                    asset_root: None,
                },
                retry: RetryConfig {
                    base_delay_ms: 1_000,
                    max_delay_ms: 30_000,
                    max_retries: 5,
                    jitter_ratio: 0.1,
                },
                workers: WorkerConfig { threads: 0 },
                tiles: TileConfig {
                    retained_tiles: DEFAULT_RETAINED_TILES,
                    pixel_ratio: 1.0,
                    prefetch_parents: true,
                    retry_failed_tiles: true,
                },
            },
            Self::LowResource => PipelineConfig {
                cache: CacheConfig {
                    max_bytes: 10 * 1024 * 1024,
                    disk_path: None,
                    disk_max_bytes: 50 * 1024 * 1024,
                },
                network: NetworkConfig {
                    max_concurrent_requests: 6,
                    request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
                    io_threads: 1,
                    user_agent: USER_AGENT.to_string(),
                    asset_root: None,
                },
                retry: RetryConfig {
                    base_delay_ms: 2_000,
                    max_delay_ms: 60_000,
                    max_retries: 3,
                    jitter_ratio: 0.1,
                },
                workers: WorkerConfig { threads: 1 },
                tiles: TileConfig {
                    retained_tiles: 16,
                    pixel_ratio: 1.0,
                    prefetch_parents: false,
                    retry_failed_tiles: true,
                },
            },
            Self::HighPerformance => PipelineConfig {
                cache: CacheConfig {
                    max_bytes: 200 * 1024 * 1024,
                    disk_path: None,
                    disk_max_bytes: 1024 * 1024 * 1024,
                },
                network: NetworkConfig {
                    max_concurrent_requests: 32,
                    request_timeout_ms: 15_000,
                    io_threads: 4,
                    user_agent: USER_AGENT.to_string(),
                    asset_root: None,
                },
                retry: RetryConfig {
                    base_delay_ms: 500,
                    max_delay_ms: 30_000,
                    max_retries: 8,
                    jitter_ratio: 0.1,
                },
                workers: WorkerConfig { threads: 0 },
                tiles: TileConfig {
                    retained_tiles: 256,
                    pixel_ratio: 1.0,
                    prefetch_parents: true,
                    retry_failed_tiles: true,
                },
            },
            Self::Custom(config) => config.clone(),
        }
    }
}

impl Default for PipelineProfile {
    fn default() -> Self {
        Self::Balanced
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub cache: CacheConfig,
    pub network: NetworkConfig,
    pub retry: RetryConfig,
    pub workers: WorkerConfig,
    pub tiles: TileConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineProfile::default().resolve()
    }
}

impl PipelineConfig {
    /// Configuration for deterministic tests: no jitter, one I/O thread,
    /// two workers, no disk tier.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.retry.jitter_ratio = 0.0;
        config.network.io_threads = 1;
        config.workers.threads = 2;
        config
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Rejects settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_bytes == 0 {
            return Err(MapError::Config("cache.max_bytes must be positive".into()));
        }
        if self.cache.disk_path.is_some() && self.cache.disk_max_bytes == 0 {
            return Err(MapError::Config(
                "cache.disk_max_bytes must be positive when a disk path is set".into(),
            ));
        }
        if self.network.max_concurrent_requests == 0 {
            return Err(MapError::Config(
                "network.max_concurrent_requests must be positive".into(),
            ));
        }
        if self.network.io_threads == 0 {
            return Err(MapError::Config("network.io_threads must be positive".into()));
        }
        if self.network.request_timeout_ms == 0 {
            return Err(MapError::Config(
                "network.request_timeout_ms must be positive".into(),
            ));
        }
        if self.retry.base_delay_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(MapError::Config(
                "retry delays must satisfy 0 < base_delay_ms <= max_delay_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(MapError::Config("retry.jitter_ratio must be within [0, 1]".into()));
        }
        if self.tiles.pixel_ratio <= 0.0 {
            return Err(MapError::Config("tiles.pixel_ratio must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory tier budget in bytes
    pub max_bytes: u64,
    /// Directory of the persistent tier; `None` keeps the cache in memory only
    pub disk_path: Option<PathBuf>,
    pub disk_max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        PipelineProfile::Balanced.resolve().cache
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub max_concurrent_requests: usize,
    pub request_timeout_ms: u64,
    pub io_threads: usize,
    pub user_agent: String,
    /// Directory `asset://` URLs resolve against
    pub asset_root: Option<PathBuf>,
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        PipelineProfile::Balanced.resolve().network
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Retries after the first attempt before an error is delivered
    pub max_retries: u32,
    /// Upper bound of the random extra delay, as a fraction of the delay
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        PipelineProfile::Balanced.resolve().retry
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker thread count; 0 picks the available parallelism
    pub threads: usize,
}

impl WorkerConfig {
    pub fn resolved_threads(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { threads: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileConfig {
    /// Off-screen tiles kept alive for quick reuse
    pub retained_tiles: usize,
    pub pixel_ratio: f32,
    /// Also load the parent of every ideal tile as a fallback
    pub prefetch_parents: bool,
    /// Reload transiently failed tiles once their backoff has elapsed
    pub retry_failed_tiles: bool,
}

impl Default for TileConfig {
    fn default() -> Self {
        PipelineProfile::Balanced.resolve().tiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_presets() {
        let balanced = PipelineProfile::Balanced.resolve();
        let low = PipelineProfile::LowResource.resolve();
        let high = PipelineProfile::HighPerformance.resolve();

        // Balanced should have reasonable defaults
        assert_eq!(balanced.cache.max_bytes, 50 * 1024 * 1024);
        assert_eq!(balanced.network.max_concurrent_requests, 20);
        assert_eq!(balanced.retry.base_delay_ms, 1_000);
        assert_eq!(balanced.retry.max_delay_ms, 30_000);

        // Low resource trades throughput for footprint
        assert!(low.cache.max_bytes < balanced.cache.max_bytes);
        assert!(low.tiles.retained_tiles < balanced.tiles.retained_tiles);

        // High performance keeps more around and fetches harder
        assert!(high.cache.max_bytes > balanced.cache.max_bytes);
        assert!(high.network.max_concurrent_requests > balanced.network.max_concurrent_requests);

        for config in [balanced, low, high] {
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn test_custom_profile_passes_through() {
        let mut custom = PipelineConfig::default();
        custom.tiles.retained_tiles = 3;
        assert_eq!(PipelineProfile::Custom(custom.clone()).resolve(), custom);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            PipelineConfig::from_json_str(r#"{ "retry": { "max_retries": 2 } }"#).unwrap();
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_budgets() {
        let mut config = PipelineConfig::default();
        config.cache.max_bytes = 0;
        assert!(matches!(config.validate(), Err(MapError::Config(_))));

        let mut config = PipelineConfig::default();
        config.network.io_threads = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.retry.max_delay_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{ "workers": { "threads": 3 } }"#).unwrap();

        let config = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.workers.resolved_threads(), 3);
        assert!(PipelineConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }
}
