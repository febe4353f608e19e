use crate::core::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Object storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStorageConfig {
    /// How long an unreferenced entry stays resident before it may be evicted
    pub cache_time_ms: u64,

    /// Entries written per backend batch by flush, free_memory and shutdown
    pub eviction_batch_size: usize,

    /// Worker threads running delayed eviction checks
    pub release_workers: usize,

    /// Write-back eligibility of newly created entries
    pub persistence_enabled: bool,

    /// Write new entries through to the backend as soon as they are stored
    pub store_on_creation: bool,

    /// Delete from the backend immediately instead of at write-back time
    pub delete_write_through: bool,

    /// Byte lengths of the key segments forming an entry's partition path
    pub key_partitions: Vec<usize>,

    /// Retry interval for entries whose partition is pinned
    pub pin_recheck_ms: u64,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            cache_time_ms: 5_000,
            eviction_batch_size: 64,
            release_workers: 2,
            persistence_enabled: true,
            store_on_creation: false,
            delete_write_through: true,
            key_partitions: Vec::new(),
            pin_recheck_ms: 1_000,
        }
    }
}

impl ObjectStorageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time_ms = cache_time.as_millis() as u64;
        self
    }

    pub fn eviction_batch_size(mut self, size: usize) -> Self {
        self.eviction_batch_size = size;
        self
    }

    pub fn release_workers(mut self, workers: usize) -> Self {
        self.release_workers = workers;
        self
    }

    pub fn persistence_enabled(mut self, enabled: bool) -> Self {
        self.persistence_enabled = enabled;
        self
    }

    pub fn store_on_creation(mut self, enabled: bool) -> Self {
        self.store_on_creation = enabled;
        self
    }

    pub fn delete_write_through(mut self, enabled: bool) -> Self {
        self.delete_write_through = enabled;
        self
    }

    pub fn key_partitions(mut self, lengths: Vec<usize>) -> Self {
        self.key_partitions = lengths;
        self
    }

    pub fn pin_recheck(mut self, interval: Duration) -> Self {
        self.pin_recheck_ms = interval.as_millis() as u64;
        self
    }

    pub fn cache_time_duration(&self) -> Duration {
        Duration::from_millis(self.cache_time_ms)
    }

    pub fn pin_recheck_duration(&self) -> Duration {
        Duration::from_millis(self.pin_recheck_ms)
    }

    /// Parses a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate().map_err(CacheError::InvalidConfig)?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CacheError::IoError(format!(
                "Failed to read config '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json(&json)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.eviction_batch_size == 0 {
            return Err("eviction_batch_size must be > 0".to_string());
        }

        if self.release_workers == 0 {
            return Err("release_workers must be > 0".to_string());
        }

        if self.key_partitions.contains(&0) {
            return Err("key_partitions lengths must be > 0".to_string());
        }

        if self.pin_recheck_ms == 0 {
            return Err("pin_recheck_ms must be > 0".to_string());
        }

        Ok(())
    }
}
