// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Cache configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// =============================================================================
// Cache Configuration
// =============================================================================

/// Configuration for the history cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Value arena capacity in slots.
    #[serde(default = "default_arena_capacity")]
    pub arena_capacity: usize,

    /// Staging buffer capacity; a writer commits implicitly when it stages
    /// this many values.
    #[serde(default = "default_staging_capacity")]
    pub staging_capacity: usize,

    /// Pre-reserved capacity of the steady-state scheduling queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Sleep interval of the arena-backpressure retry loop.
    #[serde(default = "default_retry_interval")]
    #[serde(with = "duration_millis")]
    pub retry_interval: Duration,
}

fn default_arena_capacity() -> usize {
    65536
}

fn default_staging_capacity() -> usize {
    256
}

fn default_queue_capacity() -> usize {
    65536
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(1)
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            arena_capacity: default_arena_capacity(),
            staging_capacity: default_staging_capacity(),
            queue_capacity: default_queue_capacity(),
            retry_interval: default_retry_interval(),
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Creates a configuration for testing (small limits, fast retry).
    pub fn for_testing() -> Self {
        Self {
            arena_capacity: 1024,
            staging_capacity: 16,
            queue_capacity: 1024,
            retry_interval: Duration::from_millis(1),
        }
    }
}

/// Builder for [`CacheConfig`].
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Sets the arena capacity.
    pub fn arena_capacity(mut self, capacity: usize) -> Self {
        self.config.arena_capacity = capacity;
        self
    }

    /// Sets the staging buffer capacity.
    pub fn staging_capacity(mut self, capacity: usize) -> Self {
        self.config.staging_capacity = capacity;
        self
    }

    /// Sets the scheduling queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Sets the backpressure retry interval.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> CacheConfig {
        self.config
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.arena_capacity, 65536);
        assert_eq!(config.staging_capacity, 256);
        assert_eq!(config.retry_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_builder() {
        let config = CacheConfig::builder()
            .arena_capacity(128)
            .staging_capacity(8)
            .queue_capacity(64)
            .retry_interval(Duration::from_millis(50))
            .build();

        assert_eq!(config.arena_capacity, 128);
        assert_eq!(config.staging_capacity, 8);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.retry_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_for_testing_is_small() {
        let config = CacheConfig::for_testing();
        assert!(config.arena_capacity < CacheConfig::default().arena_capacity);
        assert!(config.retry_interval < CacheConfig::default().retry_interval);
    }

    #[test]
    fn test_serde_round_trip() {
        let config = CacheConfig::for_testing();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.arena_capacity, config.arena_capacity);
        assert_eq!(parsed.retry_interval, config.retry_interval);
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let parsed: CacheConfig = serde_json::from_str(r#"{"arena_capacity": 42}"#).unwrap();
        assert_eq!(parsed.arena_capacity, 42);
        assert_eq!(parsed.staging_capacity, 256);
    }
}
