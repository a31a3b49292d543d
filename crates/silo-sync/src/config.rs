// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Synchronization engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use silo_core::types::Role;

// =============================================================================
// Sync Configuration
// =============================================================================

/// Configuration for the synchronization engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Deployment role.
    #[serde(default)]
    pub role: Role,

    /// Maximum number of items flushed per pass.
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,

    /// Soft wall-clock budget of an incremental synchronization.
    #[serde(default = "default_time_budget")]
    #[serde(with = "duration_secs")]
    pub time_budget: Duration,

    /// Minimum percentage of candidates that must be processed (vs skipped
    /// as trigger-busy) for an incremental synchronization to keep looping.
    #[serde(default = "default_min_progress_pct")]
    pub min_progress_pct: u32,

    /// Seconds past the hour boundary before the trend cleanup sweep runs.
    #[serde(default = "default_trend_cleanup_settle_secs")]
    pub trend_cleanup_settle_secs: i64,

    /// Interval between progress log lines during a full synchronization.
    #[serde(default = "default_full_sync_report_secs")]
    pub full_sync_report_secs: i64,
}

fn default_batch_max() -> usize {
    1000
}

fn default_time_budget() -> Duration {
    Duration::from_secs(10)
}

fn default_min_progress_pct() -> u32 {
    10
}

fn default_trend_cleanup_settle_secs() -> i64 {
    600
}

fn default_full_sync_report_secs() -> i64 {
    10
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            role: Role::Server,
            batch_max: default_batch_max(),
            time_budget: default_time_budget(),
            min_progress_pct: default_min_progress_pct(),
            trend_cleanup_settle_secs: default_trend_cleanup_settle_secs(),
            full_sync_report_secs: default_full_sync_report_secs(),
        }
    }
}

impl SyncConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Creates a configuration for testing (small batches).
    pub fn for_testing() -> Self {
        Self {
            batch_max: 100,
            ..Default::default()
        }
    }
}

/// Builder for [`SyncConfig`].
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    /// Sets the deployment role.
    pub fn role(mut self, role: Role) -> Self {
        self.config.role = role;
        self
    }

    /// Sets the per-pass batch limit.
    pub fn batch_max(mut self, batch_max: usize) -> Self {
        self.config.batch_max = batch_max;
        self
    }

    /// Sets the incremental time budget.
    pub fn time_budget(mut self, budget: Duration) -> Self {
        self.config.time_budget = budget;
        self
    }

    /// Sets the minimum progress percentage.
    pub fn min_progress_pct(mut self, pct: u32) -> Self {
        self.config.min_progress_pct = pct.min(100);
        self
    }

    /// Sets the trend cleanup settle delay.
    pub fn trend_cleanup_settle_secs(mut self, secs: i64) -> Self {
        self.config.trend_cleanup_settle_secs = secs;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> SyncConfig {
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
        let config = SyncConfig::default();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.batch_max, 1000);
        assert_eq!(config.time_budget, Duration::from_secs(10));
        assert_eq!(config.min_progress_pct, 10);
    }

    #[test]
    fn test_builder_clamps_percentage() {
        let config = SyncConfig::builder().min_progress_pct(250).build();
        assert_eq!(config.min_progress_pct, 100);
    }

    #[test]
    fn test_builder() {
        let config = SyncConfig::builder()
            .role(Role::Proxy)
            .batch_max(50)
            .time_budget(Duration::from_secs(2))
            .build();

        assert_eq!(config.role, Role::Proxy);
        assert_eq!(config.batch_max, 50);
        assert_eq!(config.time_budget, Duration::from_secs(2));
    }

    #[test]
    fn test_serde_defaults() {
        let parsed: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.batch_max, 1000);
        assert_eq!(parsed.role, Role::Server);
    }
}
