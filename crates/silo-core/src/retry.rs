// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Fixed-delay retry with an injectable clock.
//!
//! The cache uses a single retry shape: wait a fixed interval, optionally
//! jittered, either forever (arena backpressure — the condition resolves
//! when a syncer frees space) or up to an attempt cap. The clock is
//! injected so tests never wait for real time.
//!
//! # Example
//!
//! ```rust,ignore
//! use silo_core::retry::{FixedDelay, RetryConfig};
//!
//! let retry = FixedDelay::new(RetryConfig::forever(Duration::from_secs(1)), clock);
//!
//! let mut attempt = 0;
//! while !try_alloc() {
//!     attempt += 1;
//!     if !retry.wait(attempt).await {
//!         break;
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;

// =============================================================================
// Retry Configuration
// =============================================================================

/// Configuration for the fixed-delay retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay between attempts.
    #[serde(default = "default_interval")]
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Maximum number of attempts; `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Jitter factor (0.0 to 1.0) randomizing each delay by ±factor.
    #[serde(default)]
    pub jitter: f64,
}

fn default_interval() -> Duration {
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

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            max_attempts: None,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// Creates a retry-forever configuration with the given interval.
    pub fn forever(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            jitter: 0.0,
        }
    }

    /// Creates a bounded configuration.
    pub fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts),
            jitter: 0.0,
        }
    }

    /// Creates a configuration for testing (1 ms interval).
    pub fn for_testing() -> Self {
        Self::forever(Duration::from_millis(1))
    }

    /// Sets the jitter factor.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
}

// =============================================================================
// Fixed Delay
// =============================================================================

/// A fixed-delay retry helper.
pub struct FixedDelay {
    config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl FixedDelay {
    /// Creates a new fixed-delay retry.
    pub fn new(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Waits before the next attempt.
    ///
    /// Returns `false` if `attempt` has reached the configured cap and the
    /// caller should give up instead.
    pub async fn wait(&self, attempt: u32) -> bool {
        if let Some(max) = self.config.max_attempts {
            if attempt >= max {
                return false;
            }
        }

        let delay = self.delay();
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before retry");
        self.clock.sleep(delay).await;
        true
    }

    /// Returns the (jittered) delay for the next attempt.
    fn delay(&self) -> Duration {
        if self.config.jitter <= 0.0 {
            return self.config.interval;
        }

        let millis = self.config.interval.as_millis() as f64;
        let spread = millis * self.config.jitter;
        let random: f64 = rand::random::<f64>() * 2.0 - 1.0;

        Duration::from_millis((millis + random * spread).max(0.0) as u64)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl std::fmt::Debug for FixedDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedDelay")
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
