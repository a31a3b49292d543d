// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Injectable time source.
//!
//! Every component that reads the wall clock or sleeps (the staging buffer's
//! backpressure loop, the sync engine's time budget, the trend cleanup
//! schedule) goes through the [`Clock`] trait, so tests can drive time
//! explicitly instead of sleeping for real.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::Timespec;

// =============================================================================
// Clock Trait
// =============================================================================

/// A time source with an async sleep.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timespec;

    /// Sleeps for the given duration.
    async fn sleep(&self, duration: Duration);
}

// =============================================================================
// System Clock
// =============================================================================

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Creates a new system clock.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Timespec {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);

        Timespec::new(now.as_secs() as i64, now.subsec_nanos() as i32)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// =============================================================================
// Manual Clock (for testing)
// =============================================================================

/// A manually driven clock for tests.
///
/// `sleep` advances the clock by the requested duration, records the call
/// and yields to the scheduler so that concurrently running tasks make
/// progress, but never waits for real time.
#[derive(Debug)]
pub struct ManualClock {
    now_ns: AtomicU64,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    /// Creates a manual clock starting at the given time.
    pub fn new(start: Timespec) -> Self {
        let ns = (start.sec as u64) * 1_000_000_000 + start.ns.max(0) as u64;
        Self {
            now_ns: AtomicU64::new(ns),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Creates a manual clock starting at second `sec`.
    pub fn at(sec: i64) -> Self {
        Self::new(Timespec::new(sec, 0))
    }

    /// Advances the clock by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.now_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, now: Timespec) {
        let ns = (now.sec as u64) * 1_000_000_000 + now.ns.max(0) as u64;
        self.now_ns.store(ns, Ordering::SeqCst);
    }

    /// Returns the number of recorded sleep calls.
    pub fn sleep_count(&self) -> usize {
        self.sleeps.lock().len()
    }

    /// Returns the recorded sleep durations.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(0)
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Timespec {
        let ns = self.now_ns.load(Ordering::SeqCst);
        Timespec::new((ns / 1_000_000_000) as i64, (ns % 1_000_000_000) as i32)
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_now() {
        let clock = SystemClock::new();
        let now = clock.now();
        assert!(now.sec > 0);
        assert!(now.has_ns());
    }

    #[tokio::test]
    async fn test_manual_clock_advance() {
        let clock = ManualClock::at(100);
        assert_eq!(clock.now(), Timespec::new(100, 0));

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Timespec::new(101, 500_000_000));
    }

    #[tokio::test]
    async fn test_manual_clock_sleep_records_and_advances() {
        let clock = ManualClock::at(0);

        clock.sleep(Duration::from_secs(1)).await;
        clock.sleep(Duration::from_secs(2)).await;

        assert_eq!(clock.sleep_count(), 2);
        assert_eq!(clock.now().sec, 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn test_manual_clock_set() {
        let clock = ManualClock::at(0);
        clock.set(Timespec::new(7200, 42));
        assert_eq!(clock.now(), Timespec::new(7200, 42));
    }
}
