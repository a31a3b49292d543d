// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Lock-free cache statistics.
//!
//! All counters are atomic so statistics never take the history lock; the
//! snapshot is a consistent-enough view for observability, matching the
//! counter set the front end reports (per-type totals, not-supported count,
//! arena usage).

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use silo_core::types::{BufferedValue, ItemState, ValueType};

// =============================================================================
// Cache Statistics
// =============================================================================

/// Process-wide, monotonically updated cache counters.
#[derive(Debug)]
pub struct CacheStats {
    /// Total values accepted into the cache (cumulative, value-carrying).
    values_total: AtomicU64,
    /// Float values accepted (cumulative).
    values_float: AtomicU64,
    /// Unsigned values accepted (cumulative).
    values_unsigned: AtomicU64,
    /// Character values accepted (cumulative).
    values_character: AtomicU64,
    /// Text values accepted (cumulative).
    values_text: AtomicU64,
    /// Log values accepted (cumulative).
    values_log: AtomicU64,
    /// Not-supported samples accepted (cumulative).
    not_supported: AtomicU64,
    /// Values currently buffered (live gauge).
    buffered: AtomicU64,
    /// Arena slots currently occupied (live gauge).
    arena_used: AtomicU64,
    /// Arena slot capacity.
    arena_capacity: u64,
}

impl CacheStats {
    /// Creates statistics for an arena of the given capacity.
    pub fn new(arena_capacity: usize) -> Self {
        Self {
            values_total: AtomicU64::new(0),
            values_float: AtomicU64::new(0),
            values_unsigned: AtomicU64::new(0),
            values_character: AtomicU64::new(0),
            values_text: AtomicU64::new(0),
            values_log: AtomicU64::new(0),
            not_supported: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            arena_used: AtomicU64::new(0),
            arena_capacity: arena_capacity as u64,
        }
    }

    /// Records a value cloned into the cache.
    pub fn record_clone(&self, value: &BufferedValue) {
        self.buffered.fetch_add(1, Ordering::Relaxed);

        if value.state == ItemState::NotSupported {
            self.not_supported.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !value.flags.has_value() {
            return;
        }

        self.values_total.fetch_add(1, Ordering::Relaxed);
        let counter = match value.value_type {
            ValueType::Float => &self.values_float,
            ValueType::Unsigned => &self.values_unsigned,
            ValueType::Character => &self.values_character,
            ValueType::Text => &self.values_text,
            ValueType::Log => &self.values_log,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a value released after a successful flush.
    #[inline]
    pub fn record_release(&self) {
        self.buffered.fetch_sub(1, Ordering::Relaxed);
    }

    /// Sets the arena usage gauge.
    #[inline]
    pub fn set_arena_used(&self, used: usize) {
        self.arena_used.store(used as u64, Ordering::Relaxed);
    }

    /// Returns the number of currently buffered values (O(1)).
    #[inline]
    pub fn buffered(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Creates a snapshot of the statistics.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let arena_used = self.arena_used.load(Ordering::Relaxed);
        let arena_free = self.arena_capacity.saturating_sub(arena_used);
        let arena_pfree = if self.arena_capacity > 0 {
            100.0 * arena_free as f64 / self.arena_capacity as f64
        } else {
            0.0
        };

        CacheStatsSnapshot {
            values_total: self.values_total.load(Ordering::Relaxed),
            values_float: self.values_float.load(Ordering::Relaxed),
            values_unsigned: self.values_unsigned.load(Ordering::Relaxed),
            values_character: self.values_character.load(Ordering::Relaxed),
            values_text: self.values_text.load(Ordering::Relaxed),
            values_log: self.values_log.load(Ordering::Relaxed),
            not_supported: self.not_supported.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            arena_used,
            arena_capacity: self.arena_capacity,
            arena_free,
            arena_pfree,
            taken_at: Utc::now(),
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable snapshot of cache statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    /// Total values accepted into the cache.
    pub values_total: u64,
    /// Float values accepted.
    pub values_float: u64,
    /// Unsigned values accepted.
    pub values_unsigned: u64,
    /// Character values accepted.
    pub values_character: u64,
    /// Text values accepted.
    pub values_text: u64,
    /// Log values accepted.
    pub values_log: u64,
    /// Not-supported samples accepted.
    pub not_supported: u64,
    /// Values currently buffered.
    pub buffered: u64,
    /// Arena slots in use.
    pub arena_used: u64,
    /// Arena slot capacity.
    pub arena_capacity: u64,
    /// Arena slots free.
    pub arena_free: u64,
    /// Arena free percentage.
    pub arena_pfree: f64,
    /// Snapshot timestamp.
    pub taken_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================
