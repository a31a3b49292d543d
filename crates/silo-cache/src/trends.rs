// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Hourly trend aggregator.
//!
//! For every numeric item the cache keeps one running aggregate per hour:
//! sample count, minimum, maximum and average. Float averages are updated
//! incrementally; unsigned averages keep a 128-bit running sum and divide
//! only at flush time, so `u64::MAX`-scale samples cannot overflow the
//! accumulator.
//!
//! Aggregates roll onto a flush list when their hour ends (or their value
//! type changes), on the hourly cleanup sweep, and wholesale on a forced
//! full flush. The `disable_from` watermark records that an (item, hour)
//! row has already been reconciled with the database this hour, so repeat
//! flushes skip the existence check (see the sync engine's flush protocol).

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use silo_core::types::{HistoryValue, ItemId, Timespec, ValueType};

// =============================================================================
// Trend Values
// =============================================================================

/// The running min/avg/max of one aggregate, by value type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrendValue {
    /// Float aggregate with an incrementally maintained average.
    Float {
        /// Minimum sample.
        min: f64,
        /// Maximum sample.
        max: f64,
        /// Running arithmetic mean.
        avg: f64,
    },
    /// Unsigned aggregate with a 128-bit running sum.
    Unsigned {
        /// Minimum sample.
        min: u64,
        /// Maximum sample.
        max: u64,
        /// Running sum; divided by the count only at flush time.
        sum: u128,
    },
}

impl TrendValue {
    /// Returns the value type of this aggregate.
    pub fn value_type(&self) -> ValueType {
        match self {
            TrendValue::Float { .. } => ValueType::Float,
            TrendValue::Unsigned { .. } => ValueType::Unsigned,
        }
    }
}

// =============================================================================
// Trend Aggregate
// =============================================================================

/// The hourly rollup of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendAggregate {
    /// The aggregated item.
    pub item_id: ItemId,
    /// Hour-aligned clock of the aggregate.
    pub clock: i64,
    /// Number of samples accumulated.
    pub num: u32,
    /// Running min/avg/max.
    pub value: TrendValue,
    /// Database-reconciliation watermark: rows for clocks before this are
    /// known to exist in the database (flushed this hour); `0` means the
    /// database has not been consulted for this item yet.
    pub disable_from: i64,
}

impl TrendAggregate {
    fn first(item_id: ItemId, clock: i64, disable_from: i64, value: &HistoryValue) -> Option<Self> {
        let value = match value {
            HistoryValue::Float(v) => TrendValue::Float {
                min: *v,
                max: *v,
                avg: *v,
            },
            HistoryValue::Unsigned(v) => TrendValue::Unsigned {
                min: *v,
                max: *v,
                sum: *v as u128,
            },
            _ => return None,
        };

        Some(Self {
            item_id,
            clock,
            num: 1,
            value,
            disable_from,
        })
    }

    /// Accumulates one sample into the aggregate.
    ///
    /// Returns `false` if the sample's type does not match the aggregate.
    pub fn accumulate(&mut self, value: &HistoryValue) -> bool {
        match (&mut self.value, value) {
            (TrendValue::Float { min, max, avg }, HistoryValue::Float(v)) => {
                if *v < *min {
                    *min = *v;
                }
                if *v > *max {
                    *max = *v;
                }
                *avg = (*avg * self.num as f64 + *v) / (self.num as f64 + 1.0);
            }
            (TrendValue::Unsigned { min, max, sum }, HistoryValue::Unsigned(v)) => {
                if *v < *min {
                    *min = *v;
                }
                if *v > *max {
                    *max = *v;
                }
                *sum += *v as u128;
            }
            _ => return false,
        }
        self.num += 1;
        true
    }

    /// Merges a persisted row (count + min/avg/max) into a float aggregate.
    pub fn merge_float(&mut self, num: u32, min: f64, avg: f64, max: f64) {
        if let TrendValue::Float {
            min: cur_min,
            max: cur_max,
            avg: cur_avg,
        } = &mut self.value
        {
            if min < *cur_min {
                *cur_min = min;
            }
            if max > *cur_max {
                *cur_max = max;
            }
            *cur_avg = (*cur_avg * self.num as f64 + avg * num as f64)
                / (self.num as f64 + num as f64);
            self.num += num;
        }
    }

    /// Merges a persisted row (count + min/avg/max) into an unsigned
    /// aggregate; the row's average is widened back into the 128-bit sum.
    pub fn merge_unsigned(&mut self, num: u32, min: u64, avg: u64, max: u64) {
        if let TrendValue::Unsigned {
            min: cur_min,
            max: cur_max,
            sum,
        } = &mut self.value
        {
            if min < *cur_min {
                *cur_min = min;
            }
            if max > *cur_max {
                *cur_max = max;
            }
            *sum += num as u128 * avg as u128;
            self.num += num;
        }
    }

    /// Returns the unsigned average, dividing the 128-bit sum by the count.
    pub fn unsigned_avg(&self) -> u64 {
        match self.value {
            TrendValue::Unsigned { sum, .. } if self.num > 0 => (sum / self.num as u128) as u64,
            _ => 0,
        }
    }
}

// =============================================================================
// Trend Cache
// =============================================================================

#[derive(Debug, Default)]
struct TrendInner {
    map: HashMap<ItemId, TrendAggregate>,
    last_cleanup_hour: i64,
}

/// The shared map of per-item hourly aggregates, guarded by its own lock.
#[derive(Debug, Default)]
pub struct TrendCache {
    inner: Mutex<TrendInner>,
}

impl TrendCache {
    /// Creates an empty trend cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulates one flushed history value into its hour's aggregate.
    ///
    /// When the item's current aggregate belongs to a different hour (or a
    /// different value type), it is moved onto `rolled` for flushing and a
    /// fresh aggregate starts for the sample's hour.
    pub fn accumulate(
        &self,
        item_id: ItemId,
        ts: &Timespec,
        value: &HistoryValue,
        rolled: &mut Vec<TrendAggregate>,
    ) {
        let hour = ts.hour_floor();
        let mut inner = self.inner.lock();

        match inner.map.get_mut(&item_id) {
            Some(aggregate) => {
                let type_matches = match (&aggregate.value, value) {
                    (TrendValue::Float { .. }, HistoryValue::Float(_)) => true,
                    (TrendValue::Unsigned { .. }, HistoryValue::Unsigned(_)) => true,
                    _ => false,
                };

                if aggregate.num > 0 && (aggregate.clock != hour || !type_matches) {
                    rolled.push(aggregate.clone());
                    let disable_from = aggregate.disable_from;
                    match TrendAggregate::first(item_id, hour, disable_from, value) {
                        Some(fresh) => *aggregate = fresh,
                        None => {
                            inner.map.remove(&item_id);
                        }
                    }
                } else {
                    aggregate.clock = hour;
                    aggregate.accumulate(value);
                }
            }
            None => {
                if let Some(fresh) = TrendAggregate::first(item_id, hour, 0, value) {
                    inner.map.insert(item_id, fresh);
                }
            }
        }
    }

    /// Sweeps out aggregates whose hour has passed.
    ///
    /// Runs at most once per hour boundary, and only after `settle_secs`
    /// have elapsed past the boundary so late samples of the previous hour
    /// still land in their aggregate. Evicted aggregates are pushed onto
    /// `rolled` for flushing.
    pub fn cleanup(&self, now: Timespec, settle_secs: i64, rolled: &mut Vec<TrendAggregate>) {
        let hour = now.hour_floor();
        let seconds = now.sec - hour;

        let mut inner = self.inner.lock();
        if inner.last_cleanup_hour >= hour || seconds < settle_secs {
            return;
        }

        let before = inner.map.len();
        inner.map.retain(|_, aggregate| {
            if aggregate.clock == hour {
                return true;
            }
            if aggregate.num > 0 {
                rolled.push(aggregate.clone());
            }
            false
        });
        inner.last_cleanup_hour = hour;

        debug!(
            evicted = before - inner.map.len(),
            remaining = inner.map.len(),
            "trend cache cleanup"
        );
    }

    /// Drains every aggregate for a forced full flush.
    pub fn take_all(&self) -> Vec<TrendAggregate> {
        let mut inner = self.inner.lock();
        inner
            .map
            .drain()
            .map(|(_, aggregate)| aggregate)
            .filter(|aggregate| aggregate.num > 0)
            .collect()
    }

    /// Records that `item_id`'s trend row has been reconciled with the
    /// database up to `clock`.
    pub fn set_disable_from(&self, item_id: ItemId, clock: i64) {
        let mut inner = self.inner.lock();
        if let Some(aggregate) = inner.map.get_mut(&item_id) {
            if aggregate.disable_from < clock {
                aggregate.disable_from = clock;
            }
        }
    }

    /// Returns a copy of an item's current aggregate.
    pub fn get(&self, item_id: ItemId) -> Option<TrendAggregate> {
        self.inner.lock().map.get(&item_id).cloned()
    }

    /// Returns the number of live aggregates.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Returns `true` if no aggregates are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
