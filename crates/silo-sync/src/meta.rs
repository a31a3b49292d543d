// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Item metadata updates and delta computation.
//!
//! For every value in a flush batch this module resolves the item's
//! configuration, applies the delta mode (as-is, speed per second, simple
//! change) and the optional multiplier, range-checks float results against
//! the database's fixed-precision numeric column, and produces the item
//! metadata update rows.
//!
//! Items transition to "not supported" on out-of-range results and back to
//! normal on the next valid value; each transition emits exactly one
//! internal event, and the cached error string is rewritten only when it
//! actually changed.

use std::collections::HashMap;

use tracing::{debug, warn};

use silo_core::types::{
    BufferedValue, DeltaMode, HistoryValue, ItemConfig, ItemId, ItemState, Role, Timespec,
    ValueType,
};

use silo_cache::cache::SyncValue;

use crate::config_cache::{ConfigCache, DeltaValue};
use crate::db::ItemUpdate;
use crate::triggers::EventSink;

/// Bounds of the NUMERIC(16,4) history column.
const NUMERIC_MAX: f64 = 1e12;

// =============================================================================
// Pending Values
// =============================================================================

/// One checked-out value being flushed, with its per-pass processing state.
#[derive(Debug, Clone)]
pub(crate) struct PendingValue {
    pub item_id: ItemId,
    pub value: BufferedValue,
    /// The value to store in history (delta applied); `None` when the
    /// result is undefined or the sample carries no value.
    pub computed: Option<HistoryValue>,
    pub keep_history: bool,
    pub keep_trends: bool,
    /// The item state resulting from this sample.
    pub state: ItemState,
    /// The error string when `state` is not-supported.
    pub error: Option<String>,
    /// Excluded from every flush step (unknown item, unmonitored host,
    /// changed value type); still released from the cache.
    pub skip: bool,
}

impl PendingValue {
    pub(crate) fn new(sv: SyncValue) -> Self {
        let state = sv.value.state;
        let error = sv.value.error.clone();
        Self {
            item_id: sv.item_id,
            value: sv.value,
            computed: None,
            keep_history: false,
            keep_trends: false,
            state,
            error,
            skip: false,
        }
    }

    /// Returns `true` if this value should be written to raw history.
    pub(crate) fn writes_history(&self) -> bool {
        !self.skip
            && self.keep_history
            && self.state == ItemState::Normal
            && !self.value.flags.undefined
            && self.computed.is_some()
    }

    /// Returns `true` if this value feeds the trend aggregator.
    pub(crate) fn writes_trends(&self) -> bool {
        !self.skip
            && self.keep_trends
            && self.state == ItemState::Normal
            && !self.value.flags.undefined
            && matches!(
                self.computed,
                Some(HistoryValue::Float(_)) | Some(HistoryValue::Unsigned(_))
            )
    }
}

/// The result of the metadata pass over a batch.
#[derive(Debug, Default)]
pub(crate) struct MetaOutcome {
    /// Item metadata update rows.
    pub updates: Vec<ItemUpdate>,
    /// Previous-raw-value write-backs (`None` removes the stored value).
    pub deltas: HashMap<ItemId, Option<DeltaValue>>,
}

// =============================================================================
// Batch Processing
// =============================================================================

/// Processes a batch: delta computation, state transitions and metadata
/// update rows. Mutates each pending value in place.
pub(crate) fn process_items(
    pending: &mut [PendingValue],
    configs: &HashMap<ItemId, ItemConfig>,
    prev: &HashMap<ItemId, DeltaValue>,
    role: Role,
    events: &dyn EventSink,
    config_cache: &dyn ConfigCache,
) -> MetaOutcome {
    let mut outcome = MetaOutcome::default();

    for p in pending.iter_mut() {
        let Some(config) = configs.get(&p.item_id) else {
            warn!(item_id = %p.item_id, "flushing value for unknown item, this should never happen");
            p.skip = true;
            continue;
        };

        if !config.host_monitored {
            debug!(item_id = %p.item_id, "host not monitored, skipping value");
            p.skip = true;
            continue;
        }

        match role {
            Role::Proxy => process_proxy_value(p, &mut outcome),
            Role::Server => {
                process_server_value(p, config, prev.get(&p.item_id), events, config_cache, &mut outcome)
            }
        }
    }

    outcome
}

fn process_proxy_value(p: &mut PendingValue, outcome: &mut MetaOutcome) {
    // the proxy forwards original values and never post-processes them
    p.keep_history = true;
    p.keep_trends = false;
    p.computed = p.value.value.clone();

    if p.value.flags.meta {
        let mut update = ItemUpdate::new(p.item_id, p.value.ts);
        update.meta = p.value.meta;
        outcome.updates.push(update);
    }
}

fn process_server_value(
    p: &mut PendingValue,
    config: &ItemConfig,
    prev: Option<&DeltaValue>,
    events: &dyn EventSink,
    config_cache: &dyn ConfigCache,
    outcome: &mut MetaOutcome,
) {
    if p.state == ItemState::Normal {
        if p.value.value_type != config.value_type {
            debug!(
                item_id = %p.item_id,
                collected = %p.value.value_type,
                configured = %config.value_type,
                "value type changed since collection, skipping value"
            );
            p.skip = true;
            return;
        }

        p.keep_history = config.keep_history;
        p.keep_trends = config.keep_trends && config.value_type.is_numeric();

        compute_value(p, config, prev);
    }

    if config.value_type.is_numeric() && config.delta != DeltaMode::AsIs {
        let entry = if p.state == ItemState::Normal && p.value.has_value() {
            p.value.value.clone().map(|raw| DeltaValue {
                ts: p.value.ts,
                value: raw,
            })
        } else {
            None
        };
        outcome.deltas.insert(p.item_id, entry);
    } else if config.value_type.is_numeric() {
        outcome.deltas.insert(p.item_id, None);
    }

    let mut update = ItemUpdate::new(p.item_id, p.value.ts);
    if p.value.flags.meta {
        update.meta = p.value.meta;
    }

    if p.state == ItemState::NotSupported {
        let error = p.error.clone().unwrap_or_default();
        let mut changed = false;

        if config.state != ItemState::NotSupported {
            warn!(item_id = %p.item_id, error = %error, "item became not supported");
            events.item_unsupported(p.item_id, p.value.ts, &error);
            update.state = Some(ItemState::NotSupported);
            changed = true;
        }

        if config.error != error {
            if config.state == ItemState::NotSupported {
                warn!(item_id = %p.item_id, error = %error, "error reason for item changed");
            }
            update.error = Some(error.clone());
            changed = true;
        }

        if changed {
            config_cache.set_item_state(p.item_id, ItemState::NotSupported, &error);
        }
    } else {
        if config.state == ItemState::NotSupported {
            warn!(item_id = %p.item_id, "item became supported");
            events.item_supported(p.item_id, p.value.ts);
            update.state = Some(ItemState::Normal);
            update.error = Some(String::new());
            config_cache.set_item_state(p.item_id, ItemState::Normal, "");
        }

        update.last_value = p.computed.clone();
        if config.delta != DeltaMode::AsIs && p.value.has_value() {
            update.prev_raw = p.value.value.clone();
        }
    }

    outcome.updates.push(update);
}

// =============================================================================
// Delta Computation
// =============================================================================

fn compute_value(p: &mut PendingValue, config: &ItemConfig, prev: Option<&DeltaValue>) {
    match p.value.value.clone() {
        Some(HistoryValue::Float(orig)) if config.value_type == ValueType::Float => {
            match delta_float(config, orig, p.value.ts, prev) {
                Some(v) if float_in_range(v) => p.computed = Some(HistoryValue::Float(v)),
                Some(v) => {
                    p.state = ItemState::NotSupported;
                    p.error = Some(format!(
                        "Type of received value [{}] is not suitable for value type [{}]",
                        v, config.value_type
                    ));
                    p.value.flags.undefined = true;
                }
                None => p.value.flags.undefined = true,
            }
        }
        Some(HistoryValue::Unsigned(orig)) if config.value_type == ValueType::Unsigned => {
            match delta_unsigned(config, orig, p.value.ts, prev) {
                Some(v) => p.computed = Some(HistoryValue::Unsigned(v)),
                None => p.value.flags.undefined = true,
            }
        }
        other => p.computed = other,
    }
}

/// Applies the delta mode to a float sample; `None` marks the result
/// undefined (missing or unusable previous sample).
fn delta_float(
    config: &ItemConfig,
    orig: f64,
    ts: Timespec,
    prev: Option<&DeltaValue>,
) -> Option<f64> {
    match config.delta {
        DeltaMode::AsIs => Some(multiply_float(config, orig)),
        DeltaMode::SpeedPerSecond => {
            let prev = prev?;
            let prev_value = prev.value.as_float()?;
            if prev_value <= orig && prev.ts < ts {
                Some(multiply_float(
                    config,
                    (orig - prev_value) / ts.elapsed_secs(&prev.ts),
                ))
            } else {
                None
            }
        }
        DeltaMode::SimpleChange => {
            let prev = prev?;
            let prev_value = prev.value.as_float()?;
            if prev_value <= orig {
                Some(multiply_float(config, orig - prev_value))
            } else {
                None
            }
        }
    }
}

/// Applies the delta mode to an unsigned sample.
fn delta_unsigned(
    config: &ItemConfig,
    orig: u64,
    ts: Timespec,
    prev: Option<&DeltaValue>,
) -> Option<u64> {
    match config.delta {
        DeltaMode::AsIs => Some(multiply_unsigned(config, orig)),
        DeltaMode::SpeedPerSecond => {
            let prev = prev?;
            let prev_value = prev.value.as_unsigned()?;
            if prev_value <= orig && prev.ts < ts {
                let rate = (orig - prev_value) as f64 / ts.elapsed_secs(&prev.ts);
                Some(multiply_unsigned(config, rate as u64))
            } else {
                None
            }
        }
        DeltaMode::SimpleChange => {
            let prev = prev?;
            let prev_value = prev.value.as_unsigned()?;
            if prev_value <= orig {
                Some(multiply_unsigned(config, orig - prev_value))
            } else {
                None
            }
        }
    }
}

fn multiply_float(config: &ItemConfig, value: f64) -> f64 {
    match config.multiplier {
        Some(multiplier) => value * multiplier,
        None => value,
    }
}

fn multiply_unsigned(config: &ItemConfig, value: u64) -> u64 {
    match config.multiplier {
        Some(multiplier) if multiplier >= 0.0 && multiplier.fract() == 0.0 => {
            value.wrapping_mul(multiplier as u64)
        }
        Some(multiplier) => (value as f64 * multiplier) as u64,
        None => value,
    }
}

/// Range check against the NUMERIC(16,4) history column.
fn float_in_range(value: f64) -> bool {
    value > -NUMERIC_MAX && value < NUMERIC_MAX
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_cache::InMemoryConfigCache;
    use crate::triggers::{CollectingEventSink, InternalEvent};
    use silo_core::types::SampleFlags;

    fn float_sync_value(item: u64, sec: i64, value: f64) -> SyncValue {
        SyncValue {
            item_id: ItemId::new(item),
            value: BufferedValue {
                ts: Timespec::new(sec, 0),
                value_type: ValueType::Float,
                flags: SampleFlags::none(),
                state: ItemState::Normal,
                value: Some(HistoryValue::Float(value)),
                meta: None,
                error: None,
            },
        }
    }

    fn unsigned_sync_value(item: u64, sec: i64, value: u64) -> SyncValue {
        SyncValue {
            item_id: ItemId::new(item),
            value: BufferedValue {
                ts: Timespec::new(sec, 0),
                value_type: ValueType::Unsigned,
                flags: SampleFlags::none(),
                state: ItemState::Normal,
                value: Some(HistoryValue::Unsigned(value)),
                meta: None,
                error: None,
            },
        }
    }

    fn delta_value(sec: i64, value: HistoryValue) -> DeltaValue {
        DeltaValue {
            ts: Timespec::new(sec, 0),
            value,
        }
    }

    fn run_one(
        sv: SyncValue,
        config: ItemConfig,
        prev: Option<DeltaValue>,
    ) -> (PendingValue, MetaOutcome, CollectingEventSink) {
        let events = CollectingEventSink::new();
        let config_cache = InMemoryConfigCache::new();
        config_cache.insert_item(config.clone());

        let mut pending = vec![PendingValue::new(sv)];
        let mut configs = HashMap::new();
        configs.insert(config.item_id, config);
        let mut prev_map = HashMap::new();
        if let Some(prev) = prev {
            prev_map.insert(pending[0].item_id, prev);
        }

        let outcome = process_items(
            &mut pending,
            &configs,
            &prev_map,
            Role::Server,
            &events,
            &config_cache,
        );
        (pending.remove(0), outcome, events)
    }

    #[test]
    fn test_as_is_with_multiplier() {
        let config =
            ItemConfig::new(ItemId::new(1), ValueType::Float).with_multiplier(8.0);
        let (p, _, _) = run_one(float_sync_value(1, 100, 2.5), config, None);

        assert_eq!(p.computed, Some(HistoryValue::Float(20.0)));
        assert!(p.writes_history());
    }

    #[test]
    fn test_speed_per_second() {
        let config = ItemConfig::new(ItemId::new(1), ValueType::Unsigned)
            .with_delta(DeltaMode::SpeedPerSecond);
        let prev = delta_value(100, HistoryValue::Unsigned(1000));
        let (p, outcome, _) = run_one(unsigned_sync_value(1, 110, 2000), config, Some(prev));

        // (2000 - 1000) / 10s
        assert_eq!(p.computed, Some(HistoryValue::Unsigned(100)));
        // the raw value is tracked for the next pass
        assert_eq!(
            outcome.deltas.get(&ItemId::new(1)).unwrap().as_ref().unwrap().value,
            HistoryValue::Unsigned(2000)
        );
    }

    #[test]
    fn test_speed_without_previous_is_undefined() {
        let config = ItemConfig::new(ItemId::new(1), ValueType::Float)
            .with_delta(DeltaMode::SpeedPerSecond);
        let (p, _, events) = run_one(float_sync_value(1, 100, 5.0), config, None);

        assert_eq!(p.computed, None);
        assert!(p.value.flags.undefined);
        assert_eq!(p.state, ItemState::Normal);
        assert!(events.is_empty());
    }

    #[test]
    fn test_speed_with_decreasing_counter_is_undefined() {
        let config = ItemConfig::new(ItemId::new(1), ValueType::Unsigned)
            .with_delta(DeltaMode::SpeedPerSecond);
        let prev = delta_value(100, HistoryValue::Unsigned(5000));
        let (p, _, _) = run_one(unsigned_sync_value(1, 110, 4000), config, Some(prev));

        assert_eq!(p.computed, None);
        assert!(p.value.flags.undefined);
    }

    #[test]
    fn test_speed_with_future_previous_is_undefined() {
        let config = ItemConfig::new(ItemId::new(1), ValueType::Float)
            .with_delta(DeltaMode::SpeedPerSecond);
        let prev = delta_value(200, HistoryValue::Float(1.0));
        let (p, _, _) = run_one(float_sync_value(1, 110, 5.0), config, Some(prev));

        assert_eq!(p.computed, None);
    }

    #[test]
    fn test_simple_change() {
        let config = ItemConfig::new(ItemId::new(1), ValueType::Float)
            .with_delta(DeltaMode::SimpleChange);
        let prev = delta_value(100, HistoryValue::Float(10.0));
        let (p, _, _) = run_one(float_sync_value(1, 110, 12.5), config, Some(prev));

        assert_eq!(p.computed, Some(HistoryValue::Float(2.5)));
    }

    #[test]
    fn test_out_of_range_transitions_to_not_supported() {
        let config = ItemConfig::new(ItemId::new(300), ValueType::Float);
        let (p, outcome, events) = run_one(float_sync_value(300, 100, 5e12), config, None);

        assert_eq!(p.state, ItemState::NotSupported);
        assert!(p.error.as_ref().unwrap().contains("not suitable"));
        assert!(!p.writes_history());

        let recorded = events.events();
        assert_eq!(recorded.len(), 1);
        assert!(matches!(recorded[0], InternalEvent::Unsupported { .. }));

        let update = &outcome.updates[0];
        assert_eq!(update.state, Some(ItemState::NotSupported));
        assert!(update.error.is_some());
    }

    #[test]
    fn test_recovery_emits_one_event() {
        let mut config = ItemConfig::new(ItemId::new(300), ValueType::Float);
        config.state = ItemState::NotSupported;
        config.error = "old error".to_string();

        let (p, outcome, events) = run_one(float_sync_value(300, 200, 1.0), config, None);

        assert_eq!(p.state, ItemState::Normal);
        let recorded = events.events();
        assert_eq!(recorded.len(), 1);
        assert!(matches!(recorded[0], InternalEvent::Supported { .. }));

        let update = &outcome.updates[0];
        assert_eq!(update.state, Some(ItemState::Normal));
        assert_eq!(update.error.as_deref(), Some(""));
    }

    #[test]
    fn test_unchanged_error_not_rewritten() {
        let mut config = ItemConfig::new(ItemId::new(1), ValueType::Float);
        config.state = ItemState::NotSupported;
        config.error = "no such metric".to_string();

        let mut sv = float_sync_value(1, 100, 0.0);
        sv.value.state = ItemState::NotSupported;
        sv.value.value = None;
        sv.value.error = Some("no such metric".to_string());

        let (_, outcome, events) = run_one(sv, config, None);

        // same state, same error: no event, no state/error columns touched
        assert!(events.is_empty());
        let update = &outcome.updates[0];
        assert_eq!(update.state, None);
        assert_eq!(update.error, None);
    }

    #[test]
    fn test_unknown_item_is_skipped() {
        let events = CollectingEventSink::new();
        let config_cache = InMemoryConfigCache::new();
        let mut pending = vec![PendingValue::new(float_sync_value(9, 100, 1.0))];

        let outcome = process_items(
            &mut pending,
            &HashMap::new(),
            &HashMap::new(),
            Role::Server,
            &events,
            &config_cache,
        );

        assert!(pending[0].skip);
        assert!(outcome.updates.is_empty());
    }

    #[test]
    fn test_unmonitored_host_is_skipped() {
        let mut config = ItemConfig::new(ItemId::new(1), ValueType::Float);
        config.host_monitored = false;
        let (p, outcome, _) = run_one(float_sync_value(1, 100, 1.0), config, None);

        assert!(p.skip);
        assert!(outcome.updates.is_empty());
    }

    #[test]
    fn test_changed_value_type_is_skipped() {
        let config = ItemConfig::new(ItemId::new(1), ValueType::Unsigned);
        let (p, _, _) = run_one(float_sync_value(1, 100, 1.0), config, None);
        assert!(p.skip);
    }

    #[test]
    fn test_as_is_clears_delta_tracking() {
        let config = ItemConfig::new(ItemId::new(1), ValueType::Float);
        let (_, outcome, _) = run_one(float_sync_value(1, 100, 1.0), config, None);

        assert_eq!(outcome.deltas.get(&ItemId::new(1)), Some(&None));
    }

    #[test]
    fn test_proxy_forwards_original_values() {
        let events = CollectingEventSink::new();
        let config_cache = InMemoryConfigCache::new();
        let config = ItemConfig::new(ItemId::new(1), ValueType::Float)
            .with_delta(DeltaMode::SpeedPerSecond)
            .with_multiplier(10.0);
        config_cache.insert_item(config.clone());

        let mut pending = vec![PendingValue::new(float_sync_value(1, 100, 3.5))];
        let mut configs = HashMap::new();
        configs.insert(config.item_id, config);

        let outcome = process_items(
            &mut pending,
            &configs,
            &HashMap::new(),
            Role::Proxy,
            &events,
            &config_cache,
        );

        // no delta, no multiplier, no trends
        assert_eq!(pending[0].computed, Some(HistoryValue::Float(3.5)));
        assert!(pending[0].keep_history);
        assert!(!pending[0].keep_trends);
        assert!(outcome.updates.is_empty());
        assert!(outcome.deltas.is_empty());
    }
}
