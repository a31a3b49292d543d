// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Trigger locking, evaluation and notification boundaries.
//!
//! Several syncer workers drain the cache concurrently; the advisory
//! trigger locks ensure no two of them recompute the same trigger. An item
//! whose triggers are busy is not waited on — the engine defers it back to
//! the scheduling queue so one slow item cannot stall a whole batch.
//!
//! The evaluator, event sink and recent-value cache are the remaining
//! collaborators the engine notifies during a flush; each has a no-op and a
//! collecting/in-memory implementation.

use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};

use silo_core::types::{HistoryValue, ItemId, Timespec, TriggerId};

// =============================================================================
// Trigger Locker
// =============================================================================

/// The outcome of a trigger-lock attempt over a batch of items.
#[derive(Debug, Default)]
pub struct LockOutcome {
    /// Items whose triggers were all locked by this call (or that have no
    /// triggers).
    pub free: Vec<ItemId>,
    /// Items with at least one trigger already locked elsewhere.
    pub busy: Vec<ItemId>,
    /// Triggers locked by this call; the caller must unlock them.
    pub locked: Vec<TriggerId>,
}

/// Advisory, cross-syncer trigger locking keyed by trigger id.
pub trait TriggerLocker: Send + Sync {
    /// Tries to lock the triggers of every item in `ids`.
    ///
    /// Locking is all-or-nothing per item: if any of an item's triggers is
    /// already locked, none of its triggers are taken and the item is
    /// reported busy.
    fn try_lock_items(&self, ids: &[ItemId]) -> LockOutcome;

    /// Releases locked triggers.
    fn unlock(&self, triggers: &[TriggerId]);

    /// Releases every lock (full synchronization runs with all other
    /// syncers quiesced).
    fn unlock_all(&self);
}

/// An in-memory trigger locker.
#[derive(Debug, Default)]
pub struct InMemoryTriggerLocker {
    links: RwLock<HashMap<ItemId, Vec<TriggerId>>>,
    locked: Mutex<HashSet<TriggerId>>,
}

impl InMemoryTriggerLocker {
    /// Creates a locker with no item/trigger links.
    pub fn new() -> Self {
        Self::default()
    }

    /// Links an item to a trigger.
    pub fn link(&self, item_id: ItemId, trigger_id: TriggerId) {
        self.links.write().entry(item_id).or_default().push(trigger_id);
    }

    /// Locks a trigger directly (simulating another syncer).
    ///
    /// Returns `false` if it was already locked.
    pub fn lock_trigger(&self, trigger_id: TriggerId) -> bool {
        self.locked.lock().insert(trigger_id)
    }

    /// Returns `true` if the trigger is currently locked.
    pub fn is_locked(&self, trigger_id: TriggerId) -> bool {
        self.locked.lock().contains(&trigger_id)
    }
}

impl TriggerLocker for InMemoryTriggerLocker {
    fn try_lock_items(&self, ids: &[ItemId]) -> LockOutcome {
        let links = self.links.read();
        let mut locked = self.locked.lock();
        let mut outcome = LockOutcome::default();

        for &item_id in ids {
            let triggers = links.get(&item_id).map(Vec::as_slice).unwrap_or(&[]);

            if triggers.iter().any(|t| locked.contains(t)) {
                outcome.busy.push(item_id);
                continue;
            }

            for &trigger in triggers {
                locked.insert(trigger);
                outcome.locked.push(trigger);
            }
            outcome.free.push(item_id);
        }

        outcome
    }

    fn unlock(&self, triggers: &[TriggerId]) {
        let mut locked = self.locked.lock();
        for trigger in triggers {
            locked.remove(trigger);
        }
    }

    fn unlock_all(&self) {
        self.locked.lock().clear();
    }
}

// =============================================================================
// Value Evaluator
// =============================================================================

/// One flushed value handed to the trigger evaluation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedValue {
    /// The item.
    pub item_id: ItemId,
    /// Sample timestamp.
    pub ts: Timespec,
    /// The stored value.
    pub value: HistoryValue,
}

/// The trigger evaluation pipeline, invoked once per flushed batch on the
/// server role.
pub trait ValueEvaluator: Send + Sync {
    /// Recomputes trigger state for a batch of new values.
    fn evaluate(&self, values: &[EvaluatedValue]);
}

/// An evaluator that does nothing.
#[derive(Debug, Default)]
pub struct NoopEvaluator;

impl ValueEvaluator for NoopEvaluator {
    fn evaluate(&self, _values: &[EvaluatedValue]) {}
}

/// An evaluator that records batches, for tests.
#[derive(Debug, Default)]
pub struct CollectingEvaluator {
    batches: Mutex<Vec<Vec<EvaluatedValue>>>,
}

impl CollectingEvaluator {
    /// Creates a new collecting evaluator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of batches evaluated.
    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    /// Returns every evaluated value, flattened.
    pub fn values(&self) -> Vec<EvaluatedValue> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

impl ValueEvaluator for CollectingEvaluator {
    fn evaluate(&self, values: &[EvaluatedValue]) {
        self.batches.lock().push(values.to_vec());
    }
}

// =============================================================================
// Event Sink
// =============================================================================

/// An internal event emitted on item state transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum InternalEvent {
    /// The item became not supported.
    Unsupported {
        /// The item.
        item_id: ItemId,
        /// Transition timestamp.
        ts: Timespec,
        /// The error that made the item unsupported.
        error: String,
    },
    /// The item became supported again.
    Supported {
        /// The item.
        item_id: ItemId,
        /// Transition timestamp.
        ts: Timespec,
    },
}

/// Consumer of internal item state-transition events.
pub trait EventSink: Send + Sync {
    /// The item transitioned into the not-supported state.
    fn item_unsupported(&self, item_id: ItemId, ts: Timespec, error: &str);

    /// The item transitioned back into the normal state.
    fn item_supported(&self, item_id: ItemId, ts: Timespec);
}

/// An event sink that discards events.
#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn item_unsupported(&self, _item_id: ItemId, _ts: Timespec, _error: &str) {}
    fn item_supported(&self, _item_id: ItemId, _ts: Timespec) {}
}

/// An event sink that records events, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<InternalEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded events.
    pub fn events(&self) -> Vec<InternalEvent> {
        self.events.lock().clone()
    }

    /// Returns the number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns `true` if no events were recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for CollectingEventSink {
    fn item_unsupported(&self, item_id: ItemId, ts: Timespec, error: &str) {
        self.events.lock().push(InternalEvent::Unsupported {
            item_id,
            ts,
            error: error.to_string(),
        });
    }

    fn item_supported(&self, item_id: ItemId, ts: Timespec) {
        self.events
            .lock()
            .push(InternalEvent::Supported { item_id, ts });
    }
}

// =============================================================================
// Recent Value Cache
// =============================================================================

/// The latest-value cache, notified with every successfully persisted
/// value so "last value" queries never hit the database.
pub trait RecentValueCache: Send + Sync {
    /// Records a persisted value.
    fn update(&self, item_id: ItemId, ts: Timespec, value: &HistoryValue);
}

/// A recent-value cache that discards updates.
#[derive(Debug, Default)]
pub struct NoopRecentValueCache;

impl RecentValueCache for NoopRecentValueCache {
    fn update(&self, _item_id: ItemId, _ts: Timespec, _value: &HistoryValue) {}
}

/// An in-memory recent-value cache.
#[derive(Debug, Default)]
pub struct InMemoryRecentValueCache {
    values: RwLock<HashMap<ItemId, (Timespec, HistoryValue)>>,
}

impl InMemoryRecentValueCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the latest recorded value of an item.
    pub fn get(&self, item_id: ItemId) -> Option<(Timespec, HistoryValue)> {
        self.values.read().get(&item_id).cloned()
    }
}

impl RecentValueCache for InMemoryRecentValueCache {
    fn update(&self, item_id: ItemId, ts: Timespec, value: &HistoryValue) {
        self.values.write().insert(item_id, (ts, value.clone()));
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_items_without_triggers_are_free() {
        let locker = InMemoryTriggerLocker::new();
        let outcome = locker.try_lock_items(&[ItemId::new(1), ItemId::new(2)]);

        assert_eq!(outcome.free.len(), 2);
        assert!(outcome.busy.is_empty());
        assert!(outcome.locked.is_empty());
    }

    #[test]
    fn test_busy_trigger_defers_item() {
        let locker = InMemoryTriggerLocker::new();
        locker.link(ItemId::new(1), TriggerId::new(10));
        locker.link(ItemId::new(2), TriggerId::new(20));
        assert!(locker.lock_trigger(TriggerId::new(10)));

        let outcome = locker.try_lock_items(&[ItemId::new(1), ItemId::new(2)]);

        assert_eq!(outcome.busy, vec![ItemId::new(1)]);
        assert_eq!(outcome.free, vec![ItemId::new(2)]);
        assert_eq!(outcome.locked, vec![TriggerId::new(20)]);
    }

    #[test]
    fn test_shared_trigger_serializes_items() {
        let locker = InMemoryTriggerLocker::new();
        locker.link(ItemId::new(1), TriggerId::new(10));
        locker.link(ItemId::new(2), TriggerId::new(10));

        let outcome = locker.try_lock_items(&[ItemId::new(1), ItemId::new(2)]);

        // the second item sees the trigger taken by the first
        assert_eq!(outcome.free, vec![ItemId::new(1)]);
        assert_eq!(outcome.busy, vec![ItemId::new(2)]);
    }

    #[test]
    fn test_unlock_releases() {
        let locker = InMemoryTriggerLocker::new();
        locker.link(ItemId::new(1), TriggerId::new(10));

        let outcome = locker.try_lock_items(&[ItemId::new(1)]);
        assert!(locker.is_locked(TriggerId::new(10)));

        locker.unlock(&outcome.locked);
        assert!(!locker.is_locked(TriggerId::new(10)));
    }

    #[test]
    fn test_unlock_all() {
        let locker = InMemoryTriggerLocker::new();
        locker.lock_trigger(TriggerId::new(1));
        locker.lock_trigger(TriggerId::new(2));

        locker.unlock_all();
        assert!(!locker.is_locked(TriggerId::new(1)));
        assert!(!locker.is_locked(TriggerId::new(2)));
    }

    #[test]
    fn test_collecting_event_sink() {
        let sink = CollectingEventSink::new();
        sink.item_unsupported(ItemId::new(1), Timespec::new(5, 0), "boom");
        sink.item_supported(ItemId::new(1), Timespec::new(6, 0));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], InternalEvent::Unsupported { .. }));
        assert!(matches!(events[1], InternalEvent::Supported { .. }));
    }

    #[test]
    fn test_recent_value_cache_keeps_latest() {
        let cache = InMemoryRecentValueCache::new();
        cache.update(ItemId::new(1), Timespec::new(1, 0), &HistoryValue::Float(1.0));
        cache.update(ItemId::new(1), Timespec::new(2, 0), &HistoryValue::Float(2.0));

        let (ts, value) = cache.get(ItemId::new(1)).unwrap();
        assert_eq!(ts.sec, 2);
        assert_eq!(value, HistoryValue::Float(2.0));
    }
}
