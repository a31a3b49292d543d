// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Configuration cache boundary.
//!
//! Resolves item ids to their collection metadata (value type, delta mode,
//! keep flags, last known state) and stores the previous raw value of
//! delta-mode items. The previous-raw-value map is read once at the start
//! of a flush pass and written back once at its end; the engine never keeps
//! a standing copy.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use silo_core::types::{HistoryValue, ItemConfig, ItemId, ItemState, Timespec};

// =============================================================================
// Delta Values
// =============================================================================

/// The last raw value and timestamp of a delta-mode item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaValue {
    /// Timestamp of the raw sample.
    pub ts: Timespec,
    /// The raw (pre-delta) value.
    pub value: HistoryValue,
}

// =============================================================================
// Config Cache Trait
// =============================================================================

/// The external configuration cache, specified at its interface boundary.
pub trait ConfigCache: Send + Sync {
    /// Resolves item configurations; the result aligns with `ids`, `None`
    /// marking items unknown to the configuration.
    fn get_items(&self, ids: &[ItemId]) -> Vec<Option<ItemConfig>>;

    /// Records an item's last known state and error string.
    fn set_item_state(&self, item_id: ItemId, state: ItemState, error: &str);

    /// Reads the previous raw values of delta-mode items.
    fn delta_values(&self, ids: &[ItemId]) -> HashMap<ItemId, DeltaValue>;

    /// Writes back the previous raw values after a pass; `None` removes
    /// the stored value.
    fn set_delta_values(&self, values: HashMap<ItemId, Option<DeltaValue>>);
}

// =============================================================================
// In-Memory Implementation
// =============================================================================

/// An in-memory configuration cache.
#[derive(Debug, Default)]
pub struct InMemoryConfigCache {
    items: RwLock<HashMap<ItemId, ItemConfig>>,
    deltas: RwLock<HashMap<ItemId, DeltaValue>>,
}

impl InMemoryConfigCache {
    /// Creates an empty configuration cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an item configuration.
    pub fn insert_item(&self, config: ItemConfig) {
        self.items.write().insert(config.item_id, config);
    }

    /// Returns an item configuration.
    pub fn get_item(&self, item_id: ItemId) -> Option<ItemConfig> {
        self.items.read().get(&item_id).cloned()
    }

    /// Returns the stored previous raw value of an item.
    pub fn get_delta_value(&self, item_id: ItemId) -> Option<DeltaValue> {
        self.deltas.read().get(&item_id).cloned()
    }
}

impl ConfigCache for InMemoryConfigCache {
    fn get_items(&self, ids: &[ItemId]) -> Vec<Option<ItemConfig>> {
        let items = self.items.read();
        ids.iter().map(|id| items.get(id).cloned()).collect()
    }

    fn set_item_state(&self, item_id: ItemId, state: ItemState, error: &str) {
        let mut items = self.items.write();
        if let Some(config) = items.get_mut(&item_id) {
            config.state = state;
            config.error = error.to_string();
        }
    }

    fn delta_values(&self, ids: &[ItemId]) -> HashMap<ItemId, DeltaValue> {
        let deltas = self.deltas.read();
        ids.iter()
            .filter_map(|id| deltas.get(id).map(|d| (*id, d.clone())))
            .collect()
    }

    fn set_delta_values(&self, values: HashMap<ItemId, Option<DeltaValue>>) {
        let mut deltas = self.deltas.write();
        for (item_id, value) in values {
            match value {
                Some(value) => {
                    deltas.insert(item_id, value);
                }
                None => {
                    deltas.remove(&item_id);
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use silo_core::types::ValueType;

    #[test]
    fn test_get_items_aligns_with_ids() {
        let cache = InMemoryConfigCache::new();
        cache.insert_item(ItemConfig::new(ItemId::new(1), ValueType::Float));

        let configs = cache.get_items(&[ItemId::new(2), ItemId::new(1)]);
        assert!(configs[0].is_none());
        assert_eq!(configs[1].as_ref().unwrap().item_id, ItemId::new(1));
    }

    #[test]
    fn test_set_item_state() {
        let cache = InMemoryConfigCache::new();
        cache.insert_item(ItemConfig::new(ItemId::new(1), ValueType::Float));

        cache.set_item_state(ItemId::new(1), ItemState::NotSupported, "bad value");

        let config = cache.get_item(ItemId::new(1)).unwrap();
        assert_eq!(config.state, ItemState::NotSupported);
        assert_eq!(config.error, "bad value");
    }

    #[test]
    fn test_delta_round_trip() {
        let cache = InMemoryConfigCache::new();
        let item = ItemId::new(5);

        let mut updates = HashMap::new();
        updates.insert(
            item,
            Some(DeltaValue {
                ts: Timespec::new(100, 0),
                value: HistoryValue::Unsigned(42),
            }),
        );
        cache.set_delta_values(updates);

        let read = cache.delta_values(&[item]);
        assert_eq!(read.get(&item).unwrap().value, HistoryValue::Unsigned(42));

        // None removes
        let mut updates = HashMap::new();
        updates.insert(item, None);
        cache.set_delta_values(updates);
        assert!(cache.delta_values(&[item]).is_empty());
    }
}
