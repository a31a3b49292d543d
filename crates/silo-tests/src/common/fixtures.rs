// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Pre-built test data.

use silo_core::types::{DeltaMode, ItemConfig, ItemId, Timespec, ValueType};

/// Shorthand for a whole-second timestamp.
pub fn ts(sec: i64) -> Timespec {
    Timespec::new(sec, 0)
}

/// A float item with history and trends kept.
pub fn float_item(id: u64) -> ItemConfig {
    ItemConfig::new(ItemId::new(id), ValueType::Float)
}

/// An unsigned item with history and trends kept.
pub fn unsigned_item(id: u64) -> ItemConfig {
    ItemConfig::new(ItemId::new(id), ValueType::Unsigned)
}

/// An unsigned counter item stored as a per-second rate.
pub fn speed_item(id: u64) -> ItemConfig {
    ItemConfig::new(ItemId::new(id), ValueType::Unsigned).with_delta(DeltaMode::SpeedPerSecond)
}

/// A text item.
pub fn text_item(id: u64) -> ItemConfig {
    ItemConfig::new(ItemId::new(id), ValueType::Text)
}

/// A log item.
pub fn log_item(id: u64) -> ItemConfig {
    ItemConfig::new(ItemId::new(id), ValueType::Log)
}
