// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Core data types for SILO.
//!
//! This module provides the data model shared by the cache and the
//! synchronization engine: item identifiers, the database timestamp type,
//! the value payload sum type, and the per-item configuration resolved from
//! the external configuration cache.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// A unique identifier for a monitored item (one metric).
///
/// Item ids are assigned by the database and are stable for the lifetime of
/// the item.
///
/// # Examples
///
/// ```
/// use silo_core::types::ItemId;
///
/// let id = ItemId::new(1001);
/// assert_eq!(id.as_u64(), 1001);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(u64);

impl ItemId {
    /// Creates a new item id.
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ItemId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A unique identifier for a trigger.
///
/// Triggers are conditions over one or more items; the synchronization
/// engine locks them while recomputing so that two syncers never evaluate
/// the same trigger concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(u64);

impl TriggerId {
    /// Creates a new trigger id.
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TriggerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// =============================================================================
// Timespec
// =============================================================================

/// A sample timestamp: database epoch seconds plus nanoseconds.
///
/// Collectors may deliver samples without sub-second resolution; those carry
/// `ns < 0` until the cache backfills a synthetic, monotonically increasing
/// nanosecond part so that per-item ordering stays total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timespec {
    /// Seconds since the epoch.
    pub sec: i64,
    /// Nanosecond part; negative means "not assigned yet".
    pub ns: i32,
}

impl Timespec {
    /// Creates a new timestamp.
    #[inline]
    pub const fn new(sec: i64, ns: i32) -> Self {
        Self { sec, ns }
    }

    /// Returns the start of the hour containing this timestamp.
    #[inline]
    pub const fn hour_floor(&self) -> i64 {
        self.sec - self.sec.rem_euclid(3600)
    }

    /// Returns the end (exclusive) of the hour containing this timestamp.
    #[inline]
    pub const fn hour_end(&self) -> i64 {
        self.hour_floor() + 3600
    }

    /// Returns the elapsed time since `earlier` in fractional seconds.
    pub fn elapsed_secs(&self, earlier: &Timespec) -> f64 {
        (self.sec - earlier.sec) as f64 + (self.ns - earlier.ns) as f64 / 1_000_000_000.0
    }

    /// Returns `true` if the nanosecond part has been assigned.
    #[inline]
    pub const fn has_ns(&self) -> bool {
        self.ns >= 0
    }
}

impl PartialOrd for Timespec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timespec {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sec.cmp(&other.sec).then(self.ns.cmp(&other.ns))
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.ns.max(0))
    }
}

// =============================================================================
// Value Types
// =============================================================================

/// The value type configured for an item.
///
/// Each value type has its own history destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// 64-bit floating point values.
    Float,
    /// 64-bit unsigned integer values.
    Unsigned,
    /// Short character values.
    Character,
    /// Free-form text values.
    Text,
    /// Log records.
    Log,
}

impl ValueType {
    /// Returns the value type name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Float => "float",
            ValueType::Unsigned => "unsigned",
            ValueType::Character => "character",
            ValueType::Text => "text",
            ValueType::Log => "log",
        }
    }

    /// Returns the name of the history table this value type is stored in.
    pub fn history_table(&self) -> &'static str {
        match self {
            ValueType::Float => "history",
            ValueType::Unsigned => "history_uint",
            ValueType::Character => "history_str",
            ValueType::Text => "history_text",
            ValueType::Log => "history_log",
        }
    }

    /// Returns `true` for value types that participate in trend rollups.
    #[inline]
    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueType::Float | ValueType::Unsigned)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A log record payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogValue {
    /// The log line itself.
    pub value: String,
    /// Log source (event log name, file name), if any.
    pub source: Option<String>,
    /// Timestamp extracted from the log entry.
    pub timestamp: i64,
    /// Severity extracted from the log entry.
    pub severity: i32,
    /// Event id extracted from the log entry.
    pub event_id: i64,
}

impl LogValue {
    /// Creates a log value with no extracted metadata.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            source: None,
            timestamp: 0,
            severity: 0,
            event_id: 0,
        }
    }
}

/// A collected value payload.
///
/// This is the type-safe replacement for the side-band tagged union the
/// original wire format uses: every use site must handle each variant
/// explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum HistoryValue {
    /// A floating point sample.
    Float(f64),
    /// An unsigned integer sample.
    Unsigned(u64),
    /// A character or text sample.
    Text(String),
    /// A log record sample.
    Log(LogValue),
}

impl HistoryValue {
    /// Attempts to read this value as a float.
    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            HistoryValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Attempts to read this value as an unsigned integer.
    #[inline]
    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            HistoryValue::Unsigned(v) => Some(*v),
            _ => None,
        }
    }

    /// Attempts to read this value as text.
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HistoryValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Attempts to read this value as a log record.
    #[inline]
    pub fn as_log(&self) -> Option<&LogValue> {
        match self {
            HistoryValue::Log(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the variant name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            HistoryValue::Float(_) => "float",
            HistoryValue::Unsigned(_) => "unsigned",
            HistoryValue::Text(_) => "text",
            HistoryValue::Log(_) => "log",
        }
    }
}

impl From<f64> for HistoryValue {
    fn from(v: f64) -> Self {
        HistoryValue::Float(v)
    }
}

impl From<u64> for HistoryValue {
    fn from(v: u64) -> Self {
        HistoryValue::Unsigned(v)
    }
}

impl From<&str> for HistoryValue {
    fn from(v: &str) -> Self {
        HistoryValue::Text(v.to_string())
    }
}

// =============================================================================
// Sample Flags & Meta Information
// =============================================================================

/// Flags attached to a collected sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SampleFlags {
    /// The sample carries log meta information (size, mtime).
    pub meta: bool,
    /// The sample carries no value payload (meta only).
    pub no_value: bool,
    /// The sample belongs to a discovery rule and bypasses the cache.
    pub discovery: bool,
    /// The computed value is undefined (delta precondition failed,
    /// conversion failed or the item is gone); excluded from history,
    /// trends and trigger evaluation.
    pub undefined: bool,
}

impl SampleFlags {
    /// Flags for a plain value sample.
    pub const fn none() -> Self {
        Self {
            meta: false,
            no_value: false,
            discovery: false,
            undefined: false,
        }
    }

    /// Flags for a meta-only sample (no value payload).
    pub const fn meta_only() -> Self {
        Self {
            meta: true,
            no_value: true,
            discovery: false,
            undefined: false,
        }
    }

    /// Returns `true` if the sample carries a value payload.
    #[inline]
    pub const fn has_value(&self) -> bool {
        !self.no_value
    }
}

/// Log meta information carried by meta-flagged samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetaInfo {
    /// Size of the monitored log at collection time.
    pub log_size: u64,
    /// Modification time of the monitored log.
    pub mtime: i32,
}

// =============================================================================
// Item State & Delta Mode
// =============================================================================

/// The collection state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// The item is collected and converted normally.
    #[default]
    Normal,
    /// The latest collection or conversion failed; carries an error string.
    NotSupported,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Normal => write!(f, "normal"),
            ItemState::NotSupported => write!(f, "not supported"),
        }
    }
}

/// Per-item delta mode: how raw counter values are turned into stored values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaMode {
    /// Store the raw value (after the optional multiplier).
    #[default]
    AsIs,
    /// Store `(current - previous) / elapsed_seconds`.
    SpeedPerSecond,
    /// Store `current - previous`.
    SimpleChange,
}

/// Deployment role of the synchronization engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full processing: history, trends, triggers, events.
    #[default]
    Server,
    /// Forwarding only: raw history and item meta updates.
    Proxy,
}

impl Role {
    /// Returns `true` for the server role.
    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, Role::Server)
    }
}

// =============================================================================
// Item Configuration
// =============================================================================

/// Per-item metadata resolved from the external configuration cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemConfig {
    /// The item id.
    pub item_id: ItemId,
    /// Configured value type.
    pub value_type: ValueType,
    /// Delta mode for numeric items.
    pub delta: DeltaMode,
    /// Optional multiplier applied to computed numeric values.
    pub multiplier: Option<f64>,
    /// Whether raw history is kept for this item.
    pub keep_history: bool,
    /// Whether hourly trends are kept for this item.
    pub keep_trends: bool,
    /// Whether the item's host is monitored.
    pub host_monitored: bool,
    /// Last known collection state.
    pub state: ItemState,
    /// Last known error string (empty when supported).
    pub error: String,
}

impl ItemConfig {
    /// Creates an item configuration with defaults: as-is delta, history and
    /// trends kept, host monitored, normal state.
    pub fn new(item_id: ItemId, value_type: ValueType) -> Self {
        Self {
            item_id,
            value_type,
            delta: DeltaMode::AsIs,
            multiplier: None,
            keep_history: true,
            keep_trends: value_type.is_numeric(),
            host_monitored: true,
            state: ItemState::Normal,
            error: String::new(),
        }
    }

    /// Sets the delta mode.
    pub fn with_delta(mut self, delta: DeltaMode) -> Self {
        self.delta = delta;
        self
    }

    /// Sets the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Disables history for this item.
    pub fn without_history(mut self) -> Self {
        self.keep_history = false;
        self
    }

    /// Disables trends for this item.
    pub fn without_trends(mut self) -> Self {
        self.keep_trends = false;
        self
    }
}

// =============================================================================
// Buffered Value
// =============================================================================

/// One collected sample as stored in the value arena, awaiting flush.
///
/// The item id is not stored here: a buffered value always lives on exactly
/// one item's FIFO chain, and the chain carries the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedValue {
    /// Sample timestamp (nanoseconds backfilled on entry to the cache).
    pub ts: Timespec,
    /// The value type the sample was collected as.
    pub value_type: ValueType,
    /// Sample flags.
    pub flags: SampleFlags,
    /// Item state the sample was collected in.
    pub state: ItemState,
    /// The value payload; `None` for meta-only and not-supported samples.
    pub value: Option<HistoryValue>,
    /// Log meta information, present when `flags.meta` is set.
    pub meta: Option<MetaInfo>,
    /// The error string of a not-supported sample.
    pub error: Option<String>,
}

impl BufferedValue {
    /// Returns `true` if this sample carries a usable value payload.
    #[inline]
    pub fn has_value(&self) -> bool {
        self.value.is_some() && self.flags.has_value() && self.state == ItemState::Normal
    }
}

// =============================================================================
// Tests
// =============================================================================
