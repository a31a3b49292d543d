// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Database layer boundary.
//!
//! The engine talks to the relational database through the [`Database`]
//! trait: one transaction per flushed batch, bulk inserts into the
//! per-value-type history tables, item metadata updates, and the
//! select/insert/update trio the trend merge protocol needs. The concrete
//! SQL dialect and connection handling live behind this boundary and are
//! assumed to retry transient connectivity loss internally; the engine only
//! reacts at transaction granularity.
//!
//! [`MockDatabase`] is the in-memory implementation used by the test
//! suites: it models transactions with a write buffer, records call
//! counts, and supports one-shot failure injection.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use silo_core::error::DbError;
use silo_core::types::{HistoryValue, ItemId, ItemState, MetaInfo, Timespec, ValueType};

// =============================================================================
// Tables
// =============================================================================

/// History destination tables, one per value type plus the proxy staging
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryTable {
    /// Float samples.
    Float,
    /// Unsigned samples.
    Unsigned,
    /// Character samples.
    Character,
    /// Text samples.
    Text,
    /// Log samples.
    Log,
    /// Raw samples awaiting upload, proxy role only.
    Proxy,
}

impl HistoryTable {
    /// Returns the table name.
    pub fn name(&self) -> &'static str {
        match self {
            HistoryTable::Float => "history",
            HistoryTable::Unsigned => "history_uint",
            HistoryTable::Character => "history_str",
            HistoryTable::Text => "history_text",
            HistoryTable::Log => "history_log",
            HistoryTable::Proxy => "proxy_history",
        }
    }

    /// Returns the history table for a value type.
    pub fn for_value_type(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Float => HistoryTable::Float,
            ValueType::Unsigned => HistoryTable::Unsigned,
            ValueType::Character => HistoryTable::Character,
            ValueType::Text => HistoryTable::Text,
            ValueType::Log => HistoryTable::Log,
        }
    }
}

/// Trend destination tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendTable {
    /// Float trends.
    Float,
    /// Unsigned trends.
    Unsigned,
}

impl TrendTable {
    /// Returns the table name.
    pub fn name(&self) -> &'static str {
        match self {
            TrendTable::Float => "trends",
            TrendTable::Unsigned => "trends_uint",
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

/// One raw history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    /// The sampled item.
    pub item_id: ItemId,
    /// Sample timestamp.
    pub ts: Timespec,
    /// The stored value; log rows carry their source/severity inline.
    pub value: HistoryValue,
}

/// One item metadata update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemUpdate {
    /// The item.
    pub item_id: ItemId,
    /// Timestamp of the processed sample.
    pub last_ts: Timespec,
    /// New last value, when one was computed.
    pub last_value: Option<HistoryValue>,
    /// New previous-raw-value column for delta items; `None` clears it.
    pub prev_raw: Option<HistoryValue>,
    /// State transition, when one happened.
    pub state: Option<ItemState>,
    /// Error string change, when one happened.
    pub error: Option<String>,
    /// Log meta update, when the sample carried one.
    pub meta: Option<MetaInfo>,
}

impl ItemUpdate {
    /// Creates an update carrying only the sample timestamp.
    pub fn new(item_id: ItemId, last_ts: Timespec) -> Self {
        Self {
            item_id,
            last_ts,
            last_value: None,
            prev_raw: None,
            state: None,
            error: None,
            meta: None,
        }
    }
}

/// The min/avg/max of one trend row, by table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrendRowValue {
    /// Float trend columns.
    Float {
        /// Minimum.
        min: f64,
        /// Average.
        avg: f64,
        /// Maximum.
        max: f64,
    },
    /// Unsigned trend columns.
    Unsigned {
        /// Minimum.
        min: u64,
        /// Average.
        avg: u64,
        /// Maximum.
        max: u64,
    },
}

/// One persisted trend row (item, hour).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendRow {
    /// The aggregated item.
    pub item_id: ItemId,
    /// Hour-aligned clock.
    pub clock: i64,
    /// Sample count.
    pub num: u32,
    /// Min/avg/max columns.
    pub value: TrendRowValue,
}

// =============================================================================
// Database Trait
// =============================================================================

/// The transactional boundary to the relational database.
#[async_trait]
pub trait Database: Send + Sync {
    /// Opens a transaction.
    async fn begin(&self) -> Result<(), DbError>;

    /// Commits the open transaction.
    async fn commit(&self) -> Result<(), DbError>;

    /// Rolls back the open transaction.
    async fn rollback(&self) -> Result<(), DbError>;

    /// Bulk-inserts history rows into a table.
    async fn insert_history(
        &self,
        table: HistoryTable,
        rows: &[HistoryRow],
    ) -> Result<(), DbError>;

    /// Applies item metadata updates.
    async fn update_items(&self, updates: &[ItemUpdate]) -> Result<(), DbError>;

    /// Returns the subset of `items` that have at least one trend row with
    /// `clock >= clock_from` (the merge existence check).
    async fn select_trend_itemids(
        &self,
        table: TrendTable,
        clock_from: i64,
        items: &[ItemId],
    ) -> Result<Vec<ItemId>, DbError>;

    /// Reads the trend rows of `items` at exactly `clock`.
    async fn select_trends(
        &self,
        table: TrendTable,
        clock: i64,
        items: &[ItemId],
    ) -> Result<Vec<TrendRow>, DbError>;

    /// Inserts new trend rows.
    async fn insert_trends(&self, table: TrendTable, rows: &[TrendRow]) -> Result<(), DbError>;

    /// Updates existing trend rows.
    async fn update_trends(&self, table: TrendTable, rows: &[TrendRow]) -> Result<(), DbError>;
}

// =============================================================================
// Mock Database
// =============================================================================

#[derive(Debug, Default)]
struct TxBuffer {
    history: Vec<(HistoryTable, HistoryRow)>,
    item_updates: Vec<ItemUpdate>,
    trend_inserts: Vec<(TrendTable, TrendRow)>,
    trend_updates: Vec<(TrendTable, TrendRow)>,
}

#[derive(Debug, Default)]
struct MockState {
    in_tx: bool,
    tx: TxBuffer,
    history: HashMap<HistoryTable, Vec<HistoryRow>>,
    item_updates: Vec<ItemUpdate>,
    trends: HashMap<(TrendTable, ItemId, i64), TrendRow>,

    fail_next_begin: bool,
    fail_next_commit: bool,
    fail_next_insert: bool,

    begins: u64,
    commits: u64,
    rollbacks: u64,
    existence_checks: u64,
}

/// An in-memory database for testing.
///
/// Writes accumulate in a transaction buffer and become visible on commit;
/// reads see committed data plus the open transaction's own writes.
#[derive(Debug, Default)]
pub struct MockDatabase {
    state: Mutex<MockState>,
}

impl MockDatabase {
    /// Creates an empty mock database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the committed rows of a history table.
    pub fn history_rows(&self, table: HistoryTable) -> Vec<HistoryRow> {
        self.state
            .lock()
            .history
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the committed row count across all history tables.
    pub fn history_total(&self) -> usize {
        self.state.lock().history.values().map(Vec::len).sum()
    }

    /// Returns a committed trend row.
    pub fn trend(&self, table: TrendTable, item_id: ItemId, clock: i64) -> Option<TrendRow> {
        self.state.lock().trends.get(&(table, item_id, clock)).cloned()
    }

    /// Returns every committed item update, in application order.
    pub fn item_updates(&self) -> Vec<ItemUpdate> {
        self.state.lock().item_updates.clone()
    }

    /// Seeds a committed trend row.
    pub fn seed_trend(&self, table: TrendTable, row: TrendRow) {
        let mut state = self.state.lock();
        state.trends.insert((table, row.item_id, row.clock), row);
    }

    /// Makes the next `begin` fail.
    pub fn fail_next_begin(&self) {
        self.state.lock().fail_next_begin = true;
    }

    /// Makes the next `commit` fail (the transaction is lost).
    pub fn fail_next_commit(&self) {
        self.state.lock().fail_next_commit = true;
    }

    /// Makes the next `insert_history` fail.
    pub fn fail_next_insert(&self) {
        self.state.lock().fail_next_insert = true;
    }

    /// Returns the number of opened transactions.
    pub fn begin_count(&self) -> u64 {
        self.state.lock().begins
    }

    /// Returns the number of committed transactions.
    pub fn commit_count(&self) -> u64 {
        self.state.lock().commits
    }

    /// Returns the number of rolled-back transactions.
    pub fn rollback_count(&self) -> u64 {
        self.state.lock().rollbacks
    }

    /// Returns the number of trend existence-check queries issued.
    pub fn existence_check_count(&self) -> u64 {
        self.state.lock().existence_checks
    }
}

#[async_trait]
impl Database for MockDatabase {
    async fn begin(&self) -> Result<(), DbError> {
        let mut state = self.state.lock();
        if state.fail_next_begin {
            state.fail_next_begin = false;
            return Err(DbError::unavailable("injected begin failure"));
        }
        state.in_tx = true;
        state.tx = TxBuffer::default();
        state.begins += 1;
        Ok(())
    }

    async fn commit(&self) -> Result<(), DbError> {
        let mut state = self.state.lock();
        if !state.in_tx {
            return Err(DbError::NoTransaction { operation: "commit" });
        }
        if state.fail_next_commit {
            state.fail_next_commit = false;
            state.in_tx = false;
            state.tx = TxBuffer::default();
            return Err(DbError::unavailable("injected commit failure"));
        }

        let tx = std::mem::take(&mut state.tx);
        for (table, row) in tx.history {
            state.history.entry(table).or_default().push(row);
        }
        state.item_updates.extend(tx.item_updates);
        for (table, row) in tx.trend_inserts {
            state.trends.insert((table, row.item_id, row.clock), row);
        }
        for (table, row) in tx.trend_updates {
            state.trends.insert((table, row.item_id, row.clock), row);
        }

        state.in_tx = false;
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DbError> {
        let mut state = self.state.lock();
        state.tx = TxBuffer::default();
        state.in_tx = false;
        state.rollbacks += 1;
        Ok(())
    }

    async fn insert_history(
        &self,
        table: HistoryTable,
        rows: &[HistoryRow],
    ) -> Result<(), DbError> {
        let mut state = self.state.lock();
        if !state.in_tx {
            return Err(DbError::NoTransaction {
                operation: "insert_history",
            });
        }
        if state.fail_next_insert {
            state.fail_next_insert = false;
            return Err(DbError::query("injected insert failure"));
        }
        state
            .tx
            .history
            .extend(rows.iter().cloned().map(|row| (table, row)));
        Ok(())
    }

    async fn update_items(&self, updates: &[ItemUpdate]) -> Result<(), DbError> {
        let mut state = self.state.lock();
        if !state.in_tx {
            return Err(DbError::NoTransaction {
                operation: "update_items",
            });
        }
        state.tx.item_updates.extend(updates.iter().cloned());
        Ok(())
    }

    async fn select_trend_itemids(
        &self,
        table: TrendTable,
        clock_from: i64,
        items: &[ItemId],
    ) -> Result<Vec<ItemId>, DbError> {
        let mut state = self.state.lock();
        state.existence_checks += 1;

        let mut found: Vec<ItemId> = items
            .iter()
            .copied()
            .filter(|item| {
                state
                    .trends
                    .iter()
                    .any(|((t, i, clock), _)| *t == table && i == item && *clock >= clock_from)
                    || state.tx.trend_inserts.iter().any(|(t, row)| {
                        *t == table && row.item_id == *item && row.clock >= clock_from
                    })
            })
            .collect();
        found.dedup();
        Ok(found)
    }

    async fn select_trends(
        &self,
        table: TrendTable,
        clock: i64,
        items: &[ItemId],
    ) -> Result<Vec<TrendRow>, DbError> {
        let state = self.state.lock();

        let rows = items
            .iter()
            .filter_map(|item| {
                state
                    .tx
                    .trend_inserts
                    .iter()
                    .chain(state.tx.trend_updates.iter())
                    .rev()
                    .find(|(t, row)| *t == table && row.item_id == *item && row.clock == clock)
                    .map(|(_, row)| row.clone())
                    .or_else(|| state.trends.get(&(table, *item, clock)).cloned())
            })
            .collect();
        Ok(rows)
    }

    async fn insert_trends(&self, table: TrendTable, rows: &[TrendRow]) -> Result<(), DbError> {
        let mut state = self.state.lock();
        if !state.in_tx {
            return Err(DbError::NoTransaction {
                operation: "insert_trends",
            });
        }
        state
            .tx
            .trend_inserts
            .extend(rows.iter().cloned().map(|row| (table, row)));
        Ok(())
    }

    async fn update_trends(&self, table: TrendTable, rows: &[TrendRow]) -> Result<(), DbError> {
        let mut state = self.state.lock();
        if !state.in_tx {
            return Err(DbError::NoTransaction {
                operation: "update_trends",
            });
        }
        state
            .tx
            .trend_updates
            .extend(rows.iter().cloned().map(|row| (table, row)));
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn float_row(item: u64, sec: i64, value: f64) -> HistoryRow {
        HistoryRow {
            item_id: ItemId::new(item),
            ts: Timespec::new(sec, 0),
            value: HistoryValue::Float(value),
        }
    }

    fn trend_row(item: u64, clock: i64, num: u32, avg: f64) -> TrendRow {
        TrendRow {
            item_id: ItemId::new(item),
            clock,
            num,
            value: TrendRowValue::Float {
                min: avg,
                avg,
                max: avg,
            },
        }
    }

    #[test]
    fn test_table_names() {
        assert_eq!(HistoryTable::Float.name(), "history");
        assert_eq!(HistoryTable::Proxy.name(), "proxy_history");
        assert_eq!(TrendTable::Unsigned.name(), "trends_uint");
        assert_eq!(
            HistoryTable::for_value_type(ValueType::Log),
            HistoryTable::Log
        );
    }

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let db = MockDatabase::new();

        db.begin().await.unwrap();
        db.insert_history(HistoryTable::Float, &[float_row(1, 100, 1.0)])
            .await
            .unwrap();
        assert_eq!(db.history_total(), 0);

        db.commit().await.unwrap();
        assert_eq!(db.history_total(), 1);
        assert_eq!(db.history_rows(HistoryTable::Float)[0].item_id, ItemId::new(1));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let db = MockDatabase::new();

        db.begin().await.unwrap();
        db.insert_history(HistoryTable::Float, &[float_row(1, 100, 1.0)])
            .await
            .unwrap();
        db.rollback().await.unwrap();

        assert_eq!(db.history_total(), 0);
        assert_eq!(db.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_operations_require_transaction() {
        let db = MockDatabase::new();
        let err = db
            .insert_history(HistoryTable::Float, &[float_row(1, 100, 1.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NoTransaction { .. }));
    }

    #[tokio::test]
    async fn test_commit_failure_loses_transaction() {
        let db = MockDatabase::new();
        db.fail_next_commit();

        db.begin().await.unwrap();
        db.insert_history(HistoryTable::Float, &[float_row(1, 100, 1.0)])
            .await
            .unwrap();
        assert!(db.commit().await.is_err());
        assert_eq!(db.history_total(), 0);

        // next transaction works again
        db.begin().await.unwrap();
        db.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_trend_existence_check() {
        let db = MockDatabase::new();
        db.seed_trend(TrendTable::Float, trend_row(1, 3600, 2, 5.0));

        let found = db
            .select_trend_itemids(
                TrendTable::Float,
                3600,
                &[ItemId::new(1), ItemId::new(2)],
            )
            .await
            .unwrap();
        assert_eq!(found, vec![ItemId::new(1)]);

        // rows strictly before clock_from do not count
        let found = db
            .select_trend_itemids(TrendTable::Float, 7200, &[ItemId::new(1)])
            .await
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(db.existence_check_count(), 2);
    }

    #[tokio::test]
    async fn test_select_trends_sees_own_transaction() {
        let db = MockDatabase::new();

        db.begin().await.unwrap();
        db.insert_trends(TrendTable::Float, &[trend_row(1, 3600, 2, 5.0)])
            .await
            .unwrap();

        let rows = db
            .select_trends(TrendTable::Float, 3600, &[ItemId::new(1)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].num, 2);
    }

    #[tokio::test]
    async fn test_trend_update_replaces_row() {
        let db = MockDatabase::new();
        db.seed_trend(TrendTable::Float, trend_row(1, 3600, 2, 5.0));

        db.begin().await.unwrap();
        db.update_trends(TrendTable::Float, &[trend_row(1, 3600, 5, 6.0)])
            .await
            .unwrap();
        db.commit().await.unwrap();

        let row = db.trend(TrendTable::Float, ItemId::new(1), 3600).unwrap();
        assert_eq!(row.num, 5);
    }
}
