// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The synchronization engine.
//!
//! Each pass runs the same state machine: select a batch of items
//! oldest-first from the cache, lock their triggers (server role), flush
//! the batch in one database transaction (item metadata updates, bulk
//! history inserts, trend accumulation, trigger evaluation), then release
//! the flushed values and unlock the triggers.
//!
//! Incremental synchronization is soft-bounded: it stops after its time
//! budget, when the queue drains, or when too small a fraction of the
//! candidates could be processed — that means most items are trigger-locked
//! by other syncers and spinning on them would only add contention. A full
//! synchronization runs until the cache is empty and is used at shutdown
//! and for deliberate resynchronization.
//!
//! A failed transaction rolls back and requeues the whole batch unreleased;
//! item-level data errors never abort a batch.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use silo_core::clock::{Clock, SystemClock};
use silo_core::error::SyncError;
use silo_core::types::{ItemConfig, ItemId, ItemState, Role, TriggerId};

use silo_cache::cache::{HistoryCache, SyncValue};
use silo_cache::trends::{TrendAggregate, TrendCache, TrendValue};

use crate::config::SyncConfig;
use crate::config_cache::{ConfigCache, InMemoryConfigCache};
use crate::db::{Database, HistoryRow, HistoryTable, TrendRow, TrendRowValue, TrendTable};
use crate::meta::{self, PendingValue};
use crate::triggers::{
    EvaluatedValue, EventSink, InMemoryTriggerLocker, NoopEvaluator, NoopEventSink,
    NoopRecentValueCache, RecentValueCache, TriggerLocker, ValueEvaluator,
};

// =============================================================================
// Sync Mode
// =============================================================================

/// Synchronization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Bounded pass under the time budget and progress policy.
    Incremental,
    /// Drain the cache completely; used at shutdown and for deliberate
    /// full resynchronization.
    Full,
}

// =============================================================================
// Sync Engine
// =============================================================================

/// The synchronization engine, one instance per syncer worker.
pub struct SyncEngine {
    cache: Arc<HistoryCache>,
    trends: Arc<TrendCache>,
    db: Arc<dyn Database>,
    items: Arc<dyn ConfigCache>,
    triggers: Arc<dyn TriggerLocker>,
    evaluator: Arc<dyn ValueEvaluator>,
    events: Arc<dyn EventSink>,
    recent: Arc<dyn RecentValueCache>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SyncEngine {
    /// Creates an engine builder.
    pub fn builder(
        cache: Arc<HistoryCache>,
        trends: Arc<TrendCache>,
        db: Arc<dyn Database>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            cache,
            trends,
            db,
            items: None,
            triggers: None,
            evaluator: None,
            events: None,
            recent: None,
            clock: None,
            config: SyncConfig::default(),
        }
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // =========================================================================
    // History Synchronization
    // =========================================================================

    /// Runs one synchronization and returns the number of values flushed.
    pub async fn synchronize(&self, mode: SyncMode) -> Result<u64, SyncError> {
        let full = mode == SyncMode::Full;

        if full {
            if self.config.role.is_server() {
                self.triggers.unlock_all();
            }
            self.cache.begin_full_sync();
            info!("syncing history data...");
        }

        let result = self.sync_loop(full).await;

        if full {
            self.cache.end_full_sync();
            if result.is_ok() {
                info!("syncing history data done");
            }
        }

        result
    }

    /// Flushes every buffered value and every live trend aggregate; used
    /// at shutdown.
    pub async fn sync_all(&self) -> Result<u64, SyncError> {
        let flushed = self.synchronize(SyncMode::Full).await?;
        self.sync_trends().await?;
        Ok(flushed)
    }

    async fn sync_loop(&self, full: bool) -> Result<u64, SyncError> {
        let mut total = 0u64;
        let start = self.clock.now();
        let mut last_report = start.sec;

        loop {
            let mut locked_triggers: Vec<TriggerId> = Vec::new();
            let server = self.config.role.is_server();

            let batch = self.cache.checkout_batch(self.config.batch_max, |ids| {
                if server && !ids.is_empty() {
                    let outcome = self.triggers.try_lock_items(ids);
                    locked_triggers = outcome.locked;
                    outcome.busy
                } else {
                    Vec::new()
                }
            });

            let candidate_num = batch.candidate_num;
            let processed_num = batch.values.len();

            if processed_num == 0 {
                self.triggers.unlock(&locked_triggers);
                if full && candidate_num > 0 {
                    warn!(
                        candidates = candidate_num,
                        "all candidates trigger-locked during full sync, this should never happen"
                    );
                }
                break;
            }

            let ids: Vec<ItemId> = batch.values.iter().map(|v| v.item_id).collect();

            match self.flush_batch(batch.values).await {
                Ok(()) => {
                    let watermark = self.cache.finish_batch(&ids);
                    self.triggers.unlock(&locked_triggers);
                    total += processed_num as u64;

                    let now = self.clock.now();
                    if full && now.sec - last_report >= self.config.full_sync_report_secs {
                        let remaining = self.cache.buffered_len();
                        let pct = 100.0 * total as f64 / (total + remaining) as f64;
                        info!(synced = total, remaining, "syncing history data... {pct:.1}%");
                        last_report = now.sec;
                    }

                    if !full {
                        if processed_num as u64 * 100
                            < self.config.min_progress_pct as u64 * candidate_num as u64
                        {
                            // most candidates are trigger-locked; back off
                            // and let the other syncers finish
                            debug!(
                                processed = processed_num,
                                candidates = candidate_num,
                                "too many busy items, ending pass"
                            );
                            break;
                        }
                        if watermark.is_none() {
                            break;
                        }
                        if now.sec - start.sec
                            >= self.config.time_budget.as_secs() as i64
                        {
                            break;
                        }
                    }
                }
                Err(e) => {
                    self.cache.requeue_failed(&ids);
                    self.triggers.unlock(&locked_triggers);
                    warn!(error = %e, batch = processed_num, "batch flush failed, values requeued");
                    return Err(e);
                }
            }
        }

        Ok(total)
    }

    // =========================================================================
    // Batch Flush
    // =========================================================================

    async fn flush_batch(&self, values: Vec<SyncValue>) -> Result<(), SyncError> {
        let mut pending: Vec<PendingValue> = values.into_iter().map(PendingValue::new).collect();

        let mut ids: Vec<ItemId> = pending.iter().map(|p| p.item_id).collect();
        ids.sort_unstable();
        ids.dedup();

        let configs: HashMap<ItemId, ItemConfig> = self
            .items
            .get_items(&ids)
            .into_iter()
            .flatten()
            .map(|config| (config.item_id, config))
            .collect();

        let prev = if self.config.role.is_server() {
            self.items.delta_values(&ids)
        } else {
            HashMap::new()
        };

        self.db.begin().await.map_err(SyncError::from)?;

        match self.flush_batch_tx(&mut pending, &configs, &prev).await {
            Ok(deltas) => {
                self.db.commit().await.map_err(SyncError::from)?;

                if self.config.role.is_server() {
                    self.items.set_delta_values(deltas);
                    for p in pending.iter().filter(|p| p.writes_history()) {
                        if let Some(value) = &p.computed {
                            self.recent.update(p.item_id, p.value.ts, value);
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                let _ = self.db.rollback().await;
                Err(e)
            }
        }
    }

    async fn flush_batch_tx(
        &self,
        pending: &mut [PendingValue],
        configs: &HashMap<ItemId, ItemConfig>,
        prev: &HashMap<ItemId, crate::config_cache::DeltaValue>,
    ) -> Result<HashMap<ItemId, Option<crate::config_cache::DeltaValue>>, SyncError> {
        let outcome = meta::process_items(
            pending,
            configs,
            prev,
            self.config.role,
            self.events.as_ref(),
            self.items.as_ref(),
        );

        if !outcome.updates.is_empty() {
            self.db.update_items(&outcome.updates).await?;
        }

        for (table, rows) in self.build_history_rows(pending) {
            self.db.insert_history(table, &rows).await?;
        }

        if self.config.role.is_server() {
            let mut rolled = Vec::new();
            for p in pending.iter().filter(|p| p.writes_trends()) {
                if let Some(value) = &p.computed {
                    self.trends.accumulate(p.item_id, &p.value.ts, value, &mut rolled);
                }
            }
            self.trends.cleanup(
                self.clock.now(),
                self.config.trend_cleanup_settle_secs,
                &mut rolled,
            );
            if !rolled.is_empty() {
                self.flush_trend_list(rolled, true).await?;
            }

            let evaluated: Vec<EvaluatedValue> = pending
                .iter()
                .filter(|p| p.writes_history())
                .filter_map(|p| {
                    p.computed.as_ref().map(|value| EvaluatedValue {
                        item_id: p.item_id,
                        ts: p.value.ts,
                        value: value.clone(),
                    })
                })
                .collect();
            if !evaluated.is_empty() {
                self.evaluator.evaluate(&evaluated);
            }
        }

        Ok(outcome.deltas)
    }

    fn build_history_rows(
        &self,
        pending: &[PendingValue],
    ) -> Vec<(HistoryTable, Vec<HistoryRow>)> {
        let mut tables: HashMap<HistoryTable, Vec<HistoryRow>> = HashMap::new();

        match self.config.role {
            Role::Server => {
                for p in pending.iter().filter(|p| p.writes_history()) {
                    let Some(value) = p.computed.clone() else {
                        continue;
                    };
                    let table = HistoryTable::for_value_type(p.value.value_type);
                    tables.entry(table).or_default().push(HistoryRow {
                        item_id: p.item_id,
                        ts: p.value.ts,
                        value,
                    });
                }
            }
            Role::Proxy => {
                // the proxy stages original values of every type into one
                // upload table
                for p in pending.iter().filter(|p| {
                    !p.skip && p.state == ItemState::Normal && p.value.has_value()
                }) {
                    let Some(value) = p.value.value.clone() else {
                        continue;
                    };
                    tables.entry(HistoryTable::Proxy).or_default().push(HistoryRow {
                        item_id: p.item_id,
                        ts: p.value.ts,
                        value,
                    });
                }
            }
        }

        tables.into_iter().collect()
    }

    // =========================================================================
    // Trend Flushing
    // =========================================================================

    /// Flushes every live trend aggregate in one transaction.
    pub async fn sync_trends(&self) -> Result<u64, SyncError> {
        let all = self.trends.take_all();
        if all.is_empty() {
            return Ok(0);
        }
        let count = all.len() as u64;

        info!(aggregates = count, "syncing trend data...");
        self.db.begin().await.map_err(SyncError::from)?;

        match self.flush_trend_list(all, false).await {
            Ok(()) => {
                self.db.commit().await.map_err(SyncError::from)?;
                info!("syncing trend data done");
                Ok(count)
            }
            Err(e) => {
                let _ = self.db.rollback().await;
                Err(e)
            }
        }
    }

    /// Flushes a list of aggregates grouped by (hour, table), reconciling
    /// with rows persisted by earlier flushes or other processes.
    async fn flush_trend_list(
        &self,
        list: Vec<TrendAggregate>,
        update_cache: bool,
    ) -> Result<(), SyncError> {
        let mut groups: HashMap<(i64, TrendTable), Vec<TrendAggregate>> = HashMap::new();
        for aggregate in list {
            let table = match aggregate.value {
                TrendValue::Float { .. } => TrendTable::Float,
                TrendValue::Unsigned { .. } => TrendTable::Unsigned,
            };
            groups.entry((aggregate.clock, table)).or_default().push(aggregate);
        }

        for ((clock, table), group) in groups {
            self.flush_trend_group(table, clock, group, update_cache).await?;
        }
        Ok(())
    }

    async fn flush_trend_group(
        &self,
        table: TrendTable,
        clock: i64,
        mut group: Vec<TrendAggregate>,
        update_cache: bool,
    ) -> Result<(), SyncError> {
        // existence check only for items the database has not been
        // consulted about this hour
        let unknown: Vec<ItemId> = group
            .iter()
            .filter(|a| a.disable_from == 0)
            .map(|a| a.item_id)
            .collect();

        if !unknown.is_empty() {
            let existing = self.db.select_trend_itemids(table, clock, &unknown).await?;
            for aggregate in group.iter_mut() {
                if aggregate.disable_from == 0 && !existing.contains(&aggregate.item_id) {
                    aggregate.disable_from = clock;
                }
            }
        }

        // rows may exist for items never marked (foreign rows) or items we
        // flushed earlier this hour; read and merge those
        let merge_ids: Vec<ItemId> = group
            .iter()
            .filter(|a| a.disable_from == 0 || a.disable_from > clock)
            .map(|a| a.item_id)
            .collect();

        let mut merged: Vec<ItemId> = Vec::new();
        if !merge_ids.is_empty() {
            let rows = self.db.select_trends(table, clock, &merge_ids).await?;
            let mut updates = Vec::with_capacity(rows.len());

            for row in rows {
                let Some(aggregate) = group.iter_mut().find(|a| a.item_id == row.item_id) else {
                    warn!(item_id = %row.item_id, "trend row for item outside the flush group, this should never happen");
                    continue;
                };
                match row.value {
                    TrendRowValue::Float { min, avg, max } => {
                        aggregate.merge_float(row.num, min, avg, max)
                    }
                    TrendRowValue::Unsigned { min, avg, max } => {
                        aggregate.merge_unsigned(row.num, min, avg, max)
                    }
                }
                updates.push(to_trend_row(aggregate));
                merged.push(aggregate.item_id);
            }

            if !updates.is_empty() {
                self.db.update_trends(table, &updates).await?;
            }
        }

        let inserts: Vec<TrendRow> = group
            .iter()
            .filter(|a| !merged.contains(&a.item_id))
            .map(to_trend_row)
            .collect();
        if !inserts.is_empty() {
            self.db.insert_trends(table, &inserts).await?;
        }

        // every flushed (item, hour) is now reconciled until the hour ends
        if update_cache {
            for aggregate in &group {
                self.trends.set_disable_from(aggregate.item_id, clock + 3600);
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("role", &self.config.role)
            .field("batch_max", &self.config.batch_max)
            .finish()
    }
}

fn to_trend_row(aggregate: &TrendAggregate) -> TrendRow {
    let value = match aggregate.value {
        TrendValue::Float { min, max, avg } => TrendRowValue::Float { min, avg, max },
        TrendValue::Unsigned { min, max, .. } => TrendRowValue::Unsigned {
            min,
            avg: aggregate.unsigned_avg(),
            max,
        },
    };
    TrendRow {
        item_id: aggregate.item_id,
        clock: aggregate.clock,
        num: aggregate.num,
        value,
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    cache: Arc<HistoryCache>,
    trends: Arc<TrendCache>,
    db: Arc<dyn Database>,
    items: Option<Arc<dyn ConfigCache>>,
    triggers: Option<Arc<dyn TriggerLocker>>,
    evaluator: Option<Arc<dyn ValueEvaluator>>,
    events: Option<Arc<dyn EventSink>>,
    recent: Option<Arc<dyn RecentValueCache>>,
    clock: Option<Arc<dyn Clock>>,
    config: SyncConfig,
}

impl SyncEngineBuilder {
    /// Sets the configuration cache.
    pub fn items(mut self, items: Arc<dyn ConfigCache>) -> Self {
        self.items = Some(items);
        self
    }

    /// Sets the trigger locker.
    pub fn triggers(mut self, triggers: Arc<dyn TriggerLocker>) -> Self {
        self.triggers = Some(triggers);
        self
    }

    /// Sets the value evaluator.
    pub fn evaluator(mut self, evaluator: Arc<dyn ValueEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Sets the event sink.
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets the recent-value cache.
    pub fn recent(mut self, recent: Arc<dyn RecentValueCache>) -> Self {
        self.recent = Some(recent);
        self
    }

    /// Sets the clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the engine configuration.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the engine; unset collaborators get no-op or empty in-memory
    /// implementations.
    pub fn build(self) -> SyncEngine {
        SyncEngine {
            cache: self.cache,
            trends: self.trends,
            db: self.db,
            items: self
                .items
                .unwrap_or_else(|| Arc::new(InMemoryConfigCache::new())),
            triggers: self
                .triggers
                .unwrap_or_else(|| Arc::new(InMemoryTriggerLocker::new())),
            evaluator: self.evaluator.unwrap_or_else(|| Arc::new(NoopEvaluator)),
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventSink)),
            recent: self
                .recent
                .unwrap_or_else(|| Arc::new(NoopRecentValueCache)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
            config: self.config,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
