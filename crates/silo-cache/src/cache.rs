// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The shared history cache.
//!
//! One hash index maps each item id to its FIFO chain of buffered values in
//! the arena; a binary min-heap schedules items for flushing by the
//! timestamp of their oldest value. Both structures and the arena are
//! guarded by a single history mutex.
//!
//! Syncers drain the cache with a checkout protocol:
//!
//! 1. `checkout_batch` pops up to N items oldest-first and marks their
//!    chains checked out; a filter supplied by the caller (the trigger-lock
//!    service on the server role) can mark some of them busy, and those are
//!    requeued immediately without leaving the critical section.
//! 2. The syncer flushes the cloned oldest values outside the lock. A
//!    checked-out chain is owned exclusively by its syncer, so nothing else
//!    touches it meanwhile.
//! 3. `finish_batch` releases the flushed value of every processed item and
//!    requeues non-empty chains keyed by their new oldest timestamp;
//!    `requeue_failed` returns chains untouched after a rolled-back batch.
//!
//! A full synchronization first swaps the scheduling queue for an unbounded
//! heap rebuilt from the index, inside the history mutex, so the drain can
//! never fail on queue capacity (see DESIGN.md for the safety argument).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use silo_core::clock::Clock;
use silo_core::error::CacheError;
use silo_core::types::{BufferedValue, HistoryValue, ItemId, LogValue, Timespec};

use crate::arena::{ValueArena, ValueRef};
use crate::config::CacheConfig;
use crate::queue::SchedQueue;
use crate::staging::{StagedPayload, StagingBuffer};
use crate::stats::CacheStats;

// =============================================================================
// Item Chains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainStatus {
    Normal,
    CheckedOut,
}

#[derive(Debug)]
struct ItemChain {
    status: ChainStatus,
    /// Oldest buffered value.
    tail: ValueRef,
    /// Newest buffered value.
    head: ValueRef,
    len: u32,
}

// =============================================================================
// Sync Batch
// =============================================================================

/// One checked-out value handed to a syncer.
#[derive(Debug, Clone)]
pub struct SyncValue {
    /// The item the value belongs to.
    pub item_id: ItemId,
    /// The item's oldest buffered value, cloned out of the arena.
    pub value: BufferedValue,
}

/// The result of a batch checkout.
#[derive(Debug)]
pub struct SyncBatch {
    /// Checked-out values, one per item, oldest-first across items.
    pub values: Vec<SyncValue>,
    /// Number of candidates popped before the busy filter ran.
    pub candidate_num: usize,
}

// =============================================================================
// Cache Inner State
// =============================================================================

#[derive(Debug)]
struct CacheInner {
    arena: ValueArena,
    items: HashMap<ItemId, ItemChain>,
    queue: SchedQueue,
    /// Backfill state for samples arriving without nanoseconds.
    last_ts: Timespec,
}

// =============================================================================
// History Cache
// =============================================================================

/// The shared write-back cache for history values.
pub struct HistoryCache {
    inner: Mutex<CacheInner>,
    stats: CacheStats,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl HistoryCache {
    /// Creates a cache with the given configuration.
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                arena: ValueArena::with_capacity(config.arena_capacity),
                items: HashMap::new(),
                queue: SchedQueue::with_capacity(config.queue_capacity),
                last_ts: Timespec::default(),
            }),
            stats: CacheStats::new(config.arena_capacity),
            config,
            clock,
        }
    }

    /// Returns the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the cache clock.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Returns the cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Returns the number of currently buffered values (O(1)).
    pub fn buffered_len(&self) -> u64 {
        self.stats.buffered()
    }

    /// Returns `true` if no values are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffered_len() == 0
    }

    // =========================================================================
    // Ingest
    // =========================================================================

    /// Transfers staged values into the cache, starting at `*cursor`.
    ///
    /// Takes the history lock once. On success every staged value from the
    /// cursor onward has been cloned into the arena and `*cursor` equals
    /// the staged count. If the arena fills up, the transfer stops with
    /// `Err(CacheError::ArenaExhausted)` and `*cursor` points at the first
    /// uncommitted value, so the caller can sleep and resume without loss
    /// or duplication.
    pub fn push_values(
        &self,
        staged: &StagingBuffer,
        cursor: &mut usize,
    ) -> Result<(), CacheError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let values = staged.values();
        while *cursor < values.len() {
            if inner.arena.is_full() {
                return Err(CacheError::arena_exhausted(inner.arena.capacity()));
            }

            let sv = &values[*cursor];
            let ts = backfill_ns(&mut inner.last_ts, sv.ts);
            let value = clone_staged(sv, staged, ts);

            self.stats.record_clone(&value);
            let handle = inner.arena.alloc(value)?;

            match inner.items.get_mut(&sv.item_id) {
                Some(chain) => {
                    inner.arena.set_next(chain.head, Some(handle));
                    chain.head = handle;
                    chain.len += 1;
                }
                None => {
                    inner.items.insert(
                        sv.item_id,
                        ItemChain {
                            status: ChainStatus::Normal,
                            tail: handle,
                            head: handle,
                            len: 1,
                        },
                    );
                    inner.queue.push(ts, sv.item_id);
                }
            }

            *cursor += 1;
        }

        self.stats.set_arena_used(inner.arena.len());
        Ok(())
    }

    // =========================================================================
    // Checkout Protocol
    // =========================================================================

    /// Checks out up to `max_n` items for flushing, oldest-first.
    ///
    /// The `busy_filter` runs inside the history lock's critical section
    /// and returns the subset of popped item ids that cannot be flushed in
    /// this pass (their triggers are locked by another syncer); those are
    /// requeued immediately and excluded from the batch.
    pub fn checkout_batch<F>(&self, max_n: usize, busy_filter: F) -> SyncBatch
    where
        F: FnOnce(&[ItemId]) -> Vec<ItemId>,
    {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut popped = Vec::new();
        while popped.len() < max_n {
            let Some(entry) = inner.queue.pop_min() else {
                break;
            };
            match inner.items.get_mut(&entry.item_id) {
                Some(chain) => {
                    chain.status = ChainStatus::CheckedOut;
                    popped.push(entry.item_id);
                }
                None => {
                    error!(item_id = %entry.item_id, "queued item missing from history index, this should never happen");
                }
            }
        }

        let candidate_num = popped.len();
        let busy: HashSet<ItemId> = busy_filter(&popped).into_iter().collect();

        let mut values = Vec::with_capacity(candidate_num.saturating_sub(busy.len()));
        for item_id in popped {
            let Some(chain) = inner.items.get_mut(&item_id) else {
                continue;
            };
            let tail = chain.tail;

            if busy.contains(&item_id) {
                chain.status = ChainStatus::Normal;
                match inner.arena.value(tail) {
                    Some(v) => inner.queue.push(v.ts, item_id),
                    None => error!(item_id = %item_id, "busy chain tail not in arena, this should never happen"),
                }
                continue;
            }

            match inner.arena.value(tail) {
                Some(v) => values.push(SyncValue {
                    item_id,
                    value: v.clone(),
                }),
                None => {
                    error!(item_id = %item_id, "chain tail not in arena, this should never happen");
                    chain.status = ChainStatus::Normal;
                }
            }
        }

        SyncBatch {
            values,
            candidate_num,
        }
    }

    /// Releases the flushed value of every processed item.
    ///
    /// Empty chains are removed from the index; the rest are requeued keyed
    /// by their new oldest timestamp. Returns the timestamp of the next
    /// oldest queued value, if any — the next-sync watermark.
    pub fn finish_batch(&self, processed: &[ItemId]) -> Option<Timespec> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        for &item_id in processed {
            let Some(chain) = inner.items.get_mut(&item_id) else {
                error!(item_id = %item_id, "processed item missing from history index, this should never happen");
                continue;
            };

            let old_tail = chain.tail;
            let next = inner.arena.next_of(old_tail);

            if inner.arena.free(old_tail).is_none() {
                error!(item_id = %item_id, "chain tail already freed, this should never happen");
            } else {
                self.stats.record_release();
            }

            match next {
                Some(new_tail) => {
                    chain.tail = new_tail;
                    chain.len = chain.len.saturating_sub(1);
                    chain.status = ChainStatus::Normal;
                    match inner.arena.value(new_tail) {
                        Some(v) => inner.queue.push(v.ts, item_id),
                        None => error!(item_id = %item_id, "new chain tail not in arena, this should never happen"),
                    }
                }
                None => {
                    inner.items.remove(&item_id);
                }
            }
        }

        self.stats.set_arena_used(inner.arena.len());
        inner.queue.peek_min().map(|entry| entry.ts)
    }

    /// Returns checked-out chains to the queue untouched.
    ///
    /// Used when the batch transaction rolled back: nothing was persisted,
    /// so nothing is released and the items are retried in a later pass.
    pub fn requeue_failed(&self, items: &[ItemId]) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        for &item_id in items {
            let Some(chain) = inner.items.get_mut(&item_id) else {
                error!(item_id = %item_id, "failed item missing from history index, this should never happen");
                continue;
            };
            chain.status = ChainStatus::Normal;
            let tail = chain.tail;
            match inner.arena.value(tail) {
                Some(v) => inner.queue.push(v.ts, item_id),
                None => error!(item_id = %item_id, "failed chain tail not in arena, this should never happen"),
            }
        }
    }

    // =========================================================================
    // Full Synchronization
    // =========================================================================

    /// Prepares a full drain: swaps in an unbounded scheduling queue
    /// rebuilt from the entire history index.
    ///
    /// The caller must be the only active syncer; checked-out markers left
    /// by aborted passes are cleared.
    pub fn begin_full_sync(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        inner.queue = SchedQueue::unbounded();
        for (&item_id, chain) in inner.items.iter_mut() {
            chain.status = ChainStatus::Normal;
            match inner.arena.value(chain.tail) {
                Some(v) => inner.queue.push(v.ts, item_id),
                None => error!(item_id = %item_id, "chain tail not in arena, this should never happen"),
            }
        }

        debug!(items = inner.items.len(), "scheduling queue rebuilt for full sync");
    }

    /// Restores the steady-state bounded queue after a full drain,
    /// requeueing whatever chains remain in the index.
    pub fn end_full_sync(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        inner.queue = SchedQueue::with_capacity(self.config.queue_capacity);
        for (&item_id, chain) in inner.items.iter_mut() {
            if chain.status == ChainStatus::Normal {
                match inner.arena.value(chain.tail) {
                    Some(v) => inner.queue.push(v.ts, item_id),
                    None => error!(item_id = %item_id, "chain tail not in arena, this should never happen"),
                }
            }
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Returns the chain length of an item, if buffered.
    pub fn chain_len(&self, item_id: ItemId) -> Option<usize> {
        let guard = self.inner.lock();
        guard.items.get(&item_id).map(|chain| chain.len as usize)
    }

    /// Returns the number of items currently queued for flushing.
    pub fn queued_items(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

impl std::fmt::Debug for HistoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryCache")
            .field("buffered", &self.buffered_len())
            .field("arena_capacity", &self.config.arena_capacity)
            .finish()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Assigns synthetic nanoseconds to samples delivered without sub-second
/// resolution, keeping per-item ordering total.
fn backfill_ns(last_ts: &mut Timespec, ts: Timespec) -> Timespec {
    if ts.ns >= 0 {
        return ts;
    }

    let ns = last_ts.ns;
    last_ts.ns += 1;
    if (last_ts.ns > 999_900_000 && last_ts.sec != ts.sec) || last_ts.ns == 1_000_000_000 {
        last_ts.ns = 0;
    }
    last_ts.sec = ts.sec;

    Timespec::new(ts.sec, ns)
}

fn clone_staged(
    sv: &crate::staging::StagedValue,
    staged: &StagingBuffer,
    ts: Timespec,
) -> BufferedValue {
    let (value, error) = match sv.payload {
        StagedPayload::None => (None, None),
        StagedPayload::Float(v) => (Some(HistoryValue::Float(v)), None),
        StagedPayload::Unsigned(v) => (Some(HistoryValue::Unsigned(v)), None),
        StagedPayload::Str(r) => (Some(HistoryValue::Text(staged.text(r).to_string())), None),
        StagedPayload::Log {
            value,
            source,
            timestamp,
            severity,
            event_id,
        } => (
            Some(HistoryValue::Log(LogValue {
                value: staged.text(value).to_string(),
                source: source.map(|r| staged.text(r).to_string()),
                timestamp,
                severity,
                event_id,
            })),
            None,
        ),
        StagedPayload::Error(r) => (None, Some(staged.text(r).to_string())),
    };

    BufferedValue {
        ts,
        value_type: sv.value_type,
        flags: sv.flags,
        state: sv.state,
        value,
        meta: sv.meta,
        error,
    }
}

// =============================================================================
// Tests
// =============================================================================
