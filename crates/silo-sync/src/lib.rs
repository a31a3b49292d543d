// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # silo-sync
//!
//! The synchronization engine: drains the history cache oldest-first in
//! batches, writes each batch through the database layer in one
//! transaction, feeds qualifying values to the trend aggregator, and
//! coordinates with the trigger-lock service so that two syncers never
//! recompute the same trigger concurrently.
//!
//! External collaborators are typed trait boundaries, each with an
//! in-memory or mock implementation:
//!
//! - [`Database`]: transactions, bulk history inserts, item updates and the
//!   trend upsert queries
//! - [`ConfigCache`]: item metadata resolution and per-pass delta tracking
//! - [`TriggerLocker`]: advisory, cross-syncer trigger locks
//! - [`ValueEvaluator`] / [`EventSink`] / [`RecentValueCache`]: the trigger
//!   evaluation pipeline, internal events and the latest-value cache

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Modules
// =============================================================================

pub mod config;
pub mod config_cache;
pub mod db;
pub mod engine;
mod meta;
pub mod triggers;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use config::SyncConfig;
pub use config_cache::{ConfigCache, DeltaValue, InMemoryConfigCache};
pub use db::{
    Database, HistoryRow, HistoryTable, ItemUpdate, MockDatabase, TrendRow, TrendRowValue,
    TrendTable,
};
pub use engine::{SyncEngine, SyncEngineBuilder, SyncMode};
pub use triggers::{
    CollectingEvaluator, CollectingEventSink, EvaluatedValue, EventSink, InMemoryRecentValueCache,
    InMemoryTriggerLocker, InternalEvent, LockOutcome, NoopEvaluator, NoopEventSink,
    NoopRecentValueCache, RecentValueCache, TriggerLocker, ValueEvaluator,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
