// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # silo-cache
//!
//! The write-back cache proper: buffered values live in a fixed-capacity
//! arena, indexed per item as FIFO chains and scheduled oldest-first by a
//! binary heap; hourly trend rollups accumulate in their own map under a
//! separate lock.
//!
//! Components:
//!
//! - **Arena**: fixed-capacity slab with index handles — no raw pointers,
//!   allocation failure is the backpressure signal
//! - **Staging**: per-caller batch buffer so collectors take the cache lock
//!   once per batch, not once per value
//! - **HistoryCache**: item id → FIFO chain index plus the oldest-first
//!   scheduling queue and the checkout/release protocol used by syncers
//! - **TrendCache**: per-item hourly count/min/avg/max rollups with an
//!   overflow-safe 128-bit accumulator for unsigned averages
//! - **Stats**: lock-free counters for observability

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Modules
// =============================================================================

pub mod arena;
pub mod cache;
pub mod config;
pub mod queue;
pub mod staging;
pub mod stats;
pub mod trends;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use arena::{ValueArena, ValueRef};
pub use cache::{HistoryCache, SyncBatch, SyncValue};
pub use config::CacheConfig;
pub use queue::{QueueEntry, SchedQueue};
pub use staging::{CollectingDiscoveryProcessor, DiscoveryProcessor, ValueWriter};
pub use stats::{CacheStats, CacheStatsSnapshot};
pub use trends::{TrendAggregate, TrendCache, TrendValue};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
