// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # silo-core
//!
//! Core abstractions and shared types for SILO, the history/trend write-back
//! cache that buffers collected item values between a monitoring front end
//! and its relational database.
//!
//! This crate provides the foundational pieces used by every other SILO
//! component:
//!
//! - **Types**: `ItemId`, `Timespec`, `ValueType`, `HistoryValue`,
//!   `BufferedValue` and the per-item configuration model
//! - **Error**: Unified error hierarchy with retryability classification
//! - **Clock**: Injectable time source and sleep for testable retry loops
//! - **Retry**: Fixed-delay retry used for backpressure
//!
//! ## Example
//!
//! ```rust
//! use silo_core::types::{HistoryValue, ItemId, Timespec, ValueType};
//!
//! let ts = Timespec::new(3600, 0);
//! assert_eq!(ts.hour_floor(), 3600);
//!
//! let value = HistoryValue::Float(12.5);
//! assert_eq!(value.as_float(), Some(12.5));
//! assert_eq!(ValueType::Float.history_table(), "history");
//! # let _ = ItemId::new(1);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Core Modules
// =============================================================================

pub mod clock;
pub mod error;
pub mod retry;
pub mod types;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CacheError, DbError, SiloError, SyncError};
pub use retry::{FixedDelay, RetryConfig};
pub use types::{
    BufferedValue, DeltaMode, HistoryValue, ItemConfig, ItemId, ItemState, LogValue, MetaInfo,
    Role, SampleFlags, Timespec, TriggerId, ValueType,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
