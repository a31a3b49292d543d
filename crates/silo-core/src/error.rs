// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Unified error hierarchy for SILO.
//!
//! This module defines the error type system used across the cache and the
//! synchronization engine:
//!
//! - Distinguishes between retryable (backpressure) and non-retryable errors
//! - Supports error chaining for traceability
//! - Supports structured logging
//!
//! # Error Hierarchy
//!
//! ```text
//! SiloError (root)
//! ├── CacheError   - Value arena and history cache operations
//! ├── DbError      - Database layer operations
//! └── SyncError    - Synchronization engine passes
//! ```
//!
//! # Examples
//!
//! ```
//! use silo_core::error::{CacheError, SiloError};
//!
//! let error = CacheError::arena_exhausted(1024);
//! assert!(error.is_retryable());
//!
//! let root: SiloError = error.into();
//! assert!(root.is_retryable());
//! ```

use thiserror::Error;

use crate::types::ItemId;

// =============================================================================
// SiloError - Root Error Type
// =============================================================================

/// The root error type for SILO.
///
/// All errors in SILO can be converted to this type, providing a unified
/// error handling interface across the entire system.
#[derive(Debug, Error)]
pub enum SiloError {
    /// Cache error.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Database error.
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    /// Synchronization error.
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

impl SiloError {
    /// Returns `true` if this error is retryable.
    ///
    /// Retryable errors are backpressure conditions that resolve on their
    /// own (arena exhaustion, transient database unavailability); callers
    /// wait and try again instead of failing.
    pub fn is_retryable(&self) -> bool {
        match self {
            SiloError::Cache(e) => e.is_retryable(),
            SiloError::Db(e) => e.is_retryable(),
            SiloError::Sync(e) => e.is_retryable(),
        }
    }

    /// Returns the error type as a string for logging/metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            SiloError::Cache(_) => "cache",
            SiloError::Db(_) => "db",
            SiloError::Sync(_) => "sync",
        }
    }
}

// =============================================================================
// CacheError
// =============================================================================

/// Errors raised by the value arena and the history cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The value arena is full.
    ///
    /// This is the backpressure signal: the caller releases the cache lock,
    /// sleeps for the retry interval and resumes the transfer from the same
    /// value. It is never surfaced to collectors as a failure.
    #[error("Value arena exhausted ({capacity} slots)")]
    ArenaExhausted {
        /// Configured arena capacity in slots.
        capacity: usize,
    },

    /// A stored handle did not resolve to an occupied arena slot.
    ///
    /// Indicates a defect in chain bookkeeping, not a runtime condition.
    #[error("Invalid arena handle {index}")]
    InvalidHandle {
        /// The offending slot index.
        index: u32,
    },

    /// An item expected to be present in the history index was not found.
    ///
    /// Indicates a defect in checkout bookkeeping, not a runtime condition.
    #[error("Item {item_id} not present in history index")]
    ItemNotIndexed {
        /// The missing item.
        item_id: ItemId,
    },
}

impl CacheError {
    /// Creates an arena-exhausted error.
    pub fn arena_exhausted(capacity: usize) -> Self {
        CacheError::ArenaExhausted { capacity }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::ArenaExhausted { .. })
    }
}

// =============================================================================
// DbError
// =============================================================================

/// Errors raised by the database layer.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database is temporarily unavailable.
    #[error("Database unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// A statement failed.
    #[error("Query failed: {message}")]
    Query {
        /// Description of the failure.
        message: String,
    },

    /// An operation was issued outside an open transaction.
    #[error("No open transaction for operation '{operation}'")]
    NoTransaction {
        /// The operation that required a transaction.
        operation: &'static str,
    },
}

impl DbError {
    /// Creates an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        DbError::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a query error.
    pub fn query(message: impl Into<String>) -> Self {
        DbError::Query {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::Unavailable { .. })
    }
}

// =============================================================================
// SyncError
// =============================================================================

/// Errors raised by a synchronization pass.
///
/// Item-level data errors never surface here; only whole-batch failures do.
/// A failed batch is rolled back and its items remain queued for the next
/// pass.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The batch transaction failed.
    #[error("Batch transaction failed: {0}")]
    Database(#[from] DbError),

    /// The cache rejected an engine operation.
    #[error("Cache operation failed: {0}")]
    Cache(#[from] CacheError),
}

impl SyncError {
    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Database(e) => e.is_retryable(),
            SyncError::Cache(e) => e.is_retryable(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
