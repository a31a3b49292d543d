// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Local staging buffer.
//!
//! Collectors never take the cache lock once per value. Each caller owns a
//! [`ValueWriter`] with a private staging buffer: values append lock-free,
//! string payloads are copied into a growable byte buffer and referenced by
//! offset+length, and `commit()` transfers the whole batch into the shared
//! history cache under a single lock acquisition.
//!
//! Routing rules applied at staging time:
//!
//! - not-supported samples carry their error string as payload
//! - discovery-rule samples are handed to the [`DiscoveryProcessor`] and
//!   never enter the cache
//! - samples with neither a usable value nor meta information are dropped
//!
//! If the arena is exhausted during `commit()`, the transfer pauses, the
//! lock is released, and the writer sleeps and resumes from the same value;
//! backpressure never loses or duplicates data.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use silo_core::retry::{FixedDelay, RetryConfig};
use silo_core::types::{
    HistoryValue, ItemId, ItemState, LogValue, MetaInfo, SampleFlags, Timespec, ValueType,
};

use crate::cache::HistoryCache;

// =============================================================================
// Discovery Processor
// =============================================================================

/// Consumer of discovery-rule sample payloads.
///
/// Discovery samples describe entities to create, not metric values, so
/// they bypass the history cache entirely.
pub trait DiscoveryProcessor: Send + Sync {
    /// Processes one discovery payload.
    fn process(&self, item_id: ItemId, ts: Timespec, payload: &str);
}

/// A discovery processor that records payloads, for tests.
#[derive(Debug, Default)]
pub struct CollectingDiscoveryProcessor {
    payloads: Mutex<Vec<(ItemId, Timespec, String)>>,
}

impl CollectingDiscoveryProcessor {
    /// Creates a new collecting processor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded payloads.
    pub fn payloads(&self) -> Vec<(ItemId, Timespec, String)> {
        self.payloads.lock().clone()
    }
}

impl DiscoveryProcessor for CollectingDiscoveryProcessor {
    fn process(&self, item_id: ItemId, ts: Timespec, payload: &str) {
        self.payloads.lock().push((item_id, ts, payload.to_string()));
    }
}

// =============================================================================
// Staged Values
// =============================================================================

/// Reference into the staging string buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrRef {
    offset: u32,
    len: u32,
}

/// Payload of a staged value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StagedPayload {
    /// No payload (meta-only sample).
    None,
    /// A float sample.
    Float(f64),
    /// An unsigned sample.
    Unsigned(u64),
    /// A character/text sample.
    Str(StrRef),
    /// A log record sample.
    Log {
        /// The log line.
        value: StrRef,
        /// The log source, if any.
        source: Option<StrRef>,
        /// Timestamp extracted from the entry.
        timestamp: i64,
        /// Severity extracted from the entry.
        severity: i32,
        /// Event id extracted from the entry.
        event_id: i64,
    },
    /// The error string of a not-supported sample.
    Error(StrRef),
}

/// One staged sample awaiting commit.
#[derive(Debug, Clone, Copy)]
pub struct StagedValue {
    /// The item the sample belongs to.
    pub item_id: ItemId,
    /// Sample timestamp (`ns < 0` until the cache backfills it).
    pub ts: Timespec,
    /// Collected value type.
    pub value_type: ValueType,
    /// Sample flags.
    pub flags: SampleFlags,
    /// Item state at collection time.
    pub state: ItemState,
    /// The payload.
    pub payload: StagedPayload,
    /// Log meta information for meta-flagged samples.
    pub meta: Option<MetaInfo>,
}

// =============================================================================
// Staging Buffer
// =============================================================================

/// The caller-local batch of staged values plus its string byte buffer.
#[derive(Debug, Default)]
pub struct StagingBuffer {
    values: Vec<StagedValue>,
    text: Vec<u8>,
}

impl StagingBuffer {
    /// Creates an empty staging buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the staged values.
    pub fn values(&self) -> &[StagedValue] {
        &self.values
    }

    /// Returns the number of staged values.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if nothing is staged.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Clears the staged values and the string buffer.
    pub fn clear(&mut self) {
        self.values.clear();
        self.text.clear();
    }

    /// Resolves a string reference.
    pub fn text(&self, r: StrRef) -> &str {
        let start = r.offset as usize;
        let end = start + r.len as usize;
        std::str::from_utf8(&self.text[start..end]).unwrap_or("")
    }

    fn intern(&mut self, s: &str) -> StrRef {
        let offset = self.text.len() as u32;
        self.text.extend_from_slice(s.as_bytes());
        StrRef {
            offset,
            len: s.len() as u32,
        }
    }

    /// Stages a float sample.
    pub fn push_float(
        &mut self,
        item_id: ItemId,
        ts: Timespec,
        value: f64,
        flags: SampleFlags,
        meta: Option<MetaInfo>,
    ) {
        let payload = if flags.has_value() {
            StagedPayload::Float(value)
        } else {
            StagedPayload::None
        };
        self.values.push(StagedValue {
            item_id,
            ts,
            value_type: ValueType::Float,
            flags,
            state: ItemState::Normal,
            payload,
            meta,
        });
    }

    /// Stages an unsigned sample.
    pub fn push_unsigned(
        &mut self,
        item_id: ItemId,
        ts: Timespec,
        value: u64,
        flags: SampleFlags,
        meta: Option<MetaInfo>,
    ) {
        let payload = if flags.has_value() {
            StagedPayload::Unsigned(value)
        } else {
            StagedPayload::None
        };
        self.values.push(StagedValue {
            item_id,
            ts,
            value_type: ValueType::Unsigned,
            flags,
            state: ItemState::Normal,
            payload,
            meta,
        });
    }

    /// Stages a character or text sample.
    pub fn push_text(
        &mut self,
        item_id: ItemId,
        ts: Timespec,
        value_type: ValueType,
        value: &str,
        flags: SampleFlags,
        meta: Option<MetaInfo>,
    ) {
        let payload = if flags.has_value() {
            StagedPayload::Str(self.intern(value))
        } else {
            StagedPayload::None
        };
        self.values.push(StagedValue {
            item_id,
            ts,
            value_type,
            flags,
            state: ItemState::Normal,
            payload,
            meta,
        });
    }

    /// Stages a log record sample.
    pub fn push_log(
        &mut self,
        item_id: ItemId,
        ts: Timespec,
        log: &LogValue,
        flags: SampleFlags,
        meta: Option<MetaInfo>,
    ) {
        let payload = if flags.has_value() {
            let value = self.intern(&log.value);
            let source = log
                .source
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(|s| self.intern(s));
            StagedPayload::Log {
                value,
                source,
                timestamp: log.timestamp,
                severity: log.severity,
                event_id: log.event_id,
            }
        } else {
            StagedPayload::None
        };
        self.values.push(StagedValue {
            item_id,
            ts,
            value_type: ValueType::Log,
            flags,
            state: ItemState::Normal,
            payload,
            meta,
        });
    }

    /// Stages a not-supported sample carrying an error string.
    pub fn push_not_supported(&mut self, item_id: ItemId, ts: Timespec, error: &str) {
        let payload = StagedPayload::Error(self.intern(error));
        self.values.push(StagedValue {
            item_id,
            ts,
            value_type: ValueType::Text,
            flags: SampleFlags::none(),
            state: ItemState::NotSupported,
            payload,
            meta: None,
        });
    }
}

// =============================================================================
// Value Writer
// =============================================================================

/// A per-caller handle that stages values and commits them in batches.
pub struct ValueWriter {
    cache: Arc<HistoryCache>,
    discovery: Option<Arc<dyn DiscoveryProcessor>>,
    buffer: StagingBuffer,
    capacity: usize,
    retry: FixedDelay,
}

impl ValueWriter {
    /// Creates a writer bound to a cache.
    pub fn new(cache: Arc<HistoryCache>) -> Self {
        let capacity = cache.config().staging_capacity;
        let retry = FixedDelay::new(
            RetryConfig::forever(cache.config().retry_interval),
            cache.clock(),
        );
        Self {
            cache,
            discovery: None,
            buffer: StagingBuffer::new(),
            capacity,
            retry,
        }
    }

    /// Installs a discovery processor for discovery-flagged samples.
    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryProcessor>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Stages one collected sample.
    ///
    /// Applies the staging-side routing rules: not-supported samples are
    /// staged with their error string, discovery samples are diverted to
    /// the discovery processor, and samples with neither a value nor meta
    /// information are dropped. Commits implicitly when the staging buffer
    /// is full.
    #[allow(clippy::too_many_arguments)]
    pub async fn stage_value(
        &mut self,
        item_id: ItemId,
        value_type: ValueType,
        flags: SampleFlags,
        value: Option<HistoryValue>,
        ts: Timespec,
        state: ItemState,
        error: Option<&str>,
        meta: Option<MetaInfo>,
    ) {
        if state == ItemState::NotSupported {
            self.reserve_slot().await;
            self.buffer
                .push_not_supported(item_id, ts, error.unwrap_or(""));
            return;
        }

        if flags.discovery {
            match (&self.discovery, &value) {
                (Some(discovery), Some(HistoryValue::Text(payload))) => {
                    discovery.process(item_id, ts, payload);
                }
                _ => {
                    debug!(item_id = %item_id, "dropping discovery sample without text payload");
                }
            }
            return;
        }

        if value.is_none() && !flags.meta {
            debug!(item_id = %item_id, "dropping sample with neither value nor meta");
            return;
        }

        let mut flags = flags;
        if value.is_none() {
            flags.no_value = true;
        }

        // type/payload mismatches are conversion failures upstream of the
        // cache and the sample is dropped here
        match (value_type, value) {
            (ValueType::Float, Some(HistoryValue::Float(v))) => {
                self.reserve_slot().await;
                self.buffer.push_float(item_id, ts, v, flags, meta);
            }
            (ValueType::Unsigned, Some(HistoryValue::Unsigned(v))) => {
                self.reserve_slot().await;
                self.buffer.push_unsigned(item_id, ts, v, flags, meta);
            }
            (ValueType::Character | ValueType::Text, Some(HistoryValue::Text(s))) => {
                self.reserve_slot().await;
                self.buffer
                    .push_text(item_id, ts, value_type, &s, flags, meta);
            }
            (ValueType::Log, Some(HistoryValue::Log(log))) => {
                self.reserve_slot().await;
                self.buffer.push_log(item_id, ts, &log, flags, meta);
            }
            (_, None) => {
                // meta-only sample: staged under the item's value type
                self.reserve_slot().await;
                match value_type {
                    ValueType::Float => self.buffer.push_float(item_id, ts, 0.0, flags, meta),
                    ValueType::Unsigned => self.buffer.push_unsigned(item_id, ts, 0, flags, meta),
                    ValueType::Character | ValueType::Text => {
                        self.buffer.push_text(item_id, ts, value_type, "", flags, meta)
                    }
                    ValueType::Log => {
                        self.buffer
                            .push_log(item_id, ts, &LogValue::new(""), flags, meta)
                    }
                }
            }
            (value_type, Some(value)) => {
                debug!(
                    item_id = %item_id,
                    expected = %value_type,
                    got = value.type_name(),
                    "dropping sample with mismatched payload type"
                );
            }
        }
    }

    /// Stages a float sample.
    pub async fn stage_float(&mut self, item_id: ItemId, ts: Timespec, value: f64) {
        self.stage_value(
            item_id,
            ValueType::Float,
            SampleFlags::none(),
            Some(HistoryValue::Float(value)),
            ts,
            ItemState::Normal,
            None,
            None,
        )
        .await;
    }

    /// Stages an unsigned sample.
    pub async fn stage_unsigned(&mut self, item_id: ItemId, ts: Timespec, value: u64) {
        self.stage_value(
            item_id,
            ValueType::Unsigned,
            SampleFlags::none(),
            Some(HistoryValue::Unsigned(value)),
            ts,
            ItemState::Normal,
            None,
            None,
        )
        .await;
    }

    /// Stages a text sample.
    pub async fn stage_text(&mut self, item_id: ItemId, ts: Timespec, value: &str) {
        self.stage_value(
            item_id,
            ValueType::Text,
            SampleFlags::none(),
            Some(HistoryValue::Text(value.to_string())),
            ts,
            ItemState::Normal,
            None,
            None,
        )
        .await;
    }

    /// Stages a log record sample.
    pub async fn stage_log(&mut self, item_id: ItemId, ts: Timespec, log: LogValue) {
        self.stage_value(
            item_id,
            ValueType::Log,
            SampleFlags::none(),
            Some(HistoryValue::Log(log)),
            ts,
            ItemState::Normal,
            None,
            None,
        )
        .await;
    }

    /// Stages a not-supported sample.
    pub async fn stage_not_supported(&mut self, item_id: ItemId, ts: Timespec, error: &str) {
        self.stage_value(
            item_id,
            ValueType::Text,
            SampleFlags::none(),
            None,
            ts,
            ItemState::NotSupported,
            Some(error),
            None,
        )
        .await;
    }

    /// Commits the staged batch into the history cache.
    ///
    /// Takes the cache lock once per attempt. If the value arena fills up
    /// mid-transfer, the lock is released, the writer sleeps for the retry
    /// interval and the transfer resumes from the first uncommitted value.
    ///
    /// Returns the number of values committed.
    pub async fn commit(&mut self) -> usize {
        if self.buffer.is_empty() {
            return 0;
        }

        let mut cursor = 0usize;
        let mut attempt = 0u32;

        while let Err(e) = self.cache.push_values(&self.buffer, &mut cursor) {
            attempt += 1;
            debug!(
                attempt,
                committed = cursor,
                staged = self.buffer.len(),
                error = %e,
                "history cache full, waiting for syncers"
            );
            let _ = self.retry.wait(attempt).await;
        }

        let committed = self.buffer.len();
        self.buffer.clear();
        committed
    }

    /// Returns the number of currently staged values.
    pub fn staged(&self) -> usize {
        self.buffer.len()
    }

    async fn reserve_slot(&mut self) {
        if self.buffer.len() >= self.capacity {
            self.commit().await;
        }
    }
}

impl std::fmt::Debug for ValueWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueWriter")
            .field("staged", &self.buffer.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use silo_core::clock::ManualClock;

    fn test_cache() -> Arc<HistoryCache> {
        Arc::new(HistoryCache::new(
            CacheConfig::for_testing(),
            Arc::new(ManualClock::at(1000)),
        ))
    }

    #[test]
    fn test_string_interning() {
        let mut buffer = StagingBuffer::new();
        buffer.push_text(
            ItemId::new(1),
            Timespec::new(1, 0),
            ValueType::Text,
            "hello",
            SampleFlags::none(),
            None,
        );
        buffer.push_text(
            ItemId::new(2),
            Timespec::new(2, 0),
            ValueType::Text,
            "world",
            SampleFlags::none(),
            None,
        );

        let refs: Vec<StrRef> = buffer
            .values()
            .iter()
            .map(|v| match v.payload {
                StagedPayload::Str(r) => r,
                _ => panic!("expected string payload"),
            })
            .collect();

        assert_eq!(buffer.text(refs[0]), "hello");
        assert_eq!(buffer.text(refs[1]), "world");
    }

    #[tokio::test]
    async fn test_stage_and_commit() {
        let cache = test_cache();
        let mut writer = ValueWriter::new(cache.clone());

        writer.stage_float(ItemId::new(1), Timespec::new(100, 0), 1.5).await;
        writer.stage_float(ItemId::new(1), Timespec::new(101, 0), 2.5).await;
        assert_eq!(writer.staged(), 2);

        let committed = writer.commit().await;
        assert_eq!(committed, 2);
        assert_eq!(writer.staged(), 0);
        assert_eq!(cache.buffered_len(), 2);
    }

    #[tokio::test]
    async fn test_implicit_commit_on_full_buffer() {
        let cache = test_cache();
        let mut writer = ValueWriter::new(cache.clone());
        let capacity = cache.config().staging_capacity;

        for i in 0..capacity + 1 {
            writer
                .stage_float(ItemId::new(1), Timespec::new(i as i64, 0), i as f64)
                .await;
        }

        // the buffer overflowed once, committing the first batch
        assert_eq!(cache.buffered_len() as usize, capacity);
        assert_eq!(writer.staged(), 1);
    }

    #[tokio::test]
    async fn test_discovery_sample_is_routed() {
        let cache = test_cache();
        let discovery = Arc::new(CollectingDiscoveryProcessor::new());
        let mut writer = ValueWriter::new(cache.clone()).with_discovery(discovery.clone());

        let flags = SampleFlags {
            discovery: true,
            ..SampleFlags::none()
        };
        writer
            .stage_value(
                ItemId::new(9),
                ValueType::Text,
                flags,
                Some(HistoryValue::Text("{\"data\":[]}".to_string())),
                Timespec::new(5, 0),
                ItemState::Normal,
                None,
                None,
            )
            .await;

        assert_eq!(writer.staged(), 0);
        let payloads = discovery.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].0, ItemId::new(9));
    }

    #[tokio::test]
    async fn test_valueless_sample_is_dropped() {
        let cache = test_cache();
        let mut writer = ValueWriter::new(cache.clone());

        writer
            .stage_value(
                ItemId::new(1),
                ValueType::Float,
                SampleFlags::none(),
                None,
                Timespec::new(1, 0),
                ItemState::Normal,
                None,
                None,
            )
            .await;

        assert_eq!(writer.staged(), 0);
    }

    #[tokio::test]
    async fn test_meta_only_sample_is_kept() {
        let cache = test_cache();
        let mut writer = ValueWriter::new(cache.clone());

        writer
            .stage_value(
                ItemId::new(1),
                ValueType::Log,
                SampleFlags::meta_only(),
                None,
                Timespec::new(1, 0),
                ItemState::Normal,
                None,
                Some(MetaInfo {
                    log_size: 4096,
                    mtime: 77,
                }),
            )
            .await;

        assert_eq!(writer.staged(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_payload_is_dropped() {
        let cache = test_cache();
        let mut writer = ValueWriter::new(cache.clone());

        writer
            .stage_value(
                ItemId::new(1),
                ValueType::Unsigned,
                SampleFlags::none(),
                Some(HistoryValue::Text("not a number".to_string())),
                Timespec::new(1, 0),
                ItemState::Normal,
                None,
                None,
            )
            .await;

        assert_eq!(writer.staged(), 0);
    }

    #[tokio::test]
    async fn test_not_supported_sample_staged_with_error() {
        let cache = test_cache();
        let mut writer = ValueWriter::new(cache.clone());

        writer
            .stage_not_supported(ItemId::new(3), Timespec::new(9, 0), "no such metric")
            .await;
        writer.commit().await;

        assert_eq!(cache.buffered_len(), 1);
        assert_eq!(cache.stats().snapshot().not_supported, 1);
    }

    #[tokio::test]
    async fn test_commit_empty_buffer_is_noop() {
        let cache = test_cache();
        let mut writer = ValueWriter::new(cache);
        assert_eq!(writer.commit().await, 0);
    }
}
