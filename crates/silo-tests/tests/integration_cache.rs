// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Cache Integration Tests
//!
//! Staging, commit, FIFO ordering, oldest-first scheduling, statistics and
//! arena backpressure, driven through the public writer and engine
//! surfaces.

use std::sync::Arc;

use silo_cache::{CacheConfig, CollectingDiscoveryProcessor};
use silo_core::types::{
    HistoryValue, ItemId, ItemState, LogValue, SampleFlags, ValueType,
};
use silo_sync::{HistoryTable, SyncMode};

use silo_tests::common::fixtures::{float_item, log_item, text_item, ts};
use silo_tests::common::harness::TestBed;

// =============================================================================
// Staging & Commit
// =============================================================================

#[tokio::test]
async fn test_commit_transfers_batch() {
    let bed = TestBed::new();
    bed.add_item(float_item(1));

    let mut writer = bed.writer();
    for i in 0..10 {
        writer.stage_float(ItemId::new(1), ts(100 + i), i as f64).await;
    }
    assert_eq!(bed.cache.buffered_len(), 0);

    let committed = writer.commit().await;
    assert_eq!(committed, 10);
    assert_eq!(bed.cache.buffered_len(), 10);
    assert_eq!(bed.cache.chain_len(ItemId::new(1)), Some(10));
}

#[tokio::test]
async fn test_mixed_value_types_stage_together() {
    let bed = TestBed::new();
    bed.add_item(float_item(1));
    bed.add_item(text_item(2));
    bed.add_item(log_item(3));

    let mut writer = bed.writer();
    writer.stage_float(ItemId::new(1), ts(100), 1.5).await;
    writer.stage_text(ItemId::new(2), ts(101), "status ok").await;
    writer
        .stage_log(
            ItemId::new(3),
            ts(102),
            LogValue {
                value: "error in subsystem".to_string(),
                source: Some("syslog".to_string()),
                timestamp: 102,
                severity: 3,
                event_id: 77,
            },
        )
        .await;
    writer.commit().await;

    assert_eq!(bed.cache.buffered_len(), 3);

    bed.engine.synchronize(SyncMode::Full).await.unwrap();

    assert_eq!(bed.db.history_rows(HistoryTable::Float).len(), 1);
    assert_eq!(bed.db.history_rows(HistoryTable::Text).len(), 1);

    let logs = bed.db.history_rows(HistoryTable::Log);
    assert_eq!(logs.len(), 1);
    let log = logs[0].value.as_log().unwrap();
    assert_eq!(log.source.as_deref(), Some("syslog"));
    assert_eq!(log.severity, 3);
}

#[tokio::test]
async fn test_discovery_samples_bypass_cache() {
    let bed = TestBed::new();
    let discovery = Arc::new(CollectingDiscoveryProcessor::new());
    let mut writer = bed.writer().with_discovery(discovery.clone());

    let flags = SampleFlags {
        discovery: true,
        ..SampleFlags::none()
    };
    writer
        .stage_value(
            ItemId::new(50),
            ValueType::Text,
            flags,
            Some(HistoryValue::Text("{\"data\":[{\"#IF\":\"eth0\"}]}".to_string())),
            ts(100),
            ItemState::Normal,
            None,
            None,
        )
        .await;
    writer.commit().await;

    assert_eq!(bed.cache.buffered_len(), 0);
    assert_eq!(discovery.payloads().len(), 1);
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test]
async fn test_fifo_order_reaches_database() {
    let bed = TestBed::new();
    bed.add_item(float_item(1));

    let mut writer = bed.writer();
    for (sec, v) in [(100, 1.0), (105, 2.0), (110, 3.0)] {
        writer.stage_float(ItemId::new(1), ts(sec), v).await;
    }
    writer.commit().await;

    bed.drain().await;

    let rows = bed.db.history_rows(HistoryTable::Float);
    let values: Vec<f64> = rows.iter().filter_map(|r| r.value.as_float()).collect();
    assert_eq!(values, vec![1.0, 2.0, 3.0]);
}

#[tokio::test]
async fn test_items_flush_oldest_first() {
    let bed = TestBed::new();
    for id in 1..=3 {
        bed.add_item(float_item(id));
    }

    let mut writer = bed.writer();
    writer.stage_float(ItemId::new(3), ts(300), 3.0).await;
    writer.stage_float(ItemId::new(1), ts(100), 1.0).await;
    writer.stage_float(ItemId::new(2), ts(200), 2.0).await;
    writer.commit().await;

    // batch of one: each pass takes the globally oldest item
    let batch = bed.cache.checkout_batch(1, |_| Vec::new());
    assert_eq!(batch.values[0].item_id, ItemId::new(1));
    bed.cache.finish_batch(&[ItemId::new(1)]);

    let batch = bed.cache.checkout_batch(1, |_| Vec::new());
    assert_eq!(batch.values[0].item_id, ItemId::new(2));
    bed.cache.finish_batch(&[ItemId::new(2)]);

    let batch = bed.cache.checkout_batch(1, |_| Vec::new());
    assert_eq!(batch.values[0].item_id, ItemId::new(3));
}

// =============================================================================
// Statistics
// =============================================================================

#[tokio::test]
async fn test_statistics_track_types_and_gauge() {
    let bed = TestBed::new();
    bed.add_item(float_item(1));
    bed.add_item(text_item(2));

    let mut writer = bed.writer();
    writer.stage_float(ItemId::new(1), ts(100), 1.0).await;
    writer.stage_float(ItemId::new(1), ts(101), 2.0).await;
    writer.stage_text(ItemId::new(2), ts(102), "x").await;
    writer.stage_not_supported(ItemId::new(1), ts(103), "gone").await;
    writer.commit().await;

    let snap = bed.cache.stats().snapshot();
    assert_eq!(snap.values_total, 3);
    assert_eq!(snap.values_float, 2);
    assert_eq!(snap.values_text, 1);
    assert_eq!(snap.not_supported, 1);
    assert_eq!(snap.buffered, 4);
    assert_eq!(snap.arena_used, 4);

    bed.drain().await;

    let snap = bed.cache.stats().snapshot();
    assert_eq!(snap.buffered, 0);
    assert_eq!(snap.arena_used, 0);
    // cumulative counters survive the drain
    assert_eq!(snap.values_total, 3);
}

// =============================================================================
// Backpressure
// =============================================================================

#[tokio::test]
async fn test_arena_backpressure_blocks_commit_until_drained() {
    let bed = TestBed::builder()
        .cache_config(
            CacheConfig::builder()
                .arena_capacity(2)
                .queue_capacity(2)
                .staging_capacity(16)
                .build(),
        )
        .build();
    bed.add_item(float_item(1));

    let mut writer = bed.writer();
    for i in 0..5 {
        writer.stage_float(ItemId::new(1), ts(100 + i), i as f64).await;
    }

    // commit of 5 values into a 2-slot arena blocks on backpressure
    let handle = tokio::spawn(async move { writer.commit().await });

    let mut syncs = 0;
    while !handle.is_finished() {
        bed.engine.synchronize(SyncMode::Full).await.unwrap();
        tokio::task::yield_now().await;
        syncs += 1;
        assert!(syncs < 1000, "commit never completed");
    }

    assert_eq!(handle.await.unwrap(), 5);
    assert!(bed.clock.sleep_count() > 0);

    bed.drain().await;
    assert_eq!(bed.db.history_rows(HistoryTable::Float).len(), 5);

    // no value lost, none duplicated
    let rows = bed.db.history_rows(HistoryTable::Float);
    let mut seconds: Vec<i64> = rows.iter().map(|r| r.ts.sec).collect();
    seconds.sort_unstable();
    assert_eq!(seconds, vec![100, 101, 102, 103, 104]);
}
