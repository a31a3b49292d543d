// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Trend Integration Tests
//!
//! Hourly rollup correctness, the merge-on-flush protocol with its
//! `disable_from` gating, the cleanup sweep and the forced full flush.

use silo_core::types::{ItemId, Timespec};
use silo_sync::{SyncMode, TrendRow, TrendRowValue, TrendTable};

use silo_tests::common::fixtures::{float_item, ts, unsigned_item};
use silo_tests::common::harness::TestBed;

async fn stage_floats(bed: &TestBed, item: u64, samples: &[(i64, f64)]) {
    let mut writer = bed.writer();
    for &(sec, v) in samples {
        writer.stage_float(ItemId::new(item), ts(sec), v).await;
    }
    writer.commit().await;
}

// =============================================================================
// Rollup Correctness
// =============================================================================

#[tokio::test]
async fn test_hour_rollup_min_max_avg() {
    let bed = TestBed::new();
    bed.add_item(float_item(1));

    let samples: Vec<(i64, f64)> = (0..10).map(|i| (3600 + i, (i + 1) as f64)).collect();
    stage_floats(&bed, 1, &samples).await;
    bed.drain().await;

    let aggregate = bed.trends.get(ItemId::new(1)).unwrap();
    assert_eq!(aggregate.num, 10);
    match aggregate.value {
        silo_cache::TrendValue::Float { min, max, avg } => {
            assert_eq!(min, 1.0);
            assert_eq!(max, 10.0);
            assert!((avg - 5.5).abs() < 1e-9);
        }
        _ => panic!("expected float aggregate"),
    }
}

#[tokio::test]
async fn test_unsigned_average_survives_huge_values() {
    let bed = TestBed::new();
    bed.add_item(unsigned_item(1));

    let mut writer = bed.writer();
    for i in 0..3 {
        writer
            .stage_unsigned(ItemId::new(1), ts(3600 + i), u64::MAX - 1)
            .await;
    }
    writer.commit().await;
    bed.drain().await;
    bed.engine.sync_trends().await.unwrap();

    let row = bed.db.trend(TrendTable::Unsigned, ItemId::new(1), 3600).unwrap();
    assert_eq!(row.num, 3);
    match row.value {
        TrendRowValue::Unsigned { min, avg, max } => {
            assert_eq!(min, u64::MAX - 1);
            assert_eq!(avg, u64::MAX - 1);
            assert_eq!(max, u64::MAX - 1);
        }
        _ => panic!("expected unsigned trend row"),
    }
}

// =============================================================================
// Merge Protocol
// =============================================================================

#[tokio::test]
async fn test_flush_merges_with_persisted_row() {
    let bed = TestBed::new();
    bed.add_item(float_item(1));

    // a row flushed earlier by another process
    bed.db.seed_trend(
        TrendTable::Float,
        TrendRow {
            item_id: ItemId::new(1),
            clock: 3600,
            num: 2,
            value: TrendRowValue::Float {
                min: 4.0,
                avg: 5.0,
                max: 6.0,
            },
        },
    );

    stage_floats(&bed, 1, &[(3600, 10.0), (3601, 20.0)]).await;
    bed.drain().await;
    bed.engine.sync_trends().await.unwrap();

    let row = bed.db.trend(TrendTable::Float, ItemId::new(1), 3600).unwrap();
    assert_eq!(row.num, 4);
    match row.value {
        TrendRowValue::Float { min, avg, max } => {
            assert_eq!(min, 4.0);
            assert_eq!(max, 20.0);
            // (2*5 + 10 + 20) / 4
            assert!((avg - 10.0).abs() < 1e-9);
        }
        _ => panic!("expected float trend row"),
    }
}

#[tokio::test]
async fn test_repeat_flush_same_hour_does_not_double_count() {
    let bed = TestBed::new();
    bed.add_item(float_item(1));

    stage_floats(&bed, 1, &[(3600, 1.0), (3601, 3.0)]).await;
    bed.drain().await;
    bed.engine.sync_trends().await.unwrap();
    assert_eq!(bed.db.existence_check_count(), 1);

    let row = bed.db.trend(TrendTable::Float, ItemId::new(1), 3600).unwrap();
    assert_eq!(row.num, 2);

    // new samples in the same hour, flushed again: the persisted row is
    // re-read and merged, never re-added
    stage_floats(&bed, 1, &[(3602, 5.0)]).await;
    bed.drain().await;
    bed.engine.sync_trends().await.unwrap();

    let row = bed.db.trend(TrendTable::Float, ItemId::new(1), 3600).unwrap();
    assert_eq!(row.num, 3);
    match row.value {
        TrendRowValue::Float { min, avg, max } => {
            assert_eq!(min, 1.0);
            assert_eq!(max, 5.0);
            assert!((avg - 3.0).abs() < 1e-9);
        }
        _ => panic!("expected float trend row"),
    }
}

#[tokio::test]
async fn test_disable_from_skips_existence_check_after_rollover() {
    let bed = TestBed::new();
    bed.add_item(float_item(1));

    // hour H
    stage_floats(&bed, 1, &[(3600, 1.0)]).await;
    bed.drain().await;
    assert_eq!(bed.db.existence_check_count(), 0);

    // move into hour H+1, past the cleanup settle window; the next flush
    // rolls hour H out to the database
    bed.clock.set(Timespec::new(7200 + 601, 0));
    stage_floats(&bed, 1, &[(7200 + 601, 2.0)]).await;
    bed.drain().await;

    assert_eq!(bed.db.existence_check_count(), 1);
    assert!(bed.db.trend(TrendTable::Float, ItemId::new(1), 3600).is_some());

    // the live aggregate for H+1 inherited the reconciliation watermark:
    // flushing it does not consult the database again
    bed.engine.sync_trends().await.unwrap();
    assert_eq!(bed.db.existence_check_count(), 1);
    assert!(bed.db.trend(TrendTable::Float, ItemId::new(1), 7200).is_some());
}

// =============================================================================
// Cleanup Sweep
// =============================================================================

#[tokio::test]
async fn test_cleanup_evicts_stale_hours() {
    let bed = TestBed::new();
    bed.add_item(float_item(1));
    bed.add_item(float_item(2));

    stage_floats(&bed, 1, &[(3600, 1.0)]).await;
    bed.drain().await;
    assert_eq!(bed.trends.len(), 1);

    // a flush pass in the next hour sweeps the stale aggregate out
    bed.clock.set(Timespec::new(7200 + 601, 0));
    stage_floats(&bed, 2, &[(7200 + 650, 2.0)]).await;
    bed.drain().await;

    assert!(bed.trends.get(ItemId::new(1)).is_none());
    assert!(bed.trends.get(ItemId::new(2)).is_some());
    assert!(bed.db.trend(TrendTable::Float, ItemId::new(1), 3600).is_some());
}

// =============================================================================
// Forced Full Flush
// =============================================================================

#[tokio::test]
async fn test_sync_trends_flushes_everything_in_one_transaction() {
    let bed = TestBed::new();
    for id in 1..=4 {
        bed.add_item(float_item(id));
    }

    for id in 1..=4u64 {
        stage_floats(&bed, id, &[(3600 + id as i64, id as f64)]).await;
    }
    bed.drain().await;
    assert_eq!(bed.trends.len(), 4);

    let commits_before = bed.db.commit_count();
    let flushed = bed.engine.sync_trends().await.unwrap();

    assert_eq!(flushed, 4);
    assert!(bed.trends.is_empty());
    assert_eq!(bed.db.commit_count(), commits_before + 1);
    for id in 1..=4u64 {
        assert!(bed.db.trend(TrendTable::Float, ItemId::new(id), 3600).is_some());
    }
}

#[tokio::test]
async fn test_sync_trends_with_nothing_to_flush() {
    let bed = TestBed::new();
    assert_eq!(bed.engine.sync_trends().await.unwrap(), 0);
    assert_eq!(bed.db.begin_count(), 0);
}

#[tokio::test]
async fn test_full_shutdown_flushes_history_and_trends() {
    let bed = TestBed::new();
    bed.add_item(float_item(1));

    stage_floats(&bed, 1, &[(3600, 2.0), (3650, 4.0)]).await;

    let flushed = bed.engine.sync_all().await.unwrap();
    assert_eq!(flushed, 2);
    assert!(bed.cache.is_empty());
    assert!(bed.trends.is_empty());

    let row = bed.db.trend(TrendTable::Float, ItemId::new(1), 3600).unwrap();
    assert_eq!(row.num, 2);

    // a second shutdown flush finds nothing and changes nothing
    let flushed = bed.engine.sync_all().await.unwrap();
    assert_eq!(flushed, 0);
    let row = bed.db.trend(TrendTable::Float, ItemId::new(1), 3600).unwrap();
    assert_eq!(row.num, 2);
}

// =============================================================================
// Incremental Passes Do Not Flush Live Hours
// =============================================================================

#[tokio::test]
async fn test_live_hour_stays_in_memory() {
    let bed = TestBed::new();
    bed.add_item(float_item(1));

    stage_floats(&bed, 1, &[(3600, 1.0), (3700, 2.0), (3800, 3.0)]).await;
    bed.engine.synchronize(SyncMode::Incremental).await.unwrap();
    bed.drain().await;

    // all samples of the current hour aggregate in memory only
    assert!(bed.db.trend(TrendTable::Float, ItemId::new(1), 3600).is_none());
    let aggregate = bed.trends.get(ItemId::new(1)).unwrap();
    assert_eq!(aggregate.num, 3);
}
