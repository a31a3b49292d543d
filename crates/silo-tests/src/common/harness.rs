// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Test bed for integration tests.
//!
//! Assembles a history cache, trend cache and synchronization engine with
//! in-memory/mock implementations of every external collaborator, driven
//! by a manual clock.

use std::sync::Arc;

use silo_cache::{CacheConfig, HistoryCache, TrendCache, ValueWriter};
use silo_core::clock::ManualClock;
use silo_core::types::{ItemConfig, Role};
use silo_sync::{
    CollectingEvaluator, CollectingEventSink, InMemoryConfigCache, InMemoryRecentValueCache,
    InMemoryTriggerLocker, MockDatabase, SyncConfig, SyncEngine, SyncMode,
};

// =============================================================================
// Test Bed
// =============================================================================

/// The assembled cache + engine with mock collaborators.
pub struct TestBed {
    /// The history cache.
    pub cache: Arc<HistoryCache>,
    /// The trend cache.
    pub trends: Arc<TrendCache>,
    /// The mock database.
    pub db: Arc<MockDatabase>,
    /// The in-memory configuration cache.
    pub items: Arc<InMemoryConfigCache>,
    /// The in-memory trigger locker.
    pub triggers: Arc<InMemoryTriggerLocker>,
    /// The collecting event sink.
    pub events: Arc<CollectingEventSink>,
    /// The collecting evaluator.
    pub evaluator: Arc<CollectingEvaluator>,
    /// The in-memory recent-value cache.
    pub recent: Arc<InMemoryRecentValueCache>,
    /// The manual clock driving the bed.
    pub clock: Arc<ManualClock>,
    /// The engine under test.
    pub engine: SyncEngine,
}

impl TestBed {
    /// Creates a test bed with default (testing) configurations.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a test bed builder.
    pub fn builder() -> TestBedBuilder {
        TestBedBuilder::default()
    }

    /// Creates a writer bound to the bed's cache.
    pub fn writer(&self) -> ValueWriter {
        ValueWriter::new(self.cache.clone())
    }

    /// Registers an item configuration.
    pub fn add_item(&self, config: ItemConfig) {
        self.items.insert_item(config);
    }

    /// Runs full synchronizations until the cache reports empty, returning
    /// the total number of values flushed.
    pub async fn drain(&self) -> u64 {
        let mut total = 0;
        for _ in 0..100 {
            let flushed = self.engine.synchronize(SyncMode::Full).await.unwrap();
            total += flushed;
            if flushed == 0 {
                break;
            }
        }
        total
    }
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`TestBed`].
pub struct TestBedBuilder {
    role: Role,
    cache_config: CacheConfig,
    sync_config: Option<SyncConfig>,
    start_sec: i64,
    enable_tracing: bool,
}

impl Default for TestBedBuilder {
    fn default() -> Self {
        Self {
            role: Role::Server,
            cache_config: CacheConfig::for_testing(),
            sync_config: None,
            start_sec: 1000,
            enable_tracing: false,
        }
    }
}

impl TestBedBuilder {
    /// Sets the engine role.
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Sets the cache configuration.
    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    /// Sets the engine configuration.
    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = Some(config);
        self
    }

    /// Sets the clock's starting second.
    pub fn start_sec(mut self, sec: i64) -> Self {
        self.start_sec = sec;
        self
    }

    /// Enables tracing output for the test.
    pub fn with_tracing(mut self) -> Self {
        self.enable_tracing = true;
        self
    }

    /// Builds the test bed.
    pub fn build(self) -> TestBed {
        if self.enable_tracing {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
                )
                .with_test_writer()
                .try_init();
        }

        let clock = Arc::new(ManualClock::at(self.start_sec));
        let cache = Arc::new(HistoryCache::new(self.cache_config, clock.clone()));
        let trends = Arc::new(TrendCache::new());
        let db = Arc::new(MockDatabase::new());
        let items = Arc::new(InMemoryConfigCache::new());
        let triggers = Arc::new(InMemoryTriggerLocker::new());
        let events = Arc::new(CollectingEventSink::new());
        let evaluator = Arc::new(CollectingEvaluator::new());
        let recent = Arc::new(InMemoryRecentValueCache::new());

        let sync_config = self.sync_config.unwrap_or_else(|| {
            let mut config = SyncConfig::for_testing();
            config.role = self.role;
            config
        });

        let engine = SyncEngine::builder(cache.clone(), trends.clone(), db.clone())
            .items(items.clone())
            .triggers(triggers.clone())
            .evaluator(evaluator.clone())
            .events(events.clone())
            .recent(recent.clone())
            .clock(clock.clone())
            .config(sync_config)
            .build();

        TestBed {
            cache,
            trends,
            db,
            items,
            triggers,
            events,
            evaluator,
            recent,
            clock,
            engine,
        }
    }
}
