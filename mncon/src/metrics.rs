//! Metrics module for Prometheus integration

use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector for the MongoDB-NATS connector
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    running_watchers: Arc<Gauge>,
    collection_watchers: Arc<GaugeVec>,
    watcher_restarts: Arc<CounterVec>,
    watcher_failures: Arc<CounterVec>,
    watchers_started: Arc<Counter>,
    events_published: Arc<CounterVec>,
    publish_retries: Arc<CounterVec>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let running_watchers = Arc::new(
            Gauge::with_opts(Opts::new(
                "mncon_running_watchers_total",
                "Total number of running collection watchers",
            ))
            .expect("Failed to create running_watchers gauge"),
        );

        let collection_watchers = Arc::new(
            GaugeVec::new(
                Opts::new(
                    "mncon_collection_watchers",
                    "Number of watchers per collection",
                ),
                &["collection", "database"],
            )
            .expect("Failed to create collection_watchers gauge"),
        );

        let watcher_restarts = Arc::new(
            CounterVec::new(
                Opts::new(
                    "mncon_watcher_restarts_total",
                    "Total number of change stream restarts per collection",
                ),
                &["collection", "database", "reason"],
            )
            .expect("Failed to create watcher_restarts counter"),
        );

        let watcher_failures = Arc::new(
            CounterVec::new(
                Opts::new(
                    "mncon_watcher_failures_total",
                    "Total number of fatal watcher failures per collection",
                ),
                &["collection", "database", "error_kind"],
            )
            .expect("Failed to create watcher_failures counter"),
        );

        let watchers_started = Arc::new(
            Counter::with_opts(Opts::new(
                "mncon_watchers_started_total",
                "Total number of watchers started since connector startup",
            ))
            .expect("Failed to create watchers_started counter"),
        );

        let events_published = Arc::new(
            CounterVec::new(
                Opts::new(
                    "mncon_events_published_total",
                    "Total number of change events published per stream",
                ),
                &["stream"],
            )
            .expect("Failed to create events_published counter"),
        );

        let publish_retries = Arc::new(
            CounterVec::new(
                Opts::new(
                    "mncon_publish_retries_total",
                    "Total number of publish retries per stream",
                ),
                &["stream"],
            )
            .expect("Failed to create publish_retries counter"),
        );

        registry
            .register(Box::new((*running_watchers).clone()))
            .expect("Failed to register running_watchers metric");
        registry
            .register(Box::new((*collection_watchers).clone()))
            .expect("Failed to register collection_watchers metric");
        registry
            .register(Box::new((*watcher_restarts).clone()))
            .expect("Failed to register watcher_restarts metric");
        registry
            .register(Box::new((*watcher_failures).clone()))
            .expect("Failed to register watcher_failures metric");
        registry
            .register(Box::new((*watchers_started).clone()))
            .expect("Failed to register watchers_started metric");
        registry
            .register(Box::new((*events_published).clone()))
            .expect("Failed to register events_published metric");
        registry
            .register(Box::new((*publish_retries).clone()))
            .expect("Failed to register publish_retries metric");

        Self {
            registry,
            running_watchers,
            collection_watchers,
            watcher_restarts,
            watcher_failures,
            watchers_started,
            events_published,
            publish_retries,
        }
    }

    /// Set the total watcher count
    pub fn set_watcher_count(&self, count: usize) {
        self.running_watchers.set(count as f64);
    }

    /// Get the current total watcher count
    pub fn get_watcher_count(&self) -> usize {
        self.running_watchers.get() as usize
    }

    /// Record that a watcher was started for a collection
    pub fn record_watcher_start(&self, collection: &str, database: &str) {
        self.watchers_started.inc();
        self.collection_watchers
            .with_label_values(&[collection, database])
            .set(1.0);
    }

    /// Record that a watcher stopped for a collection
    pub fn record_watcher_stop(&self, collection: &str, database: &str) {
        self.collection_watchers
            .with_label_values(&[collection, database])
            .set(0.0);
    }

    /// Record a change stream restart
    pub fn record_watcher_restart(&self, collection: &str, database: &str, reason: &str) {
        self.watcher_restarts
            .with_label_values(&[collection, database, reason])
            .inc();
    }

    /// Record a fatal watcher failure
    pub fn record_watcher_failure(&self, collection: &str, database: &str, error_kind: &str) {
        self.watcher_failures
            .with_label_values(&[collection, database, error_kind])
            .inc();
    }

    /// Record a successfully published change event
    pub fn record_event_published(&self, stream: &str) {
        self.events_published.with_label_values(&[stream]).inc();
    }

    /// Record a publish retry
    pub fn record_publish_retry(&self, stream: &str) {
        self.publish_retries.with_label_values(&[stream]).inc();
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    /// Get the registry backing this collector
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }
}
