//! Connector orchestrator: validates specs, bootstraps external resources,
//! fans out watchers, and owns graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::backoff::{self, Backoff};
use crate::config::{CollectionSpec, Settings};
use crate::error::Error;
use crate::health::Health;
use crate::metrics::Metrics;
use crate::mongo::{EnsureCollectionOptions, MongoClient, MongoPort};
use crate::nats::{EnsureStreamOptions, NatsClient, NatsPort};
use crate::watcher::Watcher;

/// Startup connections keep retrying on the shared backoff schedule until
/// this deadline passes.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(300);

/// Cooperative cancellation signal for a running connector.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Supervisor for the per-collection watchers.
///
/// Bootstrap ordering is strict: no watcher starts until every token
/// collection, watched collection, and stream for every spec has been
/// ensured. The first fatal watcher error cancels the rest; both ports are
/// closed exactly once on the way out.
pub struct Connector {
    settings: Settings,
    mongo: Arc<dyn MongoPort>,
    nats: Arc<dyn NatsPort>,
    metrics: Metrics,
    health: Health,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Connector {
    /// Connect to both services and build the connector. Connection attempts
    /// are retried for up to five minutes before giving up.
    pub async fn connect(settings: Settings) -> Result<Self, Error> {
        let (mongo, nats) = tokio::try_join!(
            Self::connect_mongo(&settings),
            Self::connect_nats(&settings),
        )?;
        Ok(Self::with_ports(settings, Arc::new(mongo), Arc::new(nats)))
    }

    /// Build a connector on pre-built ports. This is the seam used by tests
    /// and by embedders that manage their own clients; connection strings in
    /// `settings` are ignored.
    pub fn with_ports(
        settings: Settings,
        mongo: Arc<dyn MongoPort>,
        nats: Arc<dyn NatsPort>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            settings,
            mongo,
            nats,
            metrics: Metrics::new(),
            health: Health::new(),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    pub fn health(&self) -> Health {
        self.health.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    async fn connect_mongo(settings: &Settings) -> Result<MongoClient, Error> {
        let uri = settings.connections().mongo_uri.clone();
        backoff::retry_with_deadline(STARTUP_TIMEOUT, "connect mongodb", || {
            MongoClient::connect(&uri)
        })
        .await
    }

    async fn connect_nats(settings: &Settings) -> Result<NatsClient, Error> {
        let url = settings.connections().nats_url.clone();
        backoff::retry_with_deadline(STARTUP_TIMEOUT, "connect nats", || NatsClient::connect(&url))
            .await
    }

    /// Run the connector until shutdown or a fatal error.
    pub async fn run(&self) -> Result<(), Error> {
        if let Err(e) = self.bootstrap().await {
            error!(kind = e.kind(), error = %e, "Bootstrap failed");
            self.close_ports().await;
            return Err(e);
        }
        self.health.set_bootstrapped(true);
        info!("Bootstrap complete, starting watchers");

        let mut join_set = JoinSet::new();
        for spec in self.settings.specs() {
            info!(collection = %spec.identity(), stream = %spec.stream_name, "Starting watcher");
            let watcher = Watcher::new(
                spec.clone(),
                self.mongo.clone(),
                self.nats.clone(),
                self.metrics.clone(),
                self.shutdown_tx.subscribe(),
            );
            join_set.spawn(watcher.run());
        }
        self.metrics.set_watcher_count(join_set.len());

        let monitors = self.spawn_monitors();

        if self.settings.specs().is_empty() {
            self.await_shutdown().await;
        }

        let mut result = Ok(());
        while let Some(joined) = join_set.join_next().await {
            self.metrics.set_watcher_count(join_set.len());
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(kind = e.kind(), error = %e, "Watcher failed, shutting down");
                    if result.is_ok() {
                        result = Err(e);
                    }
                    self.signal_shutdown();
                }
                Err(e) => {
                    error!(error = %e, "Watcher task panicked, shutting down");
                    if result.is_ok() {
                        result = Err(Error::Aborted(e.to_string()));
                    }
                    self.signal_shutdown();
                }
            }
        }

        self.signal_shutdown();
        self.health.set_bootstrapped(false);
        for handle in monitors {
            let _ = handle.await;
        }
        self.close_ports().await;
        info!("Connector stopped");
        result
    }

    /// Sequentially ensure the token collection, the watched collection, and
    /// the stream for every spec. Failures carry the offending collection.
    async fn bootstrap(&self) -> Result<(), Error> {
        for spec in self.settings.specs() {
            self.bootstrap_collection(spec)
                .await
                .map_err(|e| Error::Bootstrap {
                    collection: spec.identity(),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    async fn bootstrap_collection(&self, spec: &CollectionSpec) -> Result<(), Error> {
        self.mongo
            .ensure_collection(&EnsureCollectionOptions {
                db_name: spec.tokens_db_name.clone(),
                coll_name: spec.tokens_coll_name.clone(),
                capped: spec.tokens_coll_capped,
                size_in_bytes: spec.tokens_coll_size_in_bytes,
                change_stream_pre_and_post_images: false,
            })
            .await?;

        self.mongo
            .ensure_collection(&EnsureCollectionOptions {
                db_name: spec.db_name.clone(),
                coll_name: spec.coll_name.clone(),
                capped: false,
                size_in_bytes: 0,
                change_stream_pre_and_post_images: spec.change_stream_pre_and_post_images,
            })
            .await?;

        self.nats
            .ensure_stream(&EnsureStreamOptions {
                stream_name: spec.stream_name.clone(),
            })
            .await?;

        info!(collection = %spec.identity(), stream = %spec.stream_name, "Bootstrapped collection");
        Ok(())
    }

    fn spawn_monitors(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let mongo = self.mongo.clone();
        let health = self.health.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        handles.push(tokio::spawn(async move {
            let mut retry = Backoff::default();
            loop {
                let mut shutdown = shutdown_tx.subscribe();
                if *shutdown.borrow() {
                    break;
                }
                match mongo.monitor(shutdown.clone()).await {
                    Ok(()) => break,
                    Err(e) => {
                        health.set_mongo_healthy(false);
                        warn!(port = mongo.name(), error = %e, "Port monitor reported unhealthy");
                        if !backoff::sleep(retry.next_delay(), &mut shutdown).await {
                            break;
                        }
                        health.set_mongo_healthy(true);
                    }
                }
            }
        }));

        let nats = self.nats.clone();
        let health = self.health.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        handles.push(tokio::spawn(async move {
            let mut retry = Backoff::default();
            loop {
                let mut shutdown = shutdown_tx.subscribe();
                if *shutdown.borrow() {
                    break;
                }
                match nats.monitor(shutdown.clone()).await {
                    Ok(()) => break,
                    Err(e) => {
                        health.set_nats_healthy(false);
                        warn!(port = nats.name(), error = %e, "Port monitor reported unhealthy");
                        if !backoff::sleep(retry.next_delay(), &mut shutdown).await {
                            break;
                        }
                        health.set_nats_healthy(true);
                    }
                }
            }
        }));

        handles
    }

    async fn await_shutdown(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    }

    fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn close_ports(&self) {
        if let Err(e) = self.mongo.close().await {
            warn!(port = self.mongo.name(), error = %e, "Failed to close port");
        }
        if let Err(e) = self.nats.close().await {
            warn!(port = self.nats.name(), error = %e, "Failed to close port");
        }
    }
}
