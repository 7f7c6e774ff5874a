//! Per-collection watcher: change stream consumption, publish retries, and
//! restart with backoff.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::{self, Backoff};
use crate::config::CollectionSpec;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::mongo::{ChangeEventHandler, MongoPort, WatchCollectionOptions};
use crate::nats::{NatsPort, PublishOptions};

/// One watcher per collection. Internally sequential: an event is published
/// and its token persisted before the next event is read.
pub struct Watcher {
    spec: CollectionSpec,
    mongo: Arc<dyn MongoPort>,
    nats: Arc<dyn NatsPort>,
    metrics: Metrics,
    shutdown: watch::Receiver<bool>,
}

impl Watcher {
    pub fn new(
        spec: CollectionSpec,
        mongo: Arc<dyn MongoPort>,
        nats: Arc<dyn NatsPort>,
        metrics: Metrics,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            spec,
            mongo,
            nats,
            metrics,
            shutdown,
        }
    }

    /// Run until shutdown or a fatal error. Transient change stream loss is
    /// absorbed: the stream is reopened with backoff, without a ceiling on
    /// the number of attempts.
    pub async fn run(self) -> Result<(), Error> {
        let mut shutdown = self.shutdown.clone();
        let handler: Arc<dyn ChangeEventHandler> = Arc::new(PublishHandler {
            spec: self.spec.clone(),
            nats: self.nats.clone(),
            metrics: self.metrics.clone(),
            shutdown: shutdown.clone(),
        });

        self.metrics
            .record_watcher_start(&self.spec.coll_name, &self.spec.db_name);
        let mut restart = Backoff::default();

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let started = Instant::now();
            let outcome = self
                .mongo
                .watch_collection(
                    WatchCollectionOptions {
                        spec: self.spec.clone(),
                        handler: handler.clone(),
                    },
                    shutdown.clone(),
                )
                .await;

            match outcome {
                Ok(()) => break Ok(()),
                Err(e) if e.is_cancelled() => break Ok(()),
                Err(e) if e.is_fatal() => {
                    error!(
                        collection = %self.spec.identity(),
                        kind = e.kind(),
                        error = %e,
                        "Watcher failed",
                    );
                    self.metrics.record_watcher_failure(
                        &self.spec.coll_name,
                        &self.spec.db_name,
                        e.kind(),
                    );
                    break Err(e);
                }
                Err(e) => {
                    // A stream that stayed up past the backoff cap earns a
                    // fresh schedule.
                    if started.elapsed() >= Backoff::CAP {
                        restart.reset();
                    }
                    self.metrics.record_watcher_restart(
                        &self.spec.coll_name,
                        &self.spec.db_name,
                        e.kind(),
                    );
                    let delay = restart.next_delay();
                    warn!(
                        collection = %self.spec.identity(),
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Change stream interrupted, backing off",
                    );
                    if !backoff::sleep(delay, &mut shutdown).await {
                        break Ok(());
                    }
                }
            }
        };

        self.metrics
            .record_watcher_stop(&self.spec.coll_name, &self.spec.db_name);
        info!(collection = %self.spec.identity(), "Watcher stopped");
        result
    }
}

/// Publish side of the watcher: retries transient broker failures with
/// backoff until success or shutdown.
struct PublishHandler {
    spec: CollectionSpec,
    nats: Arc<dyn NatsPort>,
    metrics: Metrics,
    shutdown: watch::Receiver<bool>,
}

#[async_trait]
impl ChangeEventHandler for PublishHandler {
    async fn handle(&self, subject: &str, msg_id: &str, payload: &[u8]) -> Result<(), Error> {
        let opts = PublishOptions {
            subject: subject.to_string(),
            msg_id: msg_id.to_string(),
            payload: payload.to_vec(),
        };
        let mut shutdown = self.shutdown.clone();
        let mut retry = Backoff::default();

        loop {
            match self.nats.publish(&opts).await {
                Ok(()) => {
                    self.metrics.record_event_published(&self.spec.stream_name);
                    debug!(subject = %opts.subject, msg_id = %opts.msg_id, "Published change event");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.metrics.record_publish_retry(&self.spec.stream_name);
                    warn!(
                        collection = %self.spec.identity(),
                        subject = %opts.subject,
                        error = %e,
                        "Publish failed, retrying",
                    );
                    if !backoff::sleep(retry.next_delay(), &mut shutdown).await {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }
    }
}
