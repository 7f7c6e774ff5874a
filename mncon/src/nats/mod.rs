//! NATS JetStream port: stream bootstrap and deduplicated publication.

use std::time::Duration;

use async_nats::jetstream::{
    self,
    context::PublishErrorKind,
    stream::{Config as StreamConfig, StorageType},
};
use async_nats::HeaderMap;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::backoff;
use crate::error::Error;

/// JetStream deduplication window. Must exceed the maximum plausible time
/// between two delivery attempts of the same event.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureStreamOptions {
    pub stream_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub subject: String,
    pub msg_id: String,
    pub payload: Vec<u8>,
}

/// Capability set the core needs from NATS.
#[async_trait]
pub trait NatsPort: Send + Sync {
    /// Create the stream if absent; idempotent. Fails with a configuration
    /// conflict when an existing stream does not cover the subjects.
    async fn ensure_stream(&self, opts: &EnsureStreamOptions) -> Result<(), Error>;

    /// Publish with the deduplication id attached. Returns only after the
    /// broker acknowledged the message as durably committed or deduplicated.
    async fn publish(&self, opts: &PublishOptions) -> Result<(), Error>;

    /// Runs until the connection is declared unhealthy or shutdown fires.
    async fn monitor(&self, shutdown: watch::Receiver<bool>) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;

    fn name(&self) -> &str;
}

pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| Error::BrokerUnavailable(format!("connect to {url} failed: {e}")))?;
        let jetstream = jetstream::new(client.clone());
        Ok(Self { client, jetstream })
    }

    fn subjects(stream_name: &str) -> Vec<String> {
        // Subjects carry the uppercased stream name, matching the subjects
        // derived from change events.
        vec![format!("{}.*", stream_name.to_uppercase())]
    }
}

#[async_trait]
impl NatsPort for NatsClient {
    async fn ensure_stream(&self, opts: &EnsureStreamOptions) -> Result<(), Error> {
        let subjects = Self::subjects(&opts.stream_name);

        match self.jetstream.get_stream(&opts.stream_name).await {
            Ok(stream) => {
                let existing = &stream.cached_info().config.subjects;
                if !subjects.iter().all(|s| existing.contains(s)) {
                    return Err(Error::ConfigConflict {
                        resource: format!("stream {}", opts.stream_name),
                        detail: format!(
                            "existing subjects {existing:?} do not cover {subjects:?}"
                        ),
                    });
                }
                Ok(())
            }
            Err(_) => {
                self.jetstream
                    .create_stream(StreamConfig {
                        name: opts.stream_name.clone(),
                        subjects,
                        storage: StorageType::File,
                        duplicate_window: DUPLICATE_WINDOW,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| {
                        Error::BrokerUnavailable(format!(
                            "create stream {} failed: {e}",
                            opts.stream_name
                        ))
                    })?;
                info!(stream = %opts.stream_name, "Created stream");
                Ok(())
            }
        }
    }

    async fn publish(&self, opts: &PublishOptions) -> Result<(), Error> {
        let mut headers = HeaderMap::new();
        headers.insert("Nats-Msg-Id", opts.msg_id.as_str());

        let ack = self
            .jetstream
            .publish_with_headers(opts.subject.clone(), headers, opts.payload.clone().into())
            .await
            .map_err(|e| classify_publish_error(&opts.subject, e))?;
        ack.await
            .map_err(|e| classify_publish_error(&opts.subject, e))?;

        debug!(subject = %opts.subject, msg_id = %opts.msg_id, "Published change event");
        Ok(())
    }

    async fn monitor(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        use async_nats::connection::State;
        loop {
            if self.client.connection_state() == State::Disconnected {
                return Err(Error::BrokerUnavailable("connection lost".to_string()));
            }
            if !backoff::sleep(MONITOR_INTERVAL, &mut shutdown).await {
                return Ok(());
            }
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.client
            .flush()
            .await
            .map_err(|e| Error::BrokerUnavailable(format!("flush failed: {e}")))?;
        Ok(())
    }

    fn name(&self) -> &str {
        "nats"
    }
}

fn classify_publish_error(subject: &str, e: async_nats::jetstream::context::PublishError) -> Error {
    match e.kind() {
        // The stream was verified at bootstrap; its disappearance will not
        // heal on retry.
        PublishErrorKind::StreamNotFound => Error::ConfigConflict {
            resource: format!("subject {subject}"),
            detail: "stream no longer exists".to_string(),
        },
        _ => Error::BrokerUnavailable(format!("publish on {subject} failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_subjects_are_uppercased() {
        assert_eq!(NatsClient::subjects("coll1-stream"), vec!["COLL1-STREAM.*"]);
        assert_eq!(NatsClient::subjects("COLL1"), vec!["COLL1.*"]);
    }
}
