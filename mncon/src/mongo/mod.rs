//! MongoDB port: collection bootstrap, change stream consumption, and
//! resume-token persistence.

pub mod event;
pub mod resume_tokens;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use mongodb::bson::{doc, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, ResumeToken};
use mongodb::options::{FullDocumentBeforeChangeType, FullDocumentType};
use mongodb::Client;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::{self, Backoff};
use crate::config::CollectionSpec;
use crate::error::Error;
use resume_tokens::{ResumeTokensDb, TokenStore};

const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Ceiling on resume-token write retries. Must stay well under the broker's
/// deduplication window: a restart after an unpersisted token relies on that
/// window to collapse the replayed event.
const TOKEN_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Handler invoked for every mapped change event. Returning an error stops
/// the change stream; the watcher decides whether the error is fatal.
#[async_trait]
pub trait ChangeEventHandler: Send + Sync {
    async fn handle(&self, subject: &str, msg_id: &str, payload: &[u8]) -> Result<(), Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureCollectionOptions {
    pub db_name: String,
    pub coll_name: String,
    pub capped: bool,
    pub size_in_bytes: u64,
    pub change_stream_pre_and_post_images: bool,
}

pub struct WatchCollectionOptions {
    pub spec: CollectionSpec,
    pub handler: Arc<dyn ChangeEventHandler>,
}

/// Capability set the core needs from MongoDB.
#[async_trait]
pub trait MongoPort: Send + Sync {
    /// Create the collection if absent; idempotent. Fails with a
    /// configuration conflict when an existing collection contradicts the
    /// requested options.
    async fn ensure_collection(&self, opts: &EnsureCollectionOptions) -> Result<(), Error>;

    /// Tail the collection's change stream, resuming from the last persisted
    /// token. Invokes the handler per event and persists the new token after
    /// the handler succeeds. Returns `Ok` only on shutdown.
    async fn watch_collection(
        &self,
        opts: WatchCollectionOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), Error>;

    /// Runs until the connection is declared unhealthy or shutdown fires.
    /// Returning an error indicates readiness loss.
    async fn monitor(&self, shutdown: watch::Receiver<bool>) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;

    fn name(&self) -> &str;
}

pub struct MongoClient {
    client: Client,
}

impl MongoClient {
    pub async fn connect(uri: &str) -> Result<Self, Error> {
        let client = Client::with_uri_str(uri).await?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MongoPort for MongoClient {
    async fn ensure_collection(&self, opts: &EnsureCollectionOptions) -> Result<(), Error> {
        let db = self.client.database(&opts.db_name);

        let mut create = doc! {"create": &opts.coll_name};
        if opts.capped {
            create.insert("capped", true);
            create.insert("size", opts.size_in_bytes as i64);
        }

        match db.run_command(create).await {
            Ok(_) => {
                debug!(db = %opts.db_name, coll = %opts.coll_name, "Created collection");
            }
            Err(e) if is_namespace_exists(&e) => {
                if opts.capped {
                    let stats = db.run_command(doc! {"collStats": &opts.coll_name}).await?;
                    if !stats.get_bool("capped").unwrap_or(false) {
                        return Err(Error::ConfigConflict {
                            resource: format!("collection {}.{}", opts.db_name, opts.coll_name),
                            detail: "existing collection is not capped".to_string(),
                        });
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }

        if opts.change_stream_pre_and_post_images {
            db.run_command(doc! {
                "collMod": &opts.coll_name,
                "changeStreamPreAndPostImages": {"enabled": true},
            })
            .await
            .map_err(|e| {
                if matches!(&*e.kind, mongodb::error::ErrorKind::Command(_)) {
                    Error::ConfigConflict {
                        resource: format!("collection {}.{}", opts.db_name, opts.coll_name),
                        detail: format!("cannot enable pre and post images: {e}"),
                    }
                } else {
                    Error::Mongo(e)
                }
            })?;
        }

        Ok(())
    }

    async fn watch_collection(
        &self,
        opts: WatchCollectionOptions,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        let spec = opts.spec;
        let tokens = ResumeTokensDb::new(&self.client, &spec);

        let resume_after = tokens
            .last()
            .await?
            .and_then(|b| bson::from_bson::<ResumeToken>(b).ok());

        let collection = self
            .client
            .database(&spec.db_name)
            .collection::<Document>(&spec.coll_name);

        let mut watch = collection.watch().resume_after(resume_after);
        if spec.change_stream_pre_and_post_images {
            watch = watch
                .full_document(FullDocumentType::WhenAvailable)
                .full_document_before_change(FullDocumentBeforeChangeType::WhenAvailable);
        }
        let mut change_stream = watch.await?;
        info!(db = %spec.db_name, coll = %spec.coll_name, "Started watching collection");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                next = change_stream.next() => {
                    match next {
                        None => {
                            return Err(Error::StorageUnavailable(format!(
                                "change stream for {} closed",
                                spec.identity(),
                            )));
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(change)) => {
                            let token = change_stream.resume_token();
                            process_event(&spec, &change, token, opts.handler.as_ref(), &tokens, &mut shutdown)
                                .await?;
                        }
                    }
                }
            }
        }
    }

    async fn monitor(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let db = self.client.database("admin");
        loop {
            db.run_command(doc! {"ping": 1}).await?;
            if !backoff::sleep(MONITOR_INTERVAL, &mut shutdown).await {
                return Ok(());
            }
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.client.clone().shutdown().await;
        Ok(())
    }

    fn name(&self) -> &str {
        "mongodb"
    }
}

/// One step of the watch loop: map the event, hand it to the handler, then
/// persist the resume token. The token write starts only after the handler
/// acknowledged the event; a crash in between replays the event on restart
/// and broker-side deduplication collapses it. Token writes that keep
/// failing past [`TOKEN_WRITE_TIMEOUT`] become fatal rather than leaving
/// the persisted position to go stale.
async fn process_event(
    spec: &CollectionSpec,
    change: &ChangeStreamEvent<Document>,
    token: Option<ResumeToken>,
    handler: &dyn ChangeEventHandler,
    tokens: &dyn TokenStore,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), Error> {
    let Some(msg) = event::map_change_event(&spec.stream_name, change)? else {
        warn!(
            db = %spec.db_name,
            coll = %spec.coll_name,
            operation = ?change.operation_type,
            "Suppressing collection lifecycle event",
        );
        return Ok(());
    };

    handler.handle(&msg.subject, &msg.msg_id, &msg.payload).await?;

    let Some(token) = token else {
        warn!(db = %spec.db_name, coll = %spec.coll_name, "No resume token found in change event");
        return Ok(());
    };
    let value = bson::to_bson(&token)
        .map_err(|e| Error::EventMalformed(format!("resume token is not serializable: {e}")))?;

    let started = tokio::time::Instant::now();
    let mut retry = Backoff::default();
    loop {
        match tokens.save(&value).await {
            Ok(()) => {
                debug!(db = %spec.db_name, coll = %spec.coll_name, msg_id = %msg.msg_id, "Saved resume token");
                return Ok(());
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                if started.elapsed() >= TOKEN_WRITE_TIMEOUT {
                    error!(
                        db = %spec.db_name,
                        coll = %spec.coll_name,
                        error = %e,
                        "Resume token writes kept failing, giving up",
                    );
                    return Err(Error::Aborted(format!(
                        "resume token write for {} kept failing for {:?}: {e}",
                        spec.identity(),
                        TOKEN_WRITE_TIMEOUT,
                    )));
                }
                warn!(
                    db = %spec.db_name,
                    coll = %spec.coll_name,
                    error = %e,
                    "Failed to save resume token, retrying",
                );
                if !backoff::sleep(retry.next_delay(), shutdown).await {
                    return Err(Error::Cancelled);
                }
            }
        }
    }
}

fn is_namespace_exists(e: &mongodb::error::Error) -> bool {
    // NamespaceExists (48); older servers only report it in the message.
    matches!(&*e.kind, mongodb::error::ErrorKind::Command(c) if c.code == 48)
        || e.to_string().contains("already exists")
}
