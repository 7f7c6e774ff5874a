use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_TOKENS_DB_NAME: &str = "resume-tokens";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("watched collection is missing a database name")]
    DbNameMissing,
    #[error("watched collection is missing a collection name")]
    CollNameMissing,
    #[error("capped resume-token collections require a size greater than zero")]
    InvalidTokensCollSize,
    #[error("resume tokens cannot be stored in the watched collection '{db}.{coll}'")]
    TokensCollideWithWatched { db: String, coll: String },
    #[error("duplicate collection configuration found at index {first} and {second}")]
    DuplicateCollection { first: usize, second: usize },
    #[error("unsupported log level '{0}', expected one of debug, info, warn, error")]
    InvalidLogLevel(String),
}

#[derive(Debug, Deserialize, Clone, Hash, Eq, PartialEq)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Hash, Eq, PartialEq)]
pub struct WatchedDb {
    pub db_name: String,
    pub coll_name: String,
    #[serde(default)]
    pub change_stream_pre_and_post_images: bool,
}

#[derive(Debug, Default, Deserialize, Clone, Hash, Eq, PartialEq)]
pub struct ResumeTokensDb {
    pub tokens_db_name: Option<String>,
    pub tokens_coll_name: Option<String>,
    pub tokens_coll_capped: Option<bool>,
    pub tokens_coll_size_in_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone, Hash, Eq, PartialEq)]
pub struct Nats {
    pub stream_name: Option<String>,
}

/// One watched collection as written in the configuration file. Optional
/// fields default during [`Collection::resolve`].
#[derive(Debug, Deserialize, Clone, Hash, Eq, PartialEq)]
pub struct Collection {
    pub watched: WatchedDb,
    #[serde(default)]
    pub resume_tokens: ResumeTokensDb,
    #[serde(default)]
    pub nats: Nats,
}

impl Collection {
    pub fn new(db_name: impl Into<String>, coll_name: impl Into<String>) -> Self {
        Self {
            watched: WatchedDb {
                db_name: db_name.into(),
                coll_name: coll_name.into(),
                change_stream_pre_and_post_images: false,
            },
            resume_tokens: ResumeTokensDb::default(),
            nats: Nats::default(),
        }
    }

    pub fn with_pre_and_post_images(mut self) -> Self {
        self.watched.change_stream_pre_and_post_images = true;
        self
    }

    pub fn with_tokens_db_name(mut self, name: impl Into<String>) -> Self {
        self.resume_tokens.tokens_db_name = Some(name.into());
        self
    }

    pub fn with_tokens_coll_name(mut self, name: impl Into<String>) -> Self {
        self.resume_tokens.tokens_coll_name = Some(name.into());
        self
    }

    pub fn with_tokens_coll_capped(mut self, size_in_bytes: u64) -> Self {
        self.resume_tokens.tokens_coll_capped = Some(true);
        self.resume_tokens.tokens_coll_size_in_bytes = Some(size_in_bytes);
        self
    }

    pub fn with_stream_name(mut self, name: impl Into<String>) -> Self {
        self.nats.stream_name = Some(name.into());
        self
    }

    /// Apply defaults and validate, producing the immutable spec the core
    /// runs on. Validation happens here, once, never lazily.
    pub fn resolve(&self) -> Result<CollectionSpec, Error> {
        if self.watched.db_name.is_empty() {
            return Err(Error::DbNameMissing);
        }
        if self.watched.coll_name.is_empty() {
            return Err(Error::CollNameMissing);
        }

        let capped = self.resume_tokens.tokens_coll_capped.unwrap_or(false);
        let size = self.resume_tokens.tokens_coll_size_in_bytes.unwrap_or(0);
        if capped != (size > 0) {
            return Err(Error::InvalidTokensCollSize);
        }

        let tokens_db_name = self
            .resume_tokens
            .tokens_db_name
            .clone()
            .unwrap_or_else(|| DEFAULT_TOKENS_DB_NAME.to_string());
        let tokens_coll_name = self
            .resume_tokens
            .tokens_coll_name
            .clone()
            .unwrap_or_else(|| self.watched.coll_name.clone());

        if tokens_db_name == self.watched.db_name && tokens_coll_name == self.watched.coll_name {
            return Err(Error::TokensCollideWithWatched {
                db: self.watched.db_name.clone(),
                coll: self.watched.coll_name.clone(),
            });
        }

        let stream_name = self
            .nats
            .stream_name
            .clone()
            .unwrap_or_else(|| self.watched.coll_name.to_uppercase());

        Ok(CollectionSpec {
            db_name: self.watched.db_name.clone(),
            coll_name: self.watched.coll_name.clone(),
            change_stream_pre_and_post_images: self.watched.change_stream_pre_and_post_images,
            tokens_db_name,
            tokens_coll_name,
            tokens_coll_capped: capped,
            tokens_coll_size_in_bytes: size,
            stream_name,
        })
    }
}

/// Fully resolved configuration for one watched collection. Immutable after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub db_name: String,
    pub coll_name: String,
    pub change_stream_pre_and_post_images: bool,
    pub tokens_db_name: String,
    pub tokens_coll_name: String,
    pub tokens_coll_capped: bool,
    pub tokens_coll_size_in_bytes: u64,
    pub stream_name: String,
}

impl CollectionSpec {
    pub fn identity(&self) -> String {
        format!("{}.{}", self.db_name, self.coll_name)
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Connections {
    #[serde(default)]
    pub mongo_uri: String,
    #[serde(default)]
    pub nats_url: String,
    /// Listen address of the health endpoint; empty disables the server.
    #[serde(default)]
    pub server_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(skip)]
    connections: Connections,
    #[serde(default)]
    log: LogConfig,
    collections: Vec<Collection>,
    #[serde(skip)]
    specs: Vec<CollectionSpec>,
}

impl Settings {
    pub fn new(connections: Connections, collections: Vec<Collection>) -> Result<Self, Error> {
        Self::with_log(connections, LogConfig::default(), collections)
    }

    pub fn with_log(
        connections: Connections,
        log: LogConfig,
        collections: Vec<Collection>,
    ) -> Result<Self, Error> {
        match log.level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => return Err(Error::InvalidLogLevel(other.to_string())),
        }

        let mut seen = std::collections::HashMap::new();
        for (current, collection) in collections.iter().enumerate() {
            if let Some(first) = seen.insert(collection.clone(), current) {
                return Err(Error::DuplicateCollection {
                    first,
                    second: current,
                });
            }
        }

        let specs = collections
            .iter()
            .map(Collection::resolve)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            connections,
            log,
            collections,
            specs,
        })
    }

    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    pub fn log(&self) -> &LogConfig {
        &self.log
    }

    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }

    pub fn specs(&self) -> &[CollectionSpec] {
        &self.specs
    }
}
