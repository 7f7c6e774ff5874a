//! Runtime error taxonomy shared by the watcher and the orchestrator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::Error),

    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("MongoDB unavailable: {0}")]
    StorageUnavailable(String),

    #[error("NATS unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("existing {resource} conflicts with the requested configuration: {detail}")]
    ConfigConflict { resource: String, detail: String },

    #[error("malformed change event: {0}")]
    EventMalformed(String),

    #[error("bootstrap failed for collection '{collection}': {source}")]
    Bootstrap {
        collection: String,
        #[source]
        source: Box<Error>,
    },

    #[error("task aborted: {0}")]
    Aborted(String),

    #[error("shutdown requested")]
    Cancelled,
}

impl Error {
    /// Whether the watcher must give up and propagate instead of retrying.
    ///
    /// Transient connectivity loss is absorbed by the backoff loop; anything
    /// that would fail the same way on the next attempt is fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Config(_)
            | Error::ConfigConflict { .. }
            | Error::EventMalformed(_)
            | Error::Bootstrap { .. }
            | Error::Aborted(_) => true,
            Error::Mongo(e) => is_auth_error(e),
            Error::StorageUnavailable(_) | Error::BrokerUnavailable(_) | Error::Cancelled => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Short error category for log lines and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config-invalid",
            Error::Mongo(_) | Error::StorageUnavailable(_) => "storage-unavailable",
            Error::BrokerUnavailable(_) => "broker-unavailable",
            Error::ConfigConflict { .. } => "config-conflict",
            Error::EventMalformed(_) => "event-malformed",
            Error::Bootstrap { .. } => "bootstrap-failed",
            Error::Aborted(_) => "aborted",
            Error::Cancelled => "cancelled",
        }
    }
}

fn is_auth_error(e: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;

    // Unauthorized (13) and AuthenticationFailed (18) will not heal on retry.
    match &*e.kind {
        ErrorKind::Authentication { .. } => true,
        ErrorKind::Command(c) => c.code == 13 || c.code == 18,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_not_fatal() {
        assert!(!Error::StorageUnavailable("down".into()).is_fatal());
        assert!(!Error::BrokerUnavailable("down".into()).is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }

    #[test]
    fn config_and_conflict_errors_are_fatal() {
        let conflict = Error::ConfigConflict {
            resource: "stream COLL1".into(),
            detail: "subjects differ".into(),
        };
        assert!(conflict.is_fatal());
        assert!(Error::EventMalformed("no _id".into()).is_fatal());

        let bootstrap = Error::Bootstrap {
            collection: "db.coll".into(),
            source: Box::new(Error::StorageUnavailable("down".into())),
        };
        assert!(bootstrap.is_fatal());
        assert_eq!(bootstrap.kind(), "bootstrap-failed");
    }

    #[test]
    fn cancelled_is_recognized() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::BrokerUnavailable("down".into()).is_cancelled());
    }
}
