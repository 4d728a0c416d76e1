//! Error types of the processing pipeline
use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::state::Dependency;

/// Errors returned by a [`PriceStore`](crate::store::PriceStore)
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Storage can't be reached at all (server selection, network, pool cleared)
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Storage answered but rejected the write
    #[error("write rejected: {0}")]
    Write(String),

    #[error("encoding document: {0}")]
    Encode(String),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;
        match err.kind.as_ref() {
            ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. } => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Write(err.to_string()),
        }
    }
}

impl From<mongodb::bson::ser::Error> for StoreError {
    fn from(err: mongodb::bson::ser::Error) -> Self {
        StoreError::Encode(err.to_string())
    }
}

/// Why a single event could not be persisted
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PersistError {
    /// Whether the failure means storage itself is gone, not just this record
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PersistError::Store(StoreError::Unavailable(_)))
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        PersistError::Malformed(err.to_string())
    }
}

/// Errors of a [`RecordSource`](crate::kafka::RecordSource)
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("kafka: {0}")]
    Kafka(#[from] KafkaError),
}

/// Faults that make the processing loop drop both connections and start over
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("persisting record: {0}")]
    StorageUnavailable(#[source] PersistError),

    #[error("{0} is not connected")]
    NotConnected(Dependency),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_store_errors_are_classified() {
        let err = PersistError::Store(StoreError::Unavailable("no servers".into()));
        assert!(err.is_unavailable());

        let err = PersistError::Store(StoreError::Write("duplicate key".into()));
        assert!(!err.is_unavailable());
        assert!(!PersistError::Timeout(Duration::from_secs(1)).is_unavailable());
    }

    #[test]
    fn json_errors_become_malformed() {
        let err: PersistError = serde_json::from_slice::<serde_json::Value>(b"{")
            .unwrap_err()
            .into();
        assert!(matches!(err, PersistError::Malformed(_)));
    }
}
