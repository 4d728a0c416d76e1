//! Storage backends for price records
pub mod memory;
pub mod mongo;

use async_trait::async_trait;

use crate::{error::StoreError, event::PriceRecord};

pub use memory::MemoryStore;
pub use mongo::{MongoConnector, MongoSettings, MongoStore};

/// What an upsert did to the collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Document store holding at most one record per `event_id`
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Inserts the record, or overwrites the fields of the record with the same `event_id`
    async fn upsert(&self, record: &PriceRecord) -> Result<UpsertOutcome, StoreError>;

    /// Number of stored records
    async fn count(&self) -> Result<u64, StoreError>;

    async fn close(&self) {}
}
