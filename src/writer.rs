//! Idempotent persistence of single events
use std::{sync::Arc, time::Duration};

use tokio::time::{timeout, Instant};
use tracing::{debug, error, info};

use crate::{
    error::PersistError,
    event::{PriceEvent, PriceRecord},
    state::SharedState,
    store::{PriceStore, UpsertOutcome},
};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upserts events keyed by `event_id`, so redelivered events overwrite
/// instead of duplicating. Outcomes are published to the shared state.
pub struct IdempotentWriter {
    processor_id: String,
    write_timeout: Duration,
    state: Arc<SharedState>,
}

impl IdempotentWriter {
    pub fn new(processor_id: String, write_timeout: Duration, state: Arc<SharedState>) -> Self {
        IdempotentWriter {
            processor_id,
            write_timeout,
            state,
        }
    }

    pub fn processor_id(&self) -> &str {
        &self.processor_id
    }

    /// Decodes a raw message value and persists it
    pub async fn persist_payload(
        &self,
        store: &dyn PriceStore,
        payload: Option<&[u8]>,
    ) -> Result<UpsertOutcome, PersistError> {
        let decoded = match payload {
            Some(bytes) => PriceEvent::from_json(bytes),
            None => Err(PersistError::Malformed("empty message".to_string())),
        };
        match decoded {
            Ok(event) => self.persist(store, event).await,
            Err(e) => Err(self.fail(e)),
        }
    }

    pub async fn persist(
        &self,
        store: &dyn PriceStore,
        event: PriceEvent,
    ) -> Result<UpsertOutcome, PersistError> {
        let started = Instant::now();
        if let Err(e) = event.validate() {
            return Err(self.fail(e));
        }
        let record = PriceRecord::stamp(event, &self.processor_id);

        let outcome = match timeout(self.write_timeout, store.upsert(&record)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(self.fail(e.into())),
            Err(_) => return Err(self.fail(PersistError::Timeout(self.write_timeout))),
        };

        let event = &record.event;
        self.state
            .record_processed(&event.event_id, &event.metal, outcome, started.elapsed());
        match outcome {
            UpsertOutcome::Inserted => info!("processed: {} @ ${}", event.metal, event.price),
            UpsertOutcome::Updated => debug!(event_id = %event.event_id, "replaced existing record"),
        }
        Ok(outcome)
    }

    fn fail(&self, err: PersistError) -> PersistError {
        error!(error = %err, "processing error");
        self.state.record_error(err.to_string());
        err
    }
}
