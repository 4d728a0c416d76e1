//! Price events as they arrive from Kafka and as they are stored
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PersistError;

/// Fields added by the processor; never taken from the incoming payload
const RESERVED_FIELDS: [&str; 3] = ["_id", "processed_at", "processor_id"];

/// Price event produced upstream.
///
/// Only `event_id`, `metal` and `price` are interpreted, everything else
/// (`unit`, `timestamp`, `source`, `market`, `volume`, ...) is carried through as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEvent {
    pub event_id: String,
    pub metal: String,
    pub price: f64,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl PriceEvent {
    /// Decodes a JSON message value
    pub fn from_json(payload: &[u8]) -> Result<Self, PersistError> {
        let event: PriceEvent = serde_json::from_slice(payload)?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<(), PersistError> {
        if self.event_id.is_empty() {
            return Err(PersistError::Malformed("empty event_id".to_string()));
        }
        Ok(())
    }
}

/// Event enriched with processing metadata, one per `event_id` in storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    #[serde(flatten)]
    pub event: PriceEvent,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub processed_at: DateTime<Utc>,
    pub processor_id: String,
}

impl PriceRecord {
    pub fn stamp(mut event: PriceEvent, processor_id: &str) -> Self {
        for field in RESERVED_FIELDS {
            event.details.remove(field);
        }
        PriceRecord {
            event,
            processed_at: Utc::now(),
            processor_id: processor_id.to_string(),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event.event_id
    }
}
