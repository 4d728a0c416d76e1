use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{PriceStore, UpsertOutcome};
use crate::{error::StoreError, event::PriceRecord};

/// In-memory store keyed by `event_id`.
///
/// Clones share the same records. Failure and latency switches let callers
/// simulate a struggling backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    records: Mutex<HashMap<String, PriceRecord>>,
    unavailable: Mutex<bool>,
    write_delay: Mutex<Option<Duration>>,
    failing_writes: Mutex<u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event_id: &str) -> Option<PriceRecord> {
        self.inner.records.lock().get(event_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes every following call fail with [`StoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.inner.unavailable.lock() = unavailable;
    }

    /// Delays every following write
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.inner.write_delay.lock() = delay;
    }

    /// Rejects the next `count` writes with [`StoreError::Write`]
    pub fn fail_next_writes(&self, count: u32) {
        *self.inner.failing_writes.lock() = count;
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if *self.inner.unavailable.lock() {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PriceStore for MemoryStore {
    async fn upsert(&self, record: &PriceRecord) -> Result<UpsertOutcome, StoreError> {
        let delay = *self.inner.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_available()?;
        {
            let mut failing = self.inner.failing_writes.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(StoreError::Write("write rejected by memory store".to_string()));
            }
        }
        let mut records = self.inner.records.lock();
        match records.get_mut(record.event_id()) {
            // same as `$set`: fields missing from the new record survive
            Some(existing) => {
                let mut merged = record.clone();
                for (key, value) in std::mem::take(&mut existing.event.details) {
                    merged.event.details.entry(key).or_insert(value);
                }
                *existing = merged;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                records.insert(record.event_id().to_string(), record.clone());
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self.len() as u64)
    }
}
