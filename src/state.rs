//! Process-wide state shared by the processing loop and the status server.
//!
//! The loop is the only writer. Readers never wait on the loop: flags and
//! counters are atomics, the few strings sit behind short-lived locks.
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::{
    metrics::ProcessorMetrics,
    store::{PriceStore, UpsertOutcome},
};

pub const SERVICE_NAME: &str = "metals-processor";

/// External dependencies whose connectivity is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    Kafka,
    MongoDb,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Kafka => write!(f, "kafka"),
            Dependency::MongoDb => write!(f, "mongodb"),
        }
    }
}

pub struct SharedState {
    kafka_connected: AtomicBool,
    mongodb_connected: AtomicBool,
    processed_count: AtomicU64,
    error_count: AtomicU64,
    last_processed: RwLock<Option<String>>,
    last_error: RwLock<Option<String>>,
    store: RwLock<Option<Arc<dyn PriceStore>>>,
    metrics: ProcessorMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub kafka_connected: bool,
    pub mongodb_status: &'static str,
    pub processed_count: u64,
    pub error_count: u64,
    pub last_processed: Option<String>,
    pub last_error: Option<String>,
    pub timestamp: String,
    pub service: &'static str,
    pub version: &'static str,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub processed_count: u64,
    pub error_count: u64,
    pub total_documents: u64,
    pub kafka_connected: bool,
    pub mongodb_connected: bool,
}

impl SharedState {
    pub fn new(metrics: ProcessorMetrics) -> Self {
        SharedState {
            kafka_connected: AtomicBool::new(false),
            mongodb_connected: AtomicBool::new(false),
            processed_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_processed: RwLock::new(None),
            last_error: RwLock::new(None),
            store: RwLock::new(None),
            metrics,
        }
    }

    pub fn metrics(&self) -> &ProcessorMetrics {
        &self.metrics
    }

    pub fn set_connected(&self, dependency: Dependency, connected: bool) {
        match dependency {
            Dependency::Kafka => {
                self.kafka_connected.store(connected, Ordering::SeqCst);
                self.metrics.set_kafka_connected(connected);
            }
            Dependency::MongoDb => {
                self.mongodb_connected.store(connected, Ordering::SeqCst);
                self.metrics.set_mongodb_connected(connected);
            }
        }
    }

    pub fn is_connected(&self, dependency: Dependency) -> bool {
        match dependency {
            Dependency::Kafka => self.kafka_connected.load(Ordering::SeqCst),
            Dependency::MongoDb => self.mongodb_connected.load(Ordering::SeqCst),
        }
    }

    pub fn record_processed(
        &self,
        event_id: &str,
        metal: &str,
        outcome: UpsertOutcome,
        elapsed: Duration,
    ) {
        self.processed_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_processed(metal, outcome, elapsed);
        *self.last_processed.write() = Some(event_id.to_string());
    }

    /// Counts a failed record and remembers why it failed
    pub fn record_error(&self, message: impl Into<String>) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_error();
        self.set_last_error(message);
    }

    /// Remembers a failure without counting it as a failed record
    pub fn set_last_error(&self, message: impl Into<String>) {
        *self.last_error.write() = Some(message.into());
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Makes the live storage handle visible to readers, `None` once it is dropped
    pub fn publish_store(&self, store: Option<Arc<dyn PriceStore>>) {
        *self.store.write() = store;
    }

    pub fn store(&self) -> Option<Arc<dyn PriceStore>> {
        self.store.read().clone()
    }

    pub fn health(&self) -> HealthReport {
        let kafka_connected = self.is_connected(Dependency::Kafka);
        let mongodb_connected = self.is_connected(Dependency::MongoDb);
        HealthReport {
            status: if kafka_connected && mongodb_connected {
                "healthy"
            } else {
                "unhealthy"
            },
            kafka_connected,
            mongodb_status: if mongodb_connected {
                "connected"
            } else {
                "disconnected"
            },
            processed_count: self.processed_count(),
            error_count: self.error_count(),
            last_processed: self.last_processed.read().clone(),
            last_error: self.last_error.read().clone(),
            timestamp: Utc::now().to_rfc3339(),
            service: SERVICE_NAME,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn stats(&self, total_documents: u64) -> StatsReport {
        StatsReport {
            processed_count: self.processed_count(),
            error_count: self.error_count(),
            total_documents,
            kafka_connected: self.is_connected(Dependency::Kafka),
            mongodb_connected: self.is_connected(Dependency::MongoDb),
        }
    }
}
