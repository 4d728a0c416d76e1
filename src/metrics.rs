//! Prometheus metrics for the processor
//!
//! Metrics live in a registry owned by [`ProcessorMetrics`], so every
//! [`SharedState`](crate::state::SharedState) exposes its own independent set.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;

use crate::store::UpsertOutcome;

pub struct ProcessorMetrics {
    registry: Registry,
    /// Messages persisted, by metal
    messages_total: IntCounterVec,
    errors_total: IntCounter,
    /// New documents created, by metal
    inserts_total: IntCounterVec,
    consumer_lag: IntGaugeVec,
    mongodb_connection_status: IntGauge,
    kafka_connection_status: IntGauge,
    processing_duration: Histogram,
}

impl ProcessorMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let messages_total = IntCounterVec::new(
            Opts::new("processor_messages_total", "Total messages processed"),
            &["metal"],
        )?;
        let errors_total =
            IntCounter::with_opts(Opts::new("processor_errors_total", "Total processing errors"))?;
        let inserts_total = IntCounterVec::new(
            Opts::new("mongodb_inserts_total", "Total MongoDB inserts"),
            &["metal"],
        )?;
        let consumer_lag = IntGaugeVec::new(
            Opts::new("kafka_consumer_lag", "Kafka consumer lag"),
            &["partition"],
        )?;
        let mongodb_connection_status = IntGauge::with_opts(Opts::new(
            "mongodb_connection_status",
            "MongoDB connection status (1=connected, 0=disconnected)",
        ))?;
        let kafka_connection_status = IntGauge::with_opts(Opts::new(
            "kafka_connection_status",
            "Kafka connection status (1=connected, 0=disconnected)",
        ))?;
        let processing_duration = Histogram::with_opts(HistogramOpts::new(
            "processing_duration_seconds",
            "Time spent processing messages",
        ))?;

        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(inserts_total.clone()))?;
        registry.register(Box::new(consumer_lag.clone()))?;
        registry.register(Box::new(mongodb_connection_status.clone()))?;
        registry.register(Box::new(kafka_connection_status.clone()))?;
        registry.register(Box::new(processing_duration.clone()))?;

        Ok(ProcessorMetrics {
            registry,
            messages_total,
            errors_total,
            inserts_total,
            consumer_lag,
            mongodb_connection_status,
            kafka_connection_status,
            processing_duration,
        })
    }

    pub(crate) fn record_processed(&self, metal: &str, outcome: UpsertOutcome, elapsed: Duration) {
        self.messages_total.with_label_values(&[metal]).inc();
        if outcome == UpsertOutcome::Inserted {
            self.inserts_total.with_label_values(&[metal]).inc();
        }
        self.processing_duration.observe(elapsed.as_secs_f64());
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.inc();
    }

    pub(crate) fn set_kafka_connected(&self, connected: bool) {
        self.kafka_connection_status.set(connected as i64);
    }

    pub(crate) fn set_mongodb_connected(&self, connected: bool) {
        self.mongodb_connection_status.set(connected as i64);
    }

    pub fn set_consumer_lag(&self, partition: i32, lag: i64) {
        self.consumer_lag
            .with_label_values(&[&partition.to_string()])
            .set(lag);
    }

    /// Renders all metrics in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
