//! ## metals-processor
//! Consumes metal price events from Kafka and stores them in MongoDB.
//!
//! ## Configuration
//! Everything has a default and can be overridden from the environment:
//! ```text
//! KAFKA_BOOTSTRAP_SERVERS=kafka:9092
//! KAFKA_TOPIC=metals-prices
//! KAFKA_GROUP_ID=metals-processor-group
//! MONGODB_HOST=mongodb
//! MONGODB_PORT=27017
//! MONGODB_DATABASE=metals
//! MONGODB_USERNAME=admin
//! MONGODB_PASSWORD_FILE=/run/secrets/mongodb-password   # MONGODB_PASSWORD if unreadable
//! PROCESSOR_BATCH_SIZE=50
//! PROCESSOR_FLUSH_INTERVAL_SECONDS=5
//! PROCESSOR_WRITE_TIMEOUT_SECONDS=10
//! PROCESSOR_MAX_DELIVERY_ATTEMPTS=3
//! STATUS_PORT=8001
//! LOG_LEVEL=info
//! ```
//! The same keys, lowercased, may be put into a config file passed with `--config`.
//!
//! ## Kafka and MongoDB
//! Delivery is at-least-once. Every event is upserted by its `event_id`,
//! so a redelivered event overwrites its earlier copy instead of duplicating it.
//!
//! Offsets are committed manually, in batches: when [`batch_size`] records are
//! pending, or when records are pending and the flush interval has passed since
//! the previous commit. Only offsets of persisted records are committed. A record
//! that fails to persist is read again from its offset, up to
//! `PROCESSOR_MAX_DELIVERY_ATTEMPTS` times, and then skipped with an error log.
//!
//! When either dependency goes away the processor drops both connections and
//! reconnects, retrying forever. `/health`, `/stats` and `/metrics` report
//! what it is doing.
//!
//! [`batch_size`]: processor::ProcessorConfig::batch_size

pub mod batch;
pub mod connection;
pub mod error;
pub mod event;
pub mod kafka;
pub mod metrics;
pub mod processor;
pub mod settings;
pub mod state;
pub mod status;
pub mod store;
pub mod writer;
