//! Application config
//!
//! Built-in defaults, overridden by an optional config file, overridden by
//! environment variables (`KAFKA_TOPIC`, `MONGODB_HOST`, `PROCESSOR_BATCH_SIZE`, ...).
use std::{fs, net::SocketAddr, path::Path, time::Duration};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use tracing::warn;

use crate::{
    kafka::KafkaSettings,
    processor::ProcessorConfig,
    store::MongoSettings,
};

const FALLBACK_PASSWORD: &str = "password";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// address of bootstrap kafka brokers
    pub kafka_bootstrap_servers: String,
    /// topic to consume
    pub kafka_topic: String,
    /// consumer group to use
    pub kafka_group_id: String,
    pub mongodb_host: String,
    pub mongodb_port: u16,
    pub mongodb_database: String,
    pub mongodb_username: String,
    /// mounted secret holding the MongoDB password
    pub mongodb_password_file: String,
    /// used when the secret file can't be read
    pub mongodb_password: Option<String>,
    /// records per poll and per commit (default: 50)
    pub processor_batch_size: usize,
    /// max age of uncommitted records (default: 5s)
    pub processor_flush_interval_seconds: u64,
    /// upper bound for one MongoDB write (default: 10s)
    pub processor_write_timeout_seconds: u64,
    /// deliveries of a record that keeps failing before it is skipped (default: 3)
    pub processor_max_delivery_attempts: u32,
    pub status_bind_address: String,
    pub status_port: u16,
    /// identity stamped on every record, random when unset
    pub hostname: Option<String>,
}

impl Settings {
    pub fn new(cfgfile: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;
        if let Some(path) = cfgfile {
            builder = builder.add_source(File::with_name(path).required(true));
        }
        Self::build(builder.add_source(Environment::default()))
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("kafka_bootstrap_servers", "kafka:9092")?
            .set_default("kafka_topic", "metals-prices")?
            .set_default("kafka_group_id", "metals-processor-group")?
            .set_default("mongodb_host", "mongodb")?
            .set_default("mongodb_port", 27017_i64)?
            .set_default("mongodb_database", "metals")?
            .set_default("mongodb_username", "admin")?
            .set_default("mongodb_password_file", "/run/secrets/mongodb-password")?
            .set_default("processor_batch_size", 50_i64)?
            .set_default("processor_flush_interval_seconds", 5_i64)?
            .set_default("processor_write_timeout_seconds", 10_i64)?
            .set_default("processor_max_delivery_attempts", 3_i64)?
            .set_default("status_bind_address", "0.0.0.0")?
            .set_default("status_port", 8001_i64)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        if settings.processor_batch_size == 0 {
            return Err(ConfigError::Message(
                "processor_batch_size must be at least 1".to_string(),
            ));
        }
        if settings.processor_flush_interval_seconds == 0 {
            return Err(ConfigError::Message(
                "processor_flush_interval_seconds must be at least 1".to_string(),
            ));
        }
        if settings.processor_max_delivery_attempts == 0 {
            return Err(ConfigError::Message(
                "processor_max_delivery_attempts must be at least 1".to_string(),
            ));
        }
        Ok(settings)
    }

    /// Secret file first, then `MONGODB_PASSWORD`, then the built-in fallback
    pub fn password(&self) -> String {
        match fs::read_to_string(Path::new(&self.mongodb_password_file)) {
            Ok(secret) => secret.trim().to_string(),
            Err(e) => {
                warn!(
                    path = %self.mongodb_password_file,
                    error = %e,
                    "failed to read MongoDB password file"
                );
                self.mongodb_password
                    .clone()
                    .unwrap_or_else(|| FALLBACK_PASSWORD.to_string())
            }
        }
    }

    pub fn processor_id(&self) -> String {
        match &self.hostname {
            Some(name) if !name.is_empty() => name.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn kafka(&self) -> KafkaSettings {
        KafkaSettings {
            bootstrap_servers: self.kafka_bootstrap_servers.clone(),
            topic: self.kafka_topic.clone(),
            group_id: self.kafka_group_id.clone(),
        }
    }

    pub fn mongo(&self) -> MongoSettings {
        MongoSettings {
            host: self.mongodb_host.clone(),
            port: self.mongodb_port,
            database: self.mongodb_database.clone(),
            username: self.mongodb_username.clone(),
            password: self.password(),
        }
    }

    pub fn processor(&self) -> ProcessorConfig {
        ProcessorConfig {
            batch_size: self.processor_batch_size,
            flush_interval: Duration::from_secs(self.processor_flush_interval_seconds),
            write_timeout: Duration::from_secs(self.processor_write_timeout_seconds),
            max_delivery_attempts: self.processor_max_delivery_attempts,
            ..ProcessorConfig::default()
        }
    }

    pub fn status_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.status_bind_address, self.status_port)
            .parse()
            .map_err(|e| ConfigError::Message(format!("invalid status address: {e}")))
    }
}
