//! Kafka consumption with manual offset commits
use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    Message, Offset, TopicPartitionList,
};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::{
    batch::{Checkpoint, Position},
    connection::Connector,
    error::SourceError,
    state::Dependency,
};

pub const POLL_WAIT: Duration = Duration::from_secs(1);
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const WATERMARK_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub bootstrap_servers: String,
    pub topic: String,
    pub group_id: String,
}

/// A consumed message, detached from the consumer
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

impl SourceRecord {
    pub fn position(&self) -> Position {
        Position::new(self.topic.clone(), self.partition, self.offset)
    }
}

/// Log of records that is read in order and acknowledged explicitly
#[async_trait]
pub trait RecordSource: Send {
    /// Waits at most `wait` for up to `max_records` records, in delivery order
    async fn poll(
        &mut self,
        max_records: usize,
        wait: Duration,
    ) -> Result<Vec<SourceRecord>, SourceError>;

    fn commit(&self, checkpoint: &Checkpoint) -> Result<(), SourceError>;

    /// Makes the partition of `position` deliver again starting at `position`.
    /// Records of that partition already returned past it come again too.
    fn rewind(&self, position: &Position) -> Result<(), SourceError>;

    /// How far the given next offset is behind the end of the partition, if known
    fn lag(&self, _topic: &str, _partition: i32, _next_offset: i64) -> Option<i64> {
        None
    }
}

pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    pub fn new(consumer: StreamConsumer) -> Self {
        KafkaSource { consumer }
    }
}

#[async_trait]
impl RecordSource for KafkaSource {
    async fn poll(
        &mut self,
        max_records: usize,
        wait: Duration,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let deadline = Instant::now() + wait;
        let mut records = Vec::new();
        while records.len() < max_records {
            match timeout_at(deadline, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) if records.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    // hand over what we have, the error shows up again on the next poll
                    warn!("error receiving message: {e}");
                    break;
                }
                Ok(Ok(msg)) => records.push(SourceRecord {
                    topic: msg.topic().to_string(),
                    partition: msg.partition(),
                    offset: msg.offset(),
                    payload: msg.payload().map(<[u8]>::to_vec),
                }),
            }
        }
        Ok(records)
    }

    fn commit(&self, checkpoint: &Checkpoint) -> Result<(), SourceError> {
        let tpl = topic_partition_list(checkpoint)?;
        self.consumer.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }

    fn rewind(&self, position: &Position) -> Result<(), SourceError> {
        self.consumer.seek(
            &position.topic,
            position.partition,
            Offset::Offset(position.offset),
            SEEK_TIMEOUT,
        )?;
        Ok(())
    }

    /// Asks the partition leader for the high watermark
    fn lag(&self, topic: &str, partition: i32, next_offset: i64) -> Option<i64> {
        let watermarks = tokio::task::block_in_place(|| {
            self.consumer
                .fetch_watermarks(topic, partition, WATERMARK_TIMEOUT)
        });
        match watermarks {
            Ok((_, high)) => Some((high - next_offset).max(0)),
            Err(e) => {
                debug!(topic, partition, error = %e, "fetching watermarks");
                None
            }
        }
    }
}

fn topic_partition_list(checkpoint: &Checkpoint) -> Result<TopicPartitionList, SourceError> {
    let topic_map: HashMap<(String, i32), Offset> = checkpoint
        .offsets()
        .iter()
        .map(|(key, offset)| (key.clone(), Offset::Offset(*offset)))
        .collect();
    Ok(TopicPartitionList::from_topic_map(&topic_map)?)
}

pub struct KafkaConnector {
    settings: KafkaSettings,
}

impl KafkaConnector {
    pub fn new(settings: KafkaSettings) -> Self {
        KafkaConnector { settings }
    }
}

#[async_trait]
impl Connector for KafkaConnector {
    type Connection = KafkaSource;

    fn dependency(&self) -> Dependency {
        Dependency::Kafka
    }

    fn target(&self) -> String {
        self.settings.bootstrap_servers.clone()
    }

    async fn connect(&self) -> anyhow::Result<KafkaSource> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.settings.bootstrap_servers)
            .set("group.id", &self.settings.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[self.settings.topic.as_str()])?;

        // doubles as the reachability check: fails when no broker answers
        let topic = self.settings.topic.as_str();
        let metadata = tokio::task::block_in_place(|| {
            consumer.fetch_metadata(Some(topic), METADATA_TIMEOUT)
        })?;
        let partitions = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic && t.error().is_none())
            .map(|t| t.partitions().len())
            .unwrap_or(0);
        if partitions == 0 {
            warn!(topic, "topic doesn't exist yet, will be created automatically");
        }
        info!(
            topic,
            group = %self.settings.group_id,
            partitions,
            "subscribed to Kafka topic"
        );
        Ok(KafkaSource::new(consumer))
    }
}
