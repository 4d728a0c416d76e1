use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    batch::{
        CommitBatch, Position, Redeliveries, Redelivery, DEFAULT_BATCH_SIZE,
        DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_DELIVERY_ATTEMPTS,
    },
    connection::{ConnectionManager, Connector, RetryPolicy},
    error::ProcessorError,
    kafka::{RecordSource, SourceRecord, POLL_WAIT},
    state::{Dependency, SharedState},
    store::PriceStore,
    writer::{IdempotentWriter, DEFAULT_WRITE_TIMEOUT},
};

/// Pause after a loop fault before reconnecting
const FAULT_BACKOFF: Duration = Duration::from_secs(5);
/// Pause after a connection manager used up its retry budget
const RECONNECT_PAUSE: Duration = Duration::from_secs(10);
/// Minimum time between two consumer lag refreshes
const LAG_REPORT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// records per poll, and pending records that force a commit
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub poll_wait: Duration,
    pub write_timeout: Duration,
    /// deliveries of a failing record before it is given up
    pub max_delivery_attempts: u32,
    pub fault_backoff: Duration,
    pub reconnect_pause: Duration,
    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            poll_wait: POLL_WAIT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            fault_backoff: FAULT_BACKOFF,
            reconnect_pause: RECONNECT_PAUSE,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DisconnectedBroker,
    DisconnectedStorage,
    Polling,
    Idle,
}

/// Sequential consume → persist → commit loop.
///
/// Records are persisted one at a time in delivery order. Offsets are only
/// committed for persisted records (see [`CommitBatch`]). A record that fails
/// to persist has its partition rewound to it and is retried up to
/// [`ProcessorConfig::max_delivery_attempts`] times, then given up.
pub struct Processor<B: Connector, S: Connector> {
    broker: ConnectionManager<B>,
    storage: ConnectionManager<S>,
    writer: IdempotentWriter,
    batch: CommitBatch,
    redeliveries: Redeliveries,
    lag_reported: Option<Instant>,
    config: ProcessorConfig,
    state: Arc<SharedState>,
    cancel: CancellationToken,
    source: Option<B::Connection>,
    store: Option<Arc<dyn PriceStore>>,
    phase: Phase,
}

impl<B, S> Processor<B, S>
where
    B: Connector,
    B::Connection: RecordSource,
    S: Connector,
    S::Connection: PriceStore,
{
    pub fn new(
        broker: B,
        storage: S,
        config: ProcessorConfig,
        processor_id: String,
        state: Arc<SharedState>,
        cancel: CancellationToken,
    ) -> Self {
        Processor {
            broker: ConnectionManager::new(broker, config.retry, state.clone(), cancel.clone()),
            storage: ConnectionManager::new(storage, config.retry, state.clone(), cancel.clone()),
            writer: IdempotentWriter::new(processor_id, config.write_timeout, state.clone()),
            batch: CommitBatch::new(config.batch_size, config.flush_interval),
            redeliveries: Redeliveries::new(config.max_delivery_attempts),
            lag_reported: None,
            config,
            state,
            cancel,
            source: None,
            store: None,
            phase: Phase::DisconnectedBroker,
        }
    }

    /// Runs until the cancellation token fires, then commits what it can and
    /// releases both connections.
    pub async fn run(mut self) {
        info!(
            processor_id = self.writer.processor_id(),
            batch_size = self.config.batch_size,
            "starting consumption"
        );
        while !self.cancel.is_cancelled() {
            let step = match self.phase {
                Phase::DisconnectedBroker => self.connect_broker().await,
                Phase::DisconnectedStorage => self.connect_storage().await,
                Phase::Polling => self.poll().await,
                Phase::Idle => self.flush_if_due().map(|_| Phase::Polling),
            };
            match step {
                Ok(next) => self.phase = next,
                Err(e) => self.recover(e).await,
            }
        }
        self.shutdown().await;
    }

    async fn connect_broker(&mut self) -> Result<Phase, ProcessorError> {
        match self.broker.connect().await {
            Some(source) => {
                self.source = Some(source);
                Ok(self.next_connect_phase())
            }
            None => {
                self.pause(self.config.reconnect_pause).await;
                Ok(Phase::DisconnectedBroker)
            }
        }
    }

    async fn connect_storage(&mut self) -> Result<Phase, ProcessorError> {
        match self.storage.connect().await {
            Some(store) => {
                let store: Arc<dyn PriceStore> = Arc::new(store);
                self.state.publish_store(Some(store.clone()));
                self.store = Some(store);
                Ok(self.next_connect_phase())
            }
            None => {
                self.pause(self.config.reconnect_pause).await;
                Ok(Phase::DisconnectedStorage)
            }
        }
    }

    fn next_connect_phase(&self) -> Phase {
        match (&self.source, &self.store) {
            (None, _) => Phase::DisconnectedBroker,
            (_, None) => Phase::DisconnectedStorage,
            _ => Phase::Polling,
        }
    }

    async fn poll(&mut self) -> Result<Phase, ProcessorError> {
        let source = self
            .source
            .as_mut()
            .ok_or(ProcessorError::NotConnected(Dependency::Kafka))?;
        let records = source
            .poll(self.config.batch_size, self.config.poll_wait)
            .await?;
        if records.is_empty() {
            return Ok(Phase::Idle);
        }
        let store = self
            .store
            .clone()
            .ok_or(ProcessorError::NotConnected(Dependency::MongoDb))?;

        debug!(count = records.len(), "polled records");
        // partitions rewound during this poll, their remaining records come again
        let mut rewound: HashSet<(&str, i32)> = HashSet::new();
        for record in &records {
            if rewound.contains(&(record.topic.as_str(), record.partition)) {
                continue;
            }
            let position = record.position();
            match self
                .writer
                .persist_payload(store.as_ref(), record.payload.as_deref())
                .await
            {
                Ok(_) => {
                    self.redeliveries.succeeded(&position);
                    self.batch.push(position);
                }
                Err(e) if e.is_unavailable() => {
                    return Err(ProcessorError::StorageUnavailable(e));
                }
                Err(e) => match self.redeliveries.failed(&position) {
                    Redelivery::Retry { attempt } => {
                        warn!(
                            topic = %position.topic,
                            partition = position.partition,
                            offset = position.offset,
                            attempt,
                            "record will be redelivered"
                        );
                        self.rewind(&position)?;
                        rewound.insert((record.topic.as_str(), record.partition));
                    }
                    Redelivery::GiveUp { attempts } => {
                        error!(
                            topic = %position.topic,
                            partition = position.partition,
                            offset = position.offset,
                            attempts,
                            error = %e,
                            "giving up on record"
                        );
                        self.batch.push(position);
                    }
                },
            }
            if self.batch.size_reached() {
                self.commit("batch size reached")?;
            }
        }
        self.report_lag(&records);
        self.flush_if_due()?;
        Ok(Phase::Polling)
    }

    fn rewind(&self, position: &Position) -> Result<(), ProcessorError> {
        let source = self
            .source
            .as_ref()
            .ok_or(ProcessorError::NotConnected(Dependency::Kafka))?;
        source.rewind(position)?;
        Ok(())
    }

    fn flush_if_due(&mut self) -> Result<(), ProcessorError> {
        if self.batch.interval_elapsed(Instant::now()) {
            self.commit("flush interval elapsed")?;
        }
        Ok(())
    }

    /// Takes the checkpoint and clears the batch, then commits it
    fn commit(&mut self, reason: &str) -> Result<(), ProcessorError> {
        let pending = self.batch.len();
        let Some(checkpoint) = self.batch.take_checkpoint(Instant::now()) else {
            return Ok(());
        };
        let source = self
            .source
            .as_ref()
            .ok_or(ProcessorError::NotConnected(Dependency::Kafka))?;
        source.commit(&checkpoint)?;
        info!(pending, reason, "committed batch");
        Ok(())
    }

    fn report_lag(&mut self, records: &[SourceRecord]) {
        let now = Instant::now();
        if matches!(self.lag_reported, Some(at) if now.duration_since(at) < LAG_REPORT_INTERVAL) {
            return;
        }
        let Some(source) = self.source.as_ref() else {
            return;
        };
        self.lag_reported = Some(now);
        let mut last: HashMap<(&str, i32), i64> = HashMap::new();
        for record in records {
            last.insert((record.topic.as_str(), record.partition), record.offset);
        }
        for ((topic, partition), offset) in last {
            if let Some(lag) = source.lag(topic, partition, offset + 1) {
                self.state.metrics().set_consumer_lag(partition, lag);
            }
        }
    }

    /// Drops both connections and starts over from connecting.
    /// Uncommitted records will be delivered again by the next consumer.
    async fn recover(&mut self, err: ProcessorError) {
        error!(error = %err, "processing loop failed, reconnecting");
        self.state.set_last_error(err.to_string());
        self.disconnect().await;
        self.batch.reset(Instant::now());
        self.redeliveries.clear();
        self.pause(self.config.fault_backoff).await;
        self.phase = Phase::DisconnectedBroker;
    }

    async fn disconnect(&mut self) {
        self.source = None;
        self.state.publish_store(None);
        if let Some(store) = self.store.take() {
            store.close().await;
        }
        self.broker.mark_disconnected();
        self.storage.mark_disconnected();
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = sleep(duration) => {}
        }
    }

    async fn shutdown(&mut self) {
        info!("shutting down");
        if self.source.is_some() {
            if let Err(e) = self.commit("shutdown") {
                error!(error = %e, "final commit failed");
            }
        }
        self.disconnect().await;
    }
}
