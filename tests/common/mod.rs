//! Scripted broker and helpers for driving the processing loop in tests
#![allow(dead_code)]

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use metals_processor::{
    batch::{Checkpoint, Position},
    connection::Connector,
    error::SourceError,
    kafka::{RecordSource, SourceRecord},
    metrics::ProcessorMetrics,
    processor::{Processor, ProcessorConfig},
    state::{Dependency, SharedState},
    store::MemoryStore,
};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

pub const TOPIC: &str = "metals-prices";
pub const PROCESSOR_ID: &str = "test-processor";

#[derive(Default)]
struct BrokerLog {
    queued: VecDeque<Vec<SourceRecord>>,
    /// everything handed out so far, by (partition, offset)
    delivered: BTreeMap<(i32, i64), SourceRecord>,
    commits: Vec<Checkpoint>,
    rewinds: Vec<Position>,
    high_watermark: Option<i64>,
}

/// Broker that hands out pre-queued poll results and records commits.
/// A rewind puts the rewound partition's delivered records back in front.
#[derive(Clone, Default)]
pub struct ScriptedBroker {
    log: Arc<Mutex<BrokerLog>>,
    connects: Arc<AtomicU32>,
}

impl ScriptedBroker {
    pub fn enqueue(&self, records: Vec<SourceRecord>) {
        self.log.lock().queued.push_back(records);
    }

    pub fn commits(&self) -> Vec<Checkpoint> {
        self.log.lock().commits.clone()
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn rewinds(&self) -> Vec<Position> {
        self.log.lock().rewinds.clone()
    }

    /// Highest committed next offset of a partition
    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.log
            .lock()
            .commits
            .iter()
            .filter_map(|c| c.offset(TOPIC, partition))
            .max()
    }

    pub fn set_high_watermark(&self, offset: i64) {
        self.log.lock().high_watermark = Some(offset);
    }
}

pub struct ScriptedSource {
    broker: ScriptedBroker,
}

#[async_trait]
impl RecordSource for ScriptedSource {
    async fn poll(
        &mut self,
        max_records: usize,
        wait: Duration,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let next = {
            let mut log = self.broker.log.lock();
            let next = log.queued.pop_front();
            for record in next.iter().flatten() {
                log.delivered
                    .insert((record.partition, record.offset), record.clone());
            }
            next
        };
        match next {
            Some(records) => {
                assert!(records.len() <= max_records);
                Ok(records)
            }
            None => {
                sleep(wait).await;
                Ok(Vec::new())
            }
        }
    }

    fn commit(&self, checkpoint: &Checkpoint) -> Result<(), SourceError> {
        self.broker.log.lock().commits.push(checkpoint.clone());
        Ok(())
    }

    fn rewind(&self, position: &Position) -> Result<(), SourceError> {
        let mut log = self.broker.log.lock();
        let again: Vec<SourceRecord> = log
            .delivered
            .range((position.partition, position.offset)..(position.partition, i64::MAX))
            .map(|(_, record)| record.clone())
            .collect();
        log.queued.push_front(again);
        log.rewinds.push(position.clone());
        Ok(())
    }

    fn lag(&self, _topic: &str, _partition: i32, next_offset: i64) -> Option<i64> {
        let high = self.broker.log.lock().high_watermark?;
        Some(high - next_offset)
    }
}

#[async_trait]
impl Connector for ScriptedBroker {
    type Connection = ScriptedSource;

    fn dependency(&self) -> Dependency {
        Dependency::Kafka
    }

    fn target(&self) -> String {
        "scripted".to_string()
    }

    async fn connect(&self) -> anyhow::Result<ScriptedSource> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedSource {
            broker: self.clone(),
        })
    }
}

/// Hands out clones of one in-memory store
#[derive(Clone, Default)]
pub struct MemoryConnector {
    pub store: MemoryStore,
    connects: Arc<AtomicU32>,
}

impl MemoryConnector {
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryStore;

    fn dependency(&self) -> Dependency {
        Dependency::MongoDb
    }

    fn target(&self) -> String {
        "memory".to_string()
    }

    async fn connect(&self) -> anyhow::Result<MemoryStore> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.store.clone())
    }
}

pub fn record(partition: i32, offset: i64, payload: &str) -> SourceRecord {
    SourceRecord {
        topic: TOPIC.to_string(),
        partition,
        offset,
        payload: Some(payload.as_bytes().to_vec()),
    }
}

pub fn price(partition: i32, offset: i64, event_id: &str, metal: &str, price: f64) -> SourceRecord {
    let payload = serde_json::json!({
        "event_id": event_id,
        "metal": metal,
        "price": price,
        "unit": "USD/oz",
        "source": "metals-producer",
        "market": "COMEX",
        "volume": 1000,
    });
    record(partition, offset, &payload.to_string())
}

pub struct Running {
    pub state: Arc<SharedState>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl Running {
    pub async fn stop(self) {
        self.cancel.cancel();
        self.handle.await.expect("processor task panicked");
    }
}

pub fn start(config: ProcessorConfig, broker: &ScriptedBroker, storage: &MemoryConnector) -> Running {
    let state = Arc::new(SharedState::new(ProcessorMetrics::new().unwrap()));
    let cancel = CancellationToken::new();
    let processor = Processor::new(
        broker.clone(),
        storage.clone(),
        config,
        PROCESSOR_ID.to_string(),
        state.clone(),
        cancel.clone(),
    );
    let handle = tokio::spawn(processor.run());
    Running {
        state,
        cancel,
        handle,
    }
}

/// Polls `condition` every 100ms of (usually paused) time, panics after a simulated minute
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached in time");
}
