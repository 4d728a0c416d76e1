mod common;

use std::time::Duration;

use common::*;
use metals_processor::{processor::ProcessorConfig, state::Dependency};
use tokio::time::{sleep, Instant};

#[tokio::test(start_paused = true)]
async fn redelivered_event_is_stored_once_with_latest_payload() {
    let broker = ScriptedBroker::default();
    let storage = MemoryConnector::default();
    broker.enqueue(vec![price(0, 0, "gold-1700000000000-1234", "gold", 1950.25)]);
    broker.enqueue(vec![price(0, 1, "gold-1700000000000-1234", "gold", 1955.00)]);

    let running = start(ProcessorConfig::default(), &broker, &storage);
    wait_until(|| running.state.processed_count() == 2).await;

    assert_eq!(storage.store.len(), 1);
    let stored = storage.store.get("gold-1700000000000-1234").unwrap();
    assert_eq!(stored.event.price, 1955.00);
    assert_eq!(stored.processor_id, PROCESSOR_ID);
    assert_eq!(stored.event.details["market"], "COMEX");

    let health = running.state.health();
    assert!(health.is_healthy());
    assert_eq!(health.error_count, 0);
    assert_eq!(health.last_processed.as_deref(), Some("gold-1700000000000-1234"));

    running.stop().await;
    let commits = broker.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].offset(TOPIC, 0), Some(2));
}

#[tokio::test(start_paused = true)]
async fn full_batch_commits_once_without_waiting_for_the_timer() {
    let broker = ScriptedBroker::default();
    let storage = MemoryConnector::default();
    let records = (0..50)
        .map(|i| price(i % 2, i as i64 / 2, &format!("silver-{i}"), "silver", 24.0))
        .collect();
    broker.enqueue(records);

    let started = Instant::now();
    let running = start(ProcessorConfig::default(), &broker, &storage);
    wait_until(|| !broker.commits().is_empty()).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let commits = broker.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].offset(TOPIC, 0), Some(25));
    assert_eq!(commits[0].offset(TOPIC, 1), Some(25));
    assert_eq!(storage.store.len(), 50);

    // nothing pending, so the timer has nothing to flush
    sleep(Duration::from_secs(20)).await;
    assert_eq!(broker.commits().len(), 1);
    running.stop().await;
    assert_eq!(broker.commits().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_partial_batch_is_committed_after_the_flush_interval() {
    let broker = ScriptedBroker::default();
    let storage = MemoryConnector::default();
    broker.enqueue(vec![
        price(0, 10, "pt-1", "platinum", 980.0),
        price(0, 11, "pt-2", "platinum", 981.0),
        price(0, 12, "pt-3", "platinum", 982.0),
    ]);

    let started = Instant::now();
    let running = start(ProcessorConfig::default(), &broker, &storage);
    wait_until(|| running.state.processed_count() == 3).await;
    assert!(broker.commits().is_empty());

    wait_until(|| !broker.commits().is_empty()).await;
    assert!(started.elapsed() > Duration::from_secs(5));
    let commits = broker.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].offset(TOPIC, 0), Some(13));

    sleep(Duration::from_secs(30)).await;
    assert_eq!(broker.commits().len(), 1);
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_record_is_redelivered_then_given_up() {
    let broker = ScriptedBroker::default();
    let storage = MemoryConnector::default();
    broker.enqueue(vec![
        price(0, 0, "cu-1", "copper", 3.85),
        record(0, 1, r#"{"metal":"copper","price":3.9}"#),
        price(0, 2, "cu-3", "copper", 3.95),
        price(1, 0, "al-1", "aluminum", 2.2),
    ]);

    let running = start(ProcessorConfig::default(), &broker, &storage);
    wait_until(|| !broker.commits().is_empty()).await;

    // two rewinds to the bad record, the third failure gives it up
    let rewinds = broker.rewinds();
    assert_eq!(rewinds.len(), 2);
    assert!(rewinds.iter().all(|p| p.partition == 0 && p.offset == 1));

    let commits = broker.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].offset(TOPIC, 0), Some(3));
    assert_eq!(commits[0].offset(TOPIC, 1), Some(1));
    assert_eq!(running.state.processed_count(), 3);
    assert_eq!(running.state.error_count(), 3);
    assert!(running.state.health().last_error.unwrap().contains("malformed"));
    assert_eq!(storage.store.len(), 3);

    // per-record failures don't disturb the connections
    assert!(running.state.health().is_healthy());
    assert_eq!(broker.connects(), 1);
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn partition_keeps_committing_after_a_bad_record() {
    let broker = ScriptedBroker::default();
    let storage = MemoryConnector::default();
    broker.enqueue(vec![
        price(0, 0, "au-0", "gold", 1950.0),
        record(0, 1, "not json"),
    ]);
    for poll in 0..10_i64 {
        let records = (0..50)
            .map(|i| {
                let offset = 2 + poll * 50 + i;
                price(0, offset, &format!("au-{offset}"), "gold", 1950.0)
            })
            .collect();
        broker.enqueue(records);
    }

    let running = start(ProcessorConfig::default(), &broker, &storage);
    wait_until(|| broker.committed(0) == Some(502)).await;

    assert_eq!(running.state.processed_count(), 501);
    assert_eq!(running.state.error_count(), 3);
    assert_eq!(storage.store.len(), 501);
    assert!(broker.commits().len() >= 10);

    let committed: Vec<i64> = broker
        .commits()
        .iter()
        .filter_map(|c| c.offset(TOPIC, 0))
        .collect();
    assert!(committed.windows(2).all(|w| w[0] < w[1]));
    assert!(running.state.health().is_healthy());
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_write_is_retried_from_its_offset() {
    let broker = ScriptedBroker::default();
    let storage = MemoryConnector::default();
    storage.store.fail_next_writes(1);
    broker.enqueue(vec![
        price(0, 7, "ni-1", "nickel", 16.2),
        price(0, 8, "ni-2", "nickel", 16.3),
    ]);

    let running = start(ProcessorConfig::default(), &broker, &storage);
    wait_until(|| running.state.processed_count() == 2).await;

    assert_eq!(broker.rewinds().len(), 1);
    assert_eq!(broker.rewinds()[0].offset, 7);
    assert_eq!(running.state.error_count(), 1);
    assert!(storage.store.get("ni-1").is_some());
    assert!(storage.store.get("ni-2").is_some());
    assert_eq!(broker.connects(), 1);

    wait_until(|| !broker.commits().is_empty()).await;
    assert_eq!(broker.commits()[0].offset(TOPIC, 0), Some(9));
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn consumer_lag_is_reported_per_partition() {
    let broker = ScriptedBroker::default();
    let storage = MemoryConnector::default();
    broker.set_high_watermark(40);
    broker.enqueue(vec![
        price(0, 10, "zn-1", "zinc", 2.5),
        price(0, 11, "zn-2", "zinc", 2.6),
        price(2, 30, "zn-3", "zinc", 2.7),
    ]);

    let running = start(ProcessorConfig::default(), &broker, &storage);
    wait_until(|| running.state.processed_count() == 3).await;

    let text = running.state.metrics().encode().unwrap();
    assert!(text.contains(r#"kafka_consumer_lag{partition="0"} 28"#));
    assert!(text.contains(r#"kafka_consumer_lag{partition="2"} 9"#));
    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn storage_outage_resets_both_connections() {
    let broker = ScriptedBroker::default();
    let storage = MemoryConnector::default();
    storage.store.set_unavailable(true);

    let running = start(ProcessorConfig::default(), &broker, &storage);
    wait_until(|| running.state.health().is_healthy()).await;

    broker.enqueue(vec![price(0, 0, "pd-1", "palladium", 1100.0)]);
    wait_until(|| running.state.error_count() == 1).await;

    let health = running.state.health();
    assert_eq!(health.status, "unhealthy");
    assert!(!running.state.is_connected(Dependency::Kafka));
    assert!(!running.state.is_connected(Dependency::MongoDb));
    assert!(health.last_error.unwrap().contains("unavailable"));
    assert!(running.state.store().is_none());

    storage.store.set_unavailable(false);
    wait_until(|| running.state.health().is_healthy()).await;
    assert_eq!(broker.connects(), 2);
    assert_eq!(storage.connects(), 2);
    assert!(broker.commits().is_empty());

    // the failed record was discarded with its batch, shutdown has nothing to commit
    running.stop().await;
    assert!(broker.commits().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_commits_what_was_persisted() {
    let broker = ScriptedBroker::default();
    let storage = MemoryConnector::default();
    broker.enqueue(vec![
        price(0, 4, "au-1", "gold", 1950.0),
        price(0, 5, "au-2", "gold", 1951.0),
    ]);

    let config = ProcessorConfig {
        flush_interval: Duration::from_secs(3600),
        ..ProcessorConfig::default()
    };
    let running = start(config, &broker, &storage);
    wait_until(|| running.state.processed_count() == 2).await;
    assert!(broker.commits().is_empty());

    let state = running.state.clone();
    running.stop().await;

    let commits = broker.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].offset(TOPIC, 0), Some(6));
    assert!(!state.is_connected(Dependency::Kafka));
    assert!(!state.is_connected(Dependency::MongoDb));
    assert!(state.store().is_none());
}

#[tokio::test(start_paused = true)]
async fn metrics_follow_the_pipeline() {
    let broker = ScriptedBroker::default();
    let storage = MemoryConnector::default();
    broker.enqueue(vec![
        price(0, 0, "au-1", "gold", 1950.0),
        price(0, 1, "au-1", "gold", 1952.0),
        price(0, 2, "ag-1", "silver", 24.0),
    ]);

    let running = start(ProcessorConfig::default(), &broker, &storage);
    wait_until(|| running.state.processed_count() == 3).await;

    let text = running.state.metrics().encode().unwrap();
    assert!(text.contains(r#"processor_messages_total{metal="gold"} 2"#));
    assert!(text.contains(r#"mongodb_inserts_total{metal="gold"} 1"#));
    assert!(text.contains(r#"mongodb_inserts_total{metal="silver"} 1"#));
    assert!(text.contains("kafka_connection_status 1"));
    assert!(text.contains("mongodb_connection_status 1"));
    assert!(text.contains("processing_duration_seconds_count 3"));
    running.stop().await;
}
