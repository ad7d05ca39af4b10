use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kafka_session::error_codes::codes;
use kafka_session::test_utils::MockProducer;
use kafka_session::{
    BrokerEvent, ErrorKind, ProduceRecord, ProducingSession, SessionConfig, SessionError,
};
use serde::Serialize;

const TOPIC: &str = "clickhouse_events_json";

async fn connected_session() -> Result<(Arc<MockProducer>, ProducingSession<MockProducer>)> {
    let client = Arc::new(MockProducer::new());
    let session = ProducingSession::new(client.clone(), SessionConfig::for_tests(TOPIC));
    session.connect().await?;
    Ok((client, session))
}

#[derive(Serialize)]
struct CapturedEvent {
    uuid: String,
    distinct_id: String,
    event: String,
}

fn captured(uuid: &str, distinct_id: &str) -> CapturedEvent {
    CapturedEvent {
        uuid: uuid.to_string(),
        distinct_id: distinct_id.to_string(),
        event: "$pageview".to_string(),
    }
}

#[tokio::test]
async fn test_batch_is_enqueued_then_flushed_once() -> Result<()> {
    let (client, session) = connected_session().await?;

    let produced = session
        .produce(1..=3, |n: i32| {
            ProduceRecord::new(n.to_string()).key(format!("key-{n}"))
        })
        .await?;

    assert_eq!(produced, 3);
    assert_eq!(client.flush_count.load(Ordering::SeqCst), 1);
    let records = client.records();
    assert!(records.iter().all(|(topic, _)| topic == TOPIC));
    assert_eq!(records[2].1.key.as_deref(), Some(&b"key-3"[..]));
    Ok(())
}

#[tokio::test]
async fn test_enqueue_failure_is_reported_after_flush() -> Result<()> {
    let (client, session) = connected_session().await?;
    client.fail_next_enqueue(SessionError::broker(codes::QUEUE_FULL, "queue full"));

    let err = session
        .produce(vec!["a", "b"], ProduceRecord::new)
        .await
        .unwrap_err();

    assert_eq!(client.flush_count.load(Ordering::SeqCst), 1);
    assert_eq!(client.records().len(), 1);
    assert_eq!(err.code(), Some(codes::QUEUE_FULL));
    assert!(err
        .to_string()
        .starts_with("Failure to produce 1 of 2 messages"));
    Ok(())
}

#[tokio::test]
async fn test_delivery_fault_does_not_fail_the_batch() -> Result<()> {
    let (client, session) = connected_session().await?;
    client.emit_on_flush(BrokerEvent::ClientError(SessionError::broker(
        codes::MSG_TIMED_OUT,
        "Local: Message timed out",
    )));

    let produced = session.produce(vec!["a"], ProduceRecord::new).await?;

    assert_eq!(produced, 1);
    // The per-call capture is gone; the event bridge remains
    assert_eq!(client.listener_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_flush_exhausting_retries_fails() -> Result<()> {
    let (client, session) = connected_session().await?;
    for _ in 0..4 {
        client.push_flush_result(Err(SessionError::broker(codes::TIMED_OUT, "flush timed out")));
    }

    let err = session
        .produce_with_timeout(vec!["a"], ProduceRecord::new, Duration::from_secs(1))
        .await
        .unwrap_err();

    assert_eq!(client.flush_count.load(Ordering::SeqCst), 4);
    assert_eq!(err.kind(), ErrorKind::Failure);
    assert!(err
        .to_string()
        .starts_with("Failure to execute action after retries"));
    Ok(())
}

#[tokio::test]
async fn test_json_batch_is_keyed_by_distinct_id() -> Result<()> {
    let (client, session) = connected_session().await?;
    let events = vec![captured("u1", "alice"), captured("u2", "bob")];

    let produced = session
        .produce_json(&events, |event| Some(event.distinct_id.clone()))
        .await?;

    assert_eq!(produced, 2);
    let keys: Vec<Option<Vec<u8>>> = client.records().into_iter().map(|(_, r)| r.key).collect();
    assert_eq!(keys, vec![Some(b"alice".to_vec()), Some(b"bob".to_vec())]);
    Ok(())
}

#[tokio::test]
async fn test_disconnected_session_skips_work() -> Result<()> {
    let (client, session) = connected_session().await?;

    session.disconnect().await?;
    let produced = session.produce(vec!["a"], ProduceRecord::new).await?;

    assert_eq!(produced, 0);
    assert!(client.records().is_empty());
    assert_eq!(client.flush_count.load(Ordering::SeqCst), 0);
    assert_eq!(session.connect().await.unwrap_err().kind(), ErrorKind::Closed);
    Ok(())
}
