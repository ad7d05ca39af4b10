use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::Result;
use kafka_session::rdkafka_connection::{ClientConfigBuilder, RdKafkaConsumer, RdKafkaProducer};
use kafka_session::{ConsumingSession, ProduceRecord, ProducingSession, SessionConfig};
use rdkafka::mocking::MockCluster;
use rdkafka::producer::DefaultProducerContext;

const TOPIC: &str = "session_events";

static TRACING_INIT: Once = Once::new();
fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

fn mock_cluster() -> MockCluster<'static, DefaultProducerContext> {
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");
    cluster
        .create_topic(TOPIC, 1, 1)
        .expect("failed to create topic");
    cluster
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_produce_then_consume_and_commit() -> Result<()> {
    setup_tracing();
    let cluster = mock_cluster();
    let bootstrap = cluster.bootstrap_servers();

    let producer_config = ClientConfigBuilder::for_producer(&bootstrap)
        .set("linger.ms", "0")
        .build();
    let producer = ProducingSession::new(
        Arc::new(RdKafkaProducer::new(&producer_config)?),
        SessionConfig::new(TOPIC),
    );
    producer.connect().await?;

    let produced = producer
        .produce(["first", "second", "third"], ProduceRecord::new)
        .await?;
    assert_eq!(produced, 3);

    let consumer_config = ClientConfigBuilder::for_consumer(&bootstrap, "kafka-session-tests")
        .with_offset_reset("earliest")
        .build();
    let mut consumer = ConsumingSession::new(
        Arc::new(RdKafkaConsumer::new(&consumer_config, TOPIC)?),
        SessionConfig::new(TOPIC),
    );
    consumer.connect().await?;
    assert_eq!(consumer.partition_count(TOPIC).await?, 1);

    // Joining the group takes a few polls on the mock cluster
    let mut received = Vec::new();
    for _ in 0..10 {
        let batch = consumer
            .consume(3 - received.len(), Duration::from_secs(2), |m| {
                m.payload
                    .as_deref()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
            })
            .await?;
        received.extend(batch);
        if received.len() == 3 {
            break;
        }
    }

    assert_eq!(received, vec!["first", "second", "third"]);
    assert_eq!(consumer.window().ended(0), Some(3));

    consumer.commit().await?;
    consumer.disconnect().await?;
    producer.disconnect().await?;
    Ok(())
}
