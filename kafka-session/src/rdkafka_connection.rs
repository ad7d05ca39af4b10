//! librdkafka-backed connections.
//!
//! Client contexts forward every librdkafka callback (errors, rebalances, commit and delivery
//! reports) onto the connection's [`EventBus`]. Calls that block inside librdkafka run on the
//! blocking pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{
    BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer,
};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::connection::{
    BrokerConnection, BrokerEvent, ConsumedMessage, ConsumerConnection, EventBus, ProduceRecord,
    ProducerConnection, RebalanceSignal, TopicMetadata,
};
use crate::error::{ErrorKind, SessionError};
use crate::types::{Partition, PartitionOffset};

/// librdkafka client configuration with defaults for sessions.
///
/// Sessions commit explicitly, so automatic commits and offset stores are always disabled for
/// consumers.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn for_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    pub fn for_producer(bootstrap_servers: &str) -> Self {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("linger.ms", "20")
            .set("message.timeout.ms", "30000")
            .set("statistics.interval.ms", "10000");

        Self { config }
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Consumers only
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

async fn blocking<T, F>(call: F) -> Result<T, SessionError>
where
    F: FnOnce() -> KafkaResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| {
            SessionError::new(ErrorKind::Failure, format!("broker call panicked: {e}"))
        })?
        .map_err(SessionError::from)
}

fn partitions_of(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements().into_iter().map(Partition::from).collect()
}

fn topic_metadata<C: ClientContext>(
    client: &rdkafka::client::Client<C>,
    topic: &str,
    timeout: Duration,
) -> KafkaResult<TopicMetadata> {
    let metadata = client.fetch_metadata(Some(topic), timeout)?;
    let found = metadata.topics().iter().find(|t| t.name() == topic);

    match found {
        Some(t) => {
            if let Some(err) = t.error() {
                return Err(KafkaError::MetadataFetch(RDKafkaErrorCode::from(err)));
            }
            Ok(TopicMetadata {
                topic: topic.to_string(),
                partitions: t.partitions().iter().map(|p| p.id()).collect(),
            })
        }
        None => Err(KafkaError::MetadataFetch(RDKafkaErrorCode::UnknownTopic)),
    }
}

/// Forwards consumer callbacks as broker events.
pub struct ConsumerEventContext {
    events: EventBus,
}

impl ClientContext for ConsumerEventContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!(error = %error, reason, "Consumer client error");
        self.events
            .emit(BrokerEvent::ClientError(SessionError::from(error)));
    }
}

impl ConsumerContext for ConsumerEventContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!("Revoking {} partitions", partitions.count());
                self.events.emit(BrokerEvent::Rebalance(RebalanceSignal::Revoke(
                    partitions_of(partitions),
                )));
            }
            Rebalance::Assign(partitions) => {
                debug!("Pre-rebalance assign event for {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
                self.events.emit(BrokerEvent::Rebalance(RebalanceSignal::Error(
                    SessionError::from(e.clone()),
                )));
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!("Assigned {} partitions", partitions.count());
                self.events.emit(BrokerEvent::Rebalance(RebalanceSignal::Assign(
                    partitions_of(partitions),
                )));
            }
            Rebalance::Revoke(_) => debug!("Post-rebalance revoke event"),
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
                self.events.emit(BrokerEvent::Rebalance(RebalanceSignal::Error(
                    SessionError::from(e.clone()),
                )));
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        let committed: Vec<PartitionOffset> = offsets
            .elements()
            .iter()
            .filter_map(PartitionOffset::from_elem)
            .collect();
        self.events.emit(BrokerEvent::OffsetCommit {
            offsets: committed,
            error: result.err().map(SessionError::from),
        });
    }
}

pub struct RdKafkaConsumer {
    consumer: Arc<StreamConsumer<ConsumerEventContext>>,
    topic: String,
    events: EventBus,
    connected: AtomicBool,
}

impl RdKafkaConsumer {
    pub fn new(config: &ClientConfig, topic: impl Into<String>) -> Result<Self, SessionError> {
        let events = EventBus::default();
        let consumer: StreamConsumer<ConsumerEventContext> =
            config.create_with_context(ConsumerEventContext {
                events: events.clone(),
            })?;

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: topic.into(),
            events,
            connected: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl BrokerConnection for RdKafkaConsumer {
    async fn connect(&self, timeout: Duration) -> Result<(), SessionError> {
        let subscribed = self
            .consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(SessionError::from);

        let consumer = self.consumer.clone();
        let pinged = match subscribed {
            Ok(()) => {
                blocking(move || {
                    consumer
                        .fetch_metadata(None, timeout)
                        .map(|metadata| metadata.topics().len())
                })
                .await
            }
            Err(err) => Err(err),
        };

        match pinged {
            Ok(topics) => {
                info!(
                    topic = %self.topic,
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    topics
                );
                self.connected.store(true, Ordering::SeqCst);
                self.events.emit(BrokerEvent::Ready);
                Ok(())
            }
            Err(err) => {
                error!(topic = %self.topic, error = %err, "Failed to connect consumer");
                self.events.emit(BrokerEvent::ConnectError(err.clone()));
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.consumer.unsubscribe();
        self.connected.store(false, Ordering::SeqCst);
        self.events.emit(BrokerEvent::Disconnected);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    async fn fetch_metadata(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<TopicMetadata, SessionError> {
        let consumer = self.consumer.clone();
        let topic = topic.to_string();
        blocking(move || topic_metadata(consumer.client(), &topic, timeout)).await
    }
}

#[async_trait]
impl ConsumerConnection for RdKafkaConsumer {
    async fn pull(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumedMessage>, SessionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut messages = Vec::new();

        while messages.len() < max_messages {
            match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => messages.push(ConsumedMessage {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    key: message.key().map(<[u8]>::to_vec),
                    payload: message.payload().map(<[u8]>::to_vec),
                    timestamp: message.timestamp().to_millis(),
                }),
                Ok(Err(e)) if messages.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    // Hand over what was read; the fault will resurface on the next pull
                    warn!(topic = %self.topic, error = %e, "Error after partial pull");
                    break;
                }
            }
        }

        Ok(messages)
    }

    async fn commit(&self, offset: &PartitionOffset, sync: bool) -> Result<(), SessionError> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(
            offset.topic(),
            offset.partition_number(),
            Offset::Offset(offset.offset()),
        )?;

        let mode = if sync {
            CommitMode::Sync
        } else {
            CommitMode::Async
        };
        let consumer = self.consumer.clone();
        blocking(move || consumer.commit(&list, mode)).await
    }

    async fn seek(&self, offset: &PartitionOffset, timeout: Duration) -> Result<(), SessionError> {
        let consumer = self.consumer.clone();
        let topic = offset.topic().to_string();
        let partition = offset.partition_number();
        let target = Offset::Offset(offset.offset());
        blocking(move || consumer.seek(&topic, partition, target, timeout)).await
    }

    fn position(&self) -> Result<Vec<PartitionOffset>, SessionError> {
        let positions = self.consumer.position()?;
        Ok(positions
            .elements()
            .iter()
            .filter_map(PartitionOffset::from_elem)
            .collect())
    }
}

/// Forwards producer errors and failed delivery reports as `ClientError` events.
pub struct ProducerEventContext {
    events: EventBus,
}

impl ClientContext for ProducerEventContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!(error = %error, reason, "Producer client error");
        self.events
            .emit(BrokerEvent::ClientError(SessionError::from(error)));
    }
}

impl ProducerContext for ProducerEventContext {
    type DeliveryOpaque = ();

    fn delivery(
        &self,
        delivery_result: &DeliveryResult<'_>,
        _delivery_opaque: Self::DeliveryOpaque,
    ) {
        if let Err((error, message)) = delivery_result {
            warn!(
                topic = message.topic(),
                partition = message.partition(),
                error = %error,
                "Message delivery failed"
            );
            self.events
                .emit(BrokerEvent::ClientError(SessionError::from(error.clone())));
        }
    }
}

pub struct RdKafkaProducer {
    producer: Arc<ThreadedProducer<ProducerEventContext>>,
    events: EventBus,
    connected: AtomicBool,
}

impl RdKafkaProducer {
    pub fn new(config: &ClientConfig) -> Result<Self, SessionError> {
        let events = EventBus::default();
        let producer: ThreadedProducer<ProducerEventContext> =
            config.create_with_context(ProducerEventContext {
                events: events.clone(),
            })?;

        Ok(Self {
            producer: Arc::new(producer),
            events,
            connected: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl BrokerConnection for RdKafkaProducer {
    async fn connect(&self, timeout: Duration) -> Result<(), SessionError> {
        // "Ping" the brokers by requesting metadata
        let producer = self.producer.clone();
        let pinged = blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.topics().len())
        })
        .await;

        match pinged {
            Ok(topics) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    topics
                );
                self.connected.store(true, Ordering::SeqCst);
                self.events.emit(BrokerEvent::Ready);
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Failed to fetch metadata from Kafka brokers");
                self.events.emit(BrokerEvent::ConnectError(err.clone()));
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.connected.store(false, Ordering::SeqCst);
        self.events.emit(BrokerEvent::Disconnected);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    async fn fetch_metadata(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<TopicMetadata, SessionError> {
        let producer = self.producer.clone();
        let topic = topic.to_string();
        blocking(move || topic_metadata(producer.client(), &topic, timeout)).await
    }
}

#[async_trait]
impl ProducerConnection for RdKafkaProducer {
    fn produce(&self, topic: &str, record: &ProduceRecord) -> Result<(), SessionError> {
        let mut base = BaseRecord::<[u8], [u8]>::to(topic);
        if let Some(key) = record.key.as_deref() {
            base = base.key(key);
        }
        if let Some(payload) = record.payload.as_deref() {
            base = base.payload(payload);
        }
        if let Some(timestamp) = record.timestamp {
            base = base.timestamp(timestamp);
        }

        self.producer
            .send(base)
            .map_err(|(error, _)| SessionError::from(error))
    }

    async fn flush(&self, timeout: Duration) -> Result<(), SessionError> {
        let producer = self.producer.clone();
        blocking(move || producer.flush(timeout)).await
    }
}
