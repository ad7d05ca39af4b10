//! The capability a session needs from the underlying broker client.
//!
//! Connections report out-of-band signals (readiness, faults, rebalances, commit
//! acknowledgements) as [`BrokerEvent`]s on a broadcast channel. Every subscriber gets its own
//! receiver, so nothing is ever registered on the connection itself and nothing can leak.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{ErrorKind, SessionError};
use crate::types::{Partition, PartitionOffset};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum RebalanceSignal {
    /// Partitions were assigned; the list replaces the previous assignment
    Assign(Vec<Partition>),
    /// Partitions are being taken away
    Revoke(Vec<Partition>),
    /// The broker reported a rebalance failure
    Error(SessionError),
}

#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Ready,
    ConnectError(SessionError),
    ClientError(SessionError),
    Rebalance(RebalanceSignal),
    /// The broker acknowledged (or rejected) a commit
    OffsetCommit {
        offsets: Vec<PartitionOffset>,
        error: Option<SessionError>,
    },
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerEventKind {
    Ready,
    ConnectError,
    ClientError,
    Rebalance,
    OffsetCommit,
    Disconnected,
}

impl BrokerEvent {
    pub fn kind(&self) -> BrokerEventKind {
        match self {
            BrokerEvent::Ready => BrokerEventKind::Ready,
            BrokerEvent::ConnectError(_) => BrokerEventKind::ConnectError,
            BrokerEvent::ClientError(_) => BrokerEventKind::ClientError,
            BrokerEvent::Rebalance(_) => BrokerEventKind::Rebalance,
            BrokerEvent::OffsetCommit { .. } => BrokerEventKind::OffsetCommit,
            BrokerEvent::Disconnected => BrokerEventKind::Disconnected,
        }
    }

    /// The error payload, if the event carries one.
    pub fn error(&self) -> Option<&SessionError> {
        match self {
            BrokerEvent::ConnectError(err) | BrokerEvent::ClientError(err) => Some(err),
            BrokerEvent::Rebalance(RebalanceSignal::Error(err)) => Some(err),
            BrokerEvent::OffsetCommit { error, .. } => error.as_ref(),
            _ => None,
        }
    }
}

/// Fan-out of broker events. Connections own one and hand out receivers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes to current subscribers. Events with nobody listening are dropped.
    pub fn emit(&self, event: BrokerEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No subscribers for broker event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Milliseconds since the epoch, when the broker reported one
    pub timestamp: Option<i64>,
}

impl ConsumedMessage {
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }
}

/// One outbound record. The topic defaults to the producing session's topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProduceRecord {
    pub topic: Option<String>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
}

impl ProduceRecord {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: Some(payload.into()),
            ..Self::default()
        }
    }

    pub fn json<T: Serialize + ?Sized>(item: &T) -> Result<Self, SessionError> {
        let payload = serde_json::to_vec(item).map_err(|e| {
            SessionError::new(ErrorKind::Failure, format!("failed to serialize: {e}"))
        })?;
        Ok(Self::new(payload))
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub topic: String,
    pub partitions: Vec<i32>,
}

#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    async fn connect(&self, timeout: Duration) -> Result<(), SessionError>;

    async fn disconnect(&self) -> Result<(), SessionError>;

    fn is_connected(&self) -> bool;

    /// A fresh receiver for every broker event published from now on.
    fn events(&self) -> broadcast::Receiver<BrokerEvent>;

    async fn fetch_metadata(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<TopicMetadata, SessionError>;
}

#[async_trait]
pub trait ConsumerConnection: BrokerConnection {
    /// Up to `max_messages` messages, waiting at most `timeout` for them.
    async fn pull(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumedMessage>, SessionError>;

    async fn commit(&self, offset: &PartitionOffset, sync: bool) -> Result<(), SessionError>;

    async fn seek(&self, offset: &PartitionOffset, timeout: Duration) -> Result<(), SessionError>;

    fn position(&self) -> Result<Vec<PartitionOffset>, SessionError>;
}

#[async_trait]
pub trait ProducerConnection: BrokerConnection {
    /// Non-blocking enqueue. Delivery failures arrive later as `ClientError` events.
    fn produce(&self, topic: &str, record: &ProduceRecord) -> Result<(), SessionError>;

    async fn flush(&self, timeout: Duration) -> Result<(), SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_codes::codes;

    #[test]
    fn test_event_error_payloads() {
        let err = SessionError::broker(codes::TRANSPORT, "down");
        assert!(BrokerEvent::ClientError(err.clone()).error().is_some());
        assert!(BrokerEvent::Ready.error().is_none());
        assert!(BrokerEvent::OffsetCommit {
            offsets: vec![],
            error: None
        }
        .error()
        .is_none());
        assert_eq!(
            BrokerEvent::ConnectError(err).kind(),
            BrokerEventKind::ConnectError
        );
    }

    #[test]
    fn test_event_bus_without_subscribers_drops_events() {
        let bus = EventBus::default();
        bus.emit(BrokerEvent::Ready);

        let mut rx = bus.subscribe();
        bus.emit(BrokerEvent::Disconnected);
        assert_eq!(rx.try_recv().unwrap().kind(), BrokerEventKind::Disconnected);
    }

    #[test]
    fn test_produce_record_json() {
        let record = ProduceRecord::json(&serde_json::json!({"id": 1}))
            .unwrap()
            .key("k")
            .timestamp(5);
        assert_eq!(record.payload.as_deref(), Some(br#"{"id":1}"#.as_slice()));
        assert_eq!(record.key.as_deref(), Some(b"k".as_slice()));
        assert_eq!(record.timestamp, Some(5));
        assert_eq!(record.topic, None);
    }
}
