//! Scripted in-memory connections for session tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::connection::{
    BrokerConnection, BrokerEvent, ConsumedMessage, ConsumerConnection, EventBus, ProduceRecord,
    ProducerConnection, TopicMetadata,
};
use crate::error::SessionError;
use crate::types::PartitionOffset;

/// Builds a consumed message with a payload.
pub fn message(topic: &str, partition: i32, offset: i64, payload: &[u8]) -> ConsumedMessage {
    ConsumedMessage {
        topic: topic.to_string(),
        partition,
        offset,
        key: None,
        payload: Some(payload.to_vec()),
        timestamp: None,
    }
}

/// Consumer connection driven by a script of pull results.
///
/// An exhausted script behaves like an idle topic: `pull` waits out its timeout and returns
/// nothing.
pub struct MockConsumer {
    events: EventBus,
    connected: AtomicBool,
    connect_results: Mutex<VecDeque<Result<(), SessionError>>>,
    pulls: Mutex<VecDeque<Result<Vec<ConsumedMessage>, SessionError>>>,
    commit_failures: Mutex<HashMap<i32, VecDeque<SessionError>>>,
    seek_failures: Mutex<HashMap<i32, VecDeque<SessionError>>>,
    ack_commits: AtomicBool,
    commits: Mutex<Vec<PartitionOffset>>,
    seeks: Mutex<Vec<PartitionOffset>>,
    positions: Mutex<Vec<PartitionOffset>>,
    partitions: Mutex<Vec<i32>>,
    pub connect_count: AtomicUsize,
    pub disconnect_count: AtomicUsize,
    pub pull_count: AtomicUsize,
}

impl Default for MockConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConsumer {
    pub fn new() -> Self {
        Self {
            events: EventBus::default(),
            connected: AtomicBool::new(false),
            connect_results: Mutex::new(VecDeque::new()),
            pulls: Mutex::new(VecDeque::new()),
            commit_failures: Mutex::new(HashMap::new()),
            seek_failures: Mutex::new(HashMap::new()),
            ack_commits: AtomicBool::new(false),
            commits: Mutex::new(Vec::new()),
            seeks: Mutex::new(Vec::new()),
            positions: Mutex::new(Vec::new()),
            partitions: Mutex::new(vec![0]),
            connect_count: AtomicUsize::new(0),
            disconnect_count: AtomicUsize::new(0),
            pull_count: AtomicUsize::new(0),
        }
    }

    pub fn push_messages(&self, messages: Vec<ConsumedMessage>) {
        self.pulls.lock().unwrap().push_back(Ok(messages));
    }

    pub fn push_pull_error(&self, error: SessionError) {
        self.pulls.lock().unwrap().push_back(Err(error));
    }

    pub fn push_connect_result(&self, result: Result<(), SessionError>) {
        self.connect_results.lock().unwrap().push_back(result);
    }

    pub fn fail_commit(&self, partition: i32, error: SessionError) {
        self.commit_failures
            .lock()
            .unwrap()
            .entry(partition)
            .or_default()
            .push_back(error);
    }

    pub fn fail_seek(&self, partition: i32, error: SessionError) {
        self.seek_failures
            .lock()
            .unwrap()
            .entry(partition)
            .or_default()
            .push_back(error);
    }

    /// When set, every commit attempt is reported with an `OffsetCommit` event, carrying the
    /// error of a failed one, as the librdkafka commit callback does.
    pub fn ack_commits(&self, ack: bool) {
        self.ack_commits.store(ack, Ordering::SeqCst);
    }

    pub fn set_positions(&self, positions: Vec<PartitionOffset>) {
        *self.positions.lock().unwrap() = positions;
    }

    pub fn set_partitions(&self, partitions: Vec<i32>) {
        *self.partitions.lock().unwrap() = partitions;
    }

    pub fn commits(&self) -> Vec<PartitionOffset> {
        self.commits.lock().unwrap().clone()
    }

    pub fn seeks(&self) -> Vec<PartitionOffset> {
        self.seeks.lock().unwrap().clone()
    }

    pub fn emit(&self, event: BrokerEvent) {
        self.events.emit(event);
    }

    /// Number of live event receivers.
    pub fn listener_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Drops the connection without telling anyone, as a broker-side disconnect would.
    pub fn disconnect_silently(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn take_failure(
        failures: &Mutex<HashMap<i32, VecDeque<SessionError>>>,
        partition: i32,
    ) -> Option<SessionError> {
        failures
            .lock()
            .unwrap()
            .get_mut(&partition)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl BrokerConnection for MockConsumer {
    async fn connect(&self, _timeout: Duration) -> Result<(), SessionError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        let result = self
            .connect_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));

        match result {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                self.events.emit(BrokerEvent::Ready);
                Ok(())
            }
            Err(err) => {
                self.events.emit(BrokerEvent::ConnectError(err.clone()));
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.disconnect_count.fetch_add(1, Ordering::SeqCst);
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
        _timeout: Duration,
    ) -> Result<TopicMetadata, SessionError> {
        Ok(TopicMetadata {
            topic: topic.to_string(),
            partitions: self.partitions.lock().unwrap().clone(),
        })
    }
}

#[async_trait]
impl ConsumerConnection for MockConsumer {
    async fn pull(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<ConsumedMessage>, SessionError> {
        self.pull_count.fetch_add(1, Ordering::SeqCst);
        let next = self.pulls.lock().unwrap().pop_front();

        match next {
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
            Some(Ok(mut messages)) => {
                if messages.len() > max_messages {
                    let rest = messages.split_off(max_messages);
                    self.pulls.lock().unwrap().push_front(Ok(rest));
                }
                Ok(messages)
            }
            Some(Err(err)) => Err(err),
        }
    }

    async fn commit(&self, offset: &PartitionOffset, _sync: bool) -> Result<(), SessionError> {
        if let Some(err) = Self::take_failure(&self.commit_failures, offset.partition_number()) {
            if self.ack_commits.load(Ordering::SeqCst) {
                self.events.emit(BrokerEvent::OffsetCommit {
                    offsets: vec![offset.clone()],
                    error: Some(err.clone()),
                });
            }
            return Err(err);
        }

        self.commits.lock().unwrap().push(offset.clone());
        if self.ack_commits.load(Ordering::SeqCst) {
            self.events.emit(BrokerEvent::OffsetCommit {
                offsets: vec![offset.clone()],
                error: None,
            });
        }
        Ok(())
    }

    async fn seek(&self, offset: &PartitionOffset, _timeout: Duration) -> Result<(), SessionError> {
        if let Some(err) = Self::take_failure(&self.seek_failures, offset.partition_number()) {
            return Err(err);
        }

        self.seeks.lock().unwrap().push(offset.clone());
        Ok(())
    }

    fn position(&self) -> Result<Vec<PartitionOffset>, SessionError> {
        Ok(self.positions.lock().unwrap().clone())
    }
}

/// Producer connection recording every enqueued record.
pub struct MockProducer {
    events: EventBus,
    connected: AtomicBool,
    records: Mutex<Vec<(String, ProduceRecord)>>,
    enqueue_failures: Mutex<VecDeque<SessionError>>,
    flush_results: Mutex<VecDeque<Result<(), SessionError>>>,
    flush_events: Mutex<VecDeque<BrokerEvent>>,
    pub connect_count: AtomicUsize,
    pub flush_count: AtomicUsize,
}

impl Default for MockProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProducer {
    pub fn new() -> Self {
        Self {
            events: EventBus::default(),
            connected: AtomicBool::new(false),
            records: Mutex::new(Vec::new()),
            enqueue_failures: Mutex::new(VecDeque::new()),
            flush_results: Mutex::new(VecDeque::new()),
            flush_events: Mutex::new(VecDeque::new()),
            connect_count: AtomicUsize::new(0),
            flush_count: AtomicUsize::new(0),
        }
    }

    /// The next enqueue fails with `error`.
    pub fn fail_next_enqueue(&self, error: SessionError) {
        self.enqueue_failures.lock().unwrap().push_back(error);
    }

    pub fn push_flush_result(&self, result: Result<(), SessionError>) {
        self.flush_results.lock().unwrap().push_back(result);
    }

    /// Emits `event` during the next flush, as a delivery report would.
    pub fn emit_on_flush(&self, event: BrokerEvent) {
        self.flush_events.lock().unwrap().push_back(event);
    }

    pub fn records(&self) -> Vec<(String, ProduceRecord)> {
        self.records.lock().unwrap().clone()
    }

    pub fn emit(&self, event: BrokerEvent) {
        self.events.emit(event);
    }

    pub fn listener_count(&self) -> usize {
        self.events.receiver_count()
    }
}

#[async_trait]
impl BrokerConnection for MockProducer {
    async fn connect(&self, _timeout: Duration) -> Result<(), SessionError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self.events.emit(BrokerEvent::Ready);
        Ok(())
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
        _timeout: Duration,
    ) -> Result<TopicMetadata, SessionError> {
        Ok(TopicMetadata {
            topic: topic.to_string(),
            partitions: vec![0],
        })
    }
}

#[async_trait]
impl ProducerConnection for MockProducer {
    fn produce(&self, topic: &str, record: &ProduceRecord) -> Result<(), SessionError> {
        if let Some(err) = self.enqueue_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.records
            .lock()
            .unwrap()
            .push((topic.to_string(), record.clone()));
        Ok(())
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), SessionError> {
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        let event = self.flush_events.lock().unwrap().pop_front();
        if let Some(event) = event {
            self.events.emit(event);
            tokio::task::yield_now().await;
        }
        self.flush_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}
