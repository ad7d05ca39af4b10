use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffController;
use crate::config::SessionConfig;
use crate::connection::{BrokerEvent, BrokerEventKind, ProduceRecord, ProducerConnection};
use crate::error::SessionError;
use crate::error_codes::{wrap_error, ActionKind};
use crate::events::{await_once, Resolution};
use crate::metrics_consts::{MESSAGES_PRODUCED, PRODUCER_ASYNC_ERRORS, PRODUCER_CLIENT_ERRORS};
use crate::retry::RetryExecutor;

/// Producing session: enqueue a batch, flush it, and surface every fault seen on the way.
pub struct ProducingSession<P: ProducerConnection> {
    client: Arc<P>,
    config: SessionConfig,
    executor: RetryExecutor,
    closed: Arc<AtomicBool>,
    scope: CancellationToken,
    bridge_registered: AtomicBool,
    client_errors: Arc<AtomicU64>,
}

impl<P: ProducerConnection> ProducingSession<P> {
    pub fn new(client: Arc<P>, config: SessionConfig) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let scope = CancellationToken::new();
        let executor = RetryExecutor::new(
            BackoffController::new(config.backoff_settings()),
            closed.clone(),
            scope.clone(),
        );

        Self {
            client,
            config,
            executor,
            closed,
            scope,
            bridge_registered: AtomicBool::new(false),
            client_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub fn client(&self) -> &Arc<P> {
        &self.client
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Client errors seen by the event bridge since the session connected.
    pub fn client_errors(&self) -> u64 {
        self.client_errors.load(Ordering::SeqCst)
    }

    pub async fn connect(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::closed());
        }
        self.register_bridge();

        let timeout = self.config.connect_timeout();
        let (ready_sub, ready) = await_once(
            self.client.events(),
            BrokerEventKind::Ready,
            Some(timeout),
            true,
            &self.scope,
        );

        let connected = self
            .executor
            .run_with_event_race(
                self.client.as_ref(),
                BrokerEventKind::ConnectError,
                ActionKind::Connect,
                self.config.max_retries,
                None,
                || self.client.connect(timeout),
            )
            .await;

        match connected {
            Ok(Some(())) => {}
            Ok(None) => {
                ready_sub.cancel();
                return Err(SessionError::closed());
            }
            Err(err) => {
                ready_sub.cancel();
                return Err(err);
            }
        }

        match ready.await? {
            Resolution::Fired(_) => {
                info!(topic = %self.config.topic, "Producer connected");
                Ok(())
            }
            Resolution::Cancelled => Err(SessionError::closed()),
            Resolution::TimedOut => Err(SessionError::timeout(timeout)),
        }
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(topic = %self.config.topic, "Producer already disconnected");
            return Ok(());
        }

        info!(topic = %self.config.topic, "Disconnecting producer");
        self.scope.cancel();
        self.client.disconnect().await
    }

    fn register_bridge(&self) {
        if self.bridge_registered.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut events = self.client.events();
        let token = self.scope.child_token();
        let topic = self.config.topic.clone();
        let client_errors = self.client_errors.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(BrokerEvent::ClientError(err)) => {
                            client_errors.fetch_add(1, Ordering::SeqCst);
                            metrics::counter!(PRODUCER_CLIENT_ERRORS, "topic" => topic.clone())
                                .increment(1);
                            warn!(topic = %topic, error = %err, "Producer client error");
                        }
                        Ok(BrokerEvent::Disconnected) => {
                            info!(topic = %topic, "Producer connection closed");
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "Event bridge lagged behind");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!(topic = %topic, "Event bridge stopped");
        });
    }

    /// Produces `items`, flushing with the configured flush timeout. Returns how many records
    /// were enqueued, zero once the session is closed.
    pub async fn produce<T, F>(
        &self,
        items: impl IntoIterator<Item = T>,
        map: F,
    ) -> Result<usize, SessionError>
    where
        F: FnMut(T) -> ProduceRecord,
    {
        self.produce_with_timeout(items, map, self.config.flush_timeout())
            .await
    }

    /// Maps every item to a record and enqueues it, then flushes.
    ///
    /// Faults reported asynchronously while producing (failed deliveries, client errors) are
    /// logged. A failed flush fails the call; so do enqueue errors, but only once the records
    /// that were accepted have been flushed.
    pub async fn produce_with_timeout<T, F>(
        &self,
        items: impl IntoIterator<Item = T>,
        mut map: F,
        flush_timeout: Duration,
    ) -> Result<usize, SessionError>
    where
        F: FnMut(T) -> ProduceRecord,
    {
        if self.is_closed() {
            debug!(topic = %self.config.topic, "Producer is closed, skipping produce");
            return Ok(0);
        }

        let (capture, captured) = await_once(
            self.client.events(),
            BrokerEventKind::ClientError,
            None,
            false,
            &self.scope,
        );

        let mut total = 0;
        let mut failures = Vec::new();
        for item in items {
            total += 1;
            let record = map(item);
            let topic = record.topic.as_deref().unwrap_or(&self.config.topic);

            match self.client.produce(topic, &record) {
                Ok(()) => {
                    metrics::counter!(
                        MESSAGES_PRODUCED,
                        "topic" => topic.to_string(),
                        "outcome" => "enqueued"
                    )
                    .increment(1);
                }
                Err(err) => {
                    metrics::counter!(
                        MESSAGES_PRODUCED,
                        "topic" => topic.to_string(),
                        "outcome" => "failed"
                    )
                    .increment(1);
                    warn!(topic, error = %err, "Failed to enqueue message");
                    failures.push(err);
                }
            }
        }

        let flushed = self
            .executor
            .run(ActionKind::Any, self.config.max_retries, None, || {
                self.client.flush(flush_timeout)
            })
            .await;

        capture.cancel();
        if let Err(fault) = captured.await {
            metrics::counter!(PRODUCER_ASYNC_ERRORS, "topic" => self.config.topic.clone())
                .increment(1);
            error!(
                topic = %self.config.topic,
                error = %fault,
                "Producer reported an error while producing"
            );
        }

        flushed?;

        if let Some(first) = failures.first() {
            return Err(wrap_error(
                &format!("Failure to produce {} of {} messages", failures.len(), total),
                first,
            ));
        }

        debug!(topic = %self.config.topic, count = total, "Produced messages");
        Ok(total)
    }

    /// Produces `items` as JSON, keyed by `key`. Nothing is enqueued when any item fails to
    /// serialize.
    pub async fn produce_json<T, K>(&self, items: &[T], key: K) -> Result<usize, SessionError>
    where
        T: Serialize,
        K: Fn(&T) -> Option<String>,
    {
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let mut record = ProduceRecord::json(item)?;
            record.key = key(item).map(String::into_bytes);
            records.push(record);
        }

        self.produce(records, |record| record).await
    }
}

impl<P: ProducerConnection> Drop for ProducingSession<P> {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{BrokerConnection, BrokerEvent};
    use crate::error::ErrorKind;
    use crate::error_codes::codes;
    use crate::test_utils::MockProducer;

    fn session() -> (Arc<MockProducer>, ProducingSession<MockProducer>) {
        let client = Arc::new(MockProducer::new());
        let session = ProducingSession::new(client.clone(), SessionConfig::for_tests("events"));
        (client, session)
    }

    #[tokio::test]
    async fn test_connect_waits_for_ready() {
        let (client, session) = session();

        session.connect().await.unwrap();

        assert_eq!(client.connect_count.load(Ordering::SeqCst), 1);
        assert!(client.is_connected());
        // Only the event bridge keeps listening
        assert_eq!(client.listener_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_counts_client_errors_between_calls() {
        let (client, session) = session();
        session.connect().await.unwrap();
        session.connect().await.unwrap();
        assert_eq!(client.listener_count(), 1);

        client.emit(BrokerEvent::ClientError(SessionError::broker(
            codes::ALL_BROKERS_DOWN,
            "all brokers down",
        )));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(session.client_errors(), 1);

        session.disconnect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(client.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_records_default_to_session_topic() {
        let (client, session) = session();

        let produced = session
            .produce(["a", "b"], |payload| {
                if payload == "b" {
                    ProduceRecord::new(payload).topic("audit")
                } else {
                    ProduceRecord::new(payload)
                }
            })
            .await
            .unwrap();

        assert_eq!(produced, 2);
        let topics: Vec<String> = client.records().into_iter().map(|(t, _)| t).collect();
        assert_eq!(topics, vec!["events".to_string(), "audit".to_string()]);
        assert_eq!(client.flush_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enqueue_failure_fails_after_flush() {
        let (client, session) = session();
        client.fail_next_enqueue(SessionError::broker(codes::MSG_SIZE_TOO_LARGE, "too large"));

        let err = session
            .produce(["a", "b", "c"], ProduceRecord::new)
            .await
            .unwrap_err();

        assert!(err
            .to_string()
            .starts_with("Failure to produce 1 of 3 messages, caused by error: too large"));
        assert_eq!(err.code(), Some(codes::MSG_SIZE_TOO_LARGE));
        assert_eq!(client.flush_count.load(Ordering::SeqCst), 1);
        assert_eq!(client.records().len(), 2);
    }

    #[tokio::test]
    async fn test_async_fault_is_logged_not_raised() {
        let (client, session) = session();
        client.emit_on_flush(BrokerEvent::ClientError(SessionError::broker(
            codes::MSG_TIMED_OUT,
            "delivery timed out",
        )));

        let produced = session.produce(["a", "b"], ProduceRecord::new).await.unwrap();

        assert_eq!(produced, 2);
        assert_eq!(client.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_flush_failure_is_retried() {
        let (client, session) = session();
        client.push_flush_result(Err(SessionError::broker(codes::TIMED_OUT, "flush timed out")));

        let produced = session.produce(["a"], ProduceRecord::new).await.unwrap();

        assert_eq!(produced, 1);
        assert_eq!(client.flush_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_flush_failure_fails_the_call() {
        let (client, session) = session();
        client.push_flush_result(Err(SessionError::broker(codes::SSL, "handshake failed")));

        let err = session
            .produce(["a"], ProduceRecord::new)
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("Failure to execute action"));
        assert_eq!(err.code(), Some(codes::SSL));
    }

    #[tokio::test]
    async fn test_closed_session_produces_nothing() {
        let (client, session) = session();
        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();

        let produced = session.produce(["a"], ProduceRecord::new).await.unwrap();

        assert_eq!(produced, 0);
        assert!(client.records().is_empty());
        assert_eq!(client.flush_count.load(Ordering::SeqCst), 0);
        assert_eq!(
            session.connect().await.unwrap_err().kind(),
            ErrorKind::Closed
        );
    }

    #[derive(Serialize)]
    struct PageView {
        distinct_id: String,
        url: String,
    }

    #[tokio::test]
    async fn test_produce_json_keys_records() {
        let (client, session) = session();
        let views = vec![
            PageView {
                distinct_id: "user-1".to_string(),
                url: "/home".to_string(),
            },
            PageView {
                distinct_id: "user-2".to_string(),
                url: "/pricing".to_string(),
            },
        ];

        let produced = session
            .produce_json(&views, |view| Some(view.distinct_id.clone()))
            .await
            .unwrap();

        assert_eq!(produced, 2);
        let records = client.records();
        assert_eq!(records[0].1.key.as_deref(), Some(&b"user-1"[..]));
        let payload: serde_json::Value =
            serde_json::from_slice(records[1].1.payload.as_deref().unwrap()).unwrap();
        assert_eq!(payload["url"], "/pricing");
    }
}
