//! Consuming session.
//!
//! Callers drive one window at a time: `consume`, then exactly one of `commit` (the window was
//! processed) or `rollback` (rewind every partition to where the window started), or `retry`
//! which picks between the two per configuration.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffController;
use crate::config::SessionConfig;
use crate::connection::{
    BrokerEvent, BrokerEventKind, ConsumedMessage, ConsumerConnection, RebalanceSignal,
};
use crate::error::SessionError;
use crate::error_codes::{wrap_error, ActionKind};
use crate::events::{await_once, Resolution};
use crate::metrics_consts::{
    BYTES_CONSUMED, COMMITS_ISSUED, EMPTY_WINDOWS, MESSAGES_CONSUMED, PENDING_COMMITS,
    ROLLBACK_SEEKS,
};
use crate::offset_tracker::{OffsetSide, OffsetTracker};
use crate::rebalance_coordinator::RebalanceCoordinator;
use crate::retry::{PreCheck, RetryExecutor};
use crate::types::{Partition, PartitionOffset};

const INVALID_STATE_PAUSE: Duration = Duration::from_millis(1000);

/// Empty windows start to count as distress once there are more than `threshold` of them.
pub(crate) fn exceeds_empty_window_threshold(empty_windows: u32, threshold: u32) -> bool {
    empty_windows > threshold
}

/// Distress needs at least `min` wrong-state faults on record.
pub(crate) fn reaches_invalid_state_min(invalid_state_count: u32, min: u32) -> bool {
    invalid_state_count >= min
}

/// Below `max` wrong-state faults distress is only logged; at `max` it is fatal.
pub(crate) fn below_invalid_state_max(invalid_state_count: u32, max: u32) -> bool {
    invalid_state_count < max
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Healthy,
    Distressed,
    Fatal,
}

/// Decides whether repeated empty windows mean the client is stuck.
struct InvalidStateMonitor {
    empty_windows: AtomicU32,
    empty_window_threshold: u32,
    invalid_state_min: u32,
    invalid_state_max: u32,
    backoff: BackoffController,
}

impl InvalidStateMonitor {
    fn new(config: &SessionConfig, backoff: BackoffController) -> Self {
        Self {
            empty_windows: AtomicU32::new(0),
            empty_window_threshold: config.empty_window_threshold,
            invalid_state_min: config.invalid_state_min,
            invalid_state_max: config.invalid_state_max,
            backoff,
        }
    }

    fn record_empty_window(&self) -> u32 {
        self.empty_windows.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_progress(&self) {
        self.empty_windows.store(0, Ordering::SeqCst);
        self.backoff.relieve_invalid_state();
    }

    fn empty_windows(&self) -> u32 {
        self.empty_windows.load(Ordering::SeqCst)
    }

    fn verdict(&self, connected: bool, rebalancing: bool) -> Verdict {
        let invalid = self.backoff.invalid_state_count();
        if !exceeds_empty_window_threshold(self.empty_windows(), self.empty_window_threshold)
            || !reaches_invalid_state_min(invalid, self.invalid_state_min)
            || !connected
            || rebalancing
        {
            Verdict::Healthy
        } else if below_invalid_state_max(invalid, self.invalid_state_max) {
            Verdict::Distressed
        } else {
            Verdict::Fatal
        }
    }
}

/// Runs before every consumer action: the session must be open, connected, not rebalancing,
/// and not stuck.
struct ConsumerPreCheck<C> {
    client: Arc<C>,
    closed: Arc<AtomicBool>,
    scope: CancellationToken,
    rebalance: RebalanceCoordinator,
    monitor: Arc<InvalidStateMonitor>,
    connect_timeout: Duration,
}

#[async_trait]
impl<C: ConsumerConnection> PreCheck for ConsumerPreCheck<C> {
    async fn check(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::closed());
        }

        if !self.client.is_connected() {
            warn!("Consumer connection lost, reconnecting");
            self.client
                .connect(self.connect_timeout)
                .await
                .map_err(|e| wrap_error("Failure to reconnect", &e))?;
        }

        self.rebalance.await_stable().await;

        let invalid = self.monitor.backoff.invalid_state_count();
        if invalid > 0 {
            debug!(invalid_state_count = invalid, "Pausing for a client in a wrong state");
            tokio::select! {
                _ = tokio::time::sleep(INVALID_STATE_PAUSE * invalid) => {}
                _ = self.scope.cancelled() => return Err(SessionError::closed()),
            }
        }

        let verdict = self
            .monitor
            .verdict(self.client.is_connected(), self.rebalance.is_rebalancing());
        if verdict == Verdict::Fatal {
            return Err(SessionError::invalid_state());
        }
        Ok(())
    }
}

pub struct ConsumingSession<C: ConsumerConnection> {
    client: Arc<C>,
    config: SessionConfig,
    executor: RetryExecutor,
    offsets: OffsetTracker,
    rebalance: RebalanceCoordinator,
    pending_commits: Arc<DashMap<i32, usize>>,
    monitor: Arc<InvalidStateMonitor>,
    pre_check: ConsumerPreCheck<C>,
    closed: Arc<AtomicBool>,
    scope: CancellationToken,
    bridge_registered: bool,
    bytes_consumed: u64,
}

impl<C: ConsumerConnection> ConsumingSession<C> {
    /// Wraps a created, not yet connected, connection.
    pub fn new(client: Arc<C>, config: SessionConfig) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let scope = CancellationToken::new();
        let backoff = BackoffController::new(config.backoff_settings());
        let executor = RetryExecutor::new(backoff.clone(), closed.clone(), scope.clone());
        let rebalance = RebalanceCoordinator::new(
            config.topic.clone(),
            backoff.clone(),
            scope.clone(),
            config.rebalance_ceiling(),
        );
        let monitor = Arc::new(InvalidStateMonitor::new(&config, backoff));
        let pre_check = ConsumerPreCheck {
            client: client.clone(),
            closed: closed.clone(),
            scope: scope.clone(),
            rebalance: rebalance.clone(),
            monitor: monitor.clone(),
            connect_timeout: config.connect_timeout(),
        };

        Self {
            client,
            offsets: OffsetTracker::new(config.topic.clone()),
            config,
            executor,
            rebalance,
            pending_commits: Arc::new(DashMap::new()),
            monitor,
            pre_check,
            closed,
            scope,
            bridge_registered: false,
            bytes_consumed: 0,
        }
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.client.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pre_check(&self) -> Option<&dyn PreCheck> {
        Some(&self.pre_check)
    }

    pub async fn connect(&mut self) -> Result<(), SessionError> {
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
                info!(topic = %self.config.topic, "Consumer connected");
                Ok(())
            }
            Resolution::Cancelled => Err(SessionError::closed()),
            Resolution::TimedOut => Err(SessionError::timeout(timeout)),
        }
    }

    /// Closes the session for good. Cancels every outstanding wait, timer and the event bridge.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(topic = %self.config.topic, "Consumer already disconnected");
            return Ok(());
        }

        info!(topic = %self.config.topic, "Disconnecting consumer");
        self.scope.cancel();
        self.rebalance.shutdown();
        self.client.disconnect().await
    }

    fn register_bridge(&mut self) {
        if self.bridge_registered {
            return;
        }
        self.bridge_registered = true;

        let mut events = self.client.events();
        let token = self.scope.child_token();
        let topic = self.config.topic.clone();
        let rebalance = self.rebalance.clone();
        let pending = self.pending_commits.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => handle_broker_event(&topic, &rebalance, &pending, event),
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

    /// Pulls messages until `max_size` are gathered or `max_wait` elapses, mapping each through
    /// `map`. Every pulled message is recorded in the offset window, mapped or not.
    pub async fn consume<T, F>(
        &mut self,
        max_size: usize,
        max_wait: Duration,
        mut map: F,
    ) -> Result<Vec<T>, SessionError>
    where
        F: FnMut(&ConsumedMessage) -> Option<T>,
    {
        let deadline = Instant::now() + max_wait;
        let mut records = Vec::new();
        let mut pulled = 0;

        while pulled < max_size {
            let wanted = max_size - pulled;
            let batch = self
                .executor
                .run_with_event_race(
                    self.client.as_ref(),
                    BrokerEventKind::ClientError,
                    ActionKind::Consume,
                    self.config.max_retries,
                    self.pre_check(),
                    || {
                        self.client
                            .pull(wanted, deadline.saturating_duration_since(Instant::now()))
                    },
                )
                .await?;

            let Some(batch) = batch.filter(|b| !b.is_empty()) else {
                break;
            };

            pulled += batch.len();
            let mut bytes = 0;
            for message in &batch {
                self.offsets.record(message.partition, message.offset);
                bytes += message.payload_len() as u64;
                if let Some(record) = map(message) {
                    records.push(record);
                }
            }
            self.bytes_consumed += bytes;
            metrics::counter!(MESSAGES_CONSUMED, "topic" => self.config.topic.clone())
                .increment(batch.len() as u64);
            metrics::counter!(BYTES_CONSUMED, "topic" => self.config.topic.clone())
                .increment(bytes);

            if Instant::now() >= deadline {
                break;
            }
        }

        if pulled > 0 {
            self.monitor.record_progress();
            return Ok(records);
        }

        let empty_windows = self.monitor.record_empty_window();
        metrics::counter!(EMPTY_WINDOWS, "topic" => self.config.topic.clone()).increment(1);

        let invalid_state_count = self.monitor.backoff.invalid_state_count();
        match self
            .monitor
            .verdict(self.client.is_connected(), self.rebalance.is_rebalancing())
        {
            Verdict::Healthy => {}
            Verdict::Distressed => warn!(
                topic = %self.config.topic,
                empty_windows,
                invalid_state_count,
                "Consumer keeps returning nothing while in a wrong state"
            ),
            Verdict::Fatal => {
                error!(
                    topic = %self.config.topic,
                    empty_windows,
                    invalid_state_count,
                    "Consumer is stuck in an invalid state"
                );
                return Err(SessionError::invalid_state());
            }
        }

        Ok(records)
    }

    /// Like [`ConsumingSession::consume`], decoding JSON payloads. Undecodable messages are
    /// skipped with a warning; their offsets still count as consumed.
    pub async fn consume_json<T: DeserializeOwned>(
        &mut self,
        max_size: usize,
        max_wait: Duration,
    ) -> Result<Vec<T>, SessionError> {
        self.consume(max_size, max_wait, |message| {
            let payload = message.payload.as_deref()?;
            match serde_json::from_slice(payload) {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Failed to decode message"
                    );
                    None
                }
            }
        })
        .await
    }

    /// Commits the offset after the last message of every partition in the window.
    ///
    /// Partitions commit concurrently; a failing partition does not stop the others. Every
    /// attempt stays pending until the commit callback reports on it, whatever the outcome.
    pub async fn commit(&mut self) -> Result<(), SessionError> {
        let offsets = self.offsets.flush(OffsetSide::Ended);
        if offsets.is_empty() {
            debug!(topic = %self.config.topic, "Nothing to commit");
            return Ok(());
        }

        let stagger = self.config.commit_stagger();
        let sync = self.config.use_commit_sync;
        let this = &*self;

        let commits = offsets.iter().enumerate().map(|(index, offset)| {
            let jitter = stagger.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
            let delay = stagger * index as u32 + jitter;
            async move {
                tokio::time::sleep(delay).await;
                let result = this
                    .executor
                    .run(
                        ActionKind::Commit,
                        this.config.max_retries,
                        this.pre_check(),
                        || {
                            this.track_commit_issued(offset.partition_number());
                            this.client.commit(offset, sync)
                        },
                    )
                    .await;
                (offset, result)
            }
        });
        let results = join_all(commits).await;

        let mut failures = Vec::new();
        for (offset, result) in results {
            match result {
                Ok(Some(())) => {
                    metrics::counter!(COMMITS_ISSUED, "outcome" => "committed").increment(1);
                    debug!(
                        topic = offset.topic(),
                        partition = offset.partition_number(),
                        offset = offset.offset(),
                        "Committed offset"
                    );
                }
                Ok(None) => {
                    metrics::counter!(COMMITS_ISSUED, "outcome" => "skipped").increment(1);
                }
                Err(err) => {
                    metrics::counter!(COMMITS_ISSUED, "outcome" => "failed").increment(1);
                    warn!(
                        topic = offset.topic(),
                        partition = offset.partition_number(),
                        offset = offset.offset(),
                        error = %err,
                        "Failed to commit offset"
                    );
                    failures.push(err);
                }
            }
        }

        settle(failures, "Failure to commit offsets")
    }

    /// Seeks every partition of the window back to its first consumed offset.
    pub async fn rollback(&mut self) -> Result<(), SessionError> {
        let offsets = self.offsets.flush(OffsetSide::Started);
        if offsets.is_empty() {
            debug!(topic = %self.config.topic, "Nothing to roll back");
            return Ok(());
        }

        let timeout = self.config.seek_timeout();
        let this = &*self;
        let seeks = offsets.iter().map(|offset| async move {
            let result = this
                .executor
                .run(
                    ActionKind::Seek,
                    this.config.max_retries,
                    this.pre_check(),
                    || this.client.seek(offset, timeout),
                )
                .await;
            (offset, result)
        });
        let results = join_all(seeks).await;

        let mut failures = Vec::new();
        for (offset, result) in results {
            match result {
                Ok(Some(())) => {
                    self.offsets
                        .seek(offset.partition_number(), offset.offset());
                    metrics::counter!(ROLLBACK_SEEKS, "outcome" => "seeked").increment(1);
                    info!(
                        topic = offset.topic(),
                        partition = offset.partition_number(),
                        offset = offset.offset(),
                        "Rolled back partition"
                    );
                }
                Ok(None) => {
                    metrics::counter!(ROLLBACK_SEEKS, "outcome" => "skipped").increment(1);
                }
                Err(err) => {
                    metrics::counter!(ROLLBACK_SEEKS, "outcome" => "failed").increment(1);
                    warn!(
                        topic = offset.topic(),
                        partition = offset.partition_number(),
                        offset = offset.offset(),
                        error = %err,
                        "Failed to roll back partition"
                    );
                    failures.push(err);
                }
            }
        }

        settle(failures, "Failure to rollback offsets")
    }

    /// Settles a window that failed downstream: rolls it back or commits it past the failure,
    /// per `rollback_on_failure`.
    pub async fn retry(&mut self) -> Result<(), SessionError> {
        if self.config.rollback_on_failure {
            self.rollback().await
        } else {
            self.commit().await
        }
    }

    /// Moves the read position of one partition and restarts its window there.
    pub async fn seek(&mut self, partition: i32, offset: i64) -> Result<(), SessionError> {
        let target =
            PartitionOffset::new(Partition::new(self.config.topic.clone(), partition), offset);
        let timeout = self.config.seek_timeout();

        let seeked = self
            .executor
            .run(
                ActionKind::Seek,
                self.config.max_retries,
                self.pre_check(),
                || self.client.seek(&target, timeout),
            )
            .await?;

        if seeked.is_some() {
            self.offsets.seek(partition, offset);
            info!(topic = %self.config.topic, partition, offset, "Seeked partition");
        }
        Ok(())
    }

    /// Current read positions of this session's topic.
    pub fn topic_positions(&self) -> Result<Vec<PartitionOffset>, SessionError> {
        let positions = self.client.position()?;
        Ok(positions
            .into_iter()
            .filter(|p| p.topic() == self.config.topic)
            .collect())
    }

    pub async fn partition_count(&self, topic: &str) -> Result<usize, SessionError> {
        let timeout = self.config.metadata_timeout();
        let metadata = self
            .executor
            .run(
                ActionKind::Metadata,
                self.config.max_retries,
                self.pre_check(),
                || self.client.fetch_metadata(topic, timeout),
            )
            .await?;

        Ok(metadata.map_or(0, |m| m.partitions.len()))
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    /// True when no partition has more than `pending_commit_threshold` unacknowledged commits.
    pub fn handle_pending_commits(&self) -> bool {
        let threshold = self.config.pending_commit_threshold;
        let backlogged: Vec<(i32, usize)> = self
            .pending_commits
            .iter()
            .filter(|entry| *entry.value() > threshold)
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        if backlogged.is_empty() {
            return true;
        }

        for (partition, pending) in backlogged {
            warn!(
                topic = %self.config.topic,
                partition,
                pending,
                threshold,
                "Too many unacknowledged commits"
            );
        }
        false
    }

    pub fn pending_commits(&self, partition: i32) -> usize {
        self.pending_commits
            .get(&partition)
            .map_or(0, |count| *count)
    }

    pub fn assignment(&self) -> Vec<Partition> {
        self.rebalance.assignment()
    }

    pub fn is_rebalancing(&self) -> bool {
        self.rebalance.is_rebalancing()
    }

    pub fn invalid_state_count(&self) -> u32 {
        self.executor.backoff().invalid_state_count()
    }

    /// Offsets recorded in the current window, without draining it.
    pub fn window(&self) -> &OffsetTracker {
        &self.offsets
    }

    fn track_commit_issued(&self, partition: i32) {
        let mut count = self.pending_commits.entry(partition).or_insert(0);
        *count += 1;
        set_pending_gauge(&self.config.topic, partition, *count);
    }
}

impl<C: ConsumerConnection> Drop for ConsumingSession<C> {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

fn settle(failures: Vec<SessionError>, message: &str) -> Result<(), SessionError> {
    if failures.is_empty() {
        return Ok(());
    }
    if let Some(fatal) = failures.iter().find(|e| e.is_fatal()) {
        return Err(fatal.clone());
    }
    Err(SessionError::aggregate(message, failures))
}

fn set_pending_gauge(topic: &str, partition: i32, count: usize) {
    metrics::gauge!(
        PENDING_COMMITS,
        "topic" => topic.to_string(),
        "partition" => partition.to_string()
    )
    .set(count as f64);
}

fn release_pending(pending: &DashMap<i32, usize>, topic: &str, partition: i32) {
    if let Some(mut count) = pending.get_mut(&partition) {
        *count = count.saturating_sub(1);
        set_pending_gauge(topic, partition, *count);
    }
}

fn handle_broker_event(
    topic: &str,
    rebalance: &RebalanceCoordinator,
    pending: &DashMap<i32, usize>,
    event: BrokerEvent,
) {
    match event {
        BrokerEvent::Rebalance(RebalanceSignal::Revoke(partitions)) => {
            rebalance.on_revoke(&partitions);
        }
        BrokerEvent::Rebalance(RebalanceSignal::Assign(partitions)) => {
            rebalance.on_assign(partitions);
        }
        BrokerEvent::Rebalance(RebalanceSignal::Error(err)) => rebalance.on_error(&err),
        BrokerEvent::OffsetCommit { offsets, error } => {
            if let Some(err) = error {
                warn!(topic = %topic, error = %err, "Broker rejected offset commit");
            }
            for offset in offsets.iter().filter(|o| o.topic() == topic) {
                release_pending(pending, topic, offset.partition_number());
            }
        }
        BrokerEvent::ClientError(err) => {
            warn!(topic = %topic, error = %err, "Consumer client error");
        }
        BrokerEvent::Disconnected => info!(topic = %topic, "Consumer connection closed"),
        BrokerEvent::Ready | BrokerEvent::ConnectError(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::at_threshold(5, 5, false)]
    #[case::above_threshold(6, 5, true)]
    #[case::zero_threshold_first_window(1, 0, true)]
    fn test_empty_window_threshold(
        #[case] empty: u32,
        #[case] threshold: u32,
        #[case] expected: bool,
    ) {
        assert_eq!(exceeds_empty_window_threshold(empty, threshold), expected);
    }

    #[rstest]
    #[case::none(0, 1, false)]
    #[case::at_min(1, 1, true)]
    #[case::above_min(2, 1, true)]
    fn test_invalid_state_min(#[case] count: u32, #[case] min: u32, #[case] expected: bool) {
        assert_eq!(reaches_invalid_state_min(count, min), expected);
    }

    #[rstest]
    #[case::below(2, 3, true)]
    #[case::at_max(3, 3, false)]
    #[case::test_max(1, 1, false)]
    fn test_invalid_state_max(#[case] count: u32, #[case] max: u32, #[case] expected: bool) {
        assert_eq!(below_invalid_state_max(count, max), expected);
    }

    fn monitor(config: &SessionConfig) -> InvalidStateMonitor {
        InvalidStateMonitor::new(config, BackoffController::new(config.backoff_settings()))
    }

    #[test]
    fn test_verdict_requires_every_condition() {
        let config = SessionConfig::new("events");
        let monitor = monitor(&config);

        for _ in 0..6 {
            monitor.record_empty_window();
        }
        assert_eq!(monitor.verdict(true, false), Verdict::Healthy);

        monitor.backoff.record_invalid_state();
        assert_eq!(monitor.verdict(true, false), Verdict::Distressed);
        assert_eq!(monitor.verdict(false, false), Verdict::Healthy);
        assert_eq!(monitor.verdict(true, true), Verdict::Healthy);

        monitor.backoff.record_invalid_state();
        monitor.backoff.record_invalid_state();
        assert_eq!(monitor.verdict(true, false), Verdict::Fatal);
    }

    #[test]
    fn test_progress_resets_empty_windows_and_relieves() {
        let config = SessionConfig::for_tests("events");
        let monitor = monitor(&config);
        monitor.record_empty_window();
        monitor.backoff.record_invalid_state();
        assert_eq!(monitor.verdict(true, false), Verdict::Fatal);

        monitor.record_progress();
        assert_eq!(monitor.empty_windows(), 0);
        assert_eq!(monitor.backoff.invalid_state_count(), 0);
        assert_eq!(monitor.verdict(true, false), Verdict::Healthy);
    }

    #[test]
    fn test_settle_prefers_fatal_errors() {
        let err = settle(
            vec![
                SessionError::broker(-195, "transport"),
                SessionError::invalid_state(),
            ],
            "Failure to commit offsets",
        )
        .unwrap_err();
        assert!(err.is_fatal());

        assert!(settle(Vec::new(), "unused").is_ok());
    }
}
