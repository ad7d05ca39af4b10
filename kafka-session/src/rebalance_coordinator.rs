//! Rebalance state machine of a consuming session.
//!
//! ```text
//!            revoke (backoff grows, timer armed)
//!   Stable ───────────────────────────────────────► Rebalancing
//!     ▲                                                  │
//!     └──────── assign (timer cancelled) ◄───────────────┤
//!     └──────── timer expired ("took too long") ◄────────┘
//! ```
//!
//! Work that needs stable ownership waits in [`RebalanceCoordinator::await_stable`], which never
//! fails: a rebalance that outlives the safety ceiling is logged and the wait gives up.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffController;
use crate::metrics_consts::{ASSIGNED_PARTITIONS, REBALANCES_STARTED, REBALANCE_TIMEOUTS};
use crate::types::Partition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceState {
    Stable,
    Rebalancing,
}

struct Inner {
    topic: String,
    state: watch::Sender<RebalanceState>,
    assignment: Mutex<Vec<Partition>>,
    timer: Mutex<Option<CancellationToken>>,
    backoff: BackoffController,
    scope: CancellationToken,
    safety_ceiling: Duration,
}

/// Cheap to clone; clones share state with the session's event bridge.
#[derive(Clone)]
pub struct RebalanceCoordinator {
    inner: Arc<Inner>,
}

impl RebalanceCoordinator {
    pub fn new(
        topic: impl Into<String>,
        backoff: BackoffController,
        scope: CancellationToken,
        safety_ceiling: Duration,
    ) -> Self {
        let (state, _) = watch::channel(RebalanceState::Stable);
        Self {
            inner: Arc::new(Inner {
                topic: topic.into(),
                state,
                assignment: Mutex::new(Vec::new()),
                timer: Mutex::new(None),
                backoff,
                scope,
                safety_ceiling,
            }),
        }
    }

    pub fn state(&self) -> RebalanceState {
        *self.inner.state.borrow()
    }

    pub fn is_rebalancing(&self) -> bool {
        self.state() == RebalanceState::Rebalancing
    }

    pub fn assignment(&self) -> Vec<Partition> {
        self.inner
            .assignment
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    /// Partitions are being revoked. Ignored while a rebalance is already in flight.
    pub fn on_revoke(&self, partitions: &[Partition]) {
        if self.is_rebalancing() {
            debug!(
                topic = %self.inner.topic,
                revoked = partitions.len(),
                "Revoke during an ongoing rebalance"
            );
            return;
        }

        let delay = self.inner.backoff.increase().min(self.inner.safety_ceiling);
        self.inner.state.send_replace(RebalanceState::Rebalancing);
        metrics::counter!(REBALANCES_STARTED, "topic" => self.inner.topic.clone()).increment(1);
        info!(
            topic = %self.inner.topic,
            revoked = partitions.len(),
            timeout_ms = delay.as_millis() as u64,
            "Rebalance started"
        );

        self.arm_timer(delay);
    }

    /// A new assignment arrived. Replaces the previous one wholesale.
    pub fn on_assign(&self, partitions: Vec<Partition>) {
        let count = partitions.len();
        *self
            .inner
            .assignment
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = partitions;
        metrics::gauge!(ASSIGNED_PARTITIONS, "topic" => self.inner.topic.clone()).set(count as f64);

        self.disarm_timer();
        let previous = self.inner.state.send_replace(RebalanceState::Stable);
        info!(
            topic = %self.inner.topic,
            assigned = count,
            was_rebalancing = previous == RebalanceState::Rebalancing,
            "Partitions assigned"
        );
    }

    pub fn on_error(&self, error: &crate::error::SessionError) {
        warn!(topic = %self.inner.topic, error = %error, "Rebalance error reported by broker");
    }

    /// Resolves once the state is stable, the safety ceiling elapses, or the session closes.
    pub async fn await_stable(&self) {
        let mut rx = self.inner.state.subscribe();
        if *rx.borrow() == RebalanceState::Stable {
            return;
        }

        debug!(topic = %self.inner.topic, "Waiting for rebalance to settle");
        let settled = tokio::time::timeout(self.inner.safety_ceiling, async {
            rx.wait_for(|state| *state == RebalanceState::Stable)
                .await
                .map(|_| ())
        });

        tokio::select! {
            outcome = settled => match outcome {
                Ok(Ok(())) => debug!(topic = %self.inner.topic, "Rebalance settled"),
                Ok(Err(_)) => debug!(topic = %self.inner.topic, "Rebalance state dropped"),
                Err(_) => warn!(
                    topic = %self.inner.topic,
                    ceiling_ms = self.inner.safety_ceiling.as_millis() as u64,
                    "Rebalance did not settle in time, proceeding anyway"
                ),
            },
            _ = self.inner.scope.cancelled() => {
                debug!(topic = %self.inner.topic, "Session closed while waiting for rebalance");
            }
        }
    }

    /// Stops the pending rebalance timer, if any.
    pub fn shutdown(&self) {
        self.disarm_timer();
    }

    fn arm_timer(&self, delay: Duration) {
        let token = self.inner.scope.child_token();
        let previous = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if *inner.state.borrow() == RebalanceState::Rebalancing {
                        inner.state.send_replace(RebalanceState::Stable);
                        metrics::counter!(REBALANCE_TIMEOUTS, "topic" => inner.topic.clone())
                            .increment(1);
                        warn!(
                            topic = %inner.topic,
                            waited_ms = delay.as_millis() as u64,
                            "Rebalance took too long, assuming stable"
                        );
                    }
                }
            }
        });
    }

    fn disarm_timer(&self) {
        let timer = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        if let Some(timer) = timer {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CEILING: Duration = Duration::from_secs(30 * 60);

    fn coordinator(
        ceiling: Duration,
    ) -> (RebalanceCoordinator, BackoffController, CancellationToken) {
        let backoff = BackoffController::default();
        let scope = CancellationToken::new();
        let coordinator =
            RebalanceCoordinator::new("events", backoff.clone(), scope.clone(), ceiling);
        (coordinator, backoff, scope)
    }

    fn partitions(numbers: &[i32]) -> Vec<Partition> {
        numbers.iter().map(|n| Partition::new("events", *n)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoke_then_assign() {
        let (coordinator, backoff, _) = coordinator(CEILING);
        assert_eq!(coordinator.state(), RebalanceState::Stable);

        coordinator.on_revoke(&partitions(&[0, 1]));
        assert!(coordinator.is_rebalancing());
        assert!(backoff.current() > Duration::from_millis(1000));

        coordinator.on_assign(partitions(&[1, 2]));
        assert_eq!(coordinator.state(), RebalanceState::Stable);
        assert_eq!(coordinator.assignment(), partitions(&[1, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_revoke_keeps_first_timer() {
        let (coordinator, backoff, _) = coordinator(CEILING);
        coordinator.on_revoke(&partitions(&[0]));
        let delay = backoff.current();

        coordinator.on_revoke(&partitions(&[1]));
        assert_eq!(backoff.current(), delay);
        assert!(coordinator.is_rebalancing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_forces_stable() {
        let (coordinator, _, _) = coordinator(CEILING);
        coordinator.on_revoke(&partitions(&[0]));

        // The backoff never exceeds its 60s cap
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(coordinator.state(), RebalanceState::Stable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assign_cancels_timer() {
        let (coordinator, backoff, _) = coordinator(CEILING);
        coordinator.on_revoke(&partitions(&[0]));
        let first_delay = backoff.current();
        coordinator.on_assign(partitions(&[0]));
        coordinator.on_revoke(&partitions(&[0]));
        assert!(backoff.current() > first_delay + Duration::from_millis(1));

        // Stale timer from the first revoke must not end the second rebalance early
        tokio::time::sleep(first_delay + Duration::from_millis(1)).await;
        assert!(coordinator.is_rebalancing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_stable_resolves_on_assign() {
        let (coordinator, _, _) = coordinator(CEILING);
        coordinator.on_revoke(&partitions(&[0]));

        let assigner = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            assigner.on_assign(partitions(&[0]));
        });

        let started = tokio::time::Instant::now();
        coordinator.await_stable().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(coordinator.state(), RebalanceState::Stable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_stable_gives_up_at_ceiling() {
        let (coordinator, _, _) = coordinator(Duration::from_millis(500));
        coordinator.on_revoke(&partitions(&[0]));
        coordinator.shutdown();

        let started = tokio::time::Instant::now();
        coordinator.await_stable().await;
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(coordinator.is_rebalancing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scope_cancellation_releases_waiters() {
        let (coordinator, _, scope) = coordinator(CEILING);
        coordinator.on_revoke(&partitions(&[0]));
        scope.cancel();

        coordinator.await_stable().await;
        assert!(coordinator.is_rebalancing());
    }
}
