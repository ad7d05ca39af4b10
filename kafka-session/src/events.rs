//! Waiting on broker events.
//!
//! Every wait owns its broadcast receiver and a child of the session's cancellation token.
//! Dropping or cancelling a wait releases both, and cancelling the session token cancels every
//! wait derived from it.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::connection::{BrokerEvent, BrokerEventKind};
use crate::error::SessionError;

/// How a one-shot wait ended when it did not fail.
#[derive(Debug)]
pub enum Resolution {
    Fired(BrokerEvent),
    Cancelled,
    /// A soft timeout elapsed
    TimedOut,
}

/// Handle to cancel an outstanding wait.
#[derive(Debug, Clone)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Waits for the first event of `kind` on `events`.
///
/// The receiver is already subscribed when this is called, so events published between this
/// call and the first poll of the returned future are not lost. The future resolves once:
/// `Fired` when the event arrives (or `Err` with the event's error payload), `Cancelled` when
/// the subscription or `scope` is cancelled, and on `timeout` either `Err` (hard) or
/// `TimedOut` (soft).
pub fn await_once(
    mut events: broadcast::Receiver<BrokerEvent>,
    kind: BrokerEventKind,
    timeout: Option<Duration>,
    hard: bool,
    scope: &CancellationToken,
) -> (
    Subscription,
    impl Future<Output = Result<Resolution, SessionError>> + Send + 'static,
) {
    let token = scope.child_token();
    let subscription = Subscription {
        token: token.clone(),
    };

    let wait = async move {
        let deadline = tokio::time::sleep(timeout.unwrap_or_default());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                received = events.recv() => match received {
                    Ok(event) if event.kind() == kind => {
                        return match event.error() {
                            Some(err) => Err(err.clone()),
                            None => Ok(Resolution::Fired(event)),
                        };
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(?kind, skipped, "Event listener lagged behind, events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => return Ok(Resolution::Cancelled),
                },
                _ = token.cancelled() => return Ok(Resolution::Cancelled),
                _ = &mut deadline, if timeout.is_some() => {
                    return if hard {
                        Err(SessionError::timeout(timeout.unwrap_or_default()))
                    } else {
                        Ok(Resolution::TimedOut)
                    };
                }
            }
        }
    };

    (subscription, wait)
}

/// Runs `operation` while listening once for `kind`. An error delivered by the event before the
/// operation settles wins over the operation's own outcome.
pub async fn race_with_event<T, F>(
    events: broadcast::Receiver<BrokerEvent>,
    kind: BrokerEventKind,
    scope: &CancellationToken,
    operation: F,
) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, SessionError>>,
{
    let (subscription, fault) = await_once(events, kind, None, false, scope);
    tokio::pin!(fault);
    tokio::pin!(operation);

    let mut fault_done = false;
    let outcome = loop {
        tokio::select! {
            biased;

            resolution = &mut fault, if !fault_done => {
                fault_done = true;
                if let Err(err) = resolution {
                    break Err(err);
                }
            }
            result = &mut operation => break result,
        }
    };

    subscription.cancel();
    outcome
}
