use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backoff::BackoffController;
use crate::connection::{BrokerConnection, BrokerEventKind};
use crate::error::SessionError;
use crate::error_codes::{classify, is_retryable, wrap_error, ActionKind, ErrorClass};
use crate::events::race_with_event;
use crate::metrics_consts::{ACTION_FAILURES, BENIGN_FAULTS, RETRY_ATTEMPTS};

/// Runs before every attempt. Errors abort the whole run unwrapped.
#[async_trait]
pub trait PreCheck: Send + Sync {
    async fn check(&self) -> Result<(), SessionError>;
}

pub struct NoPreCheck;

#[async_trait]
impl PreCheck for NoPreCheck {
    async fn check(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Retries broker actions per the fault taxonomy, sleeping the shared backoff between attempts.
#[derive(Clone)]
pub struct RetryExecutor {
    backoff: BackoffController,
    closed: Arc<AtomicBool>,
    scope: CancellationToken,
}

impl RetryExecutor {
    pub fn new(
        backoff: BackoffController,
        closed: Arc<AtomicBool>,
        scope: CancellationToken,
    ) -> Self {
        Self {
            backoff,
            closed,
            scope,
        }
    }

    pub fn backoff(&self) -> &BackoffController {
        &self.backoff
    }

    /// Runs `action` until it succeeds, its fault is acceptable for `kind`, or the fault is
    /// fatal or out of retries.
    ///
    /// `Ok(None)` means nothing was done: the session is closed, it was closed during a backoff
    /// sleep, or the fault was benign.
    pub async fn run<T, F, Fut>(
        &self,
        kind: ActionKind,
        max_retries: u32,
        pre_check: Option<&dyn PreCheck>,
        mut action: F,
    ) -> Result<Option<T>, SessionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let mut retries_left = max_retries;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                debug!(action = %kind, "Session is closed, skipping action");
                return Ok(None);
            }

            if let Some(check) = pre_check {
                check.check().await?;
            }

            let err = match action().await {
                Ok(value) => {
                    if kind != ActionKind::Connect {
                        self.backoff.reset();
                    }
                    return Ok(Some(value));
                }
                Err(err) => err,
            };

            match classify(&err, kind) {
                ErrorClass::Benign => {
                    metrics::counter!(BENIGN_FAULTS, "action" => kind.as_str()).increment(1);
                    debug!(action = %kind, error = %err, "Ignoring acceptable fault");
                    return Ok(None);
                }
                ErrorClass::WrongState => {
                    self.backoff.increase();
                    let count = self.backoff.record_invalid_state();
                    warn!(
                        action = %kind,
                        invalid_state_count = count,
                        "Client reported a wrong state"
                    );
                }
                ErrorClass::Retryable | ErrorClass::Fatal => {}
            }

            let retryable = is_retryable(&err);
            if retryable && retries_left > 0 {
                retries_left -= 1;
                let delay = self.backoff.increase();
                metrics::counter!(RETRY_ATTEMPTS, "action" => kind.as_str()).increment(1);
                warn!(
                    action = %kind,
                    error = %err,
                    retries_left,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient fault"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.scope.cancelled() => {
                        debug!(action = %kind, "Session closed during backoff, giving up");
                        return Ok(None);
                    }
                }
                continue;
            }

            self.backoff.reset();
            metrics::counter!(
                ACTION_FAILURES,
                "action" => kind.as_str(),
                "exhausted" => retryable.to_string()
            )
            .increment(1);

            let message = if retryable {
                format!("Failure to {} after retries", kind.verb())
            } else {
                format!("Failure to {}", kind.verb())
            };
            let wrapped = wrap_error(&message, &err);
            error!(action = %kind, error = %wrapped, "Action failed");
            return Err(wrapped);
        }
    }

    /// Like [`RetryExecutor::run`], with every attempt raced against an error-carrying `event`
    /// from `source`.
    pub async fn run_with_event_race<S, T, F, Fut>(
        &self,
        source: &S,
        event: BrokerEventKind,
        kind: ActionKind,
        max_retries: u32,
        pre_check: Option<&dyn PreCheck>,
        mut action: F,
    ) -> Result<Option<T>, SessionError>
    where
        S: BrokerConnection + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        self.run(kind, max_retries, pre_check, || {
            race_with_event(source.events(), event, &self.scope, action())
        })
        .await
    }
}
