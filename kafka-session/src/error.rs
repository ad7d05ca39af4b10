use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::error_codes::describe;

/// Message carried by the fatal error raised when the client stops making progress.
pub const INVALID_STATE_MESSAGE: &str = "Kafka Client is in an invalid state";

/// Message carried by lifecycle checks on a disconnected session.
pub const CLOSED_MESSAGE: &str = "session is closed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A fault reported by the underlying broker client
    Broker,
    /// A hard wait elapsed before its event fired
    Timeout,
    /// An operation failed, possibly after exhausting its retries
    Failure,
    /// The session was disconnected and cannot be used again
    Closed,
    /// The client keeps returning nothing while in a wrong state. Hosts should restart
    /// instead of retrying the batch.
    InvalidState,
}

/// The single error type surfaced by sessions.
///
/// `code` is the numeric librdkafka code of the root broker fault, preserved through wrapping.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SessionError {
    kind: ErrorKind,
    code: Option<i32>,
    message: String,
    // Root cause text once wrapped; re-wrapping reuses it instead of nesting prefixes
    cause: Option<String>,
}

impl SessionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            cause: None,
        }
    }

    pub fn broker(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            ..Self::new(ErrorKind::Broker, message)
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("Timeout of {}ms", after.as_millis()),
        )
    }

    pub fn closed() -> Self {
        Self::new(ErrorKind::Closed, CLOSED_MESSAGE)
    }

    pub fn invalid_state() -> Self {
        Self::new(ErrorKind::InvalidState, INVALID_STATE_MESSAGE)
    }

    /// Folds several independent failures (one per partition, typically) into one error.
    /// The first failure's code is kept.
    pub fn aggregate(message: &str, errors: Vec<SessionError>) -> Self {
        let code = errors.iter().find_map(|e| e.code);
        let details: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        Self {
            code,
            ..Self::new(
                ErrorKind::Failure,
                format!("{message} ({} failed): {}", errors.len(), details.join("; ")),
            )
        }
    }

    pub(crate) fn wrapped(
        kind: ErrorKind,
        message: String,
        cause: String,
        code: Option<i32>,
    ) -> Self {
        Self {
            kind,
            code,
            message,
            cause: Some(cause),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True for the unrecoverable invalid-state case only.
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::InvalidState
    }

    pub fn is_wrapped(&self) -> bool {
        self.cause.is_some()
    }

    /// Text describing the root fault: the original cause when already wrapped, otherwise this
    /// error's message plus its code and description.
    pub fn root_cause(&self) -> String {
        if let Some(cause) = &self.cause {
            return cause.clone();
        }
        match self.code {
            Some(code) => format!(
                "{}, code: {}, desc: \"{}\"",
                self.message,
                code,
                describe(code)
            ),
            None => self.message.clone(),
        }
    }
}

impl From<KafkaError> for SessionError {
    fn from(error: KafkaError) -> Self {
        match error.rdkafka_error_code() {
            Some(code) => SessionError::broker(code as i32, error.to_string()),
            None => SessionError::new(ErrorKind::Broker, error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_codes::codes;

    #[test]
    fn test_root_cause_includes_code_and_description() {
        let err = SessionError::broker(codes::TIMED_OUT, "Local: Timed out");
        assert_eq!(
            err.root_cause(),
            "Local: Timed out, code: -185, desc: \"Local: Timed out\""
        );
    }

    #[test]
    fn test_root_cause_without_code_is_message() {
        let err = SessionError::new(ErrorKind::Failure, "boom");
        assert_eq!(err.root_cause(), "boom");
        assert!(!err.is_wrapped());
    }

    #[test]
    fn test_only_invalid_state_is_fatal() {
        assert!(SessionError::invalid_state().is_fatal());
        assert_eq!(
            SessionError::invalid_state().to_string(),
            INVALID_STATE_MESSAGE
        );
        assert!(!SessionError::closed().is_fatal());
        assert!(!SessionError::broker(codes::STATE, "Local: Erroneous state").is_fatal());
    }

    #[test]
    fn test_timeout_message() {
        let err = SessionError::timeout(Duration::from_millis(100));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.to_string(), "Timeout of 100ms");
    }

    #[test]
    fn test_aggregate_keeps_first_code() {
        let err = SessionError::aggregate(
            "Failure to commit offsets",
            vec![
                SessionError::new(ErrorKind::Failure, "first"),
                SessionError::broker(codes::TRANSPORT, "second"),
            ],
        );
        assert_eq!(err.code(), Some(codes::TRANSPORT));
        assert_eq!(
            err.to_string(),
            "Failure to commit offsets (2 failed): first; second"
        );
    }

    #[test]
    fn test_from_kafka_error_keeps_code() {
        let err = SessionError::from(KafkaError::MessageConsumption(
            rdkafka::error::RDKafkaErrorCode::PartitionEOF,
        ));
        assert_eq!(err.kind(), ErrorKind::Broker);
        assert_eq!(err.code(), Some(codes::PARTITION_EOF));
    }
}
