//! Broker fault taxonomy.
//!
//! Maps librdkafka numeric error codes to descriptions and decides, per action, whether a fault
//! is acceptable (swallowed), retryable, a wrong-state signal, or fatal.

use std::fmt;

use crate::error::{ErrorKind, SessionError};

/// librdkafka error codes. Negative values are local (client side) faults, positive values come
/// from the broker.
pub mod codes {
    pub const BAD_MSG: i32 = -199;
    pub const DESTROY: i32 = -197;
    pub const FAIL: i32 = -196;
    pub const TRANSPORT: i32 = -195;
    pub const RESOLVE: i32 = -193;
    pub const MSG_TIMED_OUT: i32 = -192;
    pub const PARTITION_EOF: i32 = -191;
    pub const UNKNOWN_PARTITION: i32 = -190;
    pub const UNKNOWN_TOPIC: i32 = -188;
    pub const ALL_BROKERS_DOWN: i32 = -187;
    pub const INVALID_ARG: i32 = -186;
    pub const TIMED_OUT: i32 = -185;
    pub const QUEUE_FULL: i32 = -184;
    pub const SSL: i32 = -181;
    pub const WAIT_COORD: i32 = -180;
    pub const UNKNOWN_GROUP: i32 = -179;
    pub const IN_PROGRESS: i32 = -178;
    pub const ASSIGN_PARTITIONS: i32 = -175;
    pub const REVOKE_PARTITIONS: i32 = -174;
    pub const STATE: i32 = -172;
    pub const NOT_IMPLEMENTED: i32 = -170;
    pub const AUTHENTICATION: i32 = -169;
    pub const NO_OFFSET: i32 = -168;
    pub const TIMED_OUT_QUEUE: i32 = -166;
    pub const FATAL: i32 = -150;
    pub const MAX_POLL_EXCEEDED: i32 = -147;
    pub const FENCED: i32 = -144;
    pub const ASSIGNMENT_LOST: i32 = -142;
    pub const UNKNOWN: i32 = -1;
    pub const NO_ERROR: i32 = 0;
    pub const OFFSET_OUT_OF_RANGE: i32 = 1;
    pub const UNKNOWN_TOPIC_OR_PART: i32 = 3;
    pub const LEADER_NOT_AVAILABLE: i32 = 5;
    pub const NOT_LEADER_FOR_PARTITION: i32 = 6;
    pub const REQUEST_TIMED_OUT: i32 = 7;
    pub const BROKER_NOT_AVAILABLE: i32 = 8;
    pub const MSG_SIZE_TOO_LARGE: i32 = 10;
    pub const NETWORK_EXCEPTION: i32 = 13;
    pub const COORDINATOR_LOAD_IN_PROGRESS: i32 = 14;
    pub const COORDINATOR_NOT_AVAILABLE: i32 = 15;
    pub const NOT_COORDINATOR: i32 = 16;
    pub const ILLEGAL_GENERATION: i32 = 22;
    pub const UNKNOWN_MEMBER_ID: i32 = 25;
    pub const REBALANCE_IN_PROGRESS: i32 = 27;
    pub const TOPIC_AUTHORIZATION_FAILED: i32 = 29;
    pub const GROUP_AUTHORIZATION_FAILED: i32 = 30;
}

/// The kind of operation a fault happened in. Each kind has its own set of acceptable codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Consume,
    Commit,
    Produce,
    Connect,
    Seek,
    Metadata,
    Retryable,
    Any,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Consume => "consume",
            ActionKind::Commit => "commit",
            ActionKind::Produce => "produce",
            ActionKind::Connect => "connect",
            ActionKind::Seek => "seek",
            ActionKind::Metadata => "metadata",
            ActionKind::Retryable => "retryable",
            ActionKind::Any => "any",
        }
    }

    /// Verb used in failure messages: `Failure to <verb>`.
    pub fn verb(&self) -> &'static str {
        match self {
            ActionKind::Metadata => "fetch metadata",
            ActionKind::Retryable | ActionKind::Any => "execute action",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a fault is handled by the retry executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Acceptable for the action; swallowed
    Benign,
    /// Retryable fault that also signals the client is in a wrong state
    WrongState,
    /// Transient fault, retried with backoff
    Retryable,
    /// Surfaced immediately
    Fatal,
}

const ANY_OKAY: &[i32] = &[codes::PARTITION_EOF, codes::NO_ERROR];

const CONSUME_OKAY: &[i32] = &[codes::TIMED_OUT_QUEUE];

const COMMIT_OKAY: &[i32] = &[
    codes::NO_OFFSET,
    codes::ASSIGN_PARTITIONS,
    codes::REVOKE_PARTITIONS,
    codes::ASSIGNMENT_LOST,
];

const RETRYABLE: &[i32] = &[
    codes::TRANSPORT,
    codes::RESOLVE,
    codes::MSG_TIMED_OUT,
    codes::ALL_BROKERS_DOWN,
    codes::TIMED_OUT,
    codes::QUEUE_FULL,
    codes::WAIT_COORD,
    codes::STATE,
    codes::TIMED_OUT_QUEUE,
    codes::MAX_POLL_EXCEEDED,
    codes::LEADER_NOT_AVAILABLE,
    codes::NOT_LEADER_FOR_PARTITION,
    codes::REQUEST_TIMED_OUT,
    codes::BROKER_NOT_AVAILABLE,
    codes::NETWORK_EXCEPTION,
    codes::COORDINATOR_LOAD_IN_PROGRESS,
    codes::COORDINATOR_NOT_AVAILABLE,
    codes::NOT_COORDINATOR,
    codes::REBALANCE_IN_PROGRESS,
];

fn acceptable(action: ActionKind) -> &'static [i32] {
    match action {
        ActionKind::Consume => CONSUME_OKAY,
        ActionKind::Commit => COMMIT_OKAY,
        ActionKind::Retryable => RETRYABLE,
        ActionKind::Any => ANY_OKAY,
        ActionKind::Produce | ActionKind::Connect | ActionKind::Seek | ActionKind::Metadata => &[],
    }
}

pub fn describe(code: i32) -> &'static str {
    match code {
        codes::BAD_MSG => "Local: Bad message format",
        codes::DESTROY => "Local: Broker handle destroyed",
        codes::FAIL => "Local: Communication failure with broker",
        codes::TRANSPORT => "Local: Broker transport failure",
        codes::RESOLVE => "Local: Host resolution failure",
        codes::MSG_TIMED_OUT => "Local: Message timed out",
        codes::PARTITION_EOF => "Broker: No more messages",
        codes::UNKNOWN_PARTITION => "Local: Unknown partition",
        codes::UNKNOWN_TOPIC => "Local: Unknown topic",
        codes::ALL_BROKERS_DOWN => "Local: All broker connections are down",
        codes::INVALID_ARG => "Local: Invalid argument or configuration",
        codes::TIMED_OUT => "Local: Timed out",
        codes::QUEUE_FULL => "Local: Queue full",
        codes::SSL => "Local: SSL error",
        codes::WAIT_COORD => "Local: Waiting for coordinator",
        codes::UNKNOWN_GROUP => "Local: Unknown group",
        codes::IN_PROGRESS => "Local: Operation in progress",
        codes::ASSIGN_PARTITIONS => "Local: Assign partitions",
        codes::REVOKE_PARTITIONS => "Local: Revoke partitions",
        codes::STATE => "Local: Erroneous state",
        codes::NOT_IMPLEMENTED => "Local: Not implemented",
        codes::AUTHENTICATION => "Local: Authentication failure",
        codes::NO_OFFSET => "Local: No offset stored",
        codes::TIMED_OUT_QUEUE => "Local: Timed out in queue",
        codes::FATAL => "Local: Fatal error",
        codes::MAX_POLL_EXCEEDED => {
            "Local: Maximum application poll interval (max.poll.interval.ms) exceeded"
        }
        codes::FENCED => "Local: This instance has been fenced by a newer instance",
        codes::ASSIGNMENT_LOST => "Local: Group partition assignment lost",
        codes::UNKNOWN => "Unknown broker error",
        codes::NO_ERROR => "Success",
        codes::OFFSET_OUT_OF_RANGE => "Broker: Offset out of range",
        codes::UNKNOWN_TOPIC_OR_PART => "Broker: Unknown topic or partition",
        codes::LEADER_NOT_AVAILABLE => "Broker: Leader not available",
        codes::NOT_LEADER_FOR_PARTITION => "Broker: Not leader for partition",
        codes::REQUEST_TIMED_OUT => "Broker: Request timed out",
        codes::BROKER_NOT_AVAILABLE => "Broker: Broker not available",
        codes::MSG_SIZE_TOO_LARGE => "Broker: Message size too large",
        codes::NETWORK_EXCEPTION => "Broker: Broker disconnected before response received",
        codes::COORDINATOR_LOAD_IN_PROGRESS => "Broker: Coordinator load in progress",
        codes::COORDINATOR_NOT_AVAILABLE => "Broker: Coordinator not available",
        codes::NOT_COORDINATOR => "Broker: Not coordinator",
        codes::ILLEGAL_GENERATION => "Broker: Specified group generation id is not valid",
        codes::UNKNOWN_MEMBER_ID => "Broker: Unknown member",
        codes::REBALANCE_IN_PROGRESS => "Broker: Group rebalance in progress",
        codes::TOPIC_AUTHORIZATION_FAILED => "Broker: Topic authorization failed",
        codes::GROUP_AUTHORIZATION_FAILED => "Broker: Group authorization failed",
        _ => "Unknown error code",
    }
}

/// An error is okay for an action when its code is in that action's acceptable set or in the
/// universal set (end of partition, no error). Errors without a code are never okay.
pub fn is_okay(error: &SessionError, action: ActionKind) -> bool {
    let Some(code) = error.code() else {
        return false;
    };
    ANY_OKAY.contains(&code) || acceptable(action).contains(&code)
}

pub fn is_retryable(error: &SessionError) -> bool {
    is_okay(error, ActionKind::Retryable)
}

pub fn is_wrong_state(error: &SessionError) -> bool {
    error.code() == Some(codes::STATE)
}

pub fn classify(error: &SessionError, action: ActionKind) -> ErrorClass {
    if is_okay(error, action) {
        ErrorClass::Benign
    } else if is_wrong_state(error) {
        ErrorClass::WrongState
    } else if is_retryable(error) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

/// Wraps `cause` under `message` one level deep:
/// `<message>, caused by error: <cause>[, code: <n>, desc: "<description>"]`.
///
/// Wrapping an already wrapped error reuses its root cause text, so prefixes never nest. The
/// root code is kept, as is the kind of closed or fatal causes.
pub fn wrap_error(message: &str, cause: &SessionError) -> SessionError {
    let root = cause.root_cause();
    let kind = match cause.kind() {
        ErrorKind::Closed | ErrorKind::InvalidState => cause.kind(),
        _ => ErrorKind::Failure,
    };
    SessionError::wrapped(
        kind,
        format!("{message}, caused by error: {root}"),
        root,
        cause.code(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn coded(code: i32) -> SessionError {
        SessionError::broker(code, describe(code))
    }

    #[rstest]
    #[case::eof_okay_everywhere(codes::PARTITION_EOF, ActionKind::Produce, true)]
    #[case::no_error_okay_everywhere(codes::NO_ERROR, ActionKind::Connect, true)]
    #[case::queue_timeout_okay_for_consume(codes::TIMED_OUT_QUEUE, ActionKind::Consume, true)]
    #[case::queue_timeout_not_okay_for_commit(codes::TIMED_OUT_QUEUE, ActionKind::Commit, false)]
    #[case::no_offset_okay_for_commit(codes::NO_OFFSET, ActionKind::Commit, true)]
    #[case::no_offset_not_okay_for_seek(codes::NO_OFFSET, ActionKind::Seek, false)]
    #[case::transport_not_okay_for_consume(codes::TRANSPORT, ActionKind::Consume, false)]
    #[case::transport_retryable(codes::TRANSPORT, ActionKind::Retryable, true)]
    #[case::auth_not_retryable(codes::AUTHENTICATION, ActionKind::Retryable, false)]
    fn test_is_okay(#[case] code: i32, #[case] action: ActionKind, #[case] expected: bool) {
        assert_eq!(is_okay(&coded(code), action), expected);
    }

    #[rstest]
    #[case::benign(codes::PARTITION_EOF, ActionKind::Consume, ErrorClass::Benign)]
    #[case::wrong_state(codes::STATE, ActionKind::Consume, ErrorClass::WrongState)]
    #[case::retryable(codes::ALL_BROKERS_DOWN, ActionKind::Commit, ErrorClass::Retryable)]
    #[case::fatal(codes::TOPIC_AUTHORIZATION_FAILED, ActionKind::Consume, ErrorClass::Fatal)]
    fn test_classify(#[case] code: i32, #[case] action: ActionKind, #[case] expected: ErrorClass) {
        assert_eq!(classify(&coded(code), action), expected);
    }

    #[test]
    fn test_uncoded_errors_are_never_okay() {
        let err = SessionError::new(ErrorKind::Failure, "boom");
        assert!(!is_okay(&err, ActionKind::Any));
        assert!(!is_retryable(&err));
        assert_eq!(classify(&err, ActionKind::Consume), ErrorClass::Fatal);
    }

    #[test]
    fn test_describe_unknown_code() {
        assert_eq!(describe(12345), "Unknown error code");
        assert_eq!(describe(codes::STATE), "Local: Erroneous state");
    }

    #[test]
    fn test_wrap_error_format() {
        let cause = SessionError::broker(codes::TRANSPORT, "Broker transport failure");
        let wrapped = wrap_error("Failure to commit", &cause);

        assert_eq!(
            wrapped.to_string(),
            "Failure to commit, caused by error: Broker transport failure, code: -195, desc: \"Local: Broker transport failure\""
        );
        assert_eq!(wrapped.code(), Some(codes::TRANSPORT));
        assert_eq!(wrapped.kind(), ErrorKind::Failure);
        assert!(wrapped.is_wrapped());
    }

    #[test]
    fn test_wrap_error_is_single_level() {
        let cause = SessionError::new(ErrorKind::Broker, "socket closed");
        let once = wrap_error("Failure to seek", &cause);
        let twice = wrap_error("Failure to rollback", &once);

        assert_eq!(
            twice.to_string(),
            "Failure to rollback, caused by error: socket closed"
        );
    }

    #[test]
    fn test_wrap_error_keeps_fatal_kind() {
        let wrapped = wrap_error("Failure to consume", &SessionError::invalid_state());
        assert!(wrapped.is_fatal());
    }
}
