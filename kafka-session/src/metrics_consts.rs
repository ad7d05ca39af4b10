// ==== Retry executor ====
/// Counter for retries after a retryable broker fault, labeled by action
pub const RETRY_ATTEMPTS: &str = "kafka_session_retry_attempts_total";

/// Counter for actions that failed for good, labeled by action and whether retries ran out
pub const ACTION_FAILURES: &str = "kafka_session_action_failures_total";

/// Counter for faults swallowed because they are acceptable for the action
pub const BENIGN_FAULTS: &str = "kafka_session_benign_faults_total";

/// Gauge for the current wrong-state distress counter
pub const INVALID_STATE_COUNT: &str = "kafka_session_invalid_state_count";

// ==== Consuming session ====
/// Counter for raw messages pulled from the broker
pub const MESSAGES_CONSUMED: &str = "kafka_session_messages_consumed_total";

/// Counter for payload bytes pulled from the broker
pub const BYTES_CONSUMED: &str = "kafka_session_bytes_consumed_total";

/// Counter for consume windows that returned nothing
pub const EMPTY_WINDOWS: &str = "kafka_session_empty_windows_total";

/// Counter for offset commits issued, labeled by outcome
pub const COMMITS_ISSUED: &str = "kafka_session_commits_total";

/// Gauge for commits issued and not yet acknowledged by the broker
pub const PENDING_COMMITS: &str = "kafka_session_pending_commits";

/// Counter for partition seeks issued by rollbacks, labeled by outcome
pub const ROLLBACK_SEEKS: &str = "kafka_session_rollback_seeks_total";

// ==== Rebalances ====
/// Counter for rebalances started by a revoke signal
pub const REBALANCES_STARTED: &str = "kafka_session_rebalances_started_total";

/// Counter for rebalances forced to stable because no assignment arrived in time
pub const REBALANCE_TIMEOUTS: &str = "kafka_session_rebalance_timeouts_total";

/// Gauge for partitions currently assigned to the session
pub const ASSIGNED_PARTITIONS: &str = "kafka_session_assigned_partitions";

// ==== Producing session ====
/// Counter for records handed to the producer queue, labeled by outcome
pub const MESSAGES_PRODUCED: &str = "kafka_session_messages_produced_total";

/// Counter for asynchronous producer faults observed while producing
pub const PRODUCER_ASYNC_ERRORS: &str = "kafka_session_producer_async_errors_total";

/// Counter for producer client errors seen by the session's event bridge
pub const PRODUCER_CLIENT_ERRORS: &str = "kafka_session_producer_client_errors_total";
