//! Resilient Kafka sessions.
//!
//! Wraps a raw, callback driven broker connection into a consuming or producing session that
//! callers drive one operation at a time. Transient broker faults are retried with jittered
//! backoff, partition reassignment is tracked so work pauses while a rebalance is in flight, and
//! per-partition offsets are recorded for at-least-once commits or rollbacks.
//!
//! ## Error logging
//!
//! Every failure surfaced by this crate is a [`SessionError`]. Errors coming out of the retry
//! executor are wrapped exactly once (`Failure to commit, caused by error: ...`) and keep the
//! numeric librdkafka code of the root fault. Check [`SessionError::is_fatal`] before retrying a
//! batch: a fatal error means the client stopped making progress and the host should restart.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod error_codes;
pub mod events;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod producer;
pub mod rdkafka_connection;
pub mod rebalance_coordinator;
pub mod retry;
pub mod test_utils;
pub mod types;

// Re-export commonly used types for convenience
pub use config::SessionConfig;
pub use connection::{
    BrokerConnection, BrokerEvent, BrokerEventKind, ConsumedMessage, ConsumerConnection,
    ProduceRecord, ProducerConnection, RebalanceSignal,
};
pub use consumer::ConsumingSession;
pub use error::{ErrorKind, SessionError};
pub use error_codes::ActionKind;
pub use producer::ProducingSession;
pub use types::{Partition, PartitionOffset};
