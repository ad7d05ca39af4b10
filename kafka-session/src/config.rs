use std::time::Duration;

use envconfig::Envconfig;

use crate::backoff::BackoffSettings;

/// Session configuration.
///
/// Sessions never read the environment themselves: hosts either build this explicitly with
/// [`SessionConfig::new`] / [`SessionConfig::for_tests`] or load it once with
/// `SessionConfig::init_from_env()` and pass it in.
#[derive(Envconfig, Clone, Debug)]
pub struct SessionConfig {
    #[envconfig(from = "KAFKA_SESSION_TOPIC")]
    pub topic: String,

    // Rolling back on failure protects data but can stall on persistent minor faults;
    // committing keeps the pipeline moving and risks skipping the failed batch
    #[envconfig(default = "false")]
    pub rollback_on_failure: bool,

    #[envconfig(default = "false")]
    pub use_commit_sync: bool,

    #[envconfig(default = "1000")]
    pub backoff_base_ms: u64,

    #[envconfig(default = "60000")]
    pub backoff_cap_ms: u64,

    #[envconfig(default = "3")]
    pub backoff_jitter_min: u32,

    #[envconfig(default = "9")]
    pub backoff_jitter_max: u32,

    #[envconfig(default = "3")]
    pub max_retries: u32,

    // Empty consume windows tolerated before the wrong-state check kicks in
    #[envconfig(default = "5")]
    pub empty_window_threshold: u32,

    // Wrong-state faults needed before empty windows count as distress
    #[envconfig(default = "1")]
    pub invalid_state_min: u32,

    // Wrong-state faults at which an empty window becomes fatal
    #[envconfig(default = "3")]
    pub invalid_state_max: u32,

    #[envconfig(default = "30000")]
    pub connect_timeout_ms: u64,

    #[envconfig(default = "10000")]
    pub seek_timeout_ms: u64,

    #[envconfig(default = "10000")]
    pub metadata_timeout_ms: u64,

    #[envconfig(default = "60000")]
    pub flush_timeout_ms: u64,

    #[envconfig(default = "1800000")] // 30 minutes
    pub rebalance_ceiling_ms: u64,

    #[envconfig(default = "100")]
    pub pending_commit_threshold: usize,

    #[envconfig(default = "10")]
    pub commit_stagger_ms: u64,
}

impl SessionConfig {
    /// Production defaults for `topic`.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            rollback_on_failure: false,
            use_commit_sync: false,
            backoff_base_ms: 1000,
            backoff_cap_ms: 60000,
            backoff_jitter_min: 3,
            backoff_jitter_max: 9,
            max_retries: 3,
            empty_window_threshold: 5,
            invalid_state_min: 1,
            invalid_state_max: 3,
            connect_timeout_ms: 30000,
            seek_timeout_ms: 10000,
            metadata_timeout_ms: 10000,
            flush_timeout_ms: 60000,
            rebalance_ceiling_ms: 30 * 60 * 1000,
            pending_commit_threshold: 100,
            commit_stagger_ms: 10,
        }
    }

    /// Defaults tuned for tests: the wrong-state check fires on the first empty window.
    pub fn for_tests(topic: impl Into<String>) -> Self {
        Self {
            empty_window_threshold: 0,
            invalid_state_max: 1,
            ..Self::new(topic)
        }
    }

    pub fn backoff_settings(&self) -> BackoffSettings {
        BackoffSettings {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
            jitter_min: self.backoff_jitter_min,
            jitter_max: self.backoff_jitter_max,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn seek_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn rebalance_ceiling(&self) -> Duration {
        Duration::from_millis(self.rebalance_ceiling_ms)
    }

    pub fn commit_stagger(&self) -> Duration {
        Duration::from_millis(self.commit_stagger_ms)
    }
}
