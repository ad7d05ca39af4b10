use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::metrics_consts::INVALID_STATE_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSettings {
    /// Starting (and reset) delay
    pub base: Duration,
    /// Upper bound for the delay
    pub cap: Duration,
    /// Each increase adds `base * factor`, factor uniform in `jitter_min..=jitter_max`
    pub jitter_min: u32,
    pub jitter_max: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(60000),
            jitter_min: 3,
            jitter_max: 9,
        }
    }
}

struct BackoffState {
    current: Duration,
    invalid_state_count: u32,
}

/// Jittered backoff shared by everything acting on one session.
///
/// Cheap to clone; clones share state. The delay always stays within `base..=cap` and never
/// decreases except through `reset()`.
#[derive(Clone)]
pub struct BackoffController {
    settings: BackoffSettings,
    state: Arc<Mutex<BackoffState>>,
}

impl BackoffController {
    pub fn new(settings: BackoffSettings) -> Self {
        let settings = BackoffSettings {
            cap: settings.cap.max(settings.base),
            jitter_min: settings.jitter_min.min(settings.jitter_max),
            jitter_max: settings.jitter_max.max(settings.jitter_min),
            ..settings
        };
        Self {
            settings,
            state: Arc::new(Mutex::new(BackoffState {
                current: settings.base,
                invalid_state_count: 0,
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BackoffState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn settings(&self) -> &BackoffSettings {
        &self.settings
    }

    pub fn current(&self) -> Duration {
        self.state().current
    }

    /// Grows the delay by a random multiple of the base, clamped to the cap. Returns the new delay.
    pub fn increase(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(
            f64::from(self.settings.jitter_min)..=f64::from(self.settings.jitter_max),
        );
        let step = self.settings.base.mul_f64(factor);

        let mut state = self.state();
        state.current = (state.current + step).min(self.settings.cap);
        state.current
    }

    pub fn reset(&self) {
        self.state().current = self.settings.base;
    }

    pub fn invalid_state_count(&self) -> u32 {
        self.state().invalid_state_count
    }

    /// Counts one more wrong-state fault. Returns the new count.
    pub fn record_invalid_state(&self) -> u32 {
        let count = {
            let mut state = self.state();
            state.invalid_state_count += 1;
            state.invalid_state_count
        };
        metrics::gauge!(INVALID_STATE_COUNT).set(f64::from(count));
        count
    }

    /// Forgives one wrong-state fault after the client made progress again.
    pub fn relieve_invalid_state(&self) -> u32 {
        let count = {
            let mut state = self.state();
            state.invalid_state_count = state.invalid_state_count.saturating_sub(1);
            state.invalid_state_count
        };
        metrics::gauge!(INVALID_STATE_COUNT).set(f64::from(count));
        count
    }
}

impl Default for BackoffController {
    fn default() -> Self {
        Self::new(BackoffSettings::default())
    }
}
