use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rand::Rng;

use crate::consts::{BACKOFF_FACTOR, BACKOFF_JITTER};

/// Which reconnection strategy a timer is driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffRole {
    /// Rotation through the configured endpoint list.
    Primary,
    /// The sticky endpoint pinned for session continuity.
    Preferred,
}

/// Schedule parameters for one backoff role.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Base delay for attempt 0.
    pub min: Duration,
    /// Hard ceiling on any computed delay.
    pub max: Duration,
    /// Growth per attempt: `min * factor^attempt`.
    pub factor: f64,
    /// Fraction of the computed delay used as the jitter window.
    pub jitter: f64,
    /// Force the very first wait to be exactly `min`, with no jitter.
    pub use_initial_value: bool,
}

impl BackoffConfig {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            factor: BACKOFF_FACTOR,
            jitter: BACKOFF_JITTER,
            use_initial_value: false,
        }
    }
}

/// A fire notification delivered through the injected hook. Fires carry the
/// epoch they were armed under; anything rescheduled or reset since then is
/// rejected by [`BackoffTimer::acknowledge`].
#[derive(Debug, Clone, Copy)]
pub struct BackoffFired {
    pub role: BackoffRole,
    pub epoch: u64,
    pub attempt: u32,
    pub delay: Duration,
}

type FireHook = Arc<dyn Fn(BackoffFired) + Send + Sync>;

/// One pending delay/fire cycle at a time, driven by `backoff()`.
///
/// The timer itself never fails and never connects anywhere; it only
/// schedules. The attempt counter advances when a fire is acknowledged, so
/// re-arming before the fire reschedules from the same attempt.
pub struct BackoffTimer {
    role: BackoffRole,
    config: BackoffConfig,
    attempt: u32,
    epoch: u64,
    pending: bool,
    on_fire: FireHook,
}

impl BackoffTimer {
    pub fn new(
        role: BackoffRole,
        config: BackoffConfig,
        on_fire: impl Fn(BackoffFired) + Send + Sync + 'static,
    ) -> Self {
        Self {
            role,
            config,
            attempt: 0,
            epoch: 0,
            pending: false,
            on_fire: Arc::new(on_fire),
        }
    }

    /// Schedules (or reschedules) the next fire from the current attempt.
    /// Returns the `(attempt, delay)` pair that was armed.
    pub fn backoff(&mut self) -> (u32, Duration) {
        self.epoch += 1;
        self.pending = true;
        let delay = self.delay_for(self.attempt);
        let fired = BackoffFired {
            role: self.role,
            epoch: self.epoch,
            attempt: self.attempt,
            delay,
        };
        debug!(
            target: "Transport/Backoff",
            "{:?} attempt {} scheduled in {:?}",
            self.role, fired.attempt, delay
        );
        let hook = Arc::clone(&self.on_fire);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            hook(fired);
        });
        (fired.attempt, delay)
    }

    /// Validates a fire against the current epoch. On a match the pending
    /// wait is consumed and the attempt counter advances.
    pub fn acknowledge(&mut self, fired: &BackoffFired) -> bool {
        if !self.pending || fired.epoch != self.epoch {
            return false;
        }
        self.pending = false;
        self.attempt += 1;
        true
    }

    /// Cancels any pending fire and rewinds to attempt 0.
    pub fn reset(&mut self) {
        self.epoch += 1;
        self.pending = false;
        self.attempt = 0;
    }

    /// Replaces the schedule in place. The attempt counter is untouched.
    pub fn seed(&mut self, config: BackoffConfig) {
        self.config = config;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let max_ms = self.config.max.as_millis() as f64;
        if attempt == 0 && self.config.use_initial_value {
            return self.config.min.min(self.config.max);
        }
        let min_ms = self.config.min.as_millis() as f64;
        let grown = (min_ms * self.config.factor.powi(attempt as i32)).min(max_ms);
        let mut delay = grown;
        if self.config.jitter > 0.0 {
            let mut rng = rand::rng();
            let magnitude = rng.random::<f64>() * self.config.jitter * grown;
            delay = if rng.random_bool(0.5) {
                grown + magnitude
            } else {
                grown - magnitude
            };
        }
        Duration::from_millis(delay.clamp(0.0, max_ms) as u64)
    }
}
