//! Delays between retry attempts.
//!
//! Retry `n` (1-based; the initial attempt never waits) waits `min * 2^(n-1)`, capped at `max`,
//! then reduced by a random fraction of up to `jitter`. Computations that would overflow
//! saturate at [`MAX_BACKOFF`].
//!
//! ```rust
//! use std::time::Duration;
//! use balanced_retry::backoff::Backoff;
//!
//! let backoff = Backoff::new(Duration::from_millis(10), Some(Duration::from_millis(50)), 0.0).unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(10));
//! assert_eq!(backoff.delay(3), Duration::from_millis(40));
//! assert_eq!(backoff.delay(4), Duration::from_millis(50)); // capped
//! ```
//!
//! Sleeping goes through [`Sleeper`] so tests can run retry loops without real delays.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::{rng, Rng};

use crate::error::ConfigError;

/// Ceiling for any computed delay (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential backoff with downward jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    /// `max = None` means only [`MAX_BACKOFF`] applies. `jitter` is clamped to `0.0..=1.0`.
    pub fn new(min: Duration, max: Option<Duration>, jitter: f64) -> Result<Self, ConfigError> {
        if min.is_zero() {
            return Err(ConfigError::InvalidBackoff("min_backoff must be greater than zero".into()));
        }
        let max = max.unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF);
        if max < min {
            return Err(ConfigError::InvalidBackoff(format!(
                "max_backoff ({:?}) must be >= min_backoff ({:?})",
                max, min
            )));
        }
        let jitter = if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, 1.0) };
        Ok(Self { min, max, jitter })
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Un-jittered delay before retry `retry`.
    pub fn delay(&self, retry: usize) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = retry.saturating_sub(1).min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.min.as_nanos().saturating_mul(multiplier);
        let exp_delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        exp_delay.min(self.max)
    }

    /// Jittered delay before retry `retry`, using the thread-local RNG.
    pub fn jittered(&self, retry: usize) -> Duration {
        let mut rng = rng();
        self.jittered_with_rng(retry, &mut rng)
    }

    /// Jittered delay with a caller-supplied RNG (for deterministic tests).
    pub fn jittered_with_rng<R: Rng>(&self, retry: usize, rng: &mut R) -> Duration {
        let delay = self.delay(retry);
        let millis = as_millis_saturated(delay);
        if millis == 0 || self.jitter == 0.0 {
            return delay;
        }
        let spread = ((millis as f64) * self.jitter) as u64;
        let floor = millis.saturating_sub(spread);
        Duration::from_millis(rng.random_range(floor..=millis))
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

/// Abstraction for waiting between attempts.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Returns immediately and remembers every requested delay.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().expect("recording sleeper poisoned").clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.delays.lock().expect("recording sleeper poisoned").push(duration);
        Box::pin(async {})
    }
}
