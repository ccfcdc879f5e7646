//! Exponential back-off with an upper bound and jitter, derived from the
//! `tokio-retry` crate.
//!
//! MIT License
//! Copyright (c) 2017 Sam Rijs
//!

use std::time::Duration;

use rand::Rng;

/// A retry strategy driven by exponential back-off.
///
/// The power corresponds to the number of past attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: u64,
    base: u64,
    factor: u64,
    max_delay: Option<Duration>,
    jitter: f64,
    attempts: u32,
}

impl ExponentialBackoff {
    /// Constructs a new exponential back-off strategy,
    /// given a base duration in milliseconds.
    ///
    /// The resulting duration is calculated by taking the base to the `n`-th power,
    /// where `n` denotes the number of past attempts.
    pub const fn from_millis(base: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            current: base,
            base,
            factor: 1u64,
            max_delay: None,
            jitter: 0.0,
            attempts: 0,
        }
    }

    /// A multiplicative factor that will be applied to the retry delay.
    ///
    /// For example, using a factor of `1000` will make each delay in units of seconds.
    ///
    /// Default factor is `1`.
    pub const fn factor(mut self, factor: u64) -> ExponentialBackoff {
        self.factor = factor;
        self
    }

    /// Apply a maximum delay. No retry delay will be longer than this `Duration`,
    /// jitter included.
    pub const fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }

    /// Spread each delay randomly over `[delay * (1 - ratio), delay * (1 + ratio)]`,
    /// so many clients failing at once do not retry in lockstep.
    ///
    /// `ratio` is clamped to `[0, 1]`, the default is `0` (no jitter).
    pub fn jitter(mut self, ratio: f64) -> ExponentialBackoff {
        self.jitter = ratio.clamp(0.0, 1.0);
        self
    }

    /// How many delays were handed out since creation or the last `reset`.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The next `Duration` to wait for.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);

        let mut duration = match self.current.checked_mul(self.factor) {
            Some(millis) => Duration::from_millis(millis),
            None => Duration::from_millis(u64::MAX),
        };

        match self.current.checked_mul(self.base) {
            Some(next) => self.current = next,
            None => self.current = u64::MAX,
        }

        if self.jitter > 0.0 {
            let scale = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
            duration = Duration::try_from_secs_f64(duration.as_secs_f64() * scale)
                .unwrap_or(Duration::MAX);
        }

        match self.max_delay {
            Some(max_delay) if duration > max_delay => max_delay,
            _ => duration,
        }
    }

    /// Start over from the base delay, usually after an attempt succeeded.
    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempts = 0;
    }
}
