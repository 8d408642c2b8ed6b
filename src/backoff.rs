// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Waiting between attempts when the accelerator is busy.
//!
//! The delay schedule is a [`BackoffPolicy`], a pure function of the attempt number, and the
//! actual waiting is done by a [`Sleeper`] so that loops can be exercised without sleeping.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Default number of attempts after which a busy loop gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100_000;

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

pub trait BackoffPolicy: Send + Sync {
    /// Returns how long to wait after the `attempt`-th consecutive failure, starting at 0.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Fixed ladder of delays, indexed by a counter that wraps around once it passes `wrap_after`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SleepLadder {
    base: Duration,
    /// `(threshold, delay)` pairs sorted by increasing threshold. `delay` applies once the counter
    /// is strictly above `threshold`.
    rungs: Vec<(u32, Duration)>,
    wrap_after: u32,
}

impl SleepLadder {
    pub fn new(base: Duration, mut rungs: Vec<(u32, Duration)>, wrap_after: u32) -> Self {
        rungs.sort_by_key(|(threshold, _)| *threshold);
        Self {
            base,
            rungs,
            wrap_after,
        }
    }

    /// Number of attempts after which the ladder starts over.
    pub fn period(&self) -> u32 {
        self.wrap_after + 2
    }
}

impl Default for SleepLadder {
    fn default() -> Self {
        Self::new(
            Duration::from_micros(10),
            vec![
                (3, Duration::from_micros(100)),
                (5, Duration::from_micros(200)),
                (7, Duration::from_micros(500)),
                (10, Duration::from_micros(1000)),
            ],
            15,
        )
    }
}

impl BackoffPolicy for SleepLadder {
    fn delay(&self, attempt: u32) -> Duration {
        let counter = attempt % self.period();
        self.rungs
            .iter()
            .rev()
            .find(|(threshold, _)| counter > *threshold)
            .map(|(_, delay)| *delay)
            .unwrap_or(self.base)
    }
}

/// How many times a busy operation is attempted before giving up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(DEFAULT_MAX_ATTEMPTS)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("device still busy after {attempts} attempts")]
pub struct RetryExhausted {
    pub attempts: u32,
}

/// State of one retry loop.
#[derive(Clone)]
pub struct Backoff {
    policy: Arc<dyn BackoffPolicy>,
    sleeper: Arc<dyn Sleeper>,
    retry: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(
        policy: Arc<dyn BackoffPolicy>,
        sleeper: Arc<dyn Sleeper>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            policy,
            sleeper,
            retry,
            attempt: 0,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Number of waits since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Starts a new retry loop.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Waits before the next attempt, or fails if the retry budget is spent.
    pub fn wait(&mut self) -> Result<(), RetryExhausted> {
        if let Some(max) = self.retry.max_attempts {
            if self.attempt >= max {
                return Err(RetryExhausted {
                    attempts: self.attempt,
                });
            }
        }

        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.sleeper.sleep(delay);
        Ok(())
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Arc::new(SleepLadder::default()),
            Arc::new(ThreadSleeper),
            RetryPolicy::default(),
        )
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("retry", &self.retry)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Sleeper recording the requested delays instead of sleeping.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSleeper {
    delays: std::sync::Mutex<Vec<Duration>>,
}

#[cfg(test)]
impl RecordingSleeper {
    pub(crate) fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
        // Let other threads make progress, like a real sleep would.
        std::thread::yield_now();
    }
}
