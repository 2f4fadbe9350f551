// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded retry with exponential backoff.
//!
//! Covers SQLite lock contention and remote endpoint hiccups. Quota and
//! validation errors never come through here: the write path answers quota
//! with one emergency compaction and a single retry of its own.
//!
//! # Example
//!
//! ```
//! use oplog_engine::RetryConfig;
//! use std::time::Duration;
//!
//! let delays: Vec<Duration> = RetryConfig::query().backoff().collect();
//! assert_eq!(delays.len(), 2); // 3 attempts = 2 waits
//! assert!(delays[1] > delays[0]);
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff settings for a retried call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts in total, the first one included. Zero behaves like one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Opening the log database: a bad path should fail within seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Single statements against a busy SQLite file.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            factor: 2.0,
        }
    }

    /// Download and upload calls.
    #[must_use]
    pub fn remote() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }

    #[must_use]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// The waits between attempts, capped at `max_delay`.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay,
            max: self.max_delay,
            factor: self.factor,
            remaining: self.max_attempts.saturating_sub(1),
        }
    }
}

/// Delays between attempts of one retried call.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    factor: f64,
    remaining: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.next.min(self.max);
        self.next = self.next.mul_f64(self.factor).min(self.max);
        Some(current)
    }
}

/// Retry every error until the attempts run out.
pub async fn retry<F, Fut, T, E>(call: &str, config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(call, config, |_| true, operation).await
}

/// Retry errors for which `is_transient` holds; anything else returns at once.
pub async fn retry_if<F, Fut, T, E, P>(
    call: &str,
    config: &RetryConfig,
    is_transient: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut backoff = config.backoff();
    let mut attempt = 1u32;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(call, attempt, "Call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_transient(&err) {
            return Err(err);
        }
        let Some(delay) = backoff.next() else {
            warn!(call, attempts = attempt, error = %err, "Giving up after retries");
            return Err(err);
        };
        warn!(call, attempt, error = %err, next_delay = ?delay, "Transient failure, retrying");
        sleep(delay).await;
        attempt += 1;
    }
}
