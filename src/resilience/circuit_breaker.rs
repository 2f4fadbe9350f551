// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker for the sync server, backed by the recloser crate.
//!
//! A dead server should not stall every sync round behind a full retry
//! schedule. Once the failure rate over the closed window crosses the
//! threshold the breaker opens and remote calls fail immediately with
//! [`CircuitError::Rejected`] until `open_for` elapses. Local capture is
//! unaffected; unsynced operations wait in the log for the next round.

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Open circuit; the call never reached the server
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("remote call failed: {0}")]
    Inner(#[source] E),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Failure ratio (0.0 - 1.0) that opens the circuit
    pub error_rate: f32,
    /// Calls observed while closed before the rate counts
    pub closed_window: usize,
    /// Trial calls while half-open
    pub half_open_window: usize,
    pub open_for: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.5,
            closed_window: 5,
            half_open_window: 2,
            open_for: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips after two calls and reopens quickly.
    #[must_use]
    pub fn test() -> Self {
        Self {
            error_rate: 0.5,
            closed_window: 2,
            half_open_window: 1,
            open_for: Duration::from_millis(50),
        }
    }
}

/// Call counters of one breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitStats {
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
}

impl CircuitStats {
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.succeeded + self.failed + self.rejected
    }

    /// Failed share of the calls that reached the server.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let attempted = self.succeeded + self.failed;
        if attempted == 0 {
            return 0.0;
        }
        self.failed as f64 / attempted as f64
    }
}

pub struct CircuitBreaker {
    name: &'static str,
    inner: AsyncRecloser,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.error_rate)
            .closed_len(config.closed_window)
            .half_open_len(config.half_open_window)
            .open_wait(config.open_for)
            .build();

        Self {
            name,
            inner: recloser.into(),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (counter, outcome, result) = match self.inner.call(f()).await {
            Ok(value) => (&self.succeeded, "success", Ok(value)),
            Err(RecloserError::Rejected) => {
                warn!(circuit = self.name, "Circuit open; skipping remote call");
                (&self.rejected, "rejected", Err(CircuitError::Rejected))
            }
            Err(RecloserError::Inner(e)) => {
                debug!(circuit = self.name, "Remote call failed inside circuit");
                (&self.failed, "failure", Err(CircuitError::Inner(e)))
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_breaker_call(self.name, outcome);
        result
    }

    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;

    fn unavailable() -> RemoteError {
        RemoteError::Unavailable("connection refused".into())
    }

    #[tokio::test]
    async fn test_successful_calls_pass_through() {
        let cb = CircuitBreaker::new("remote", CircuitConfig::test());

        let result: Result<u64, CircuitError<RemoteError>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.stats(), CircuitStats { succeeded: 1, failed: 0, rejected: 0 });
    }

    #[tokio::test]
    async fn test_dead_server_opens_circuit() {
        let config = CircuitConfig {
            open_for: Duration::from_secs(60),
            ..CircuitConfig::test()
        };
        let cb = CircuitBreaker::new("remote", config);

        for _ in 0..6 {
            let _: Result<u64, _> = cb.call(|| async { Err(unavailable()) }).await;
        }

        let stats = cb.stats();
        assert_eq!(stats.calls(), 6);
        assert!(stats.rejected >= 1, "breaker should open after repeated failures: {stats:?}");
    }

    #[tokio::test]
    async fn test_circuit_closes_again_after_open_period() {
        let cb = CircuitBreaker::new("remote", CircuitConfig::test());
        for _ in 0..6 {
            let _: Result<u64, _> = cb.call(|| async { Err(unavailable()) }).await;
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        let result: Result<u64, CircuitError<RemoteError>> = cb.call(|| async { Ok(1) }).await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_failure_rate_ignores_rejections() {
        let stats = CircuitStats {
            succeeded: 2,
            failed: 2,
            rejected: 10,
        };
        assert!((stats.failure_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(CircuitStats::default().failure_rate(), 0.0);
    }
}
