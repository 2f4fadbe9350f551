//! Retry, circuit breaking and named locks.

pub mod retry;
pub mod circuit_breaker;
pub mod lock;

pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitStats};
pub use lock::{LockService, OPERATION_LOG, QUOTA_EXCEEDED};
pub use retry::{retry, retry_if, Backoff, RetryConfig};
