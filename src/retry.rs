//! Bounded exponential backoff
//!
//! Shared by the sequence authority (local retry of transient ledger
//! writes), the stabilization probe and the commit coordinator. Delays
//! double per attempt from `base_delay`, are capped at `max_delay` and carry
//! up to 50% random jitter so concurrent workers do not retry in lockstep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::ledger::{LedgerError, LedgerResult};
use crate::observability::{log_event_with_fields, Event};

/// Retry bounds for one kind of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 50% random jitter
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// Policy without jitter, for deterministic delays
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay after failed attempt `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
        (delay + Duration::from_millis(jitter_ms)).min(self.max_delay.max(delay))
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Run a ledger operation, retrying transient failures with backoff.
///
/// Only `LedgerError::is_transient` failures are retried; conflicts and
/// fatal errors surface immediately.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && policy.allows_another(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                log_event_with_fields(
                    Event::LedgerWriteRetry,
                    &[
                        ("operation", operation),
                        ("attempt", &attempt.to_string()),
                        ("delay_ms", &delay.as_millis().to_string()),
                        ("error", &e.to_string()),
                    ],
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Convenience for tests and fault injection: a transient ledger failure
pub fn transient_error(message: &str) -> LedgerError {
    LedgerError::append_failed(
        message.to_string(),
        std::io::Error::new(std::io::ErrorKind::Other, message.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(10), Duration::from_millis(50)).without_jitter()
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(40));
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(50));
        assert_eq!(p.delay_for_attempt(40), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        for _ in 0..50 {
            let d = p.delay_for_attempt(2);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_allows_another() {
        let p = policy();
        assert!(p.allows_another(3));
        assert!(!p.allows_another(4));
    }

    #[tokio::test]
    async fn test_retry_transient_recovers() {
        let calls = Cell::new(0);
        let result = retry_transient(&policy(), "test", || {
            calls.set(calls.get() + 1);
            let call = calls.get();
            async move {
                if call < 3 {
                    Err(transient_error("busy"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_gives_up() {
        let calls = Cell::new(0);
        let result: LedgerResult<()> = retry_transient(&policy(), "test", || {
            calls.set(calls.get() + 1);
            async { Err(transient_error("busy")) }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test]
    async fn test_conflict_is_not_retried() {
        let calls = Cell::new(0);
        let result: LedgerResult<()> = retry_transient(&policy(), "test", || {
            calls.set(calls.get() + 1);
            async { Err(LedgerError::conflict("already released")) }
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.get(), 1);
    }
}
