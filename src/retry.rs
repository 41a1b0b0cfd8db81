//! Retry policy shared by the async and blocking executors.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineErrorKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `max_retries = 2` means at most three
    /// attempts.
    pub max_retries: u32,
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    /// Raw error kinds worth another attempt. Everything else fails at once.
    pub retryable: HashSet<EngineErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            retryable: [
                EngineErrorKind::Connection,
                EngineErrorKind::Io,
                EngineErrorKind::PoolExhausted,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_retryable<I: IntoIterator<Item = EngineErrorKind>>(mut self, kinds: I) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    pub fn is_retryable(&self, kind: EngineErrorKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Delay before each retry, in order. Yields `max_retries` items.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier > 0.0 {
            self.backoff_multiplier
        } else {
            1.0
        };
        (0..self.max_retries).map(move |n| {
            let factor = multiplier.powi(n as i32);
            Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
                .unwrap_or(Duration::MAX)
        })
    }

    /// Run `attempt` until it succeeds, fails with a non-retryable error, or
    /// retries run out. `on_retry` sees the attempt number (1-based), the
    /// error and the delay about to be slept.
    pub async fn run<T, F, Fut, R>(&self, mut attempt: F, mut on_retry: R) -> Result<T, EngineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
        R: FnMut(u32, &EngineError, Duration),
    {
        let mut delays = self.delays();
        let mut n = 1;
        loop {
            match attempt(n).await {
                Ok(value) => return Ok(value),
                Err(err) if self.is_retryable(err.kind) => match delays.next() {
                    Some(delay) => {
                        on_retry(n, &err, delay);
                        tokio::time::sleep(delay).await;
                        n += 1;
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::default()
            .with_max_retries(4)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);
        let delays: Vec<u128> = policy.delays().map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);
    }

    #[test]
    fn test_default_retryable_kinds() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(EngineErrorKind::Connection));
        assert!(policy.is_retryable(EngineErrorKind::PoolExhausted));
        assert!(!policy.is_retryable(EngineErrorKind::Syntax));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default().with_max_retries(2);
        let result: Result<(), _> = policy
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(EngineError::new(EngineErrorKind::Io, "reset")) }
                },
                |_, _, _| {},
            )
            .await;
        assert_eq!(result.unwrap_err().kind, EngineErrorKind::Io);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_fails_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(EngineError::new(EngineErrorKind::Syntax, "bad")) }
                },
                |_, _, _| {},
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let mut retries = Vec::new();
        let result = RetryPolicy::default()
            .run(
                |n| async move {
                    if n < 3 {
                        Err(EngineError::new(EngineErrorKind::Connection, "refused"))
                    } else {
                        Ok(n)
                    }
                },
                |n, _, delay| retries.push((n, delay.as_millis())),
            )
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(retries, vec![(1, 100), (2, 200)]);
    }

    #[test]
    fn test_deserialize_policy() {
        let policy: RetryPolicy = toml::from_str(
            r#"
            max_retries = 1
            initial_delay_ms = 50
            retryable = ["timeout"]
            "#,
        )
        .unwrap();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.initial_delay, Duration::from_millis(50));
        assert_eq!(policy.backoff_multiplier, 2.0);
        assert!(policy.is_retryable(EngineErrorKind::Timeout));
        assert!(!policy.is_retryable(EngineErrorKind::Connection));
    }
}
