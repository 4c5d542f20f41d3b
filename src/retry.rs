use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Wait after the failed attempt at `attempt_index` (zero based).
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt_index);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `operation` until it succeeds or `max_attempts` consecutive failures,
/// returning the last error as-is.
pub async fn execute_with_retry<F, Fut, T, E>(operation: F, policy: RetryPolicy) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    execute_counted(operation, policy)
        .await
        .map_err(|(err, _)| err)
}

/// Like [`execute_with_retry`] but also reports how many attempts ran before giving up.
pub async fn execute_counted<F, Fut, T, E>(
    mut operation: F,
    policy: RetryPolicy,
) -> Result<T, (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    log::warn!("Giving up after {attempt} attempt(s): {err}");
                    return Err((err, attempt));
                }
                let delay = policy.delay_for(attempt - 1);
                log::warn!(
                    "Attempt {attempt}/{max_attempts} failed: {err}. Retrying in {}ms",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::time::Instant;

    use super::*;

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_with_backoff() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));

        let result: Result<(), String> = execute_with_retry(
            || {
                let calls = Arc::clone(&calls);
                async move {
                    let mut calls = calls.lock().unwrap();
                    calls.push(started.elapsed());
                    Err(format!("failure {}", calls.len()))
                }
            },
            policy,
        )
        .await;

        assert_eq!(result, Err("failure 3".to_string()));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let before_second = calls[1] - calls[0];
        let before_third = calls[2] - calls[1];
        assert!(before_second >= Duration::from_millis(1000));
        assert!(before_second < Duration::from_millis(1100));
        assert!(before_third >= Duration::from_millis(2000));
        assert!(before_third < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = execute_with_retry(
            || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            },
            RetryPolicy::default(),
        )
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), (String, u32)> = execute_counted(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down".to_string()) }
            },
            RetryPolicy::new(0, Duration::from_millis(10)),
        )
        .await;

        assert_eq!(result, Err(("down".to_string(), 1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
