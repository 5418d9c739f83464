//! Retry/backoff helper shared by DMS fetch tasks and replication.
//!
//! Grounded on `original_source/zuilow/components/utils/retry.py`: a fixed
//! number of attempts, exponential backoff from a base delay.

use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retry_times: u32,
    pub retry_delay: Duration,
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_times: 3,
            retry_delay: Duration::from_secs(1),
            exponential: true,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        if self.exponential {
            self.retry_delay * 2u32.saturating_pow(attempt)
        } else {
            self.retry_delay
        }
    }

    /// Run `op` up to `retry_times + 1` times, sleeping between attempts.
    /// Returns the last error if every attempt fails.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt >= self.retry_times {
                        return Err(e);
                    }
                    warn!(attempt, error = %e, "retrying after transient failure");
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy {
            retry_times: 3,
            retry_delay: Duration::from_millis(1),
            exponential: false,
        };
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_error_after_exhausting_retries() {
        let policy = RetryPolicy {
            retry_times: 2,
            retry_delay: Duration::from_millis(1),
            exponential: false,
        };
        let result: Result<u32, &str> = policy.run(|| async { Err("down") }).await;
        assert_eq!(result, Err("down"));
    }
}
