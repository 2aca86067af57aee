//! Retry combinator with exponential backoff, shared by the client chunk
//! transfer loops and the worker replication fan-out.

use std::future::Future;
use std::time::Duration;

use anyhow::Error;

#[derive(Clone, Debug)]
pub struct RetryOpts {
    /// Extra attempts after the first one.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub factor: f64,
}

impl Default for RetryOpts {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
        }
    }
}

impl RetryOpts {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

/// Runs `op` until it succeeds, the error is not retriable, or the attempt
/// budget is spent. `what` names the operation in log lines.
pub async fn retry<T, F, Fut, P>(
    what: &str,
    opts: &RetryOpts,
    is_retriable: P,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    P: Fn(&Error) -> bool,
{
    let mut delay = opts.base_delay;
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= opts.max_retries || !is_retriable(&err) {
                    return Err(err);
                }
                attempt += 1;
                log::warn!(
                    "{what}: attempt {attempt}/{} failed, retrying in {delay:?} - {err:#}",
                    opts.max_retries + 1,
                );
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(opts.factor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retry_recovers() {
        let calls = AtomicUsize::new(0);
        let opts = RetryOpts {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            factor: 1.0,
        };

        let value = retry("op", &opts, |_| true, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                bail!("transient");
            }
            Ok(7)
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_fails_fast() {
        let calls = AtomicUsize::new(0);
        let opts = RetryOpts {
            max_retries: 5,
            base_delay: Duration::from_millis(1),
            factor: 1.0,
        };

        let result: Result<(), _> = retry("op", &opts, |_| false, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            bail!("fatal");
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_budget() {
        let calls = AtomicUsize::new(0);
        let opts = RetryOpts {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            factor: 1.0,
        };

        let result: Result<(), _> = retry("op", &opts, |_| true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            bail!("still broken");
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
