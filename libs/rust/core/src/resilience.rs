//! Retry with exponential backoff + jitter for checkpoint I/O.
//! Only `SwarmError::Transient` is retried; every other error returns at once.

use std::time::Duration;

use rand::{thread_rng, Rng};
use tracing::debug;

use crate::error::SwarmError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}
impl Default for RetryConfig { fn default() -> Self { Self { max_retries: 3, base_delay: Duration::from_millis(50), max_delay: Duration::from_millis(1500), jitter: 0.25 } } }

pub async fn retry_async<F, Fut, T>(cfg: &RetryConfig, mut op: F) -> Result<T, SwarmError>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, SwarmError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_transient() || attempt >= cfg.max_retries => return Err(e),
            Err(e) => {
                let exp = cfg.base_delay.mul_f64(2f64.powi(attempt as i32));
                let mut delay = std::cmp::min(exp, cfg.max_delay);
                if cfg.jitter > 0.0 {
                    let jitter_ms = (delay.as_millis() as f64 * cfg.jitter) as i64;
                    let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
                    delay = Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64);
                }
                debug!(attempt, ?delay, error=%e, "retrying_transient_failure");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> RetryConfig { RetryConfig { max_retries: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5), jitter: 0.0 } }

    #[tokio::test]
    async fn transient_eventually_succeeds() {
        let mut attempts = 0;
        let res = retry_async(&fast(), |_| {
            attempts += 1;
            let n = attempts;
            async move { if n < 3 { Err(SwarmError::Transient("flaky".into())) } else { Ok(42) } }
        }).await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn exhaustion_is_not_retried() {
        let mut attempts = 0;
        let res: Result<(), _> = retry_async(&fast(), |_| {
            attempts += 1;
            async { Err(SwarmError::StorageExhausted("full".into())) }
        }).await;
        assert!(matches!(res, Err(SwarmError::StorageExhausted(_))));
        assert_eq!(attempts, 1);
    }
}
