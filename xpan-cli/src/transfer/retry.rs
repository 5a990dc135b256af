use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use xpan_core::{ErrorClass, TokenProvider};

use super::RetryClass;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::new(Duration::from_millis(250), Duration::from_secs(10), true),
        }
    }
}

/// Wraps one idempotent operation with classification-driven retries:
/// transient and rate-limit errors back off and re-run up to `max_retries`;
/// the first auth-expired error triggers a single token refresh before one
/// more attempt; anything fatal propagates untouched.
pub async fn with_retries<T, E, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    provider: &Arc<dyn TokenProvider>,
    mut op: F,
) -> Result<T, E>
where
    E: RetryClass + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    let mut refreshed = false;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match err.retry_class() {
                ErrorClass::Auth if !refreshed => {
                    if provider.refresh().is_err() {
                        return Err(err);
                    }
                    refreshed = true;
                    eprintln!("[xpan] {label}: token refreshed after auth error");
                }
                ErrorClass::Transient | ErrorClass::RateLimit if attempt < policy.max_retries => {
                    attempt += 1;
                    let delay = policy.backoff.delay(attempt);
                    eprintln!(
                        "[xpan] {label}: retry {attempt}/{} in {}ms after: {err}",
                        policy.max_retries,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(err),
            },
        }
    }
}
