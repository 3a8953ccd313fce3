//! Centralized retry/backoff helper
//!
//! Every component retries through this one helper instead of ad-hoc
//! sleeps. Policy kinds cover the three recovery shapes the sources need:
//! exponential backoff for transient I/O, rate-limit-aware waits that
//! honour server-provided delays, and fixed-delay loops.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;

/// Retry policy kind
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// Exponential backoff with a delay cap and bounded attempts
    Exponential {
        initial: Duration,
        cap: Duration,
        max_retries: u32,
    },
    /// Honour server-provided delay (e.g. 429 Retry-After), else a default
    RateLimitAware {
        default_delay: Duration,
        max_retries: u32,
    },
    /// Fixed delay between attempts
    Fixed { delay: Duration, max_retries: u32 },
}

impl RetryPolicy {
    pub fn exponential(initial: Duration, cap: Duration, max_retries: u32) -> Self {
        RetryPolicy::Exponential {
            initial,
            cap,
            max_retries,
        }
    }
}

/// Run `op` under `policy`, retrying transient errors.
///
/// Non-transient errors (config, invariant, malformed payload) propagate
/// immediately; rate-limit errors wait the server-provided delay when the
/// policy allows it.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    let mut exp = match policy {
        RetryPolicy::Exponential { initial, cap, .. } => Some(ExponentialBackoff {
            initial_interval: *initial,
            max_interval: *cap,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }),
        _ => None,
    };

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let max_retries = match policy {
                    RetryPolicy::Exponential { max_retries, .. }
                    | RetryPolicy::RateLimitAware { max_retries, .. }
                    | RetryPolicy::Fixed { max_retries, .. } => *max_retries,
                };

                let rate_limit_delay = e.rate_limit_delay_secs();
                let retryable = e.is_transient() || rate_limit_delay.is_some();

                if !retryable || attempt >= max_retries {
                    return Err(e);
                }
                attempt += 1;

                let delay = match (policy, rate_limit_delay) {
                    (RetryPolicy::RateLimitAware { default_delay, .. }, delay) => delay
                        .map(Duration::from_secs)
                        .unwrap_or(*default_delay),
                    (_, Some(secs)) => Duration::from_secs(secs),
                    (RetryPolicy::Exponential { cap, .. }, None) => exp
                        .as_mut()
                        .and_then(|b| b.next_backoff())
                        .unwrap_or(*cap),
                    (RetryPolicy::Fixed { delay, .. }, None) => *delay,
                };

                if attempt == max_retries {
                    warn!("retry {}/{} after {:?}: {}", attempt, max_retries, delay, e);
                } else {
                    debug!("retry {}/{} after {:?}: {}", attempt, max_retries, delay, e);
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Base delay plus up to 30% random jitter, for reconnect loops
pub fn jittered(base: Duration) -> Duration {
    let jitter_ms = (base.as_millis() as f64 * 0.3) as u64;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}
