//! Three-tier retry regime for EC2 calls.
//!
//! Tier 1: throttling codes retry with capped exponential backoff + jitter.
//! Tier 2: eventual-consistency NotFound codes retry at the same cadence,
//! but only inside a short window after the resource was created.
//! Tier 3: everything else surfaces unchanged.

use std::future::Future;

use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::errors::Result;

pub const THROTTLE_CODES: &[&str] = &[
    "RequestLimitExceeded",
    "Throttling",
    "ThrottlingException",
];

/// Codes EC2 returns while a freshly created resource is still propagating.
pub const EVENTUAL_NOT_FOUND_CODES: &[&str] = &[
    "InvalidVolume.NotFound",
    "InvalidSnapshot.NotFound",
    "InvalidAttachment.NotFound",
];

/// How long after a create we treat a NotFound as eventual consistency.
pub const CONSISTENCY_WINDOW: Duration = Duration::from_secs(10);

pub fn is_throttle(code: &str) -> bool {
    THROTTLE_CODES.contains(&code)
}

pub fn is_eventual_not_found(code: &str) -> bool {
    EVENTUAL_NOT_FOUND_CODES.contains(&code)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    /// Fractional jitter applied to each delay, e.g. 0.3 for +/-30%.
    pub jitter: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            factor: 2.0,
            jitter: 0.3,
            cap: Duration::from_secs(20),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number "attempt" (zero-based), jittered and
    /// capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let spread = capped * self.jitter;
        let jittered = if spread > 0.0 {
            rand::thread_rng().gen_range(capped - spread..=capped + spread)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.min(self.cap.as_secs_f64()).max(0.0))
    }
}

/// Repeats "op" while it fails retryably, sleeping per the policy between
/// attempts. Terminal errors and exhausted attempts surface unchanged.
pub async fn with_retries<T, F, Fut>(policy: &BackoffPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay(attempt);
                log::warn!(
                    "retrying '{}' after {:?} (attempt {}): {}",
                    what,
                    delay,
                    attempt + 1,
                    e.message()
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn code_classification() {
        assert!(is_throttle("RequestLimitExceeded"));
        assert!(is_throttle("Throttling"));
        assert!(!is_throttle("InvalidParameterValue"));
        assert!(is_eventual_not_found("InvalidVolume.NotFound"));
        assert!(!is_eventual_not_found("VolumeLimitExceeded"));
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(4), Duration::from_secs(4));
        // past the cap every delay clamps to 20s
        assert_eq!(policy.delay(10), Duration::from_secs(20));
        assert_eq!(policy.delay(30), Duration::from_secs(20));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = BackoffPolicy::default();
        for attempt in 0..8 {
            let nominal =
                (0.25_f64 * 2.0_f64.powi(attempt)).min(20.0);
            let d = policy.delay(attempt as u32).as_secs_f64();
            assert!(d >= nominal * 0.7 - 1e-9, "attempt {}: {} too small", attempt, d);
            assert!(d <= nominal * 1.3 + 1e-9, "attempt {}: {} too large", attempt, d);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        let calls = AtomicU32::new(0);
        let out = with_retries(&policy, "describe", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(Error::API {
                        message: "Throttling".to_string(),
                        retryable: true,
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn terminal_error_does_not_retry() {
        let policy = BackoffPolicy::default();
        let calls = AtomicU32::new(0);
        let err = with_retries(&policy, "create", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(Error::API {
                    message: "InvalidParameterValue".to_string(),
                    retryable: false,
                })
            }
        })
        .await
        .unwrap_err();
        assert!(!err.retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            max_attempts: 3,
            ..Default::default()
        };
        let calls = AtomicU32::new(0);
        let err = with_retries(&policy, "describe", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(Error::API {
                    message: "Throttling".to_string(),
                    retryable: true,
                })
            }
        })
        .await
        .unwrap_err();
        assert!(err.retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
