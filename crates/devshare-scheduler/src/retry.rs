//! Bounded retry of conflicting persistence writes

use devshare_core::{DevshareError, DevshareResult, RetrySettings};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Delay strategy between retry attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Same delay every attempt
    Fixed { delay_ms: u64 },
    /// Exponential backoff capped at `max_ms`
    Exponential { base_ms: u64, max_ms: u64 },
}

impl RetryPolicy {
    /// Sleep duration before the given retry (0-indexed)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let ms = match self {
            RetryPolicy::Fixed { delay_ms } => *delay_ms,
            RetryPolicy::Exponential { base_ms, max_ms } => 1u64
                .checked_shl(attempt as u32)
                .and_then(|s| base_ms.checked_mul(s))
                .unwrap_or(*max_ms)
                .min(*max_ms),
        };
        Duration::from_millis(ms)
    }
}

/// How many attempts to make and how long to wait between them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts (1 = no retry)
    pub max_attempts: usize,
    pub policy: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        (&RetrySettings::default()).into()
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts as usize,
            policy: RetryPolicy::Exponential {
                base_ms: settings.base_delay_ms,
                max_ms: settings.max_delay_ms,
            },
        }
    }
}

impl RetryConfig {
    /// No delay between attempts
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            policy: RetryPolicy::Fixed { delay_ms: 0 },
        }
    }
}

/// Retry `f` while it fails with an error `is_retryable` accepts, up to
/// `config.max_attempts` calls. The last error is returned on exhaustion.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    is_retryable: impl Fn(&DevshareError) -> bool,
    mut f: F,
) -> DevshareResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DevshareResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 0..max_attempts {
        if attempt > 0 {
            let delay = config.policy.delay_for(attempt - 1);
            debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Retrying after conflict");
            tokio::time::sleep(delay).await;
        }
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| DevshareError::Internal("No attempts made".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fixed_policy_delay() {
        let p = RetryPolicy::Fixed { delay_ms: 500 };
        assert_eq!(p.delay_for(0), Duration::from_millis(500));
        assert_eq!(p.delay_for(5), Duration::from_millis(500));
    }

    #[test]
    fn test_exponential_policy_delay() {
        let p = RetryPolicy::Exponential {
            base_ms: 100,
            max_ms: 800,
        };
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(800));
        assert_eq!(p.delay_for(70), Duration::from_millis(800));
    }

    #[test]
    fn test_config_from_settings() {
        let config = RetryConfig::from(&RetrySettings {
            max_attempts: 3,
            base_delay_ms: 5,
            max_delay_ms: 50,
        });
        assert_eq!(config.max_attempts, 3);
        assert_eq!(
            config.policy,
            RetryPolicy::Exponential {
                base_ms: 5,
                max_ms: 50
            }
        );
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_conflict() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result = retry_on_conflict(&RetryConfig::immediate(3), DevshareError::is_retryable, || {
            let cc = cc.clone();
            async move {
                if cc.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DevshareError::ConflictOnCommit("stale version".into()))
                } else {
                    Ok(7u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result: DevshareResult<()> =
            retry_on_conflict(&RetryConfig::immediate(5), DevshareError::is_retryable, || {
                let cc = cc.clone();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Err(DevshareError::Persistence("store offline".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(DevshareError::Persistence(_))));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result: DevshareResult<()> =
            retry_on_conflict(&RetryConfig::immediate(4), DevshareError::is_retryable, || {
                let cc = cc.clone();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Err(DevshareError::ConflictOnCommit("stale version".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(DevshareError::ConflictOnCommit(_))));
        assert_eq!(call_count.load(Ordering::SeqCst), 4);
    }
}
