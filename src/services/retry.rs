//! Timeout, exponential backoff and cancellation for gateway calls
//!
//! Every pipeline call goes through [`complete_with_retry`]. Each attempt is
//! bounded by a timeout; transient failures are retried with exponential
//! backoff up to a small fixed count; every await is raced against the run's
//! cancellation token so cancelled work stops promptly.

use crate::config::RetrySettings;
use crate::error::{AnnotextError, Result};
use crate::services::gateway::{CompletionGateway, CompletionRequest};
use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry policy with concrete durations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            timeout: settings.timeout(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

/// Call the gateway, retrying transient failures
///
/// Returns [`AnnotextError::Cancelled`] as soon as `cancel` fires, whether the
/// call is in flight or waiting out a backoff delay.
pub async fn complete_with_retry(
    gateway: &dyn CompletionGateway,
    request: &CompletionRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Value> {
    complete_and_parse(gateway, request, policy, cancel, |value| Ok(value.clone())).await
}

/// Call the gateway and parse the payload, retrying both as one unit
///
/// A payload `parse` rejects with a retryable error (usually
/// [`AnnotextError::MalformedResponse`]) spends an attempt like any other
/// transient failure.
pub async fn complete_and_parse<T, F>(
    gateway: &dyn CompletionGateway,
    request: &CompletionRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    parse: F,
) -> Result<T>
where
    F: Fn(&Value) -> Result<T>,
{
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(AnnotextError::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AnnotextError::Cancelled),
            result = timeout(policy.timeout, gateway.complete(request)) => match result {
                Ok(inner) => inner.and_then(|value| parse(&value)),
                Err(_) => Err(AnnotextError::Timeout(policy.timeout.as_secs())),
            },
        };

        let error = match outcome {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{:?} call succeeded on attempt {}", request.purpose, attempt + 1);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if matches!(error, AnnotextError::Cancelled) || !error.is_retryable() {
            return Err(error);
        }
        if attempt >= policy.max_retries {
            warn!(
                "{:?} call exhausted {} retries: {}",
                request.purpose, policy.max_retries, error
            );
            return Err(error);
        }

        let delay = policy.backoff(attempt);
        warn!(
            "{:?} call failed, retrying after {}ms (attempt {}/{}): {}",
            request.purpose,
            delay.as_millis(),
            attempt + 1,
            policy.max_retries,
            error
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AnnotextError::Cancelled),
            _ = sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gateway::{CompletionPurpose, MockCompletionGateway};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn request() -> CompletionRequest {
        CompletionRequest {
            purpose: CompletionPurpose::HardVerify,
            system: String::new(),
            prompt: "p".to_string(),
            max_tokens: 16,
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut mock = MockCompletionGateway::new();
        mock.expect_complete().times(3).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AnnotextError::RateLimited("429".into()))
            } else {
                Ok(json!({"ok": true}))
            }
        });

        let value = complete_with_retry(&mock, &request(), &fast_policy(3), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_retry_budget() {
        let mut mock = MockCompletionGateway::new();
        mock.expect_complete()
            .times(3)
            .returning(|_| Err(AnnotextError::RateLimited("429".into())));

        let err = complete_with_retry(&mock, &request(), &fast_policy(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AnnotextError::RateLimited(_)));
    }

    #[tokio::test]
    async fn test_unparseable_payload_spends_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut mock = MockCompletionGateway::new();
        mock.expect_complete().times(3).returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"result": "sorry"}))
        });

        let err = complete_and_parse(
            &mock,
            &request(),
            &fast_policy(2),
            &CancellationToken::new(),
            |value| match value.get("items") {
                Some(items) => Ok(items.clone()),
                None => Err(AnnotextError::MalformedResponse("no items".into())),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AnnotextError::MalformedResponse(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_payload_parsed_on_later_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut mock = MockCompletionGateway::new();
        mock.expect_complete().times(2).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(json!("not an object"))
            } else {
                Ok(json!({"items": [1, 2]}))
            }
        });

        let items = complete_and_parse(
            &mock,
            &request(),
            &fast_policy(2),
            &CancellationToken::new(),
            |value| {
                value
                    .get("items")
                    .and_then(Value::as_array)
                    .map(Vec::len)
                    .ok_or_else(|| AnnotextError::MalformedResponse("no items".into()))
            },
        )
        .await
        .unwrap();
        assert_eq!(items, 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let mut mock = MockCompletionGateway::new();
        mock.expect_complete()
            .times(1)
            .returning(|_| Err(AnnotextError::Config("bad key".into())));

        let err = complete_with_retry(&mock, &request(), &fast_policy(3), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AnnotextError::Config(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let mut mock = MockCompletionGateway::new();
        mock.expect_complete().times(0);

        let token = CancellationToken::new();
        token.cancel();
        let err = complete_with_retry(&mock, &request(), &fast_policy(3), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, AnnotextError::Cancelled));
    }
}
