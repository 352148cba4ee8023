//! Retry policy for custody calls. Pure: the client feeds in what
//! happened and the attempt number, the policy answers with a delay or
//! "give up". No clocks, no sleeping here.

use std::time::Duration;

/// What a single attempt produced, as far as retrying is concerned.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Connection/timeout level failure, no HTTP status.
    Transport,
    /// HTTP response with this status and optional `Retry-After` header.
    Status {
        code: u16,
        retry_after: Option<String>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_millis(200),
            cap: Duration::from_secs(2),
        }
    }
}

fn status_is_retryable(code: u16) -> bool {
    matches!(code, 429 | 408 | 425) || (500..=599).contains(&code)
}

/// Parse a `Retry-After` header value given in whole seconds.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

impl RetryPolicy {
    /// Delay before retrying `attempt` (0-based count of attempts already
    /// made), or `None` when the call must not be retried. Non-idempotent
    /// calls are never retried.
    pub fn next_delay(&self, idempotent: bool, attempt: u32, outcome: &Outcome) -> Option<Duration> {
        if !idempotent || attempt >= self.max_retries {
            return None;
        }
        let retry_after = match outcome {
            Outcome::Transport => None,
            Outcome::Status { code, retry_after } => {
                if !status_is_retryable(*code) {
                    return None;
                }
                retry_after.as_deref().and_then(parse_retry_after)
            }
        };
        if let Some(hinted) = retry_after {
            return Some(hinted.min(self.cap));
        }
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        Some(exp.min(self.cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> Outcome {
        Outcome::Status {
            code,
            retry_after: None,
        }
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.next_delay(true, 0, &status(500)),
            Some(Duration::from_millis(200))
        );
        assert_eq!(
            policy.next_delay(true, 1, &status(500)),
            Some(Duration::from_millis(400))
        );
        assert_eq!(
            policy.next_delay(true, 2, &status(500)),
            Some(Duration::from_millis(800))
        );
        assert_eq!(policy.next_delay(true, 3, &status(500)), None);
    }

    #[test]
    fn retryable_statuses() {
        let policy = RetryPolicy::default();
        for code in [408, 425, 429, 500, 502, 503, 599] {
            assert!(policy.next_delay(true, 0, &status(code)).is_some(), "{code}");
        }
        for code in [200, 400, 401, 403, 404, 409, 410, 422] {
            assert!(policy.next_delay(true, 0, &status(code)).is_none(), "{code}");
        }
    }

    #[test]
    fn transport_errors_retry_for_idempotent_calls() {
        let policy = RetryPolicy::default();
        assert!(policy.next_delay(true, 0, &Outcome::Transport).is_some());
        assert!(policy.next_delay(false, 0, &Outcome::Transport).is_none());
    }

    #[test]
    fn non_idempotent_never_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(false, 0, &status(503)), None);
        assert_eq!(policy.next_delay(false, 0, &status(429)), None);
    }

    #[test]
    fn retry_after_hint_is_honored_and_capped() {
        let policy = RetryPolicy::default();
        let hinted = Outcome::Status {
            code: 429,
            retry_after: Some("1".into()),
        };
        assert_eq!(
            policy.next_delay(true, 0, &hinted),
            Some(Duration::from_secs(1))
        );
        let long = Outcome::Status {
            code: 429,
            retry_after: Some("3600".into()),
        };
        assert_eq!(
            policy.next_delay(true, 0, &long),
            Some(Duration::from_secs(2)),
            "hint must be capped"
        );
        let junk = Outcome::Status {
            code: 429,
            retry_after: Some("soon".into()),
        };
        assert_eq!(
            policy.next_delay(true, 0, &junk),
            Some(Duration::from_millis(200)),
            "unparseable hint falls back to backoff"
        );
    }

    #[test]
    fn conflict_is_never_retried() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(true, 0, &status(409)), None);
    }
}
