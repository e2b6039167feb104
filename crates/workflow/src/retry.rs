//! Retry logic with exponential backoff for transient script failures.

use crate::cancel::CancelToken;
use crate::command::CommandOutcome;
use crate::error::{FailureClass, Result};
use crate::types::RetryPolicy;
use std::time::Duration;

/// `EX_TEMPFAIL` from sysexits.h; scripts exit with it to ask for a retry
pub const EX_TEMPFAIL: i32 = 75;

/// Lowercased stderr fragments that indicate a network hiccup
const NETWORK_PATTERNS: &[&str] = &[
    "could not resolve",
    "connection refused",
    "connection reset",
    "timed out",
    "network is unreachable",
    "temporary failure in name resolution",
    "failed to download",
    "tls handshake",
    "i/o timeout",
    "unexpected eof",
];

/// Classify a failed attempt.
///
/// Timeouts, `EX_TEMPFAIL`, the script's own transient exit codes and
/// network-looking stderr are transient; everything else is permanent.
pub fn classify(outcome: &CommandOutcome, transient_exit_codes: &[i32]) -> FailureClass {
    if outcome.timed_out {
        return FailureClass::Transient;
    }
    if let Some(code) = outcome.exit_code
        && (code == EX_TEMPFAIL || transient_exit_codes.contains(&code))
    {
        return FailureClass::Transient;
    }

    let stderr_lower = outcome.stderr.to_lowercase();
    if NETWORK_PATTERNS.iter().any(|p| stderr_lower.contains(p)) {
        return FailureClass::Transient;
    }

    FailureClass::Permanent
}

/// Callback trait for retry progress notifications.
pub trait RetryCallback {
    /// Called before sleeping ahead of another attempt.
    ///
    /// # Arguments
    /// * `attempt` - The attempt that just failed (1-indexed)
    /// * `max_attempts` - Maximum number of attempts
    /// * `reason` - Why the attempt failed
    /// * `delay` - Time until the next attempt
    fn on_retry(&self, attempt: u32, max_attempts: u32, reason: &str, delay: Duration);
}

/// No-op callback that does nothing.
pub struct NoCallback;

impl RetryCallback for NoCallback {
    fn on_retry(&self, _attempt: u32, _max_attempts: u32, _reason: &str, _delay: Duration) {}
}

/// Result of running a command under a retry policy
#[derive(Debug)]
pub struct RetryResult {
    /// The last attempt's outcome, or the error that prevented it from starting
    pub result: Result<CommandOutcome>,
    /// Attempts made, including the last
    pub attempts: u32,
    /// A backoff sleep was cut short by cancellation
    pub interrupted: bool,
}

/// Execute a command with retry logic.
///
/// Retries only transient failures, sleeping `policy.delay_for_attempt(n)`
/// between attempts. Start-up errors and cancelled attempts end the loop
/// immediately. Backoff sleeps wake early when `cancel` fires.
pub fn with_retry<F>(
    policy: &RetryPolicy,
    transient_exit_codes: &[i32],
    cancel: &CancelToken,
    callback: &dyn RetryCallback,
    mut operation: F,
) -> RetryResult
where
    F: FnMut(u32) -> Result<CommandOutcome>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let outcome = match operation(attempt) {
            Ok(outcome) => outcome,
            Err(e) => {
                return RetryResult {
                    result: Err(e),
                    attempts: attempt,
                    interrupted: false,
                };
            }
        };

        let done = outcome.success()
            || outcome.cancelled
            || attempt >= max_attempts
            || !classify(&outcome, transient_exit_codes).is_retryable();
        if done {
            return RetryResult {
                result: Ok(outcome),
                attempts: attempt,
                interrupted: false,
            };
        }

        let delay = policy.delay_for_attempt(attempt - 1);
        let reason = outcome.failure_reason();
        log::debug!("Attempt {attempt}/{max_attempts} failed ({reason}), backing off {delay:?}");
        callback.on_retry(attempt, max_attempts, &reason, delay);

        if !cancel.sleep(delay) {
            return RetryResult {
                result: Ok(outcome),
                attempts: attempt,
                interrupted: true,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            backoff_factor: 1.0,
            max_delay_ms: 10,
        }
    }

    fn exited(code: i32, stderr: &str) -> CommandOutcome {
        CommandOutcome {
            exit_code: Some(code),
            stderr: stderr.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&exited(75, ""), &[]), FailureClass::Transient);
        assert_eq!(classify(&exited(1, ""), &[]), FailureClass::Permanent);
        assert_eq!(classify(&exited(111, ""), &[111]), FailureClass::Transient);
        assert_eq!(
            classify(&exited(1, "curl: (6) Could not resolve host: get.helm.sh"), &[]),
            FailureClass::Transient
        );
        let timed_out = CommandOutcome {
            timed_out: true,
            ..Default::default()
        };
        assert_eq!(classify(&timed_out, &[]), FailureClass::Transient);
    }

    #[test]
    fn test_success_first_try() {
        let result = with_retry(&fast(), &[], &CancelToken::new(), &NoCallback, |_| Ok(exited(0, "")));
        assert!(result.result.unwrap().success());
        assert_eq!(result.attempts, 1);
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let calls = Cell::new(0);
        let result = with_retry(&fast(), &[], &CancelToken::new(), &NoCallback, |_| {
            calls.set(calls.get() + 1);
            Ok(exited(2, "syntax error"))
        });
        assert_eq!(calls.get(), 1);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.result.unwrap().exit_code, Some(2));
    }

    #[test]
    fn test_transient_then_success() {
        let result = with_retry(&fast(), &[], &CancelToken::new(), &NoCallback, |attempt| {
            Ok(if attempt < 3 { exited(75, "") } else { exited(0, "") })
        });
        assert!(result.result.unwrap().success());
        assert_eq!(result.attempts, 3);
    }

    #[test]
    fn test_attempts_exhausted() {
        let result = with_retry(&fast(), &[], &CancelToken::new(), &NoCallback, |_| Ok(exited(75, "")));
        assert_eq!(result.attempts, 3);
        assert!(!result.result.unwrap().success());
    }

    #[test]
    fn test_start_error_stops() {
        let result = with_retry(&fast(), &[], &CancelToken::new(), &NoCallback, |_| Err(Error::Cancelled));
        assert_eq!(result.attempts, 1);
        assert!(result.result.is_err());
    }

    #[test]
    fn test_callback_invoked_between_attempts() {
        struct Counting(Arc<AtomicU32>);
        impl RetryCallback for Counting {
            fn on_retry(&self, _: u32, _: u32, _: &str, _: Duration) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicU32::new(0));
        let callback = Counting(count.clone());
        let _ = with_retry(&fast(), &[], &CancelToken::new(), &callback, |_| Ok(exited(75, "")));
        // Not before the first attempt, not after the last
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_interrupted_by_cancel() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 60_000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = with_retry(&policy, &[], &cancel, &NoCallback, |_| Ok(exited(75, "")));
        assert!(result.interrupted);
        assert_eq!(result.attempts, 1);
    }
}
