//! Per-task retry bookkeeping for the download engine.

use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum network attempts per task that end in a transient failure.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

/// How a failed attempt is treated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureClass {
    /// Connection error, timeout, interrupted body, HTTP 408, 429 or 5xx.
    Transient,

    /// The partial file on disk can't be resumed and must be restarted from zero.
    ResumeMismatch,

    /// The finished file failed verification.
    Integrity,

    /// Anything else, e.g. HTTP 404 or a local I/O error.
    Permanent,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Clone, Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
    transient_failures: u32,
    restart_used: bool,
    integrity_retry_used: bool,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay before retry number `retry` (zero-based): `base * 2^retry`, at most `cap`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> RetryState {
        RetryState {
            policy,
            attempts: 0,
            transient_failures: 0,
            restart_used: false,
            integrity_retry_used: false,
        }
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Network attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Claim the single restart from zero a task is allowed. Returns false if already used.
    pub fn take_restart(&mut self) -> bool {
        !std::mem::replace(&mut self.restart_used, true)
    }

    pub fn on_failure(&mut self, class: FailureClass) -> RetryDecision {
        match class {
            FailureClass::Transient => {
                // Bytes written by a failed attempt are kept and resumed, but the
                // attempt still counts.
                self.transient_failures += 1;

                if self.transient_failures >= self.policy.max_attempts() {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::RetryAfter(
                        self.policy.backoff(self.transient_failures - 1))
                }
            },
            FailureClass::ResumeMismatch => {
                if self.take_restart() {
                    RetryDecision::RetryAfter(Duration::ZERO)
                } else {
                    RetryDecision::GiveUp
                }
            },
            FailureClass::Integrity => {
                if std::mem::replace(&mut self.integrity_retry_used, true) {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::RetryAfter(Duration::ZERO)
                }
            },
            FailureClass::Permanent => RetryDecision::GiveUp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(1),
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let p = policy(10);
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(4), Duration::from_secs(1));
        assert_eq!(p.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn transient_failures_give_up_at_max_attempts() {
        let mut state = RetryState::new(policy(3));
        assert_eq!(state.on_failure(FailureClass::Transient),
                   RetryDecision::RetryAfter(Duration::from_millis(100)));
        assert_eq!(state.on_failure(FailureClass::Transient),
                   RetryDecision::RetryAfter(Duration::from_millis(200)));
        assert_eq!(state.on_failure(FailureClass::Transient), RetryDecision::GiveUp);
    }

    #[test]
    fn zero_retries_still_allows_one_attempt() {
        let mut state = RetryState::new(policy(0));
        assert_eq!(state.policy.max_attempts(), 1);
        assert_eq!(state.on_failure(FailureClass::Transient), RetryDecision::GiveUp);
    }

    #[test]
    fn other_failures_do_not_reset_the_transient_count() {
        let mut state = RetryState::new(policy(2));
        assert!(matches!(state.on_failure(FailureClass::Transient), RetryDecision::RetryAfter(_)));
        assert!(matches!(state.on_failure(FailureClass::ResumeMismatch),
                         RetryDecision::RetryAfter(_)));
        assert_eq!(state.on_failure(FailureClass::Transient), RetryDecision::GiveUp);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let mut state = RetryState::new(policy(5));
        assert_eq!(state.on_failure(FailureClass::Permanent), RetryDecision::GiveUp);
    }

    #[test]
    fn one_restart_and_one_integrity_retry() {
        let mut state = RetryState::new(policy(5));
        assert_eq!(state.on_failure(FailureClass::ResumeMismatch),
                   RetryDecision::RetryAfter(Duration::ZERO));
        assert_eq!(state.on_failure(FailureClass::ResumeMismatch), RetryDecision::GiveUp);
        assert!(!state.take_restart());

        assert_eq!(state.on_failure(FailureClass::Integrity),
                   RetryDecision::RetryAfter(Duration::ZERO));
        assert_eq!(state.on_failure(FailureClass::Integrity), RetryDecision::GiveUp);
    }

    #[test]
    fn take_restart_is_single_use() {
        let mut state = RetryState::new(policy(5));
        assert!(state.take_restart());
        assert!(!state.take_restart());
        assert_eq!(state.on_failure(FailureClass::ResumeMismatch), RetryDecision::GiveUp);
    }
}
