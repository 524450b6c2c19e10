use crate::constants::{QUOTA_FAILURE_MARKERS, TRANSIENT_FAILURE_MARKERS};
use std::time::Duration;

/// Attempt bookkeeping for one retry loop. The failover requester keeps one per
/// endpoint and the client poller keeps one per job; they are never shared.
#[derive(Debug, Clone)]
pub struct RetryState<E> {
    attempt: u32,
    max_attempts: u32,
    last_error: Option<E>,
}

impl<E> RetryState<E> {
    /// `max_retries` additional attempts on top of the first one.
    pub fn new(max_retries: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts: max_retries.saturating_add(1),
            last_error: None,
        }
    }

    /// Starts the next attempt and returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn has_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    pub fn record_failure(&mut self, error: E) {
        self.last_error = Some(error);
    }

    pub fn last_error(&self) -> Option<&E> {
        self.last_error.as_ref()
    }

    pub fn into_last_error(self) -> Option<E> {
        self.last_error
    }
}

/// `step * attempt`: 1st retry waits one step, 2nd waits two, ...
pub fn linear_backoff(step: Duration, attempt: u32) -> Duration {
    step.saturating_mul(attempt.max(1))
}

/// How a provider-reported `failed` event should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network-ish; the whole job may be retried.
    Transient,
    Quota,
    /// Content or input problem (e.g. no face detected); retrying won't help.
    Terminal,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        self == Self::Transient
    }
}

/// Classifies a failure from its `error_type` tag when present, falling back to
/// the message text.
pub fn classify_failure(message: &str, error_type: Option<&str>) -> FailureClass {
    match error_type {
        Some("network_error") | Some("processing_timeout") => return FailureClass::Transient,
        Some("api_quota_exceeded") => return FailureClass::Quota,
        Some("face_detection_failed") | Some("invalid_image_format") | Some("image_too_large") => {
            return FailureClass::Terminal
        }
        _ => {}
    }

    let lower = message.to_lowercase();
    if QUOTA_FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureClass::Quota
    } else if TRANSIENT_FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureClass::Transient
    } else {
        FailureClass::Terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_state_budget() {
        let mut state: RetryState<String> = RetryState::new(2);
        assert_eq!(state.max_attempts(), 3);
        assert_eq!(state.begin_attempt(), 1);
        assert!(state.has_remaining());
        state.record_failure("first".to_string());
        assert_eq!(state.begin_attempt(), 2);
        assert_eq!(state.begin_attempt(), 3);
        assert!(!state.has_remaining());
        assert_eq!(state.last_error().map(String::as_str), Some("first"));
    }

    #[test]
    fn test_zero_retries_allows_one_attempt() {
        let mut state: RetryState<()> = RetryState::new(0);
        state.begin_attempt();
        assert!(!state.has_remaining());
    }

    #[test]
    fn test_linear_backoff() {
        let step = Duration::from_secs(2);
        assert_eq!(linear_backoff(step, 1), Duration::from_secs(2));
        assert_eq!(linear_backoff(step, 3), Duration::from_secs(6));
        assert_eq!(linear_backoff(step, 0), Duration::from_secs(2));
    }

    #[test]
    fn test_classify_failure_by_message() {
        assert_eq!(
            classify_failure("upstream timeout while rendering", None),
            FailureClass::Transient
        );
        assert_eq!(classify_failure("网络连接中断", None), FailureClass::Transient);
        assert_eq!(
            classify_failure("Monthly quota exceeded", None),
            FailureClass::Quota
        );
        assert_eq!(
            classify_failure("Rate limit reached for connection", None),
            FailureClass::Quota
        );
        assert_eq!(
            classify_failure("content policy violation", None),
            FailureClass::Terminal
        );
    }

    #[test]
    fn test_classify_failure_prefers_error_type() {
        assert_eq!(
            classify_failure("no clear face found", Some("face_detection_failed")),
            FailureClass::Terminal
        );
        assert_eq!(
            classify_failure("processing took too long", Some("processing_timeout")),
            FailureClass::Transient
        );
        assert!(!classify_failure("x", Some("api_quota_exceeded")).is_retryable());
    }
}
