//! Drives one generation job against the relay and reports it through a
//! [`JobObserver`]. The whole request is retried on stalls, 5xx, transport
//! errors, transient provider failures and streams that end without a verdict.

use crate::constants::{
    CLIENT_MAX_RETRIES, CLIENT_REQUEST_TIMEOUT_SECS, CLIENT_STALL_TIMEOUT_SECS,
    STALL_CHECK_INTERVAL_SECS,
};
use crate::hardening::{classify_failure, linear_backoff, FailureClass, RetryState};
use crate::jobs::GenerationRequest;
use crate::ndjson::{parse_event, NdjsonBuffer};
use crate::types::{JobResult, JobStatus, TransportError, TransportErrorKind};
use crate::watchdog::StallWatch;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::time::Duration;
use thiserror::Error;

pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, TransportError>>;

/// What the relay answered when the request was opened.
pub enum RelayResponse {
    Streaming(ByteStream),
    Rejected { status: u16, message: String },
}

impl std::fmt::Debug for RelayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming(_) => f.write_str("Streaming(..)"),
            Self::Rejected { status, message } => f
                .debug_struct("Rejected")
                .field("status", status)
                .field("message", message)
                .finish(),
        }
    }
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn open(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<RelayResponse, TransportError>;
}

/// Talks to a relay server over HTTP.
#[derive(Clone)]
pub struct HttpRelayTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRelayTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self, request: &GenerationRequest) -> String {
        format!("{}/api/generate/{}", self.base_url, request.kind.slug())
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn open(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<RelayResponse, TransportError> {
        let body = request
            .to_relay_body()
            .map_err(|e| TransportError::new(TransportErrorKind::Other, e.inner.to_string()))?;
        let response = self
            .client
            .post(self.endpoint(request))
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;

        let status = response.status();
        if status.is_success() {
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| TransportError::from_reqwest(&e)))
                .boxed();
            return Ok(RelayResponse::Streaming(stream));
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or_else(|| format!("request failed with status {}", status.as_u16()));
        Ok(RelayResponse::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

pub trait JobObserver: Send {
    fn on_progress(&mut self, percent: u8);
    fn on_success(&mut self, result: JobResult);
    fn on_error(&mut self, message: String);
}

/// Adapts three closures into a [`JobObserver`].
pub struct Callbacks<P, S, E> {
    pub on_progress: P,
    pub on_success: S,
    pub on_error: E,
}

impl<P, S, E> JobObserver for Callbacks<P, S, E>
where
    P: FnMut(u8) + Send,
    S: FnMut(JobResult) + Send,
    E: FnMut(String) + Send,
{
    fn on_progress(&mut self, percent: u8) {
        (self.on_progress)(percent)
    }

    fn on_success(&mut self, result: JobResult) {
        (self.on_success)(result)
    }

    fn on_error(&mut self, message: String) {
        (self.on_error)(message)
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub max_retries: u32,
    /// Bound on opening the relay request (response headers).
    pub request_timeout: Duration,
    pub stall_timeout: Duration,
    pub check_interval: Duration,
    /// Drop progress values lower than one already reported.
    pub monotonic_progress: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            max_retries: CLIENT_MAX_RETRIES,
            request_timeout: Duration::from_secs(CLIENT_REQUEST_TIMEOUT_SECS),
            stall_timeout: Duration::from_secs(CLIENT_STALL_TIMEOUT_SECS),
            check_interval: Duration::from_secs(STALL_CHECK_INTERVAL_SECS),
            monotonic_progress: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTrigger {
    ServerError { status: u16 },
    Transport(TransportErrorKind),
    Stalled,
    TransientFailure,
    BodyRead,
    PrematureEnd,
}

impl RetryTrigger {
    pub fn backoff_step(self) -> Duration {
        let secs = match self {
            Self::ServerError { .. } | Self::Transport(_) | Self::PrematureEnd => 3,
            Self::Stalled => 2,
            Self::TransientFailure => 4,
            Self::BodyRead => 5,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("network error: {0}")]
    Transport(TransportError),

    #[error("request timed out after {0}s, please retry")]
    OpenTimeout(u64),

    #[error("connection timeout: no data received for {idle_secs}s, please retry")]
    Stalled { idle_secs: u64 },

    #[error("network unstable, stream interrupted: {0}")]
    BodyRead(TransportError),

    #[error("{message}")]
    JobFailed { message: String, class: FailureClass },

    #[error("no output was produced")]
    MissingOutput,

    #[error("stream ended before the job finished, please retry")]
    PrematureEnd,
}

impl ClientError {
    pub fn retry_trigger(&self) -> Option<RetryTrigger> {
        match self {
            Self::Rejected { status, .. } if *status >= 500 => {
                Some(RetryTrigger::ServerError { status: *status })
            }
            Self::Rejected { .. } | Self::MissingOutput => None,
            Self::Transport(e) => Some(RetryTrigger::Transport(e.kind)),
            Self::OpenTimeout(_) => Some(RetryTrigger::Transport(TransportErrorKind::Timeout)),
            Self::Stalled { .. } => Some(RetryTrigger::Stalled),
            Self::BodyRead(_) => Some(RetryTrigger::BodyRead),
            Self::JobFailed { class, .. } if class.is_retryable() => {
                Some(RetryTrigger::TransientFailure)
            }
            Self::JobFailed { .. } => None,
            Self::PrematureEnd => Some(RetryTrigger::PrematureEnd),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded(JobResult),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollReport {
    /// Relay requests issued, including the first.
    pub attempts: u32,
    pub outcome: JobOutcome,
}

#[derive(Debug, Default)]
struct ProgressTracker {
    monotonic: bool,
    last: Option<u8>,
}

impl ProgressTracker {
    fn new(monotonic: bool) -> Self {
        Self {
            monotonic,
            last: None,
        }
    }

    fn offer(&mut self, percent: u8) -> bool {
        if self.monotonic && self.last.is_some_and(|last| percent < last) {
            return false;
        }
        self.last = Some(percent);
        true
    }
}

pub struct JobPoller<T> {
    transport: T,
    config: PollerConfig,
}

impl<T: RelayTransport> JobPoller<T> {
    pub fn new(transport: T, config: PollerConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Runs the job to a verdict. Exactly one of `on_success` / `on_error` is
    /// called, once.
    #[tracing::instrument(name = "client.job", skip_all, fields(kind = %request.kind))]
    pub async fn run(&self, request: &GenerationRequest, observer: &mut dyn JobObserver) -> PollReport {
        let mut retry: RetryState<ClientError> = RetryState::new(self.config.max_retries);
        let mut progress = ProgressTracker::new(self.config.monotonic_progress);

        loop {
            let attempt = retry.begin_attempt();
            tracing::info!(
                "[🖥️  -> ⚙️ ] Opening relay stream (attempt {}/{})",
                attempt,
                retry.max_attempts()
            );

            match self.attempt(request, observer, &mut progress).await {
                Ok(result) => {
                    if progress.last != Some(100) && progress.offer(100) {
                        observer.on_progress(100);
                    }
                    tracing::info!("[⚙️  -> 🖥️ ] Job {} succeeded: {}", result.id, result.image_url);
                    observer.on_success(result.clone());
                    return PollReport {
                        attempts: attempt,
                        outcome: JobOutcome::Succeeded(result),
                    };
                }
                Err(error) => match error.retry_trigger() {
                    Some(trigger) if retry.has_remaining() => {
                        let delay = linear_backoff(trigger.backoff_step(), attempt);
                        tracing::warn!(
                            "[⚙️  -> 🖥️ ] Attempt {} failed ({:?}): {}. Retrying in {:?}",
                            attempt,
                            trigger,
                            error,
                            delay
                        );
                        retry.record_failure(error);
                        tokio::time::sleep(delay).await;
                    }
                    _ => {
                        let message = error.to_string();
                        tracing::error!("[⚙️  -> 🖥️ ] Job failed after {} attempt(s): {}", attempt, message);
                        observer.on_error(message.clone());
                        return PollReport {
                            attempts: attempt,
                            outcome: JobOutcome::Failed(message),
                        };
                    }
                },
            }
        }
    }

    async fn attempt(
        &self,
        request: &GenerationRequest,
        observer: &mut dyn JobObserver,
        progress: &mut ProgressTracker,
    ) -> std::result::Result<JobResult, ClientError> {
        let opened = tokio::time::timeout(self.config.request_timeout, self.transport.open(request)).await;
        let mut body = match opened {
            Err(_) => return Err(ClientError::OpenTimeout(self.config.request_timeout.as_secs())),
            Ok(Err(e)) => return Err(ClientError::Transport(e)),
            Ok(Ok(RelayResponse::Rejected { status, message })) => {
                return Err(ClientError::Rejected { status, message })
            }
            Ok(Ok(RelayResponse::Streaming(body))) => body,
        };

        let mut buffer = NdjsonBuffer::new();
        let mut watch = StallWatch::new(self.config.stall_timeout, self.config.check_interval);

        loop {
            let next = tokio::select! {
                biased;
                item = body.next() => item,
                idle = watch.stalled() => {
                    return Err(ClientError::Stalled { idle_secs: idle.as_secs() });
                }
            };

            match next {
                Some(Ok(chunk)) => {
                    watch.touch();
                    for line in buffer.push_chunk(&chunk) {
                        if let Some(result) = handle_line(&line, observer, progress)? {
                            return Ok(result);
                        }
                    }
                }
                Some(Err(e)) => return Err(ClientError::BodyRead(e)),
                None => {
                    for line in buffer.finish() {
                        if let Some(result) = handle_line(&line, observer, progress)? {
                            return Ok(result);
                        }
                    }
                    return Err(ClientError::PrematureEnd);
                }
            }
        }
    }
}

/// `Ok(Some)` on success, `Err` on a provider failure, `Ok(None)` otherwise.
fn handle_line(
    line: &str,
    observer: &mut dyn JobObserver,
    progress: &mut ProgressTracker,
) -> std::result::Result<Option<JobResult>, ClientError> {
    let event = match parse_event(line) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(
                "Skipping unparseable event ({}): {}",
                e,
                crate::str_utils::prefix_chars(line, 120)
            );
            return Ok(None);
        }
    };

    if let Some(percent) = event.progress {
        if progress.offer(percent) {
            observer.on_progress(percent);
        }
    }

    match event.status {
        JobStatus::Succeeded => JobResult::from_event(&event)
            .map(Some)
            .ok_or(ClientError::MissingOutput),
        JobStatus::Failed => {
            let message = event.failure_message();
            let class = classify_failure(&message, event.error_type.as_deref());
            Err(ClientError::JobFailed { message, class })
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_triggers() {
        let rejected = |status| ClientError::Rejected {
            status,
            message: "x".to_string(),
        };
        assert_eq!(
            rejected(502).retry_trigger(),
            Some(RetryTrigger::ServerError { status: 502 })
        );
        assert_eq!(rejected(400).retry_trigger(), None);
        assert_eq!(ClientError::MissingOutput.retry_trigger(), None);
        assert_eq!(
            ClientError::JobFailed {
                message: "no face".to_string(),
                class: FailureClass::Terminal
            }
            .retry_trigger(),
            None
        );
        assert_eq!(
            ClientError::PrematureEnd.retry_trigger(),
            Some(RetryTrigger::PrematureEnd)
        );
    }

    #[test]
    fn test_backoff_steps() {
        assert_eq!(RetryTrigger::Stalled.backoff_step(), Duration::from_secs(2));
        assert_eq!(RetryTrigger::TransientFailure.backoff_step(), Duration::from_secs(4));
        assert_eq!(RetryTrigger::BodyRead.backoff_step(), Duration::from_secs(5));
    }

    #[test]
    fn test_monotonic_progress_drops_decreases() {
        let mut tracker = ProgressTracker::new(true);
        assert!(tracker.offer(10));
        assert!(tracker.offer(40));
        assert!(!tracker.offer(30));
        assert!(tracker.offer(40));

        let mut raw = ProgressTracker::new(false);
        assert!(raw.offer(40));
        assert!(raw.offer(30));
    }
}
