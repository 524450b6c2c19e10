use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- TRANSPORT ---

/// Closed set of transport failure kinds. Produced once where the I/O error is
/// observed; upper layers match on the kind instead of re-reading messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// The peer closed, reset or aborted the connection mid-stream.
    RemoteClosed,
    Timeout,
    Connect,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::RemoteClosed => "remote closed",
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Other => "transport",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let message = error_chain_message(err);
        if err.is_timeout() {
            return Self::new(TransportErrorKind::Timeout, message);
        }
        if let Some(kind) = io_kind_in_chain(err) {
            return Self::new(kind, message);
        }
        if err.is_connect() {
            return Self::new(TransportErrorKind::Connect, message);
        }
        Self::new(classify_message(&message), message)
    }
}

fn error_chain_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn io_kind_in_chain(err: &(dyn std::error::Error + 'static)) -> Option<TransportErrorKind> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if let Some(kind) = map_io_kind(io.kind()) {
                return Some(kind);
            }
        }
        source = cause.source();
    }
    None
}

fn map_io_kind(kind: std::io::ErrorKind) -> Option<TransportErrorKind> {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::NotConnected => Some(TransportErrorKind::RemoteClosed),
        ErrorKind::TimedOut => Some(TransportErrorKind::Timeout),
        ErrorKind::ConnectionRefused => Some(TransportErrorKind::Connect),
        _ => None,
    }
}

/// Last-resort classification for errors that carry no structured cause.
pub fn classify_message(message: &str) -> TransportErrorKind {
    let lower = message.to_lowercase();
    if crate::constants::REMOTE_CLOSURE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
    {
        TransportErrorKind::RemoteClosed
    } else if lower.contains("timeout") || lower.contains("timed out") {
        TransportErrorKind::Timeout
    } else {
        TransportErrorKind::Other
    }
}

// --- RELAY STREAM ERRORS ---

/// Terminal errors raised on the relay's output stream after the 200 response
/// has already started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("connection timeout: no data from upstream for {idle_secs}s, please retry")]
    Stalled { idle_secs: u64 },

    #[error("upstream read timed out, please retry")]
    Timeout,

    #[error("network unstable: connection interrupted {attempts} times, please retry")]
    Interrupted { attempts: u32 },

    #[error("network error: {0}")]
    Network(String),
}

// --- APPLICATION ERRORS ---

#[derive(Error, Debug)]
pub enum ArtsparkError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unknown job kind: {0}")]
    UnknownJobKind(String),

    #[error("All upstream endpoints unreachable after {attempts} attempts: {last}")]
    AllEndpointsFailed { attempts: u32, last: String },

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Network error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ArtsparkError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::UnknownJobKind(_) => StatusCode::NOT_FOUND,
            Self::AllEndpointsFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(s, _) => *s,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Serialization(_) | Self::Io(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::UnknownJobKind(_) => "UNKNOWN_JOB_KIND",
            Self::AllEndpointsFailed { .. } => "UPSTREAM_UNAVAILABLE",
            Self::Upstream(_, _) => "UPSTREAM_ERROR",
            Self::Transport(_) => "NETWORK_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let message = match &self.inner {
            ArtsparkError::Configuration(m)
            | ArtsparkError::Validation(m)
            | ArtsparkError::Internal(m) => m.clone(),
            ArtsparkError::AllEndpointsFailed { .. } => format!(
                "Upstream connection failed, please retry later. Details: {}",
                self.inner
            ),
            other => other.to_string(),
        };
        (
            self.inner.status_code(),
            axum::Json(serde_json::json!({
                "error": message,
                "code": self.inner.code(),
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ArtsparkError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ArtsparkError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

// --- WIRE TYPES ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    #[serde(alias = "running")]
    Processing,
    Succeeded,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResult {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// One decoded line of the generation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StreamEvent {
    #[serde(default, deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(
        default,
        deserialize_with = "deserialize_progress",
        skip_serializing_if = "Option::is_none"
    )]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ImageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl StreamEvent {
    /// First non-empty of `output`, `url`, `results[0].url`.
    pub fn result_url(&self) -> Option<&str> {
        let candidates = [
            self.output.as_deref(),
            self.url.as_deref(),
            self.results.first().map(|r| r.url.as_str()),
        ];
        candidates
            .into_iter()
            .flatten()
            .find(|url| !url.trim().is_empty())
    }

    pub fn failure_message(&self) -> String {
        [self.failure_reason.as_deref(), self.error.as_deref()]
            .into_iter()
            .flatten()
            .find(|m| !m.trim().is_empty())
            .unwrap_or("generation failed")
            .to_string()
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

fn deserialize_progress<'de, D>(deserializer: D) -> std::result::Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(|v| v.as_f64())
        .filter(|p| p.is_finite())
        .map(|p| p.clamp(0.0, 100.0).round() as u8))
}

/// Payload handed to `on_success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub id: String,
    pub image_url: String,
    pub results: Vec<ImageResult>,
}

impl JobResult {
    pub fn from_event(event: &StreamEvent) -> Option<Self> {
        let image_url = event.result_url()?.to_string();
        Some(Self {
            id: event.id.clone(),
            image_url,
            results: event.results.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_running_alias_and_progress_clamp() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"id":7,"status":"running","progress":140.2}"#)
                .expect("valid event");
        assert_eq!(event.id, "7");
        assert_eq!(event.status, JobStatus::Processing);
        assert_eq!(event.progress, Some(100));
    }

    #[test]
    fn test_unknown_status_and_missing_fields() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"status":"queued"}"#).expect("valid event");
        assert_eq!(event.status, JobStatus::Unknown);
        assert_eq!(event.progress, None);
        assert!(event.id.is_empty());
    }

    #[test]
    fn test_result_url_precedence() {
        let event: StreamEvent = serde_json::from_str(
            r#"{"status":"succeeded","url":"","results":[{"url":"http://img/2.png","width":512,"height":512}]}"#,
        )
        .expect("valid event");
        assert_eq!(event.result_url(), Some("http://img/2.png"));

        let event: StreamEvent = serde_json::from_str(
            r#"{"status":"succeeded","output":"http://img/out.png","url":"http://img/url.png"}"#,
        )
        .expect("valid event");
        assert_eq!(event.result_url(), Some("http://img/out.png"));
    }

    #[test]
    fn test_failure_message_prefers_reason() {
        let event: StreamEvent = serde_json::from_str(
            r#"{"status":"failed","failure_reason":"face not detected","error":"bad"}"#,
        )
        .expect("valid event");
        assert_eq!(event.failure_message(), "face not detected");

        let empty = StreamEvent {
            status: JobStatus::Failed,
            ..Default::default()
        };
        assert_eq!(empty.failure_message(), "generation failed");
    }

    #[test]
    fn test_classify_message_markers() {
        assert_eq!(
            classify_message("connection closed before message completed"),
            TransportErrorKind::RemoteClosed
        );
        assert_eq!(classify_message("operation timed out"), TransportErrorKind::Timeout);
        assert_eq!(classify_message("invalid certificate"), TransportErrorKind::Other);
    }

    #[test]
    fn test_io_kind_found_in_error_chain() {
        #[derive(Debug, Error)]
        #[error("body read failed")]
        struct Wrapper(#[source] std::io::Error);

        let err = Wrapper(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset"));
        assert_eq!(io_kind_in_chain(&err), Some(TransportErrorKind::RemoteClosed));
        assert_eq!(error_chain_message(&err), "body read failed: peer reset");
    }

    #[test]
    fn test_upstream_and_transport_errors_map_to_gateway_codes() {
        use axum::http::StatusCode;
        let upstream = ArtsparkError::Upstream(StatusCode::BAD_GATEWAY, "no id".into());
        assert_eq!(upstream.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(upstream.code(), "UPSTREAM_ERROR");

        let transport: ArtsparkError =
            TransportError::new(TransportErrorKind::RemoteClosed, "reset").into();
        assert_eq!(transport.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(transport.code(), "NETWORK_ERROR");
    }

    #[test]
    fn test_error_status_mapping() {
        use axum::http::StatusCode;
        assert_eq!(
            ArtsparkError::Configuration("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ArtsparkError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ArtsparkError::AllEndpointsFailed {
                attempts: 3,
                last: "503".into()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
