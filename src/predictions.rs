//! Drives prediction-style upstreams: one create call through the failover
//! requester, then status polling until a verdict. Poll results are mapped onto
//! the same NDJSON event stream the draw relay produces, so the client sees one
//! wire format for every job kind.

use crate::constants::{
    PREDICTION_POLL_INTERVAL_SECS, PREDICTION_TIMEOUT_SECS, QUOTA_FAILURE_MARKERS,
    RELAY_CHANNEL_CAPACITY,
};
use crate::relay::{OutputSink, RelayItem};
use crate::types::{ArtsparkError, Result, TransportError};
use axum::http::StatusCode;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

const STARTING_PROGRESS: u8 = 10;
const PROGRESS_STEP: u8 = 10;
const PROGRESS_CEILING: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PredictionUrls {
    #[serde(default)]
    pub get: Option<String>,
    #[serde(default)]
    pub cancel: Option<String>,
}

/// Prediction resource as returned by create and get.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Prediction {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub urls: PredictionUrls,
}

impl Prediction {
    /// A string output, or the first string of an array output.
    pub fn output_url(&self) -> Option<&str> {
        let url = match self.output.as_ref()? {
            Value::String(s) => s.as_str(),
            Value::Array(items) => items.iter().find_map(Value::as_str)?,
            _ => return None,
        };
        Some(url).filter(|u| !u.trim().is_empty())
    }

    pub fn failure_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s.trim().to_string()),
            other => Some(other.to_string()),
        }
    }
}

/// A created prediction and where to follow it.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionHandle {
    pub prediction: Prediction,
    pub poll_url: String,
    pub cancel_url: String,
}

impl PredictionHandle {
    /// Reads the create response. Links missing from the body are derived from
    /// the URL the prediction was created at.
    pub async fn from_response(response: reqwest::Response) -> Result<Self> {
        let created_at = response.url().as_str().trim_end_matches('/').to_string();
        let prediction: Prediction = response
            .json()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;
        Self::from_prediction(prediction, &created_at)
    }

    pub fn from_prediction(prediction: Prediction, created_at: &str) -> Result<Self> {
        let id = prediction.id.trim();
        if id.is_empty() {
            return Err(ArtsparkError::Upstream(
                StatusCode::BAD_GATEWAY,
                "prediction was accepted without an id".to_string(),
            )
            .into());
        }
        let non_blank = |url: &Option<String>| {
            url.as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
        };
        let poll_url = non_blank(&prediction.urls.get)
            .unwrap_or_else(|| format!("{}/{}", created_at.trim_end_matches('/'), id));
        let cancel_url = non_blank(&prediction.urls.cancel)
            .unwrap_or_else(|| format!("{}/cancel", poll_url));
        Ok(Self {
            prediction,
            poll_url,
            cancel_url,
        })
    }

    pub fn id(&self) -> &str {
        &self.prediction.id
    }
}

/// Why a prediction ended without an image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PredictionFailure {
    #[error("prediction failed: {}", .0.as_deref().unwrap_or("no error reported"))]
    Failed(Option<String>),

    #[error("prediction was canceled")]
    Canceled,

    #[error("prediction did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("prediction succeeded without output")]
    MissingOutput,
}

impl PredictionFailure {
    /// Tag carried in the `error_type` field of the failed event.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Failed(None) => "face_detection_failed",
            Self::Failed(Some(message)) => {
                let lower = message.to_lowercase();
                if lower.contains("face") {
                    "face_detection_failed"
                } else if QUOTA_FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
                    "api_quota_exceeded"
                } else {
                    "unknown_error"
                }
            }
            Self::TimedOut(_) => "processing_timeout",
            Self::Canceled | Self::MissingOutput => "unknown_error",
        }
    }

    pub fn user_message(&self) -> String {
        match (self, self.error_type()) {
            (_, "face_detection_failed") => {
                "no clear face was detected, please upload an image with a face".to_string()
            }
            (_, "api_quota_exceeded") => "too many processing requests, please retry later".to_string(),
            (Self::TimedOut(_), _) => "processing timed out, please retry later".to_string(),
            (Self::Canceled, _) => "processing was canceled, please retry".to_string(),
            (Self::MissingOutput, _) => "no output was produced".to_string(),
            (Self::Failed(Some(message)), _) => message.clone(),
            (Self::Failed(None), _) => "processing failed, please retry".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PredictionPolicy {
    pub poll_interval: Duration,
    /// Overall budget from creation to verdict.
    pub timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for PredictionPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(PREDICTION_POLL_INTERVAL_SECS),
            timeout: Duration::from_secs(PREDICTION_TIMEOUT_SECS),
            channel_capacity: RELAY_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredictionOutcome {
    Succeeded { url: String },
    Failed(PredictionFailure),
    ConsumerGone,
}

#[derive(Clone)]
pub struct PredictionWatcher {
    client: reqwest::Client,
    policy: PredictionPolicy,
}

impl PredictionWatcher {
    pub fn new(client: reqwest::Client, policy: PredictionPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &PredictionPolicy {
        &self.policy
    }

    /// Spawns the polling task and returns its NDJSON stream.
    pub fn spawn(&self, handle: PredictionHandle, token: String) -> ReceiverStream<RelayItem> {
        let (mut sink, rx) = OutputSink::channel(self.policy.channel_capacity);
        let watcher = self.clone();
        tokio::spawn(
            async move {
                let outcome = watcher.run(handle, &token, &mut sink).await;
                tracing::debug!("[PREDICTION] finished: {:?}", outcome);
            }
            .instrument(tracing::Span::current()),
        );
        ReceiverStream::new(rx)
    }

    /// Polls until the prediction reaches a verdict or the budget runs out.
    /// Every non-terminal poll produces one event, which keeps the client's
    /// stall check fed while the model runs.
    pub async fn run(
        &self,
        handle: PredictionHandle,
        token: &str,
        sink: &mut OutputSink,
    ) -> PredictionOutcome {
        let id = handle.id().to_string();
        let deadline = Instant::now() + self.policy.timeout;
        let mut current = handle.prediction.clone();
        let mut progress = STARTING_PROGRESS;
        let mut polls = 0u32;

        tracing::info!("[☁️  -> ⚙️ ] Prediction {} created ({:?})", id, current.status);
        if !emit(sink, json!({"id": id, "status": "starting", "progress": progress})).await {
            self.cancel(&handle, token).await;
            return PredictionOutcome::ConsumerGone;
        }

        loop {
            match current.status {
                PredictionStatus::Succeeded => {
                    let Some(url) = current.output_url().map(String::from) else {
                        return fail(sink, &id, PredictionFailure::MissingOutput).await;
                    };
                    tracing::info!("[☁️  -> ⚙️ ] Prediction {} succeeded after {} polls", id, polls);
                    let event = json!({
                        "id": id,
                        "status": "succeeded",
                        "progress": 100,
                        "output": url,
                        "url": url,
                    });
                    if !emit(sink, event).await {
                        return PredictionOutcome::ConsumerGone;
                    }
                    sink.close();
                    return PredictionOutcome::Succeeded { url };
                }
                PredictionStatus::Failed => {
                    let failure = PredictionFailure::Failed(current.failure_message());
                    return fail(sink, &id, failure).await;
                }
                PredictionStatus::Canceled => {
                    return fail(sink, &id, PredictionFailure::Canceled).await;
                }
                PredictionStatus::Starting
                | PredictionStatus::Processing
                | PredictionStatus::Unknown => {}
            }

            let next_poll = (Instant::now() + self.policy.poll_interval).min(deadline);
            tokio::time::sleep_until(next_poll).await;
            if Instant::now() >= deadline {
                return self.expire(&handle, token, sink).await;
            }

            polls += 1;
            match tokio::time::timeout_at(deadline, self.fetch(&handle.poll_url, token)).await {
                Err(_) => return self.expire(&handle, token, sink).await,
                Ok(Err(e)) => {
                    tracing::warn!("[☁️  -> ⚙️ ] Poll {} for {} failed: {}", polls, id, e.inner);
                    continue;
                }
                Ok(Ok(prediction)) => current = prediction,
            }

            if matches!(
                current.status,
                PredictionStatus::Succeeded | PredictionStatus::Failed | PredictionStatus::Canceled
            ) {
                continue;
            }
            progress = progress.saturating_add(PROGRESS_STEP).min(PROGRESS_CEILING);
            let status = match current.status {
                PredictionStatus::Starting => "starting",
                _ => "processing",
            };
            if !emit(sink, json!({"id": id, "status": status, "progress": progress})).await {
                tracing::info!("[⚙️  -> 🖥️ ] Client left while {} was running", id);
                self.cancel(&handle, token).await;
                return PredictionOutcome::ConsumerGone;
            }
        }
    }

    async fn expire(
        &self,
        handle: &PredictionHandle,
        token: &str,
        sink: &mut OutputSink,
    ) -> PredictionOutcome {
        tracing::error!(
            "[☁️  -> ⚙️ ] Prediction {} did not finish within {:?}",
            handle.id(),
            self.policy.timeout
        );
        self.cancel(handle, token).await;
        fail(sink, handle.id(), PredictionFailure::TimedOut(self.policy.timeout)).await
    }

    async fn fetch(&self, url: &str, token: &str) -> Result<Prediction> {
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArtsparkError::Upstream(
                status,
                crate::str_utils::prefix_chars(&body, 200).to_string(),
            )
            .into());
        }
        let prediction = response
            .json::<Prediction>()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;
        Ok(prediction)
    }

    /// Best effort; the verdict already sent to the client does not depend on it.
    async fn cancel(&self, handle: &PredictionHandle, token: &str) {
        let request = self.client.post(&handle.cancel_url).bearer_auth(token).send();
        match tokio::time::timeout(self.policy.poll_interval.max(Duration::from_secs(1)), request).await {
            Ok(Ok(response)) if response.status().is_success() => {
                tracing::info!("[⚙️  -> ☁️ ] Canceled prediction {}", handle.id());
            }
            Ok(Ok(response)) => {
                tracing::warn!("[☁️  -> ⚙️ ] Cancel for {} returned {}", handle.id(), response.status());
            }
            Ok(Err(e)) => tracing::warn!("[☁️  -> ⚙️ ] Cancel for {} failed: {}", handle.id(), e),
            Err(_) => tracing::warn!("[☁️  -> ⚙️ ] Cancel for {} timed out", handle.id()),
        }
    }
}

/// Returns `false` only when the consumer is gone.
async fn emit(sink: &mut OutputSink, event: Value) -> bool {
    let mut line = event.to_string();
    line.push('\n');
    sink.enqueue(Bytes::from(line)).await
}

async fn fail(sink: &mut OutputSink, id: &str, failure: PredictionFailure) -> PredictionOutcome {
    tracing::error!("[☁️  -> ⚙️ ] Prediction {} ended: {}", id, failure);
    let event = json!({
        "id": id,
        "status": "failed",
        "error": failure.user_message(),
        "error_type": failure.error_type(),
    });
    if !emit(sink, event).await {
        return PredictionOutcome::ConsumerGone;
    }
    sink.close();
    PredictionOutcome::Failed(failure)
}
