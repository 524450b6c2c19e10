use crate::constants::{
    ENDPOINT_SWITCH_DELAY_SECS, SERVER_ERROR_BACKOFF_SECS, TRANSPORT_ERROR_BACKOFF_SECS,
    UPSTREAM_MAX_RETRIES, UPSTREAM_REQUEST_TIMEOUT_SECS,
};
use crate::hardening::{linear_backoff, RetryState};
use crate::types::{ArtsparkError, Result, TransportError, TransportErrorKind};
use std::fmt;
use std::time::Duration;

/// Ordered, non-empty list of upstream URLs. The first success wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointList(Vec<String>);

impl EndpointList {
    pub fn new<I, S>(endpoints: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints: Vec<String> = endpoints
            .into_iter()
            .map(Into::into)
            .filter(|e: &String| !e.trim().is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(ArtsparkError::Configuration(
                "endpoint list must contain at least one upstream URL".to_string(),
            )
            .into());
        }
        Ok(Self(endpoints))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn primary(&self) -> &str {
        &self.0[0]
    }
}

#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    /// Extra attempts per endpoint after the first.
    pub max_retries: u32,
    /// Deadline for one attempt to produce response headers.
    pub request_timeout: Duration,
    /// Backoff step after a 5xx.
    pub server_error_backoff: Duration,
    /// Backoff step after a transport failure.
    pub transport_error_backoff: Duration,
    /// Pause before moving to the next endpoint.
    pub endpoint_switch_delay: Duration,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            max_retries: UPSTREAM_MAX_RETRIES,
            request_timeout: Duration::from_secs(UPSTREAM_REQUEST_TIMEOUT_SECS),
            server_error_backoff: Duration::from_secs(SERVER_ERROR_BACKOFF_SECS),
            transport_error_backoff: Duration::from_secs(TRANSPORT_ERROR_BACKOFF_SECS),
            endpoint_switch_delay: Duration::from_secs(ENDPOINT_SWITCH_DELAY_SECS),
        }
    }
}

/// Why a single attempt did not produce a usable response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    Transport {
        endpoint: String,
        error: TransportError,
    },
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status {
                endpoint,
                status,
                body,
            } => write!(
                f,
                "{} returned {}: {}",
                endpoint,
                status,
                crate::str_utils::prefix_chars(body, 300)
            ),
            Self::Transport { endpoint, error } => write!(f, "{} failed: {}", endpoint, error),
        }
    }
}

/// Obtains a successful upstream response by walking an [`EndpointList`] with
/// bounded per-endpoint retries.
#[derive(Clone)]
pub struct FailoverRequester {
    client: reqwest::Client,
    policy: FailoverPolicy,
}

impl FailoverRequester {
    pub fn new(client: reqwest::Client, policy: FailoverPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &FailoverPolicy {
        &self.policy
    }

    #[tracing::instrument(name = "upstream.failover", skip_all, fields(endpoints = endpoints.len()))]
    pub async fn send(
        &self,
        endpoints: &EndpointList,
        body: &serde_json::Value,
        credential: &str,
    ) -> Result<reqwest::Response> {
        let mut total_attempts = 0u32;
        let mut last_failure: Option<AttemptFailure> = None;

        for (index, endpoint) in endpoints.iter().enumerate() {
            let mut retry: RetryState<AttemptFailure> = RetryState::new(self.policy.max_retries);

            while retry.has_remaining() {
                let attempt = retry.begin_attempt();
                total_attempts += 1;
                tracing::info!(
                    "[⚙️  -> ☁️ ] Endpoint {}/{} {} (attempt {}/{})",
                    index + 1,
                    endpoints.len(),
                    endpoint,
                    attempt,
                    retry.max_attempts()
                );

                match self.attempt(endpoint, body, credential).await {
                    Ok(response) if response.status().is_success() => {
                        tracing::info!("[☁️  -> ⚙️ ] {} connected ({})", endpoint, response.status());
                        return Ok(response);
                    }
                    Ok(response) => {
                        let status = response.status();
                        let body = match response.text().await {
                            Ok(text) => text,
                            Err(e) => format!("(body unreadable: {})", e),
                        };
                        tracing::warn!(
                            "[☁️  -> ⚙️ ] {} returned {}: {}",
                            endpoint,
                            status,
                            crate::str_utils::prefix_chars(&body, 200)
                        );
                        retry.record_failure(AttemptFailure::Status {
                            endpoint: endpoint.to_string(),
                            status: status.as_u16(),
                            body,
                        });
                        if status.is_server_error() && retry.has_remaining() {
                            let delay = linear_backoff(self.policy.server_error_backoff, attempt);
                            tracing::info!("Server error, retrying {} in {:?}", endpoint, delay);
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        break;
                    }
                    Err(error) => {
                        tracing::warn!("[☁️  -> ⚙️ ] {} unreachable: {}", endpoint, error);
                        retry.record_failure(AttemptFailure::Transport {
                            endpoint: endpoint.to_string(),
                            error,
                        });
                        if retry.has_remaining() {
                            let delay =
                                linear_backoff(self.policy.transport_error_backoff, attempt);
                            tracing::info!("Network error, retrying {} in {:?}", endpoint, delay);
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        break;
                    }
                }
            }

            if let Some(failure) = retry.into_last_error() {
                last_failure = Some(failure);
            }

            if index + 1 < endpoints.len() {
                tracing::info!(
                    "Switching to next endpoint in {:?}",
                    self.policy.endpoint_switch_delay
                );
                tokio::time::sleep(self.policy.endpoint_switch_delay).await;
            }
        }

        let last = match last_failure {
            Some(failure) => failure.to_string(),
            None => "no attempt was made".to_string(),
        };
        tracing::error!(
            "[☁️  -> ⚙️ ] All {} endpoints failed after {} attempts: {}",
            endpoints.len(),
            total_attempts,
            last
        );
        Err(ArtsparkError::AllEndpointsFailed {
            attempts: total_attempts,
            last,
        }
        .into())
    }

    /// One time-bounded request. Dropping the send future on deadline cancels it.
    async fn attempt(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
        credential: &str,
    ) -> std::result::Result<reqwest::Response, TransportError> {
        let request = self
            .client
            .post(endpoint)
            .bearer_auth(credential)
            .json(body)
            .send();

        match tokio::time::timeout(self.policy.request_timeout, request).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(TransportError::from_reqwest(&e)),
            Err(_) => Err(TransportError::new(
                TransportErrorKind::Timeout,
                format!("no response within {:?}", self.policy.request_timeout),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_endpoint_list_is_rejected() {
        let err = EndpointList::new(Vec::<String>::new()).expect_err("empty list must fail");
        assert!(matches!(err.inner, ArtsparkError::Configuration(_)));

        let err = EndpointList::new(["  "]).expect_err("blank entries are dropped");
        assert!(matches!(err.inner, ArtsparkError::Configuration(_)));
    }

    #[test]
    fn test_endpoint_order_is_preserved() {
        let list = EndpointList::new(["http://a", "http://b"]).expect("valid list");
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["http://a", "http://b"]);
        assert_eq!(list.primary(), "http://a");
    }

    #[test]
    fn test_status_failure_display_includes_code() {
        let failure = AttemptFailure::Status {
            endpoint: "http://a".to_string(),
            status: 503,
            body: "overloaded".to_string(),
        };
        assert_eq!(failure.to_string(), "http://a returned 503: overloaded");
    }
}
