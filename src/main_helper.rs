use crate::client::PollerConfig;
use crate::constants::*;
use crate::failover::{FailoverPolicy, FailoverRequester};
use crate::jobs::{
    AgeTransformPayload, AnimalLandmarkPayload, GenerationRequest, JobKind, JobPayload,
    PortraitPayload, Provider,
};
use crate::predictions::{PredictionPolicy, PredictionWatcher};
use crate::relay::{RelayConfig, StreamRelay};
use crate::types::*;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
    /// Emit JSON log lines on stderr instead of human-readable ones.
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,
    #[arg(long, global = true, default_value = "logs")]
    pub log_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server.
    Serve(ServeArgs),
    /// Submit one job to a running relay and follow it to completion.
    Generate(GenerateArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value_t = UPSTREAM_REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = UPSTREAM_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = UPSTREAM_MAX_RETRIES)]
    pub max_retries: u32,
    #[arg(long, default_value_t = RELAY_STALL_TIMEOUT_SECS)]
    pub stall_timeout_secs: u64,
    #[arg(long, default_value_t = MAX_BODY_SIZE)]
    pub max_body_size: usize,
    /// Front-end assets served for any path the API does not claim.
    #[arg(long)]
    pub static_dir: Option<PathBuf>,
    /// Environment variable holding the provider API key.
    #[arg(long, default_value = API_KEY_ENV)]
    pub api_key_env: String,
    /// Environment variable holding an optional endpoint override.
    #[arg(long, default_value = API_URL_ENV)]
    pub api_url_env: String,
    /// Environment variable holding the prediction API token (age-transform).
    #[arg(long, default_value = REPLICATE_TOKEN_ENV)]
    pub prediction_token_env: String,
    /// Environment variable holding an optional prediction endpoint override.
    #[arg(long, default_value = REPLICATE_URL_ENV)]
    pub prediction_url_env: String,
    /// Overall budget for one prediction, from creation to verdict.
    #[arg(long, default_value_t = PREDICTION_TIMEOUT_SECS)]
    pub prediction_timeout_secs: u64,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: UPSTREAM_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: UPSTREAM_CONNECT_TIMEOUT_SECS,
            max_retries: UPSTREAM_MAX_RETRIES,
            stall_timeout_secs: RELAY_STALL_TIMEOUT_SECS,
            max_body_size: MAX_BODY_SIZE,
            static_dir: None,
            api_key_env: API_KEY_ENV.to_string(),
            api_url_env: API_URL_ENV.to_string(),
            prediction_token_env: REPLICATE_TOKEN_ENV.to_string(),
            prediction_url_env: REPLICATE_URL_ENV.to_string(),
            prediction_timeout_secs: PREDICTION_TIMEOUT_SECS,
        }
    }
}

impl ServeArgs {
    pub fn failover_policy(&self) -> FailoverPolicy {
        FailoverPolicy {
            max_retries: self.max_retries,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            ..FailoverPolicy::default()
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            ..RelayConfig::default()
        }
    }

    pub fn prediction_policy(&self) -> PredictionPolicy {
        PredictionPolicy {
            timeout: Duration::from_secs(self.prediction_timeout_secs),
            ..PredictionPolicy::default()
        }
    }

    /// Credential and override variable names for `provider`.
    pub fn env_names(&self, provider: Provider) -> (&str, &str) {
        match provider {
            Provider::Grsai => (self.api_key_env.as_str(), self.api_url_env.as_str()),
            Provider::Replicate => (
                self.prediction_token_env.as_str(),
                self.prediction_url_env.as_str(),
            ),
        }
    }
}

/// Builds the upstream HTTP client. No whole-request timeout is set; attempts
/// are bounded by the failover policy and body reads by the stall check.
pub fn build_http_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
        .map_err(|e| ArtsparkError::Configuration(format!("failed to build HTTP client: {}", e)).into())
}

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub args: Arc<ServeArgs>,
    pub failover: FailoverRequester,
    pub relay: StreamRelay,
    pub predictions: PredictionWatcher,
}

impl AppState {
    pub fn new(args: ServeArgs) -> Result<Self> {
        let client = build_http_client(Duration::from_secs(args.connect_timeout_secs))?;
        Ok(Self::with_client(client, args))
    }

    pub fn with_client(client: reqwest::Client, args: ServeArgs) -> Self {
        let failover = FailoverRequester::new(client.clone(), args.failover_policy());
        let relay = StreamRelay::new(args.relay_config());
        let predictions = PredictionWatcher::new(client.clone(), args.prediction_policy());
        Self {
            client,
            args: Arc::new(args),
            failover,
            relay,
            predictions,
        }
    }

    /// Replaces the failover policy, e.g. to shrink backoff delays.
    pub fn with_failover_policy(mut self, policy: FailoverPolicy) -> Self {
        self.failover = FailoverRequester::new(self.client.clone(), policy);
        self
    }

    pub fn with_relay_config(mut self, config: RelayConfig) -> Self {
        self.relay = StreamRelay::new(config);
        self
    }

    pub fn with_prediction_policy(mut self, policy: PredictionPolicy) -> Self {
        self.predictions = PredictionWatcher::new(self.client.clone(), policy);
        self
    }
}

/// One provider's credential and endpoint override, read from the environment
/// per request so a rotated key takes effect without a restart.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub api_key: String,
    pub override_url: Option<String>,
}

impl UpstreamSettings {
    pub fn from_env(args: &ServeArgs, provider: Provider) -> Result<Self> {
        let (key_env, url_env) = args.env_names(provider);
        let api_key = match std::env::var(key_env) {
            Ok(k) if !k.trim().is_empty() => k.trim().to_string(),
            _ => {
                return Err(ArtsparkError::Configuration(format!(
                    "API key is not configured, set the {} environment variable on the server",
                    key_env
                ))
                .into())
            }
        };
        let override_url = std::env::var(url_env)
            .ok()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());
        Ok(Self {
            api_key,
            override_url,
        })
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct GenerateArgs {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub relay_url: String,
    /// portrait | animal-landmark | age-transform
    #[arg(long, value_parser = parse_job_kind)]
    pub kind: JobKind,
    #[arg(long)]
    pub description: Option<String>,
    /// Reference image as a data URL.
    #[arg(long)]
    pub reference_image: Option<String>,
    #[arg(long)]
    pub aspect_ratio: Option<String>,
    #[arg(long)]
    pub animal: Option<String>,
    #[arg(long)]
    pub landmark: Option<String>,
    /// Source image as a data URL.
    #[arg(long)]
    pub image: Option<String>,
    /// "default" or an age in years.
    #[arg(long)]
    pub target_age: Option<String>,
    #[arg(long, default_value_t = CLIENT_MAX_RETRIES)]
    pub max_retries: u32,
    #[arg(long, default_value_t = CLIENT_STALL_TIMEOUT_SECS)]
    pub stall_timeout_secs: u64,
    #[arg(long, default_value_t = CLIENT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,
}

fn parse_job_kind(s: &str) -> std::result::Result<JobKind, String> {
    s.parse::<JobKind>().map_err(|e| e.to_string())
}

impl GenerateArgs {
    pub fn to_request(&self) -> Result<GenerationRequest> {
        let payload = match self.kind {
            JobKind::Portrait => JobPayload::Portrait(PortraitPayload {
                character_description: self.description.clone(),
                reference_image: self.reference_image.clone(),
                aspect_ratio: self.aspect_ratio.clone(),
            }),
            JobKind::AnimalLandmark => JobPayload::AnimalLandmark(AnimalLandmarkPayload {
                animal_type: self.animal.clone(),
                landmark: self.landmark.clone(),
            }),
            JobKind::AgeTransform => JobPayload::AgeTransform(AgeTransformPayload {
                image: self.image.clone(),
                target_age: self.target_age.as_deref().map(|age| match age.trim().parse::<u32>() {
                    Ok(years) => serde_json::Value::from(years),
                    Err(_) => serde_json::Value::String(age.trim().to_string()),
                }),
            }),
        };
        GenerationRequest::new(payload)
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            max_retries: self.max_retries,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            ..PollerConfig::default()
        }
    }
}
