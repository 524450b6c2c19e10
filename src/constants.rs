/// Upstream draw endpoints. The overseas host is reachable from most networks,
/// the domestic host is faster from mainland China.
pub const GRSAI_OVERSEAS_ENDPOINT: &str = "https://api.grsai.com/v1/draw/completions";
pub const GRSAI_DOMESTIC_ENDPOINT: &str = "https://grsai.dakka.com.cn/v1/draw/completions";

/// Prediction API used by age-transform jobs
pub const REPLICATE_PREDICTIONS_ENDPOINT: &str = "https://api.replicate.com/v1/predictions";

/// Environment variables read at request time
pub const API_KEY_ENV: &str = "GRSAI_API_KEY";
pub const API_URL_ENV: &str = "GRSAI_API_URL";
pub const REPLICATE_TOKEN_ENV: &str = "REPLICATE_API_TOKEN";
pub const REPLICATE_URL_ENV: &str = "REPLICATE_API_URL";

/// Upstream model identifiers
pub const IMAGE_MODEL: &str = "sora-image";
pub const AGE_TRANSFORM_MODEL: &str =
    "yuval-alaluf/sam:9222a21c181b707209ef12b5e0d7e94c994b58f01c7b2fec075d2e892362f13c";

/// Prediction polling defaults
pub const PREDICTION_POLL_INTERVAL_SECS: u64 = 2;
pub const PREDICTION_TIMEOUT_SECS: u64 = 300;

/// Failover requester defaults
pub const UPSTREAM_MAX_RETRIES: u32 = 2;
pub const UPSTREAM_REQUEST_TIMEOUT_SECS: u64 = 90;
pub const UPSTREAM_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const SERVER_ERROR_BACKOFF_SECS: u64 = 2;
pub const TRANSPORT_ERROR_BACKOFF_SECS: u64 = 3;
pub const ENDPOINT_SWITCH_DELAY_SECS: u64 = 2;

/// Relay stall detection and reconnect defaults
pub const RELAY_STALL_TIMEOUT_SECS: u64 = 120;
pub const STALL_CHECK_INTERVAL_SECS: u64 = 10;
pub const RELAY_MAX_RECONNECTS: u32 = 3;
pub const RELAY_RECONNECT_BACKOFF_SECS: u64 = 2;
pub const RELAY_CHANNEL_CAPACITY: usize = 64;
pub const HEARTBEAT_LOG_EVERY: usize = 10;

/// Client poller defaults
pub const CLIENT_MAX_RETRIES: u32 = 2;
pub const CLIENT_REQUEST_TIMEOUT_SECS: u64 = 120;
pub const CLIENT_STALL_TIMEOUT_SECS: u64 = 60;

/// NDJSON decoding
pub const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;
pub const SSE_DATA_PREFIX: &str = "data:";

/// Request body limit for the relay endpoints (reference images are inlined as data URLs)
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Age-transform image constraints
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const SUPPORTED_IMAGE_FORMATS: &[&str] = &["jpeg", "jpg", "png", "webp"];

/// Portrait aspect ratios accepted by the upstream `size` field
pub const SUPPORTED_ASPECT_RATIOS: &[&str] = &["1:1", "2:3", "3:2"];
pub const DEFAULT_ASPECT_RATIO: &str = "1:1";

/// Read-error markers that mean the remote side hung up
pub const REMOTE_CLOSURE_MARKERS: &[&str] = &[
    "terminated",
    "closed",
    "aborted",
    "disconnected",
    "reset",
    "broken pipe",
    "unexpected eof",
];

/// Failure-message markers used to classify `failed` events
pub const TRANSIENT_FAILURE_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "unstable",
    "网络",
    "连接",
    "超时",
];
pub const QUOTA_FAILURE_MARKERS: &[&str] = &[
    "quota",
    "limit",
    "429",
    "too many",
    "额度",
    "请求过多",
];
