#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod client;
pub mod constants;
pub mod failover;
pub mod hardening;
pub mod health;
pub mod jobs;
pub mod logging;
pub mod main_helper;
pub mod ndjson;
pub mod predictions;
pub mod redaction;
pub mod redaction_layer;
pub mod relay;
pub mod server;
pub mod str_utils;
pub mod types;
pub mod watchdog;

pub use types::*;

pub use main_helper::{AppState, Args};
