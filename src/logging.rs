use crate::redaction_layer::RedactingMakeWriter;
use crate::types::{ArtsparkError, RequestId, Result};
use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::panic;
use std::path::Path;
use tracing::error;
use tracing::{info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const LOG_FILE_NAME: &str = "artspark.log";
const DEFAULT_FILTER: &str = "artspark=debug,tower_http=info";

/// Installs the global subscriber: env filter, stderr output (human or JSON),
/// a redacted daily log file and the span-trace error layer. Keep the returned
/// guard alive for the life of the process or buffered file lines are lost.
pub fn init_tracing(log_dir: &Path, json: bool) -> Result<WorkerGuard> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_FILTER.into(),
    };

    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let (human, structured) = if json {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
        )
    } else {
        (
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(human)
        .with(structured)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(RedactingMakeWriter::new(non_blocking))
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .map_err(|e| ArtsparkError::Internal(format!("failed to install tracing subscriber: {}", e)))?;

    Ok(guard)
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Echoes the caller's `x-request-id` (or mints one) on both the request and
/// the response, and runs the handler inside a span tagged with it.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(|v| RequestId::from(v.to_string()))
        .unwrap_or_default();

    let header = HeaderValue::from_str(&request_id.0).ok();
    if let Some(val) = header.clone() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!(
        "request",
        request_id = %request_id.short(),
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut response = next.run(req).instrument(span).await;
    if let Some(val) = header {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}
