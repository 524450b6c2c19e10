//! Re-streams an upstream SSE/NDJSON body as normalized NDJSON.
//!
//! One relay invocation is one task. The task owns the decode buffer, the
//! upstream stream, the [`StallWatch`] and the [`OutputSink`], and multiplexes
//! the read loop with the stall check through `select!`, so the last-activity
//! timestamp and the sink state are never shared.

use crate::constants::{
    HEARTBEAT_LOG_EVERY, RELAY_CHANNEL_CAPACITY, RELAY_MAX_RECONNECTS,
    RELAY_RECONNECT_BACKOFF_SECS, RELAY_STALL_TIMEOUT_SECS, STALL_CHECK_INTERVAL_SECS,
};
use crate::hardening::linear_backoff;
use crate::ndjson::{parse_line, NdjsonBuffer};
use crate::types::{RelayError, TransportError, TransportErrorKind};
use crate::watchdog::StallWatch;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

pub type RelayItem = std::result::Result<Bytes, RelayError>;
pub type UpstreamStream = BoxStream<'static, std::result::Result<Bytes, TransportError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Open,
    /// Clean end of stream, or the consumer hung up.
    Closed,
    Errored,
}

/// Output side of a relay. `enqueue`, `close` and `error` are guarded
/// transitions: once the sink leaves `Open` every further call is a logged
/// no-op returning `false`.
#[derive(Debug)]
pub struct OutputSink {
    tx: Option<mpsc::Sender<RelayItem>>,
    state: SinkState,
}

impl OutputSink {
    pub fn new(tx: mpsc::Sender<RelayItem>) -> Self {
        Self {
            tx: Some(tx),
            state: SinkState::Open,
        }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RelayItem>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SinkState::Open
    }

    pub async fn enqueue(&mut self, bytes: Bytes) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            tracing::debug!("[RELAY] enqueue ignored, sink is {:?}", self.state);
            return false;
        };
        if tx.send(Ok(bytes)).await.is_err() {
            tracing::debug!("[RELAY] consumer dropped the stream");
            self.tx = None;
            self.state = SinkState::Closed;
            return false;
        }
        true
    }

    pub fn close(&mut self) -> bool {
        if self.tx.take().is_none() {
            tracing::debug!("[RELAY] close ignored, sink is {:?}", self.state);
            return false;
        }
        self.state = SinkState::Closed;
        true
    }

    pub async fn error(&mut self, error: RelayError) -> bool {
        let Some(tx) = self.tx.take() else {
            tracing::debug!(
                "[RELAY] error ignored, sink is {:?}: {}",
                self.state,
                error
            );
            return false;
        };
        self.state = SinkState::Errored;
        if tx.send(Err(error)).await.is_err() {
            tracing::debug!("[RELAY] consumer gone before the error was delivered");
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub stall_timeout: Duration,
    pub check_interval: Duration,
    /// Remote closures tolerated in a row before the stream is declared interrupted.
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub channel_capacity: usize,
    pub heartbeat_every: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(RELAY_STALL_TIMEOUT_SECS),
            check_interval: Duration::from_secs(STALL_CHECK_INTERVAL_SECS),
            max_reconnect_attempts: RELAY_MAX_RECONNECTS,
            reconnect_backoff: Duration::from_secs(RELAY_RECONNECT_BACKOFF_SECS),
            channel_capacity: RELAY_CHANNEL_CAPACITY,
            heartbeat_every: HEARTBEAT_LOG_EVERY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed { lines: usize },
    Errored(RelayError),
    ConsumerGone,
}

#[derive(Debug, Clone, Default)]
pub struct StreamRelay {
    config: RelayConfig,
}

impl StreamRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Spawns the relay task and returns the normalized stream.
    pub fn spawn<S>(&self, upstream: S) -> ReceiverStream<RelayItem>
    where
        S: Stream<Item = std::result::Result<Bytes, TransportError>> + Unpin + Send + 'static,
    {
        let (mut sink, rx) = OutputSink::channel(self.config.channel_capacity);
        let relay = self.clone();
        tokio::spawn(
            async move {
                let outcome = relay.run(upstream, &mut sink).await;
                tracing::debug!("[RELAY] finished: {:?}", outcome);
            }
            .instrument(tracing::Span::current()),
        );
        ReceiverStream::new(rx)
    }

    /// Drives `upstream` into `sink` until a terminal transition. The upstream
    /// stream and the stall check are dropped on every return path.
    pub async fn run<S>(&self, mut upstream: S, sink: &mut OutputSink) -> RelayOutcome
    where
        S: Stream<Item = std::result::Result<Bytes, TransportError>> + Unpin,
    {
        let mut buffer = NdjsonBuffer::new();
        let mut watch = StallWatch::new(self.config.stall_timeout, self.config.check_interval);
        let mut forwarded = 0usize;
        let mut interruptions = 0u32;

        loop {
            let next = tokio::select! {
                biased;
                item = upstream.next() => item,
                idle = watch.stalled() => {
                    let error = RelayError::Stalled { idle_secs: idle.as_secs() };
                    tracing::error!("[☁️  -> ⚙️ ] Upstream stalled for {:?}, aborting relay", idle);
                    sink.error(error.clone()).await;
                    return RelayOutcome::Errored(error);
                }
            };

            match next {
                Some(Ok(chunk)) => {
                    watch.touch();
                    if interruptions > 0 {
                        tracing::info!("[☁️  -> ⚙️ ] Upstream resumed after {} interruption(s)", interruptions);
                        interruptions = 0;
                    }
                    for line in buffer.push_chunk(&chunk) {
                        if !self.forward(&line, sink, &mut forwarded).await {
                            return RelayOutcome::ConsumerGone;
                        }
                    }
                }
                Some(Err(error)) => match error.kind {
                    TransportErrorKind::RemoteClosed => {
                        interruptions += 1;
                        if interruptions > self.config.max_reconnect_attempts {
                            let error = RelayError::Interrupted {
                                attempts: interruptions,
                            };
                            tracing::error!("[☁️  -> ⚙️ ] {}", error);
                            sink.error(error.clone()).await;
                            return RelayOutcome::Errored(error);
                        }
                        let delay = linear_backoff(self.config.reconnect_backoff, interruptions);
                        tracing::warn!(
                            "[☁️  -> ⚙️ ] Upstream closed ({}), waiting {:?} before reading again ({}/{})",
                            error.message,
                            delay,
                            interruptions,
                            self.config.max_reconnect_attempts
                        );
                        tokio::time::sleep(delay).await;
                    }
                    TransportErrorKind::Timeout => {
                        tracing::error!("[☁️  -> ⚙️ ] Upstream read timed out: {}", error.message);
                        sink.error(RelayError::Timeout).await;
                        return RelayOutcome::Errored(RelayError::Timeout);
                    }
                    TransportErrorKind::Connect | TransportErrorKind::Other => {
                        tracing::error!("[☁️  -> ⚙️ ] Upstream read failed: {}", error.message);
                        let error = RelayError::Network(error.message);
                        sink.error(error.clone()).await;
                        return RelayOutcome::Errored(error);
                    }
                },
                None => {
                    for line in buffer.finish() {
                        if !self.forward(&line, sink, &mut forwarded).await {
                            return RelayOutcome::ConsumerGone;
                        }
                    }
                    if interruptions > 0 {
                        let error = RelayError::Interrupted {
                            attempts: interruptions,
                        };
                        tracing::error!("[☁️  -> ⚙️ ] Upstream ended while disconnected: {}", error);
                        sink.error(error.clone()).await;
                        return RelayOutcome::Errored(error);
                    }
                    tracing::info!("[☁️  -> ⚙️ ] Upstream complete, {} lines relayed", forwarded);
                    sink.close();
                    return RelayOutcome::Completed { lines: forwarded };
                }
            }
        }
    }

    /// Returns `false` only when the consumer is gone.
    async fn forward(&self, line: &str, sink: &mut OutputSink, forwarded: &mut usize) -> bool {
        let value = match parse_line(line) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    "[☁️  -> ⚙️ ] Skipping malformed line ({}): {}",
                    e,
                    crate::str_utils::prefix_chars(line, 120)
                );
                return true;
            }
        };
        let mut bytes = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("[☁️  -> ⚙️ ] Failed to re-serialize line: {}", e);
                return true;
            }
        };
        bytes.push(b'\n');
        if !sink.enqueue(Bytes::from(bytes)).await {
            return false;
        }
        *forwarded += 1;
        if self.config.heartbeat_every > 0 && *forwarded % self.config.heartbeat_every == 0 {
            tracing::info!("[⚙️  -> 🖥️ ] Stream alive, {} lines relayed", forwarded);
        }
        true
    }
}

/// Adapts a streaming `reqwest` body, classifying read errors once.
pub fn upstream_stream(response: reqwest::Response) -> UpstreamStream {
    response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| TransportError::from_reqwest(&e)))
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_first_terminal_action_wins() {
        let (mut sink, mut rx) = OutputSink::channel(4);
        assert!(sink.enqueue(Bytes::from_static(b"{}\n")).await);
        assert!(sink.close());
        assert!(!sink.close());
        assert!(!sink.error(RelayError::Timeout).await);
        assert!(!sink.enqueue(Bytes::from_static(b"{}\n")).await);
        assert_eq!(sink.state(), SinkState::Closed);

        assert_eq!(rx.recv().await, Some(Ok(Bytes::from_static(b"{}\n"))));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_sink_error_then_close_is_ignored() {
        let (mut sink, mut rx) = OutputSink::channel(4);
        assert!(sink.error(RelayError::Timeout).await);
        assert!(!sink.close());
        assert_eq!(sink.state(), SinkState::Errored);
        assert_eq!(rx.recv().await, Some(Err(RelayError::Timeout)));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_enqueue_after_consumer_drop_closes_sink() {
        let (mut sink, rx) = OutputSink::channel(1);
        drop(rx);
        assert!(!sink.enqueue(Bytes::from_static(b"{}\n")).await);
        assert_eq!(sink.state(), SinkState::Closed);
    }
}
