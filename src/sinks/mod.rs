//! Remote log sinks.
//!
//! Two services receive container output: a grouped log-stream service
//! (log groups holding ordered streams, appended to with a continuation
//! token) and a sharded stream service (batches of keyed records with a
//! per-record result). Both are reached through small traits so the
//! delivery engine never depends on the wire protocol.

mod aws;
mod cloudwatch;
mod kinesis;
pub mod sigv4;

pub use cloudwatch::CloudWatchLogs;
pub use kinesis::KinesisStreams;

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The continuation token did not match the stream's expected token.
    #[error("Sequence token rejected: {0}")]
    TokenRejected(String),
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Not authorized: {0}")]
    Auth(String),
    #[error("Throttled: {0}")]
    Throttled(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("{code}: {message}")]
    Api { code: String, message: String },
    #[error("Unable to decode response: {0}")]
    Decode(String),
}

impl SinkError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Short name used in metric lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenRejected(_) => "token_rejected",
            Self::NotFound(_) => "not_found",
            Self::Auth(_) => "auth",
            Self::Throttled(_) => "throttled",
            Self::Timeout => "timeout",
            Self::Transport(_) => "transport",
            Self::Api { .. } => "api",
            Self::Decode(_) => "decode",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStreamInfo {
    pub name: String,
    pub upload_sequence_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub message: String,
    pub timestamp_ms: i64,
}

/// Events the service accepted the call for but did not store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RejectedEvents {
    pub too_new_start_index: Option<i64>,
    pub too_old_end_index: Option<i64>,
    pub expired_end_index: Option<i64>,
}

impl RejectedEvents {
    /// Number of events the indices cover in a batch of `len` events.
    pub fn count(&self, len: usize) -> usize {
        let len = len as i64;
        let mut old_end = -1;
        if let Some(end) = self.too_old_end_index {
            old_end = old_end.max(end);
        }
        if let Some(end) = self.expired_end_index {
            old_end = old_end.max(end);
        }
        let too_old = (old_end + 1).clamp(0, len);
        let too_new = self
            .too_new_start_index
            .map_or(0, |start| (len - start.clamp(0, len)).max(0));
        (too_old + too_new).min(len) as usize
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    pub next_token: Option<String>,
    pub rejected: Option<RejectedEvents>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub data: Bytes,
    pub partition_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordResult {
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl RecordResult {
    pub fn is_failure(&self) -> bool {
        self.error_code.is_some()
    }
}

/// Grouped log-stream service.
#[async_trait]
pub trait LogGroupApi: Send + Sync {
    /// Streams in `group` whose name starts with `prefix`.
    async fn describe_streams(
        &self,
        group: &str,
        prefix: &str,
    ) -> Result<Vec<LogStreamInfo>, SinkError>;

    /// Creating a stream that already exists succeeds.
    async fn create_stream(&self, group: &str, stream: &str) -> Result<(), SinkError>;

    /// Append events in order. `token` is omitted for a stream that has
    /// never been written to.
    async fn append_events(
        &self,
        group: &str,
        stream: &str,
        events: &[LogEvent],
        token: Option<&str>,
    ) -> Result<AppendOutcome, SinkError>;
}

/// Sharded stream service.
#[async_trait]
pub trait StreamApi: Send + Sync {
    /// One result per record, in request order.
    async fn put_batch(
        &self,
        stream: &str,
        records: &[StreamRecord],
    ) -> Result<Vec<RecordResult>, SinkError>;
}
