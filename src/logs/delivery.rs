//! Periodic delivery of buffered lines to the remote sinks.
//!
//! A single task owns the continuation token cache, so tokens for one
//! stream are only ever used by one caller at a time.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use tokio::time::{Instant, MissedTickBehavior};

use super::buffer::{BufferedLine, DestinationKey, LineBuffer};
use crate::config::AgentConfig;
use crate::health::HealthSink;
use crate::sinks::{LogEvent, LogGroupApi, SinkError, StreamApi, StreamRecord};

const MAX_GROUPED_BATCH_BYTES: usize = 1_048_576;
const GROUPED_EVENT_OVERHEAD: usize = 26;
const MAX_GROUPED_BATCH_EVENTS: usize = 10_000;
const MAX_STREAM_BATCH_BYTES: usize = 5 * 1024 * 1024;
const MAX_STREAM_BATCH_RECORDS: usize = 500;
/// Pending lines across all keys above which a backlog is reported.
const BACKLOG_WARNING_LINES: usize = 100_000;
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub auth_failure_threshold: u32,
    /// The agent's own stream. Failures delivering it are only logged
    /// locally, which keeps them out of the buffer they came from.
    pub agent_stream: Option<DestinationKey>,
}

impl DeliveryConfig {
    pub fn new(config: &AgentConfig, agent_stream: Option<DestinationKey>) -> Self {
        Self {
            flush_interval: config.flush_interval(),
            batch_size: config.batch_size,
            auth_failure_threshold: config.auth_failure_threshold,
            agent_stream,
        }
    }
}

/// Counters since the engine started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub grouped_delivered: u64,
    pub grouped_dropped: u64,
    pub grouped_rejected: u64,
    pub token_conflicts: u64,
    pub stream_delivered: u64,
    pub stream_failed: u64,
    pub stream_dropped: u64,
}

impl fmt::Display for DeliveryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "grouped delivered={} dropped={} rejected={} token_conflicts={}, stream delivered={} failed={} dropped={}",
            self.grouped_delivered,
            self.grouped_dropped,
            self.grouped_rejected,
            self.token_conflicts,
            self.stream_delivered,
            self.stream_failed,
            self.stream_dropped
        )
    }
}

/// Outcome of delivering one drained batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct BatchReport {
    delivered: usize,
    dropped: usize,
    rejected: usize,
}

pub struct DeliveryEngine {
    config: DeliveryConfig,
    buffer: Arc<LineBuffer>,
    logs: Arc<dyn LogGroupApi>,
    streams: Arc<dyn StreamApi>,
    health: Arc<dyn HealthSink>,
    /// Known grouped streams and the token their next append must carry.
    /// A known stream that was never written to maps to `None`.
    tokens: HashMap<(String, String), Option<String>>,
    stats: DeliveryStats,
    auth_failures: u32,
    marked_unhealthy: bool,
    backlog_reported: bool,
}

impl DeliveryEngine {
    pub fn new(
        config: DeliveryConfig,
        buffer: Arc<LineBuffer>,
        logs: Arc<dyn LogGroupApi>,
        streams: Arc<dyn StreamApi>,
        health: Arc<dyn HealthSink>,
    ) -> Self {
        Self {
            config,
            buffer,
            logs,
            streams,
            health,
            tokens: HashMap::new(),
            stats: DeliveryStats::default(),
            auth_failures: 0,
            marked_unhealthy: false,
            backlog_reported: false,
        }
    }

    pub async fn run(mut self) {
        log::info!(
            "Delivery engine started, flushing every {:?}",
            self.config.flush_interval
        );
        let mut interval = tokio::time::interval(self.config.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_stats = Instant::now();
        loop {
            interval.tick().await;
            self.flush().await;
            if last_stats.elapsed() >= STATS_LOG_INTERVAL {
                last_stats = Instant::now();
                log::info!("Delivery totals: {}", self.stats);
            }
        }
    }

    /// Deliver one bounded batch for every key with pending lines.
    pub async fn flush(&mut self) {
        for key in self.buffer.non_empty_keys() {
            let batch = self.buffer.drain_up_to(&key, self.config.batch_size);
            if batch.is_empty() {
                continue;
            }
            match &key {
                DestinationKey::LogStream { group, stream } => {
                    let report = self.deliver_grouped(&key, group, stream, batch).await;
                    self.stats.grouped_delivered += report.delivered as u64;
                    self.stats.grouped_dropped += report.dropped as u64;
                    self.stats.grouped_rejected += report.rejected as u64;
                    self.report(
                        &key,
                        format!(
                            "container streamLogs group={group} stream={stream} count#CloudWatchLogsEvents={} count#CloudWatchLogsDropped={} count#CloudWatchLogsRejected={}",
                            report.delivered, report.dropped, report.rejected
                        ),
                    )
                    .await;
                }
                DestinationKey::Stream(name) => {
                    let report = self.deliver_stream(&key, name, batch).await;
                    self.stats.stream_delivered += report.delivered as u64;
                    self.stats.stream_failed += report.rejected as u64;
                    self.stats.stream_dropped += report.dropped as u64;
                    self.report(
                        &key,
                        format!(
                            "container streamLogs stream={name} count#KinesisRecordsSuccesses={} count#KinesisRecordsErrors={} count#KinesisRecordsDropped={}",
                            report.delivered, report.rejected, report.dropped
                        ),
                    )
                    .await;
                }
            }
            let left = self.buffer.pending(&key);
            if left > 0 {
                debug!("{key}: {left} lines left for the next tick");
            }
        }
        self.check_backlog().await;
    }

    /// The buffer never drops lines, so a stalled sink shows up here.
    async fn check_backlog(&mut self) {
        let pending = self.buffer.total_pending();
        if pending >= BACKLOG_WARNING_LINES {
            if !self.backlog_reported {
                self.backlog_reported = true;
                self.health
                    .log_operational(&format!(
                        "ns=agent at=backlog count#LogBacklog=1 sample#LinesPending={pending}"
                    ))
                    .await;
            }
        } else {
            self.backlog_reported = false;
        }
    }

    fn is_agent_stream(&self, key: &DestinationKey) -> bool {
        self.config.agent_stream.as_ref() == Some(key)
    }

    async fn report(&self, key: &DestinationKey, line: String) {
        if self.is_agent_stream(key) {
            debug!("{line}");
        } else {
            self.health.log_operational(&line).await;
        }
    }

    async fn report_error(&self, key: &DestinationKey, line: String) {
        if self.is_agent_stream(key) {
            warn!("{line}");
        } else {
            self.health.log_operational(&line).await;
        }
    }

    async fn note_result<T>(&mut self, result: &Result<T, SinkError>) {
        match result {
            Ok(_) => {
                self.auth_failures = 0;
                self.marked_unhealthy = false;
            }
            Err(e) if e.is_auth() => {
                self.auth_failures += 1;
                if self.auth_failures >= self.config.auth_failure_threshold
                    && !self.marked_unhealthy
                {
                    self.marked_unhealthy = true;
                    self.health.mark_unhealthy("logs", &e.to_string()).await;
                }
            }
            Err(_) => {}
        }
    }

    /// Token for the next append to `stream`, describing or creating the
    /// stream when it is not cached yet.
    async fn resolve_token(
        &mut self,
        key: &DestinationKey,
        group: &str,
        stream: &str,
    ) -> Result<Option<String>, SinkError> {
        let cache_key = (group.to_string(), stream.to_string());
        if let Some(token) = self.tokens.get(&cache_key) {
            return Ok(token.clone());
        }

        let described = self.logs.describe_streams(group, stream).await;
        self.note_result(&described).await;
        let existing = match described {
            Ok(streams) => streams.into_iter().find(|info| info.name == stream),
            Err(e) => {
                self.report_error(
                    key,
                    format!(
                        "ns=agent at=putCloudWatchLogs.DescribeLogStreams group={group} stream={stream} count#error.DescribeLogStreams=1 msg={:?}",
                        e.to_string()
                    ),
                )
                .await;
                return Err(e);
            }
        };

        let token = match existing {
            Some(info) => info.upload_sequence_token,
            None => {
                let created = self.logs.create_stream(group, stream).await;
                self.note_result(&created).await;
                if let Err(e) = created {
                    self.report_error(
                        key,
                        format!(
                            "ns=agent at=putCloudWatchLogs.CreateLogStream group={group} stream={stream} count#error.CreateLogStream=1 msg={:?}",
                            e.to_string()
                        ),
                    )
                    .await;
                    return Err(e);
                }
                None
            }
        };
        self.tokens.insert(cache_key, token.clone());
        Ok(token)
    }

    async fn deliver_grouped(
        &mut self,
        key: &DestinationKey,
        group: &str,
        stream: &str,
        batch: Vec<BufferedLine>,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let mut token = match self.resolve_token(key, group, stream).await {
            Ok(token) => token,
            Err(_) => {
                report.dropped = batch.len();
                return report;
            }
        };

        let events = to_log_events(batch);
        let chunks = chunk_ranges(
            &events,
            |event| event.message.len() + GROUPED_EVENT_OVERHEAD,
            MAX_GROUPED_BATCH_EVENTS,
            MAX_GROUPED_BATCH_BYTES,
        );

        for (n, range) in chunks.iter().enumerate() {
            let chunk = &events[range.clone()];
            let result = self
                .logs
                .append_events(group, stream, chunk, token.as_deref())
                .await;
            self.note_result(&result).await;

            match result {
                Ok(outcome) => {
                    let rejected = outcome
                        .rejected
                        .as_ref()
                        .map_or(0, |rejected| rejected.count(chunk.len()));
                    if rejected > 0 {
                        self.report_error(
                            key,
                            format!(
                                "ns=agent at=putCloudWatchLogs.PutLogEvents group={group} stream={stream} count#RejectedLogEvents={rejected} info={:?}",
                                outcome.rejected
                            ),
                        )
                        .await;
                    }
                    report.delivered += chunk.len() - rejected;
                    report.rejected += rejected;
                    token = outcome.next_token;
                    self.tokens
                        .insert((group.to_string(), stream.to_string()), token.clone());
                }
                Err(e) => {
                    let remaining: usize = chunks[n..].iter().map(|r| r.len()).sum();
                    report.dropped += remaining;
                    if let SinkError::TokenRejected(_) = e {
                        self.stats.token_conflicts += 1;
                        self.tokens.remove(&(group.to_string(), stream.to_string()));
                    }
                    self.report_error(
                        key,
                        format!(
                            "ns=agent at=putCloudWatchLogs.PutLogEvents group={group} stream={stream} count#error.PutLogEvents=1 kind={} msg={:?}",
                            e.kind(),
                            e.to_string()
                        ),
                    )
                    .await;
                    break;
                }
            }
        }
        report
    }

    async fn deliver_stream(
        &mut self,
        key: &DestinationKey,
        name: &str,
        batch: Vec<BufferedLine>,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let records = to_stream_records(batch);
        let chunks = chunk_ranges(
            &records,
            |record| record.data.len() + record.partition_key.len(),
            MAX_STREAM_BATCH_RECORDS,
            MAX_STREAM_BATCH_BYTES,
        );

        for range in chunks {
            let chunk = &records[range.clone()];
            let result = self.streams.put_batch(name, chunk).await;
            self.note_result(&result).await;

            match result {
                Ok(results) => {
                    let mut failed = 0;
                    for (index, record) in results.iter().enumerate() {
                        if record.is_failure() {
                            failed += 1;
                            warn!(
                                "Record {} of batch for stream {name} failed: {} - {}",
                                range.start + index,
                                record.error_code.as_deref().unwrap_or_default(),
                                record.error_message.as_deref().unwrap_or_default()
                            );
                        }
                    }
                    report.rejected += failed;
                    report.delivered += chunk.len().saturating_sub(failed);
                }
                Err(e) => {
                    report.dropped += chunk.len();
                    self.report_error(
                        key,
                        format!(
                            "container streamLogs stream={name} count#KinesisPutRecordsError=1 kind={} err={:?}",
                            e.kind(),
                            e.to_string()
                        ),
                    )
                    .await;
                }
            }
        }
        report
    }
}

/// Convert lines to events whose timestamps never decrease. The grouped
/// service rejects a batch that goes back in time.
fn to_log_events(batch: Vec<BufferedLine>) -> Vec<LogEvent> {
    let mut latest = i64::MIN;
    batch
        .into_iter()
        .map(|line| {
            latest = latest.max(line.timestamp_ms);
            LogEvent {
                message: String::from_utf8_lossy(&line.data).into_owned(),
                timestamp_ms: latest,
            }
        })
        .collect()
}

/// Each record gets its own partition key so records spread across shards.
fn to_stream_records(batch: Vec<BufferedLine>) -> Vec<StreamRecord> {
    let base = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    batch
        .into_iter()
        .enumerate()
        .map(|(index, line)| StreamRecord {
            data: line.data,
            partition_key: (base + index as i64).to_string(),
        })
        .collect()
}

/// Split `items` into consecutive ranges that respect both limits. An
/// item larger than `max_bytes` is sent on its own.
fn chunk_ranges<T>(
    items: &[T],
    size: impl Fn(&T) -> usize,
    max_items: usize,
    max_bytes: usize,
) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut bytes = 0;
    for (index, item) in items.iter().enumerate() {
        let item_bytes = size(item);
        let count = index - start;
        if count > 0 && (count >= max_items || bytes + item_bytes > max_bytes) {
            ranges.push(start..index);
            start = index;
            bytes = 0;
        }
        bytes += item_bytes;
    }
    if start < items.len() {
        ranges.push(start..items.len());
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::RejectedEvents;
    use crate::testing::{FakeLogGroups, FakeStreams, LogCall, RecordingHealth};

    const GROUP: &str = "myapp-staging-LogGroup-XYZ";
    const STREAM: &str = "web/abc123456789";

    struct Harness {
        buffer: Arc<LineBuffer>,
        logs: Arc<FakeLogGroups>,
        streams: Arc<FakeStreams>,
        health: Arc<RecordingHealth>,
        engine: DeliveryEngine,
    }

    fn harness() -> Harness {
        let buffer = Arc::new(LineBuffer::new());
        let logs = Arc::new(FakeLogGroups::default());
        let streams = Arc::new(FakeStreams::default());
        let health = Arc::new(RecordingHealth::default());
        let config = DeliveryConfig {
            flush_interval: Duration::from_millis(100),
            batch_size: 500,
            auth_failure_threshold: 3,
            agent_stream: None,
        };
        let engine = DeliveryEngine::new(
            config,
            buffer.clone(),
            logs.clone(),
            streams.clone(),
            health.clone(),
        );
        Harness {
            buffer,
            logs,
            streams,
            health,
            engine,
        }
    }

    fn grouped_key() -> DestinationKey {
        DestinationKey::LogStream {
            group: GROUP.to_string(),
            stream: STREAM.to_string(),
        }
    }

    fn push(h: &Harness, key: &DestinationKey, lines: &[&str]) {
        for (n, line) in lines.iter().enumerate() {
            h.buffer
                .enqueue(key, BufferedLine::new(1_000 + n as i64, line.to_string()));
        }
    }

    #[tokio::test]
    async fn test_new_stream_is_created_and_first_append_has_no_token() {
        let mut h = harness();
        push(&h, &grouped_key(), &["one", "two"]);

        h.engine.flush().await;

        let calls = h.logs.calls();
        assert_eq!(
            calls[0],
            LogCall::Describe {
                group: GROUP.to_string(),
                prefix: STREAM.to_string()
            }
        );
        assert_eq!(
            calls[1],
            LogCall::Create {
                group: GROUP.to_string(),
                stream: STREAM.to_string()
            }
        );
        let appends = h.logs.appends();
        assert_eq!(appends.len(), 1);
        assert_eq!(appends[0].3, None);
        assert_eq!(h.logs.messages(STREAM), vec!["one", "two"]);
        assert_eq!(h.engine.stats.grouped_delivered, 2);
    }

    #[tokio::test]
    async fn test_returned_token_is_used_next() {
        let mut h = harness();
        push(&h, &grouped_key(), &["one"]);
        h.engine.flush().await;
        push(&h, &grouped_key(), &["two"]);
        h.engine.flush().await;

        let appends = h.logs.appends();
        assert_eq!(appends.len(), 2);
        assert_eq!(appends[1].3.as_deref(), Some("token-1"));
        // Describe only happens once while the token stays valid.
        assert_eq!(h.logs.describes(), 1);
        assert_eq!(
            h.engine.tokens.get(&(GROUP.to_string(), STREAM.to_string())),
            Some(&Some("token-2".to_string()))
        );
    }

    #[tokio::test]
    async fn test_existing_stream_token_is_reused() {
        let mut h = harness();
        h.logs.add_stream(GROUP, "web/abc123456789-other", Some("wrong"));
        h.logs.add_stream(GROUP, STREAM, Some("49590"));
        push(&h, &grouped_key(), &["one"]);

        h.engine.flush().await;

        let appends = h.logs.appends();
        assert_eq!(appends[0].3.as_deref(), Some("49590"));
        assert!(!h
            .logs
            .calls()
            .iter()
            .any(|call| matches!(call, LogCall::Create { .. })));
    }

    #[tokio::test]
    async fn test_token_conflict_clears_cache_and_redescribes() {
        let mut h = harness();
        push(&h, &grouped_key(), &["one"]);
        h.engine.flush().await;

        // Another writer moves the stream on.
        h.logs.set_server_token(GROUP, STREAM, "elsewhere");
        push(&h, &grouped_key(), &["lost"]);
        h.engine.flush().await;

        assert_eq!(h.engine.stats.token_conflicts, 1);
        assert_eq!(h.engine.stats.grouped_dropped, 1);
        assert!(h.engine.tokens.is_empty());
        assert_eq!(h.buffer.total_pending(), 0);

        push(&h, &grouped_key(), &["three"]);
        h.engine.flush().await;

        assert_eq!(h.logs.describes(), 2);
        let appends = h.logs.appends();
        let last = appends.last().unwrap();
        assert_eq!(last.3.as_deref(), Some("elsewhere"));
        // The conflicting append was attempted but never stored.
        assert_eq!(h.logs.appends().len(), 3);
        assert_eq!(h.logs.messages(STREAM), vec!["one", "three"]);
        assert_eq!(h.engine.stats.grouped_delivered, 2);
        assert_eq!(
            h.health.operational_matching("count#error.PutLogEvents=1").len(),
            1
        );
    }

    #[tokio::test]
    async fn test_other_append_errors_keep_the_token() {
        let mut h = harness();
        push(&h, &grouped_key(), &["one"]);
        h.engine.flush().await;

        h.logs.push_append_error(SinkError::Timeout);
        push(&h, &grouped_key(), &["two"]);
        h.engine.flush().await;

        assert_eq!(
            h.engine.tokens.get(&(GROUP.to_string(), STREAM.to_string())),
            Some(&Some("token-1".to_string()))
        );
        assert_eq!(h.engine.stats.grouped_dropped, 1);
        assert_eq!(h.engine.stats.token_conflicts, 0);
    }

    #[tokio::test]
    async fn test_describe_failure_drops_batch() {
        let mut h = harness();
        h.logs.push_describe_error(SinkError::Throttled("slow down".to_string()));
        push(&h, &grouped_key(), &["one", "two"]);

        h.engine.flush().await;

        assert!(h.logs.appends().is_empty());
        assert_eq!(h.engine.stats.grouped_dropped, 2);
        assert_eq!(
            h.health.operational_matching("count#error.DescribeLogStreams=1").len(),
            1
        );
    }

    #[tokio::test]
    async fn test_drains_at_most_batch_size_per_tick() {
        let mut h = harness();
        for n in 0..750 {
            h.buffer
                .enqueue(&grouped_key(), BufferedLine::new(n, format!("line {n}")));
        }

        h.engine.flush().await;
        assert_eq!(h.logs.messages(STREAM).len(), 500);
        assert_eq!(h.buffer.pending(&grouped_key()), 250);

        h.engine.flush().await;
        let messages = h.logs.messages(STREAM);
        assert_eq!(messages.len(), 750);
        assert_eq!(messages[500], "line 500");
    }

    #[tokio::test]
    async fn test_rejected_events_are_counted() {
        let mut h = harness();
        h.logs.reject_next(RejectedEvents {
            too_old_end_index: Some(0),
            ..Default::default()
        });
        push(&h, &grouped_key(), &["old", "fine"]);

        h.engine.flush().await;

        assert_eq!(h.engine.stats.grouped_rejected, 1);
        assert_eq!(h.engine.stats.grouped_delivered, 1);
    }

    #[tokio::test]
    async fn test_stream_batch_keeps_order_and_counts_failures() {
        let mut h = harness();
        let key = DestinationKey::Stream("myapp-staging-Kinesis-ABC".to_string());
        h.streams.fail_records(&[1]);
        push(&h, &key, &["a", "b", "c"]);

        h.engine.flush().await;

        let records = h.streams.records("myapp-staging-Kinesis-ABC");
        let data: Vec<&[u8]> = records.iter().map(|r| r.data.as_ref()).collect();
        assert_eq!(data, vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
        let mut keys: Vec<&String> = records.iter().map(|r| &r.partition_key).collect();
        keys.dedup();
        assert_eq!(keys.len(), 3);
        assert_eq!(h.engine.stats.stream_failed, 1);
        assert_eq!(h.engine.stats.stream_delivered, 2);

        // A later batch is not affected by earlier failures.
        h.streams.fail_records(&[]);
        push(&h, &key, &["d"]);
        h.engine.flush().await;
        assert_eq!(h.streams.batches().len(), 2);
        assert_eq!(h.streams.batches()[1].1.len(), 1);
    }

    #[tokio::test]
    async fn test_one_sink_failing_does_not_block_the_other() {
        let mut h = harness();
        let stream_key = DestinationKey::Stream("myapp-staging-Kinesis-ABC".to_string());
        h.logs.push_describe_error(SinkError::Timeout);
        push(&h, &grouped_key(), &["grouped"]);
        push(&h, &stream_key, &["sharded"]);

        h.engine.flush().await;

        assert_eq!(h.streams.records("myapp-staging-Kinesis-ABC").len(), 1);
        assert_eq!(h.engine.stats.grouped_dropped, 1);
    }

    #[tokio::test]
    async fn test_repeated_auth_failures_mark_unhealthy_once() {
        let mut h = harness();
        let key = DestinationKey::Stream("s".to_string());
        for _ in 0..5 {
            h.streams.push_error(SinkError::Auth("expired".to_string()));
            push(&h, &key, &["x"]);
            h.engine.flush().await;
        }
        assert_eq!(h.health.unhealthy().len(), 1);
        assert_eq!(h.health.unhealthy()[0].0, "logs");

        // Recovery re-arms the escalation.
        push(&h, &key, &["x"]);
        h.engine.flush().await;
        for _ in 0..3 {
            h.streams.push_error(SinkError::Auth("expired".to_string()));
            push(&h, &key, &["x"]);
            h.engine.flush().await;
        }
        assert_eq!(h.health.unhealthy().len(), 2);
    }

    #[tokio::test]
    async fn test_agent_stream_errors_stay_local() {
        let mut h = harness();
        h.engine.config.agent_stream = Some(grouped_key());
        h.logs.push_describe_error(SinkError::Timeout);
        push(&h, &grouped_key(), &["agent line"]);

        h.engine.flush().await;

        assert!(h.health.operational().is_empty());
    }

    #[test]
    fn test_timestamps_are_clamped_in_order() {
        let events = to_log_events(vec![
            BufferedLine::new(10, "a"),
            BufferedLine::new(5, "b"),
            BufferedLine::new(12, "c"),
        ]);
        let stamps: Vec<i64> = events.iter().map(|e| e.timestamp_ms).collect();
        let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(stamps, vec![10, 10, 12]);
        assert_eq!(messages, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_chunk_ranges() {
        let sizes = [4, 4, 4, 10, 1];
        let ranges = chunk_ranges(&sizes, |s| *s, 2, 9);
        assert_eq!(ranges, vec![0..2, 2..3, 3..4, 4..5]);

        let ranges = chunk_ranges(&sizes, |s| *s, 100, 100);
        assert_eq!(ranges, vec![0..5]);
        assert!(chunk_ranges::<usize>(&[], |s| *s, 10, 10).is_empty());
    }

    #[tokio::test]
    async fn test_oversized_grouped_batch_chains_tokens() {
        let mut h = harness();
        let big = "x".repeat(300 * 1024);
        for _ in 0..5 {
            h.buffer.enqueue(&grouped_key(), BufferedLine::new(1, big.clone()));
        }

        h.engine.flush().await;

        let appends = h.logs.appends();
        assert_eq!(appends.len(), 2);
        assert_eq!(appends[0].2.len(), 3);
        assert_eq!(appends[1].2.len(), 2);
        assert_eq!(appends[0].3, None);
        assert_eq!(appends[1].3.as_deref(), Some("token-1"));
        assert_eq!(h.engine.stats.grouped_delivered, 5);
    }

    #[tokio::test]
    async fn test_backlog_is_reported_once_until_it_clears() {
        let mut h = harness();
        let key = DestinationKey::Stream("s".to_string());
        for n in 0..BACKLOG_WARNING_LINES + 600 {
            h.buffer.enqueue(&key, BufferedLine::new(n as i64, "x"));
        }

        h.engine.flush().await;
        h.engine.flush().await;
        assert_eq!(h.health.operational_matching("count#LogBacklog").len(), 1);

        h.buffer.drain_up_to(&key, usize::MAX);
        h.engine.flush().await;
        for n in 0..BACKLOG_WARNING_LINES {
            h.buffer.enqueue(&key, BufferedLine::new(n as i64, "x"));
        }
        h.engine.flush().await;
        assert_eq!(h.health.operational_matching("count#LogBacklog").len(), 1);

        for n in 0..1_000 {
            h.buffer.enqueue(&key, BufferedLine::new(n as i64, "x"));
        }
        h.engine.flush().await;
        assert_eq!(h.health.operational_matching("count#LogBacklog").len(), 2);
    }

    #[test]
    fn test_stats_summary() {
        let stats = DeliveryStats {
            grouped_delivered: 7,
            token_conflicts: 1,
            stream_failed: 2,
            ..Default::default()
        };
        assert_eq!(
            stats.to_string(),
            "grouped delivered=7 dropped=0 rejected=0 token_conflicts=1, stream delivered=0 failed=2 dropped=0"
        );
    }
}
