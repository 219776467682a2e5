//! Parsing runtime output and rendering tagged lines.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, FixedOffset, Local};

use super::env::{ContainerEnv, short_id};

/// Largest event the grouped log-stream service accepts, overhead included.
pub const MAX_EVENT_BYTES: usize = 256 * 1024;
pub const EVENT_OVERHEAD_BYTES: usize = 26;

/// Longest raw line buffered before it is cut, whatever the sinks accept.
pub const MAX_RAW_LINE_BYTES: usize = 1024 * 1024;

const LOCAL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// `LOCAL_TIME_FORMAT` plus the separating space.
const LOCAL_TIME_PREFIX_BYTES: usize = 20;

/// A line of container output with the runtime timestamp split off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedLine {
    pub timestamp: DateTime<FixedOffset>,
    pub payload: String,
}

impl TimestampedLine {
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Split `<RFC3339 timestamp> <payload>`. When the prefix does not parse
/// the whole line is the payload and the time is the local clock.
pub fn parse_line(line: &str) -> TimestampedLine {
    if let Some((prefix, rest)) = line.split_once(' ') {
        match DateTime::parse_from_rfc3339(prefix) {
            Ok(timestamp) => {
                return TimestampedLine {
                    timestamp,
                    payload: rest.to_string(),
                };
            }
            Err(e) => log::trace!("Unparseable log timestamp {prefix:?}: {e}"),
        }
    }
    TimestampedLine {
        timestamp: Local::now().fixed_offset(),
        payload: line.to_string(),
    }
}

fn grouped_prefix(env: &ContainerEnv, id: &str) -> String {
    format!("{}:{}/{} ", env.process(), env.release(), short_id(id))
}

/// `web:RXZMCQEPDKO/1d11a78279e0 Hello from Docker.`
pub fn render_grouped(env: &ContainerEnv, id: &str, payload: &str) -> String {
    grouped_prefix(env, id) + payload
}

/// Sharded stream consumers expect a readable timestamp in front of the
/// grouped rendering.
pub fn render_sharded(
    env: &ContainerEnv,
    id: &str,
    timestamp: &DateTime<FixedOffset>,
    payload: &str,
) -> String {
    format!(
        "{} {}",
        timestamp.format(LOCAL_TIME_FORMAT),
        render_grouped(env, id, payload)
    )
}

/// Payload bytes that fit in one event once either rendering is applied.
pub fn payload_budget(env: &ContainerEnv, id: &str) -> usize {
    let prefix = LOCAL_TIME_PREFIX_BYTES + grouped_prefix(env, id).len();
    MAX_EVENT_BYTES
        .saturating_sub(EVENT_OVERHEAD_BYTES + prefix)
        .max(1)
}

/// Cut `payload` into pieces of at most `max_bytes`, on character
/// boundaries. A single character wider than `max_bytes` is kept whole.
pub fn split_payload(payload: &str, max_bytes: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = payload;
    while rest.len() > max_bytes {
        let mut cut = max_bytes;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }
    pieces.push(rest);
    pieces
}

/// `2024-01-01 12:00:00 i-0abc myapp-staging/web:R1 : Starting process abc123456789`
pub fn render_lifecycle(
    now: DateTime<Local>,
    instance_id: &str,
    env: &ContainerEnv,
    message: &str,
) -> String {
    format!(
        "{} {} {}/{}:{} : {}",
        now.format(LOCAL_TIME_FORMAT),
        instance_id,
        env.app(),
        env.process(),
        env.release(),
        message
    )
}

/// Reassembles newline-delimited lines from arbitrarily cut frames.
///
/// Lines longer than the configured cap are cut into consecutive pieces,
/// never inside a UTF-8 sequence. A trailing carriage return is stripped
/// along with the newline.
#[derive(Debug)]
pub struct LineSplitter {
    pending: BytesMut,
    max_line: usize,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::new(MAX_RAW_LINE_BYTES)
    }
}

impl LineSplitter {
    pub fn new(max_line: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            max_line: max_line.max(1),
        }
    }

    /// Feed a frame and return every line it completes.
    pub fn push(&mut self, frame: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(frame);
        let mut lines = Vec::new();
        loop {
            match self.pending.iter().position(|b| *b == b'\n') {
                Some(pos) if pos <= self.max_line => {
                    let line = self.pending.split_to(pos + 1);
                    lines.push(decode(&line[..pos]));
                }
                _ if self.pending.len() > self.max_line => {
                    let cut = utf8_cut(&self.pending, self.max_line);
                    let piece = self.pending.split_to(cut);
                    lines.push(decode(&piece));
                }
                _ => break,
            }
        }
        lines
    }

    /// Whatever is left without a terminating newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest: Bytes = self.pending.split().freeze();
        Some(decode(&rest))
    }
}

/// Largest cut at or below `max` that does not land on a continuation
/// byte. Falls back to `max` for input that is not UTF-8 anyway.
fn utf8_cut(raw: &[u8], max: usize) -> usize {
    (max.saturating_sub(3)..=max)
        .rev()
        .find(|&cut| cut > 0 && raw.get(cut).is_none_or(|b| (b & 0xC0) != 0x80))
        .unwrap_or(max)
}

fn decode(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
