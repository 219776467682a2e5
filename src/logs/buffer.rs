use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;

/// One delivery target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DestinationKey {
    /// A stream inside a grouped log-stream service log group.
    LogStream { group: String, stream: String },
    /// A sharded stream, by name.
    Stream(String),
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LogStream { group, stream } => write!(f, "{group}/{stream}"),
            Self::Stream(name) => write!(f, "kinesis:{name}"),
        }
    }
}

/// A fully rendered line waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedLine {
    /// Event time in milliseconds since the epoch.
    pub timestamp_ms: i64,
    pub data: Bytes,
}

impl BufferedLine {
    pub fn new(timestamp_ms: i64, data: impl Into<Bytes>) -> Self {
        Self {
            timestamp_ms,
            data: data.into(),
        }
    }
}

/// Pending lines per destination.
///
/// Producers (follow loops, the dispatcher, the operational reporter) and
/// the single delivery task only meet here. The lock is held for queue
/// manipulation only. The buffer never discards a line on its own.
#[derive(Debug, Default)]
pub struct LineBuffer {
    queues: Mutex<HashMap<DestinationKey, VecDeque<BufferedLine>>>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, key: &DestinationKey, line: BufferedLine) {
        let mut queues = self.lock();
        match queues.get_mut(key) {
            Some(queue) => queue.push_back(line),
            None => {
                queues.insert(key.clone(), VecDeque::from([line]));
            }
        }
    }

    /// Remove and return up to `max` of the oldest lines for `key`, oldest
    /// first. An unknown or empty key yields an empty batch.
    pub fn drain_up_to(&self, key: &DestinationKey, max: usize) -> Vec<BufferedLine> {
        let mut queues = self.lock();
        let Some(queue) = queues.get_mut(key) else {
            return Vec::new();
        };
        let take = max.min(queue.len());
        let batch: Vec<BufferedLine> = queue.drain(..take).collect();
        if queue.is_empty() {
            queues.remove(key);
        }
        batch
    }

    /// Snapshot of the keys that currently have pending lines.
    pub fn non_empty_keys(&self) -> Vec<DestinationKey> {
        let mut keys: Vec<DestinationKey> = self
            .lock()
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn pending(&self, key: &DestinationKey) -> usize {
        self.lock().get(key).map_or(0, VecDeque::len)
    }

    pub fn total_pending(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DestinationKey, VecDeque<BufferedLine>>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
