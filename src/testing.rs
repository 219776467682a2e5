//! In-memory doubles for the runtime, the sinks and the health collaborator.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::sync::mpsc;

use crate::health::HealthSink;
use crate::runtime::{
    ContainerDetails, ContainerRuntime, ContainerState, ContainerSummary, ListFilter,
    RuntimeError, RuntimeEvent,
};
use crate::sinks::{
    AppendOutcome, LogEvent, LogGroupApi, LogStreamInfo, RecordResult, SinkError, StreamApi,
    StreamRecord,
};

/// One scripted attach: the frames it yields and the state the container
/// is in once the attach has been made.
struct LogSession {
    frames: Vec<Result<Bytes, RuntimeError>>,
    then: ContainerState,
}

#[derive(Default)]
struct RuntimeState {
    containers: HashMap<String, ContainerDetails>,
    running: Vec<ContainerSummary>,
    exited: Vec<ContainerSummary>,
    sessions: HashMap<String, VecDeque<LogSession>>,
    inspect_errors: HashMap<String, u32>,
    attaches: Vec<(String, i64)>,
    fail_listing: bool,
}

/// Scripted container runtime.
///
/// When a container has no scripted log session left, an attach yields
/// nothing and the container is marked exited, so follow loops end.
pub struct MockRuntime {
    state: Mutex<RuntimeState>,
    events_tx: mpsc::UnboundedSender<Result<RuntimeEvent, RuntimeError>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<RuntimeEvent, RuntimeError>>>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(RuntimeState::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }
}

impl MockRuntime {
    pub fn add_container(&self, id: &str, image: &str, env: &[&str], state: ContainerState) {
        let details = ContainerDetails {
            id: id.to_string(),
            image: image.to_string(),
            env: env.iter().map(|e| e.to_string()).collect(),
            state,
        };
        let summary = ContainerSummary {
            id: id.to_string(),
            image: image.to_string(),
        };
        let mut s = self.state.lock().unwrap();
        match state {
            ContainerState::Exited => s.exited.push(summary),
            state if state.is_alive() => s.running.push(summary),
            _ => {}
        }
        s.containers.insert(id.to_string(), details);
    }

    pub fn set_state(&self, id: &str, state: ContainerState) {
        if let Some(details) = self.state.lock().unwrap().containers.get_mut(id) {
            details.state = state;
        }
    }

    pub fn remove_container(&self, id: &str) {
        self.state.lock().unwrap().containers.remove(id);
    }

    pub fn push_session(&self, id: &str, frames: Vec<Result<Bytes, RuntimeError>>, then: ContainerState) {
        self.state
            .lock()
            .unwrap()
            .sessions
            .entry(id.to_string())
            .or_default()
            .push_back(LogSession { frames, then });
    }

    /// The next `times` inspections of `id` fail with a non-404 error.
    pub fn fail_inspect(&self, id: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .inspect_errors
            .insert(id.to_string(), times);
    }

    pub fn fail_listing(&self) {
        self.state.lock().unwrap().fail_listing = true;
    }

    pub fn send_event(&self, event: RuntimeEvent) {
        let _ = self.events_tx.send(Ok(event));
    }

    pub fn send_event_error(&self, message: &str) {
        let _ = self
            .events_tx
            .send(Err(RuntimeError::Stream(message.to_string())));
    }

    /// Every attach made so far as `(id, since)`.
    pub fn attaches(&self) -> Vec<(String, i64)> {
        self.state.lock().unwrap().attaches.clone()
    }

    pub fn attaches_for(&self, id: &str) -> Vec<i64> {
        self.attaches()
            .into_iter()
            .filter(|(attached, _)| attached == id)
            .map(|(_, since)| since)
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(
        &self,
        filter: ListFilter,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let s = self.state.lock().unwrap();
        if s.fail_listing {
            return Err(RuntimeError::Stream("listing failed".to_string()));
        }
        Ok(match filter {
            ListFilter::Running => s.running.clone(),
            ListFilter::Exited => s.exited.clone(),
        })
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let mut s = self.state.lock().unwrap();
        if let Some(remaining) = s.inspect_errors.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RuntimeError::Stream("inspect timed out".to_string()));
            }
        }
        s.containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    fn events(&self) -> BoxStream<'_, Result<RuntimeEvent, RuntimeError>> {
        match self.events_rx.lock().unwrap().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed(),
            None => stream::empty().boxed(),
        }
    }

    fn logs<'a>(&'a self, id: &'a str, since: i64) -> BoxStream<'a, Result<Bytes, RuntimeError>> {
        let mut s = self.state.lock().unwrap();
        s.attaches.push((id.to_string(), since));
        let session = s.sessions.get_mut(id).and_then(VecDeque::pop_front);
        let (frames, then) = match session {
            Some(session) => (session.frames, session.then),
            None => (Vec::new(), ContainerState::Exited),
        };
        if let Some(details) = s.containers.get_mut(id) {
            details.state = then;
        }
        stream::iter(frames).boxed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogCall {
    Describe { group: String, prefix: String },
    Create { group: String, stream: String },
    Append {
        group: String,
        stream: String,
        events: Vec<LogEvent>,
        token: Option<String>,
    },
}

#[derive(Default)]
struct LogGroupState {
    /// Server-side expected token per `(group, stream)`.
    streams: HashMap<(String, String), Option<String>>,
    calls: Vec<LogCall>,
    /// `(stream, message)` of every event in an accepted append.
    stored: Vec<(String, String)>,
    next_token: u64,
    append_errors: VecDeque<SinkError>,
    describe_errors: VecDeque<SinkError>,
    rejected: Option<crate::sinks::RejectedEvents>,
}

/// Grouped log-stream service that enforces continuation tokens.
#[derive(Default)]
pub struct FakeLogGroups {
    state: Mutex<LogGroupState>,
}

impl FakeLogGroups {
    pub fn add_stream(&self, group: &str, stream: &str, token: Option<&str>) {
        self.state.lock().unwrap().streams.insert(
            (group.to_string(), stream.to_string()),
            token.map(str::to_string),
        );
    }

    /// Simulate another writer advancing the stream.
    pub fn set_server_token(&self, group: &str, stream: &str, token: &str) {
        self.add_stream(group, stream, Some(token));
    }

    pub fn push_append_error(&self, err: SinkError) {
        self.state.lock().unwrap().append_errors.push_back(err);
    }

    pub fn push_describe_error(&self, err: SinkError) {
        self.state.lock().unwrap().describe_errors.push_back(err);
    }

    pub fn reject_next(&self, rejected: crate::sinks::RejectedEvents) {
        self.state.lock().unwrap().rejected = Some(rejected);
    }

    pub fn calls(&self) -> Vec<LogCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn appends(&self) -> Vec<(String, String, Vec<LogEvent>, Option<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                LogCall::Append {
                    group,
                    stream,
                    events,
                    token,
                } => Some((group, stream, events, token)),
                _ => None,
            })
            .collect()
    }

    /// Messages the service accepted for `stream`, in order. Events of
    /// failed appends are not included.
    pub fn messages(&self, stream: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .stored
            .iter()
            .filter(|(s, _)| s == stream)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn describes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, LogCall::Describe { .. }))
            .count()
    }
}

#[async_trait]
impl LogGroupApi for FakeLogGroups {
    async fn describe_streams(
        &self,
        group: &str,
        prefix: &str,
    ) -> Result<Vec<LogStreamInfo>, SinkError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(LogCall::Describe {
            group: group.to_string(),
            prefix: prefix.to_string(),
        });
        if let Some(err) = s.describe_errors.pop_front() {
            return Err(err);
        }
        let mut found: Vec<LogStreamInfo> = s
            .streams
            .iter()
            .filter(|((g, name), _)| g == group && name.starts_with(prefix))
            .map(|((_, name), token)| LogStreamInfo {
                name: name.clone(),
                upload_sequence_token: token.clone(),
            })
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn create_stream(&self, group: &str, stream: &str) -> Result<(), SinkError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(LogCall::Create {
            group: group.to_string(),
            stream: stream.to_string(),
        });
        s.streams
            .entry((group.to_string(), stream.to_string()))
            .or_insert(None);
        Ok(())
    }

    async fn append_events(
        &self,
        group: &str,
        stream: &str,
        events: &[LogEvent],
        token: Option<&str>,
    ) -> Result<AppendOutcome, SinkError> {
        let mut s = self.state.lock().unwrap();
        s.calls.push(LogCall::Append {
            group: group.to_string(),
            stream: stream.to_string(),
            events: events.to_vec(),
            token: token.map(str::to_string),
        });
        if let Some(err) = s.append_errors.pop_front() {
            return Err(err);
        }
        let key = (group.to_string(), stream.to_string());
        let expected = match s.streams.get(&key) {
            Some(expected) => expected.clone(),
            None => return Err(SinkError::NotFound(format!("{group}/{stream}"))),
        };
        if expected.as_deref() != token {
            return Err(SinkError::TokenRejected(format!(
                "The next expected sequenceToken is: {expected:?}"
            )));
        }
        s.next_token += 1;
        let next = format!("token-{}", s.next_token);
        s.streams.insert(key, Some(next.clone()));
        s.stored.extend(
            events
                .iter()
                .map(|e| (stream.to_string(), e.message.clone())),
        );
        Ok(AppendOutcome {
            next_token: Some(next),
            rejected: s.rejected.take(),
        })
    }
}

#[derive(Default)]
struct StreamState {
    batches: Vec<(String, Vec<StreamRecord>)>,
    errors: VecDeque<SinkError>,
    failing_indices: Vec<usize>,
}

/// Sharded stream service recording every batch.
#[derive(Default)]
pub struct FakeStreams {
    state: Mutex<StreamState>,
}

impl FakeStreams {
    pub fn push_error(&self, err: SinkError) {
        self.state.lock().unwrap().errors.push_back(err);
    }

    /// Records at these positions of each batch report a failure.
    pub fn fail_records(&self, indices: &[usize]) {
        self.state.lock().unwrap().failing_indices = indices.to_vec();
    }

    pub fn batches(&self) -> Vec<(String, Vec<StreamRecord>)> {
        self.state.lock().unwrap().batches.clone()
    }

    pub fn records(&self, stream: &str) -> Vec<StreamRecord> {
        self.batches()
            .into_iter()
            .filter(|(name, _)| name == stream)
            .flat_map(|(_, records)| records)
            .collect()
    }
}

#[async_trait]
impl StreamApi for FakeStreams {
    async fn put_batch(
        &self,
        stream: &str,
        records: &[StreamRecord],
    ) -> Result<Vec<RecordResult>, SinkError> {
        let mut s = self.state.lock().unwrap();
        s.batches.push((stream.to_string(), records.to_vec()));
        if let Some(err) = s.errors.pop_front() {
            return Err(err);
        }
        Ok((0..records.len())
            .map(|i| {
                if s.failing_indices.contains(&i) {
                    RecordResult {
                        error_code: Some("ProvisionedThroughputExceededException".to_string()),
                        error_message: Some("Rate exceeded for shard".to_string()),
                    }
                } else {
                    RecordResult::default()
                }
            })
            .collect())
    }
}

/// Health collaborator that only records what it was told.
#[derive(Default)]
pub struct RecordingHealth {
    operational: Mutex<Vec<String>>,
    unhealthy: Mutex<Vec<(String, String)>>,
    dumps: Mutex<Vec<(String, String)>>,
}

impl RecordingHealth {
    pub fn operational(&self) -> Vec<String> {
        self.operational.lock().unwrap().clone()
    }

    pub fn operational_matching(&self, needle: &str) -> Vec<String> {
        self.operational()
            .into_iter()
            .filter(|line| line.contains(needle))
            .collect()
    }

    pub fn unhealthy(&self) -> Vec<(String, String)> {
        self.unhealthy.lock().unwrap().clone()
    }

    pub fn dumps(&self) -> Vec<(String, String)> {
        self.dumps.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealthSink for RecordingHealth {
    async fn log_operational(&self, line: &str) {
        self.operational.lock().unwrap().push(line.to_string());
    }

    async fn mark_unhealthy(&self, subsystem: &str, reason: &str) {
        self.unhealthy
            .lock()
            .unwrap()
            .push((subsystem.to_string(), reason.to_string()));
    }

    async fn report_crash_dump(&self, subsystem: &str, dump: &str) {
        self.dumps
            .lock()
            .unwrap()
            .push((subsystem.to_string(), dump.to_string()));
    }
}
