//! Per-container log following.
//!
//! Each followed container gets one task that attaches to the runtime's
//! output, tags every line and enqueues it for delivery. When the attach
//! ends the container is inspected again and the task either re-attaches
//! or stops for good.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::env::{ContainerEnv, short_id};
use super::lines::{
    LineSplitter, parse_line, payload_budget, render_grouped, render_sharded, split_payload,
};
use crate::config::AgentConfig;
use crate::health::HealthSink;
use crate::logs::{BufferedLine, LineBuffer};
use crate::runtime::{ContainerRuntime, RuntimeError};

const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Point in time (epoch seconds) from which the next attach replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumptionCursor {
    since: i64,
}

impl ResumptionCursor {
    /// Cursor for a first attach: `grace` before `now`.
    pub fn start(now: DateTime<Utc>, grace: Duration) -> Self {
        let grace = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
        Self {
            since: now.timestamp().saturating_sub(grace).max(0),
        }
    }

    /// Move to `now`. The cursor never goes backwards.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.since = self.since.max(now.timestamp());
    }

    pub fn since(&self) -> i64 {
        self.since
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowSettings {
    pub grace: Duration,
    pub reconnect_delay: Duration,
    pub max_inspect_failures: u32,
}

impl From<&AgentConfig> for FollowSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            grace: config.follow_grace(),
            reconnect_delay: config.reconnect_delay(),
            max_inspect_failures: config.max_inspect_failures.max(1),
        }
    }
}

/// Why a follow loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowEnd {
    NotRunning(String),
    Vanished,
    InspectFailed(String),
}

#[derive(Clone)]
struct Follower {
    runtime: Arc<dyn ContainerRuntime>,
    buffer: Arc<LineBuffer>,
    health: Arc<dyn HealthSink>,
    settings: FollowSettings,
}

impl Follower {
    async fn follow(&self, id: &str, env: &ContainerEnv) -> FollowEnd {
        let short = short_id(id);
        let mut cursor = ResumptionCursor::start(Utc::now(), self.settings.grace);
        let mut inspect_failures = 0;

        loop {
            log::debug!("Attaching to {short} since {}", cursor.since());
            match self.attach(id, env, cursor.since()).await {
                Ok(lines) => log::debug!("Log stream of {short} ended after {lines} lines"),
                Err(e) => {
                    self.health
                        .log_operational(&format!(
                            "container subscribeLogs followDockerLogs id={short} count#DockerLogsError=1 err={:?}",
                            e.to_string()
                        ))
                        .await;
                }
            }
            // Output written from here on has not been requested yet.
            cursor.advance(Utc::now());

            match self.runtime.inspect(id).await {
                Ok(details) if details.state.is_alive() => inspect_failures = 0,
                Ok(details) => return FollowEnd::NotRunning(details.state.as_ref().to_string()),
                Err(RuntimeError::NotFound(_)) => return FollowEnd::Vanished,
                Err(e) => {
                    inspect_failures += 1;
                    log::warn!(
                        "Inspect of {short} failed ({inspect_failures}/{}): {e}",
                        self.settings.max_inspect_failures
                    );
                    if inspect_failures >= self.settings.max_inspect_failures {
                        return FollowEnd::InspectFailed(e.to_string());
                    }
                }
            }

            self.health
                .log_operational(&format!(
                    "container subscribeLogs id={short} count#DockerLogsRetry=1"
                ))
                .await;
            tokio::time::sleep(self.settings.reconnect_delay).await;
        }
    }

    /// One attach. The reader half splits frames into lines and hands them
    /// to the writer half, which tags and enqueues them.
    async fn attach(&self, id: &str, env: &ContainerEnv, since: i64) -> Result<usize, RuntimeError> {
        let (tx, mut rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
        let runtime = self.runtime.as_ref();

        let reader = async move {
            let mut output = runtime.logs(id, since);
            let mut splitter = LineSplitter::default();
            let mut result = Ok(());
            while let Some(frame) = output.next().await {
                match frame {
                    Ok(frame) => {
                        for line in splitter.push(&frame) {
                            if tx.send(line).await.is_err() {
                                return result;
                            }
                        }
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            if let Some(rest) = splitter.finish() {
                let _ = tx.send(rest).await;
            }
            result
        };

        let writer = async {
            let mut count = 0;
            while let Some(line) = rx.recv().await {
                self.forward(id, env, &line);
                count += 1;
            }
            count
        };

        let (result, count) = tokio::join!(reader, writer);
        result.map(|_| count)
    }

    /// Tag and enqueue one line. Payloads too long for a single event are
    /// sent as consecutive events sharing the line's timestamp.
    fn forward(&self, id: &str, env: &ContainerEnv, raw: &str) {
        let line = parse_line(raw);
        let timestamp_ms = line.timestamp_ms();
        let grouped = env.log_stream_key(id);
        let sharded = env.kinesis_key();
        for piece in split_payload(&line.payload, payload_budget(env, id)) {
            if let Some(key) = &grouped {
                let rendered = render_grouped(env, id, piece);
                self.buffer
                    .enqueue(key, BufferedLine::new(timestamp_ms, rendered));
            }
            if let Some(key) = &sharded {
                let rendered = render_sharded(env, id, &line.timestamp, piece);
                self.buffer
                    .enqueue(key, BufferedLine::new(timestamp_ms, rendered));
            }
        }
    }
}

/// Removes a container from the active set when its task finishes,
/// however it finishes.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.id);
    }
}

fn lock(active: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    active
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The set of running follow loops, at most one per container.
#[derive(Clone)]
pub struct Followers {
    follower: Follower,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Followers {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        buffer: Arc<LineBuffer>,
        health: Arc<dyn HealthSink>,
        settings: FollowSettings,
    ) -> Self {
        Self {
            follower: Follower {
                runtime,
                buffer,
                health,
                settings,
            },
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start following `id` unless it is already followed. Returns the
    /// task handle when a new loop was started.
    pub fn spawn(&self, id: &str, env: Arc<ContainerEnv>) -> Option<JoinHandle<FollowEnd>> {
        if !lock(&self.active).insert(id.to_string()) {
            log::debug!("Already following {}", short_id(id));
            return None;
        }

        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            id: id.to_string(),
        };
        let follower = self.follower.clone();
        let id = id.to_string();
        Some(tokio::spawn(async move {
            let _guard = guard;
            let short = short_id(&id).to_string();
            log::info!("Following logs of {short}");
            let end = follower.follow(&id, &env).await;
            follower
                .health
                .log_operational(&format!("container subscribeLogs id={short} at=end reason={end:?}"))
                .await;
            end
        }))
    }

    pub fn is_following(&self, id: &str) -> bool {
        lock(&self.active).contains(id)
    }

    pub fn active(&self) -> usize {
        lock(&self.active).len()
    }
}
