//! Operational reporting and the unhealthy-instance entry point.
//!
//! The host health pollers and the cluster deregistration mechanics live
//! outside this agent. The pipeline only needs somewhere to send status
//! text and a single call to flag the instance, which is what
//! [`HealthSink`] provides.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::logs::{BufferedLine, DestinationKey, LineBuffer};

#[async_trait]
pub trait HealthSink: Send + Sync {
    /// Internal status text. Always logged locally.
    async fn log_operational(&self, line: &str);

    /// Flag the instance as unhealthy because `subsystem` failed.
    async fn mark_unhealthy(&self, subsystem: &str, reason: &str);

    async fn report_crash_dump(&self, subsystem: &str, dump: &str);
}

/// Logs operational text and mirrors it into the agent's own stream.
#[derive(Debug)]
pub struct Reporter {
    buffer: Arc<LineBuffer>,
    mirror: Option<DestinationKey>,
}

impl Reporter {
    /// `mirror` is the agent's own log stream, if operational lines should
    /// also be shipped.
    pub fn new(buffer: Arc<LineBuffer>, mirror: Option<DestinationKey>) -> Self {
        Self { buffer, mirror }
    }

    /// The agent's own stream: `<group>/agent/<instance-id>`.
    pub fn agent_stream(group: &str, instance_id: &str) -> DestinationKey {
        DestinationKey::LogStream {
            group: group.to_string(),
            stream: format!("agent/{instance_id}"),
        }
    }

    fn mirror(&self, line: &str) {
        if let Some(key) = &self.mirror {
            self.buffer.enqueue(
                key,
                BufferedLine::new(Utc::now().timestamp_millis(), line.to_string()),
            );
        }
    }
}

#[async_trait]
impl HealthSink for Reporter {
    async fn log_operational(&self, line: &str) {
        log::info!("{line}");
        self.mirror(line);
    }

    async fn mark_unhealthy(&self, subsystem: &str, reason: &str) {
        let line = format!("ns=agent at=mark_unhealthy system={subsystem} count#unhealthy=1 reason={reason:?}");
        log::error!("{line}");
        self.mirror(&line);
    }

    async fn report_crash_dump(&self, subsystem: &str, dump: &str) {
        log::error!("ns=agent at=crash_dump system={subsystem} bytes={}", dump.len());
        for line in dump.lines() {
            self.mirror(&format!("crash system={subsystem} {line}"));
        }
    }
}
