use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Local, Utc};
use futures_util::StreamExt;
use log::{debug, info};

use super::cgroups::CgroupOverride;
use super::env::{ContainerEnv, EnvStore, short_id};
use super::follow::Followers;
use super::lines::render_lifecycle;
use crate::health::HealthSink;
use crate::identity::{AgentContainer, InstanceIdentity};
use crate::logs::{BufferedLine, LineBuffer};
use crate::runtime::{
    ContainerDetails, ContainerRuntime, EventStatus, ListFilter, RuntimeError, RuntimeEvent,
};

/// Reacts to container lifecycle events.
///
/// Events are handled one at a time in arrival order. Anything that can
/// take long (following logs, the swap override) runs in its own task.
pub struct Dispatcher {
    runtime: Arc<dyn ContainerRuntime>,
    envs: Arc<EnvStore>,
    buffer: Arc<LineBuffer>,
    health: Arc<dyn HealthSink>,
    identity: Arc<InstanceIdentity>,
    followers: Followers,
    cgroups: CgroupOverride,
    agent: Option<AgentContainer>,
    agent_ids: HashSet<String>,
}

fn ucfirst(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl Dispatcher {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        envs: Arc<EnvStore>,
        buffer: Arc<LineBuffer>,
        health: Arc<dyn HealthSink>,
        identity: Arc<InstanceIdentity>,
        followers: Followers,
        cgroups: CgroupOverride,
    ) -> Self {
        Self {
            runtime,
            envs,
            buffer,
            health,
            identity,
            followers,
            cgroups,
            agent: None,
            agent_ids: HashSet::new(),
        }
    }

    pub fn agent(&self) -> Option<&AgentContainer> {
        self.agent.as_ref()
    }

    /// Bring the agent up to date with containers that existed before it
    /// started. Failing to list is fatal.
    pub async fn reconcile(&mut self) -> Result<(), RuntimeError> {
        info!("Reconciling running containers");
        for container in self.runtime.list_containers(ListFilter::Running).await? {
            if self.identity.is_agent_image(&container.image) {
                let agent = AgentContainer::new(&container.id, &container.image);
                info!(
                    "Found agent container {} image={} version={}",
                    short_id(&agent.id),
                    agent.image,
                    agent.version.as_deref().unwrap_or("unknown")
                );
                self.agent_ids.insert(agent.id.clone());
                self.agent = Some(agent);
                // Its environment is still recorded for event metrics.
                if let Ok(details) = self.runtime.inspect(&container.id).await {
                    self.remember(&container.id, &details);
                }
                continue;
            }
            debug!("Running container {}", short_id(&container.id));
            self.handle_create(&container.id).await;
            self.handle_start(&container.id).await;
        }

        info!("Reconciling exited containers");
        for container in self.runtime.list_containers(ListFilter::Exited).await? {
            debug!("Exited container {}", short_id(&container.id));
            self.handle_die(&container.id).await;
        }
        info!("Reconciled, following {} containers", self.followers.active());
        Ok(())
    }

    /// Consume live events until the event stream fails or ends, which
    /// always yields an error.
    pub async fn run(&mut self) -> Result<(), RuntimeError> {
        let runtime = Arc::clone(&self.runtime);
        let mut events = runtime.events();
        info!("Listening for container events");
        while let Some(event) = events.next().await {
            self.handle(&event?).await;
        }
        Err(RuntimeError::Stream("event stream ended".to_string()))
    }

    pub async fn handle(&mut self, event: &RuntimeEvent) {
        let known = self.envs.get(&event.id);
        match event.status {
            EventStatus::Create => self.handle_create(&event.id).await,
            EventStatus::Start => self.handle_start(&event.id).await,
            EventStatus::Die => self.handle_die(&event.id).await,
            EventStatus::Kill => self.handle_kill(&event.id).await,
            EventStatus::Oom => self.handle_oom(&event.id).await,
            EventStatus::Stop => self.handle_stop(&event.id).await,
            EventStatus::Destroy => self.handle_destroy(&event.id),
            EventStatus::Other(_) => {}
        }

        let env = known.or_else(|| self.envs.get(&event.id));
        let metric = format!("DockerEvent{}", ucfirst(event.status.as_ref()));
        let line = match env.as_deref().map(ContainerEnv::process) {
            Some(process) if !process.is_empty() => format!(
                "container handleEvents id={} process={process} time={} count#{metric}=1",
                event.id, event.time
            ),
            _ => format!(
                "container handleEvents id={} time={} count#{metric}=1",
                event.id, event.time
            ),
        };
        self.health.log_operational(&line).await;
    }

    /// Store what an inspect returned. Containers running an agent image
    /// are marked so they are never followed.
    fn remember(&mut self, id: &str, details: &ContainerDetails) -> Arc<ContainerEnv> {
        if self.identity.is_agent_image(&details.image) {
            self.agent_ids.insert(id.to_string());
        }
        self.envs.insert(id, ContainerEnv::parse(&details.env))
    }

    /// Environment recorded for `id`, inspecting the container when the
    /// agent has not seen it yet.
    async fn env_for(&mut self, id: &str) -> Option<Arc<ContainerEnv>> {
        if let Some(env) = self.envs.get(id) {
            return Some(env);
        }
        match self.runtime.inspect(id).await {
            Ok(details) => Some(self.remember(id, &details)),
            Err(e) => {
                debug!("No environment for {}: {e}", short_id(id));
                None
            }
        }
    }

    async fn handle_create(&mut self, id: &str) {
        let short = short_id(id);
        let details = match self.runtime.inspect(id).await {
            Ok(details) => details,
            Err(e) => {
                self.health
                    .log_operational(&format!(
                        "container handleCreate id={short} count#DockerInspectError=1 err={:?}",
                        e.to_string()
                    ))
                    .await;
                return;
            }
        };

        let env = self.remember(id, &details);
        self.emit_lifecycle(id, &env, &format!("Starting process {short}"));

        if self.agent_ids.contains(id) {
            info!("Not following logs of agent container {short}");
            return;
        }
        self.follow(id, env);
    }

    fn follow(&self, id: &str, env: Arc<ContainerEnv>) {
        if !env.has_destination() {
            debug!("No log destination for {}, not following", short_id(id));
            return;
        }
        self.followers.spawn(id, env);
    }

    async fn handle_start(&mut self, id: &str) {
        let Some(env) = self.env_for(id).await else {
            return;
        };
        if env.swap_enabled() {
            self.cgroups.schedule(id);
        }
        // Covers restarts after the previous loop ended on die.
        if !self.agent_ids.contains(id) && !self.followers.is_following(id) {
            self.follow(id, env);
        }
    }

    async fn handle_die(&mut self, id: &str) {
        self.lifecycle(id, format!("Dead process {}", short_id(id))).await;
    }

    async fn handle_kill(&mut self, id: &str) {
        self.lifecycle(id, format!("Stopped process {} via SIGKILL", short_id(id)))
            .await;
    }

    async fn handle_oom(&mut self, id: &str) {
        self.lifecycle(id, format!("Stopped process {} due to OOM", short_id(id)))
            .await;
    }

    async fn handle_stop(&mut self, id: &str) {
        self.lifecycle(id, format!("Stopped process {} via SIGTERM", short_id(id)))
            .await;
    }

    fn handle_destroy(&mut self, id: &str) {
        self.envs.remove(id);
        self.agent_ids.remove(id);
        debug!("Forgot container {}, {} known", short_id(id), self.envs.len());
    }

    async fn lifecycle(&mut self, id: &str, message: String) {
        match self.env_for(id).await {
            Some(env) => self.emit_lifecycle(id, &env, &message),
            None => info!("{message}"),
        }
    }

    /// Log a lifecycle line and enqueue it for every destination of the
    /// container.
    fn emit_lifecycle(&self, id: &str, env: &ContainerEnv, message: &str) {
        let line = render_lifecycle(Local::now(), &self.identity.instance_id, env, message);
        info!("{line}");
        let timestamp_ms = Utc::now().timestamp_millis();
        for key in [env.log_stream_key(id), env.kinesis_key()].into_iter().flatten() {
            self.buffer
                .enqueue(&key, BufferedLine::new(timestamp_ms, line.clone()));
        }
    }
}
