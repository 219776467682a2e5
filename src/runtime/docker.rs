//! Docker runtime using bollard.
//!
//! This module owns the single Docker client the agent uses and maps the
//! Engine API models onto the runtime types the rest of the agent works with.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::query_parameters::{
    EventsOptions, EventsOptionsBuilder, InspectContainerOptions, InspectContainerOptionsBuilder,
    ListContainersOptions, ListContainersOptionsBuilder, LogsOptions, LogsOptionsBuilder,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;

use super::types::{ContainerDetails, ContainerState, ContainerSummary, EventStatus, RuntimeEvent};
use super::{ContainerRuntime, ListFilter, RuntimeError};

const CONNECT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon.
    ///
    /// With no host the client uses the default connection method
    /// (Unix socket on Linux/macOS, named pipe on Windows).
    pub fn connect(host: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match host {
            None => Docker::connect_with_local_defaults()?,
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            Some(host) => {
                Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
        };
        Ok(Self { docker })
    }

    /// Fails when the daemon does not answer, so startup can abort early.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }
}

fn not_found(id: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(id.to_string()),
        e => RuntimeError::Api(e),
    }
}

fn event_from_message(message: bollard::models::EventMessage) -> Option<RuntimeEvent> {
    let id = message.actor.and_then(|actor| actor.id)?;
    let status = message.action?;
    // Health check events carry the result after a colon
    // ("health_status: healthy"), only the verb matters here.
    let verb = status.split(':').next().unwrap_or_default().trim();
    Some(RuntimeEvent {
        id,
        status: EventStatus::from(verb),
        time: message.time.unwrap_or_default(),
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(
        &self,
        filter: ListFilter,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let options: ListContainersOptions = match filter {
            ListFilter::Running => ListContainersOptionsBuilder::new().build(),
            ListFilter::Exited => {
                let filters = HashMap::from([("status", vec!["exited"])]);
                ListContainersOptionsBuilder::new()
                    .all(true)
                    .filters(&filters)
                    .build()
            }
        };

        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    image: c.image.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();

        let info = self
            .docker
            .inspect_container(id, Some(options))
            .await
            .map_err(|e| not_found(id, e))?;

        let state = match info.state {
            Some(state) => match state.status {
                Some(status) => ContainerState::from(status),
                None if state.running.unwrap_or(false) => ContainerState::Running,
                None => ContainerState::Unknown,
            },
            None => ContainerState::Unknown,
        };

        let (image, env) = match info.config {
            Some(config) => (
                config.image.unwrap_or_default(),
                config.env.unwrap_or_default(),
            ),
            None => (String::new(), Vec::new()),
        };

        Ok(ContainerDetails {
            id: info.id.unwrap_or_else(|| id.to_string()),
            image,
            env,
            state,
        })
    }

    fn events(&self) -> BoxStream<'_, Result<RuntimeEvent, RuntimeError>> {
        let filters = HashMap::from([("type", vec!["container"])]);
        let options: EventsOptions = EventsOptionsBuilder::new().filters(&filters).build();

        self.docker
            .events(Some(options))
            .filter_map(|res| async move {
                match res {
                    Ok(message) => event_from_message(message).map(Ok),
                    Err(e) => Some(Err(RuntimeError::Api(e))),
                }
            })
            .boxed()
    }

    fn logs<'a>(&'a self, id: &'a str, since: i64) -> BoxStream<'a, Result<Bytes, RuntimeError>> {
        let since = i32::try_from(since).unwrap_or(i32::MAX);
        let options: LogsOptions = LogsOptionsBuilder::new()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .since(since)
            .timestamps(true)
            .tail("all")
            .build();

        self.docker
            .logs(id, Some(options))
            .map(move |res| res.map(LogOutput::into_bytes).map_err(|e| not_found(id, e)))
            .boxed()
    }
}
