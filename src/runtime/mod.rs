//! Container runtime access.
//!
//! Everything the agent needs from the runtime goes through the
//! [`ContainerRuntime`] trait: listing containers for startup
//! reconciliation, inspecting a single container, subscribing to lifecycle
//! events and following a container's combined output. The production
//! implementation talks to the Docker Engine API through bollard.

mod docker;
mod types;

pub use docker::DockerRuntime;
pub use types::{ContainerDetails, ContainerState, ContainerSummary, EventStatus, RuntimeEvent};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Container {0} not found")]
    NotFound(String),
    #[error("Docker API error: {0}")]
    Api(#[from] bollard::errors::Error),
    #[error("Runtime stream error: {0}")]
    Stream(String),
}

/// Which containers a listing should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    Running,
    Exited,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(
        &self,
        filter: ListFilter,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;

    /// Live container lifecycle events, starting now.
    fn events(&self) -> BoxStream<'_, Result<RuntimeEvent, RuntimeError>>;

    /// Combined stdout/stderr of a container from `since` (epoch seconds),
    /// following until the container stops or the connection drops. Every
    /// line is prefixed with the runtime's RFC3339 timestamp. Chunks are raw
    /// frames and do not necessarily align with line boundaries.
    fn logs<'a>(&'a self, id: &'a str, since: i64) -> BoxStream<'a, Result<Bytes, RuntimeError>>;
}
