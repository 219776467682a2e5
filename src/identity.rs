use crate::config::AgentConfig;

/// Who this agent is. Built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub instance_id: String,
    agent_images: Vec<String>,
}

impl InstanceIdentity {
    pub fn new(instance_id: impl Into<String>, agent_images: Vec<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            agent_images,
        }
    }

    /// Instance id from the config (which already carries `INSTANCE_ID`),
    /// falling back to the host name.
    pub fn resolve(config: &AgentConfig) -> Self {
        let instance_id = config.instance_id.clone().unwrap_or_else(|| {
            match nix::unistd::gethostname() {
                Ok(name) => name.to_string_lossy().into_owned(),
                Err(e) => {
                    log::warn!("Unable to read hostname: {e}");
                    "unknown".to_string()
                }
            }
        });
        Self::new(instance_id, config.agent_images.clone())
    }

    /// Whether an image name belongs to the agent itself.
    pub fn is_agent_image(&self, image: &str) -> bool {
        self.agent_images
            .iter()
            .any(|prefix| image.starts_with(prefix.as_str()))
    }
}

/// The agent's own container, once reconciliation has found it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentContainer {
    pub id: String,
    pub image: String,
    pub version: Option<String>,
}

impl AgentContainer {
    pub fn new(id: &str, image: &str) -> Self {
        let version = image
            .split_once(':')
            .map(|(_, tag)| tag.to_string())
            .filter(|tag| !tag.is_empty());
        Self {
            id: id.to_string(),
            image: image.to_string(),
            version,
        }
    }
}
