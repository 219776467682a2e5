//! Agent configuration.
//!
//! Settings come from an optional TOML file, then environment variables
//! override the values that the deployment traditionally injects
//! (`DOCKER_HOST`, `AWS_REGION`, `LOG_GROUP`, `INSTANCE_ID`).
//!
//! ```toml
//! agent_images = ["convox/agent"]
//! log_group = "rack-LogGroup-1A2B3C"
//! flush_interval_ms = 100
//! batch_size = 500
//! ```

use std::{collections::HashMap, path::Path, time::Duration};

use serde::Deserialize;

fn default_agent_images() -> Vec<String> {
    vec!["convox/agent".to_string(), "agent/agent".to_string()]
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_batch_size() -> usize {
    500
}

fn default_follow_grace_secs() -> u64 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_inspect_failures() -> u32 {
    5
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_auth_failure_threshold() -> u32 {
    10
}

fn default_cgroup_root() -> String {
    "/cgroup".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentConfig {
    /// Runtime endpoint. `None` uses the local socket defaults.
    #[serde(default)]
    pub docker_host: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Image name prefixes that identify the agent's own container.
    #[serde(default = "default_agent_images")]
    pub agent_images: Vec<String>,
    /// Log group receiving the agent's own operational lines.
    #[serde(default)]
    pub log_group: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub logs_endpoint: Option<String>,
    #[serde(default)]
    pub kinesis_endpoint: Option<String>,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_follow_grace_secs")]
    pub follow_grace_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_inspect_failures")]
    pub max_inspect_failures: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_auth_failure_threshold")]
    pub auth_failure_threshold: u32,
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: String,
    #[serde(default = "default_true")]
    pub mirror_operational: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            instance_id: None,
            agent_images: default_agent_images(),
            log_group: None,
            region: default_region(),
            logs_endpoint: None,
            kinesis_endpoint: None,
            flush_interval_ms: default_flush_interval_ms(),
            batch_size: default_batch_size(),
            follow_grace_secs: default_follow_grace_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_inspect_failures: default_max_inspect_failures(),
            request_timeout_secs: default_request_timeout_secs(),
            auth_failure_threshold: default_auth_failure_threshold(),
            cgroup_root: default_cgroup_root(),
            mirror_operational: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl AgentConfig {
    /// Loads the config file (defaults when it does not exist) and applies
    /// the process environment on top.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => Self::try_init_from_string(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config file at {path:?}, using defaults");
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        let env: HashMap<String, String> = std::env::vars().collect();
        config.apply_env(&env);
        config.validate()?;
        Ok(config)
    }

    fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(val)?)
    }

    fn apply_env(&mut self, env: &HashMap<String, String>) {
        let get = |key: &str| env.get(key).filter(|v| !v.is_empty()).cloned();

        if let Some(host) = get("DOCKER_HOST") {
            self.docker_host = Some(host);
        }
        if let Some(region) = get("AWS_REGION") {
            self.region = region;
        }
        if let Some(group) = get("LOG_GROUP") {
            self.log_group = Some(group);
        }
        if let Some(id) = get("INSTANCE_ID") {
            self.instance_id = Some(id);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "flush_interval_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.agent_images.iter().any(|prefix| prefix.is_empty()) {
            return Err(ConfigError::Invalid {
                key: "agent_images",
                reason: "empty prefix would match every image".to_string(),
            });
        }
        Ok(())
    }

    pub fn logs_endpoint(&self) -> String {
        self.logs_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://logs.{}.amazonaws.com", self.region))
    }

    pub fn kinesis_endpoint(&self) -> String {
        self.kinesis_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://kinesis.{}.amazonaws.com", self.region))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn follow_grace(&self) -> Duration {
        Duration::from_secs(self.follow_grace_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
