use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::logs::DestinationKey;

/// Number of characters in the short form of a container id.
pub const SHORT_ID_LEN: usize = 12;

pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

/// Environment of a container captured when it was created.
///
/// The values are a snapshot: changes made inside the running container
/// are never observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerEnv {
    vars: HashMap<String, String>,
}

impl ContainerEnv {
    /// Parse `KEY=VALUE` strings. Entries without `=` are ignored and
    /// the last occurrence of a key wins.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Self {
        let vars = entries
            .iter()
            .filter_map(|entry| entry.as_ref().split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self { vars }
    }

    /// Value of a variable, treating empty values as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn process(&self) -> &str {
        self.get("PROCESS").unwrap_or_default()
    }

    pub fn release(&self) -> &str {
        self.get("RELEASE").unwrap_or_default()
    }

    pub fn log_group(&self) -> Option<&str> {
        self.get("LOG_GROUP")
    }

    pub fn kinesis(&self) -> Option<&str> {
        self.get("KINESIS")
    }

    pub fn swap_enabled(&self) -> bool {
        self.get("SWAP") == Some("1")
    }

    /// App name from `APP`, or inferred from the log resource name.
    ///
    /// `myapp-staging-LogGroup-9I65CAJ6OLO9` -> `myapp-staging`
    pub fn app(&self) -> String {
        if let Some(app) = self.get("APP") {
            return app.to_string();
        }
        let Some(resource) = self.log_group().or_else(|| self.kinesis()) else {
            return String::new();
        };
        let parts: Vec<&str> = resource.split('-').collect();
        if parts.len() > 2 {
            parts[..parts.len() - 2].join("-")
        } else {
            String::new()
        }
    }

    /// Grouped log stream for this container, when a log group is set.
    pub fn log_stream_key(&self, id: &str) -> Option<DestinationKey> {
        let group = self.log_group()?;
        let stream = match self.process() {
            "" => id.to_string(),
            process => format!("{process}/{id}"),
        };
        Some(DestinationKey::LogStream {
            group: group.to_string(),
            stream,
        })
    }

    pub fn kinesis_key(&self) -> Option<DestinationKey> {
        self.kinesis()
            .map(|stream| DestinationKey::Stream(stream.to_string()))
    }

    pub fn has_destination(&self) -> bool {
        self.log_group().is_some() || self.kinesis().is_some()
    }
}

/// Environments of known containers, keyed by full container id.
///
/// Shared by the dispatcher and every follow loop. Lookups hand out an
/// `Arc` so no caller holds the lock beyond the map access.
#[derive(Debug, Default)]
pub struct EnvStore {
    inner: Mutex<HashMap<String, Arc<ContainerEnv>>>,
}

impl EnvStore {
    pub fn insert(&self, id: &str, env: ContainerEnv) -> Arc<ContainerEnv> {
        let env = Arc::new(env);
        self.lock().insert(id.to_string(), Arc::clone(&env));
        env
    }

    pub fn get(&self, id: &str) -> Option<Arc<ContainerEnv>> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ContainerEnv>> {
        self.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ContainerEnv>>> {
        // The map stays consistent even if a holder panicked mid-access.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
