//! Memory limit override for containers that opt into swap.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::env::short_id;
use crate::health::HealthSink;

/// Largest value the cgroup v1 memory controller accepts, meaning "no limit".
pub const UNLIMITED: &str = "18446744073709551615";

/// Order matters: memsw must be raised before the plain limit can be.
const LIMIT_FILES: [&str; 3] = [
    "memory.memsw.limit_in_bytes",
    "memory.soft_limit_in_bytes",
    "memory.limit_in_bytes",
];

/// The runtime finishes setting up the cgroup shortly after `start`.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct CgroupOverride {
    root: PathBuf,
    delay: Duration,
    health: Arc<dyn HealthSink>,
}

impl CgroupOverride {
    pub fn new(root: impl Into<PathBuf>, delay: Duration, health: Arc<dyn HealthSink>) -> Self {
        Self {
            root: root.into(),
            delay,
            health,
        }
    }

    fn dir(&self, id: &str) -> PathBuf {
        self.root.join("memory").join("docker").join(id)
    }

    /// Apply the override in the background after the settle delay.
    pub fn schedule(&self, id: &str) -> JoinHandle<usize> {
        let this = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(this.delay).await;
            this.apply(&id).await
        })
    }

    /// Lift every memory limit for `id`. Failures are reported and do not
    /// stop the remaining writes. Returns how many files were written.
    pub async fn apply(&self, id: &str) -> usize {
        let dir = self.dir(id);
        let short = short_id(id);
        let mut written = 0;
        for file in LIMIT_FILES {
            let path = dir.join(file);
            match tokio::fs::write(&path, UNLIMITED).await {
                Ok(()) => {
                    written += 1;
                    self.health
                        .log_operational(&format!(
                            "container handleStart id={short} at=swap file={file} count#SwapOverride=1"
                        ))
                        .await;
                }
                Err(e) => {
                    self.health
                        .log_operational(&format!(
                            "container handleStart id={short} at=swap file={file} count#SwapOverrideError=1 err={:?}",
                            e.to_string()
                        ))
                        .await;
                }
            }
        }
        written
    }
}
