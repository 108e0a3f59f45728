//! Agent-side configuration consumed by the manager.

use crate::constants::{DEFAULT_DOCKER, DEFAULT_RECOVERY_TIMEOUT};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the container lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the docker CLI binary.
    #[serde(default = "default_docker")]
    pub docker: PathBuf,

    /// Agent work directory; recoverable metadata lives under
    /// `<work_dir>/meta`.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Seconds executors should wait for the agent to come back after a
    /// restart. Passed to executors through their environment.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

fn default_docker() -> PathBuf {
    PathBuf::from(DEFAULT_DOCKER)
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/stevedore")
}

fn default_recovery_timeout_secs() -> u64 {
    DEFAULT_RECOVERY_TIMEOUT.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker: default_docker(),
            work_dir: default_work_dir(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

impl Config {
    /// Loads configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Recovery timeout as a [`Duration`].
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}
