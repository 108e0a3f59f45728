//! Task and executor descriptions handed to the manager by the agent.
//!
//! These are plain value types: the agent deserializes them from its wire
//! messages and the manager only reads them. The one piece of logic that
//! lives here is [`CommandInfo::docker_image`], which decides whether a
//! launch request belongs to this containerizer at all.

use crate::constants::DOCKER_IMAGE_SCHEME;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// Container Id
// =============================================================================

/// Opaque container identifier assigned by the caller.
///
/// The unique key for all per-container state in the manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ContainerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// =============================================================================
// Resources
// =============================================================================

/// Resource allocation for a container.
///
/// Only the two dimensions the manager can enforce online are modeled;
/// absent fields mean "no opinion", not zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Fractional cpus, e.g. `0.5` or `2.0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,

    /// Memory limit in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_bytes: Option<u64>,
}

impl Resources {
    /// Creates an allocation with both dimensions set.
    pub fn new(cpus: f64, mem_bytes: u64) -> Self {
        Self {
            cpus: Some(cpus),
            mem_bytes: Some(mem_bytes),
        }
    }

    /// Returns true if neither supported resource is present.
    pub fn is_empty(&self) -> bool {
        self.cpus.is_none() && self.mem_bytes.is_none()
    }
}

// =============================================================================
// Command / Executor / Task Descriptions
// =============================================================================

/// Container qualifier on a command: which image to run it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Image URI, e.g. `docker:///nginx`.
    pub image: String,
}

/// A command to run, optionally inside a container image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    /// Shell command line.
    pub value: String,

    /// Container qualifier; absent means "run on the bare agent".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ImageInfo>,

    /// Command-level environment variables, layered on top of the
    /// agent-composed executor environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

impl CommandInfo {
    /// Creates a bare command with no container qualifier.
    pub fn shell(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            container: None,
            environment: BTreeMap::new(),
        }
    }

    /// Returns the docker image name if this command carries a container
    /// qualifier with the recognized scheme.
    ///
    /// `None` means the command is not ours to launch.
    pub fn docker_image(&self) -> Option<&str> {
        self.container
            .as_ref()
            .and_then(|c| c.image.strip_prefix(DOCKER_IMAGE_SCHEME))
    }
}

/// Description of an executor: the task's controller process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    /// Executor id, unique within the framework.
    pub executor_id: String,

    /// Owning framework.
    pub framework_id: String,

    /// Command that starts the executor.
    pub command: CommandInfo,

    /// Resources allocated to the executor itself.
    #[serde(default)]
    pub resources: Resources,
}

/// Description of a task to launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task id, assigned by the framework.
    pub task_id: String,

    /// Command to run; tasks without one are not launchable here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,

    /// Resources allocated to the task.
    #[serde(default)]
    pub resources: Resources,
}

// =============================================================================
// Termination
// =============================================================================

/// Final observable outcome of a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Termination {
    /// True if teardown was requested externally; false if the supervised
    /// child exited on its own.
    pub killed: bool,

    /// Exit code of the supervised child, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,

    /// Human-readable cause.
    pub message: String,
}

// =============================================================================
// Resource Statistics
// =============================================================================

/// A usage sample for a container, derived from its root process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatistics {
    /// Seconds since the epoch when the sample was taken.
    pub timestamp: f64,

    /// User-mode cpu time consumed, in seconds.
    pub cpus_user_time_secs: f64,

    /// Kernel-mode cpu time consumed, in seconds.
    pub cpus_system_time_secs: f64,

    /// Last-known cpu allocation, when the manager has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus_limit: Option<f64>,

    /// Resident set size in bytes.
    pub mem_rss_bytes: u64,

    /// Last-known memory allocation, when the manager has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_limit_bytes: Option<u64>,

    /// Thread count of the root process, when sampled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
}
