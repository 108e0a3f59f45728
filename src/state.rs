//! Persisted run state handed to the manager at recovery.
//!
//! The agent checkpoints this hierarchy while running; after a restart it
//! deserializes the snapshot and passes it to
//! [`recover`](crate::manager::DockerContainerizer::recover). The manager
//! only reads it.

use crate::spec::{ContainerId, ExecutorInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Snapshot of everything the agent knew before it restarted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    /// Frameworks keyed by framework id.
    #[serde(default)]
    pub frameworks: HashMap<String, FrameworkState>,
}

/// Persisted state of one framework.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkState {
    /// Framework id.
    pub id: String,

    /// Executors keyed by executor id.
    #[serde(default)]
    pub executors: HashMap<String, ExecutorState>,
}

/// Persisted state of one executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorState {
    /// Executor id.
    pub id: String,

    /// Executor description; absent if its checkpoint was unreadable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<ExecutorInfo>,

    /// Container id of the executor's most recent run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<ContainerId>,

    /// All recorded runs, keyed by container id.
    #[serde(default)]
    pub runs: HashMap<ContainerId, RunState>,
}

/// Persisted state of a single run of an executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    /// Container id of the run; must match the map key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<ContainerId>,

    /// Pid of the forked executor child; absent if the agent died before
    /// the pid checkpoint landed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_pid: Option<i32>,

    /// True once the run terminated and its termination was processed.
    #[serde(default)]
    pub completed: bool,
}
