//! Constants for the container lifecycle manager.
//!
//! All prefixes, floors, and intervals are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Engine Naming
// =============================================================================

/// Prefix applied to every engine-visible container name.
///
/// This is how the manager tells its own containers apart from co-tenants
/// on the same engine: names are produced as `<prefix><container-id>` on
/// launch and stripped again during recovery.
//
// TODO(recovery): running multiple agents against one engine requires the
// agent id in this prefix; until then recovery misclassifies containers
// across agents.
pub const DOCKER_NAME_PREFIX: &str = "stevedore-";

/// Image URI scheme the manager recognizes as its own.
///
/// A launch whose image does not carry this scheme is declined (`false`)
/// so another containerizer can claim the task.
pub const DOCKER_IMAGE_SCHEME: &str = "docker:///";

/// Default docker CLI binary, resolved via `PATH`.
pub const DEFAULT_DOCKER: &str = "docker";

// =============================================================================
// Resource Floors
// =============================================================================

/// cgroup cpu shares corresponding to one full cpu.
pub const CPU_SHARES_PER_CPU: u64 = 1024;

/// Floor for `cpu.shares`; the kernel misbehaves below this.
pub const MIN_CPU_SHARES: u64 = 10;

/// Floor for the memory limit (32 MiB).
pub const MIN_MEMORY_BYTES: u64 = 32 * 1024 * 1024;

// =============================================================================
// Supervision
// =============================================================================

/// Poll interval when watching a pid that is not our child.
pub const REAPER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of the manager's mailbox.
pub const MAILBOX_CAPACITY: usize = 256;

/// Default grace period handed to executors for recovery reconnection.
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

// =============================================================================
// Checkpoint Layout
// =============================================================================

/// Subdirectory of the work dir holding recoverable agent metadata.
pub const META_DIR: &str = "meta";

/// File name under a run's `pids/` directory holding the forked pid.
pub const FORKED_PID_FILE: &str = "forked.pid";

// =============================================================================
// Executor Environment
// =============================================================================

/// Sandbox directory the executor runs in.
pub const ENV_EXECUTOR_DIRECTORY: &str = "EXECUTOR_DIRECTORY";

/// Id of the agent that launched the executor.
pub const ENV_AGENT_ID: &str = "AGENT_ID";

/// Endpoint of the agent process the executor reports back to.
pub const ENV_AGENT_ENDPOINT: &str = "AGENT_ENDPOINT";

/// Framework the executor belongs to.
pub const ENV_FRAMEWORK_ID: &str = "FRAMEWORK_ID";

/// Id of the executor itself.
pub const ENV_EXECUTOR_ID: &str = "EXECUTOR_ID";

/// Whether the framework has checkpointing enabled ("1" or "0").
pub const ENV_CHECKPOINT: &str = "CHECKPOINT";

/// Seconds the executor should wait for the agent to recover.
pub const ENV_RECOVERY_TIMEOUT_SECS: &str = "RECOVERY_TIMEOUT_SECS";
