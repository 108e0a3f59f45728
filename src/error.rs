//! Error types for the container lifecycle manager.

use crate::spec::ContainerId;
use std::path::PathBuf;

/// Result type alias for manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the container lifecycle manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Launch was attempted for a container id that is already owned.
    #[error("container already started: {0}")]
    AlreadyStarted(ContainerId),

    /// Operation on a container id the manager does not own.
    #[error("unknown container: {0}")]
    NotOwned(ContainerId),

    /// Operation raced with an in-flight destroy.
    #[error("container is being removed: {0}")]
    BeingDestroyed(ContainerId),

    /// Container exists but has no running root process.
    #[error("container is not running: {0}")]
    NotRunning(ContainerId),

    /// Engine reported no root pid after a successful launch.
    #[error("unable to get executor pid after launch of container {0}")]
    PidUnavailable(ContainerId),

    /// Teardown could not complete.
    #[error("failed to destroy container: {reason}")]
    DestroyFailed { reason: String },

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// A container engine call failed.
    #[error("engine {op} failed: {reason}")]
    Engine { op: &'static str, reason: String },

    // =========================================================================
    // Launch Errors
    // =========================================================================
    /// Forking the local executor child failed.
    #[error("failed to fork executor: {0}")]
    SpawnFailed(String),

    /// Persisting the forked pid failed.
    #[error("could not checkpoint executor's pid to {path}: {reason}")]
    CheckpointFailed { path: PathBuf, reason: String },

    /// The handshake byte could not be delivered to the executor child.
    #[error("failed to synchronize with child process: {0}")]
    SynchronizeFailed(String),

    // =========================================================================
    // Recovery Errors
    // =========================================================================
    /// Two live runs in the snapshot share one pid.
    #[error("detected duplicate pid {pid} for containers {first} and {second}")]
    DuplicatePid {
        pid: i32,
        first: ContainerId,
        second: ContainerId,
    },

    /// The persisted snapshot is unusable.
    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// cgroup hierarchy resolution, lookup, or control-file access failed.
    #[error("cgroup {what}: {reason}")]
    Cgroup { what: String, reason: String },

    /// Operation requires Linux.
    #[error("{0} is not supported on this platform")]
    UnsupportedPlatform(&'static str),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration could not be loaded or parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    // =========================================================================
    // I/O and Internal Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}
