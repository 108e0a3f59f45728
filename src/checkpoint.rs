//! Forked-pid checkpointing.
//!
//! The agent owns the on-disk layout of its recoverable metadata; the
//! manager only needs the one path where a run's forked executor pid is
//! persisted, and an atomic write so a crash never leaves a torn pid file.

use crate::constants::{FORKED_PID_FILE, META_DIR};
use crate::error::{Error, Result};
use crate::spec::ContainerId;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Root of the agent's recoverable metadata under the work dir.
pub fn meta_root(work_dir: &Path) -> PathBuf {
    work_dir.join(META_DIR)
}

/// Path where a run's forked executor pid is checkpointed.
pub fn forked_pid_path(
    meta_root: &Path,
    agent_id: &str,
    framework_id: &str,
    executor_id: &str,
    container_id: &ContainerId,
) -> PathBuf {
    meta_root
        .join("agents")
        .join(agent_id)
        .join("frameworks")
        .join(framework_id)
        .join("executors")
        .join(executor_id)
        .join("runs")
        .join(container_id.as_str())
        .join("pids")
        .join(FORKED_PID_FILE)
}

/// Atomically persists `content` at `path`.
///
/// Writes to a temp file in the target directory and renames it into
/// place, so readers never observe a partial write. Last writer wins;
/// by construction there is never more than one writer per path.
pub fn checkpoint(path: &Path, content: &str) -> Result<()> {
    let failed = |reason: String| Error::CheckpointFailed {
        path: path.to_path_buf(),
        reason,
    };

    let parent = path
        .parent()
        .ok_or_else(|| failed("path has no parent directory".to_string()))?;
    fs::create_dir_all(parent).map_err(|e| failed(e.to_string()))?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).map_err(|e| failed(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| failed(e.to_string()))?;

    debug!("checkpointed {} bytes to {}", content.len(), path.display());
    Ok(())
}
