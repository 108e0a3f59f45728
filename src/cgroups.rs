//! Direct control-group manipulation.
//!
//! The engine exposes no online resource update for the knobs the manager
//! needs, so resource updates reach into the kernel's cgroup filesystem
//! directly: resolve the v1 hierarchy a subsystem is mounted at, resolve
//! the group the container's root pid currently belongs to, and write the
//! control files. The hierarchy lookups are memoized once per process and
//! treated as immutable afterwards.
//!
//! Missing hierarchies, missing groups, and absent resource fields are
//! tolerated with a warning; write failures are propagated.

use crate::constants::{CPU_SHARES_PER_CPU, MIN_CPU_SHARES, MIN_MEMORY_BYTES};
use crate::error::{Error, Result};
use crate::spec::Resources;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

// =============================================================================
// Share / Limit Math
// =============================================================================

/// Converts a fractional cpu allocation into `cpu.shares`, flooring at
/// [`MIN_CPU_SHARES`].
pub fn shares_for_cpus(cpus: f64) -> u64 {
    ((CPU_SHARES_PER_CPU as f64 * cpus) as u64).max(MIN_CPU_SHARES)
}

/// Clamps a requested memory limit to the [`MIN_MEMORY_BYTES`] floor.
pub fn clamp_memory_limit(bytes: u64) -> u64 {
    bytes.max(MIN_MEMORY_BYTES)
}

// =============================================================================
// /proc Parsing
// =============================================================================

/// Finds the mount point of the cgroup v1 hierarchy carrying `subsystem`
/// in `/proc/mounts` content.
pub fn parse_mounts(content: &str, subsystem: &str) -> Option<PathBuf> {
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let _device = fields.next()?;
        let mount_point = fields.next()?;
        let fstype = fields.next()?;
        let options = fields.next()?;

        if fstype == "cgroup" && options.split(',').any(|o| o == subsystem) {
            return Some(PathBuf::from(mount_point));
        }
    }
    None
}

/// Finds the group a process belongs to for `subsystem` in
/// `/proc/<pid>/cgroup` content.
///
/// Lines look like `4:cpu,cpuacct:/docker/<id>`.
pub fn parse_proc_cgroup(content: &str, subsystem: &str) -> Option<String> {
    for line in content.lines() {
        let mut fields = line.splitn(3, ':');
        let _id = fields.next()?;
        let controllers = fields.next()?;
        let group = fields.next()?;

        if controllers.split(',').any(|c| c == subsystem) {
            return Some(group.to_string());
        }
    }
    None
}

// =============================================================================
// Hierarchy / Group Resolution
// =============================================================================

/// Resolves the mount point of the hierarchy carrying `subsystem`, or
/// `None` when no such hierarchy is mounted.
pub fn hierarchy(subsystem: &str) -> Result<Option<PathBuf>> {
    let content = fs::read_to_string("/proc/mounts").map_err(|e| Error::Cgroup {
        what: format!("'{}' hierarchy", subsystem),
        reason: e.to_string(),
    })?;
    Ok(parse_mounts(&content, subsystem))
}

fn memoized_hierarchy(
    cell: &'static OnceLock<std::result::Result<Option<PathBuf>, String>>,
    subsystem: &'static str,
) -> Result<Option<PathBuf>> {
    let cached = cell.get_or_init(|| hierarchy(subsystem).map_err(|e| e.to_string()));
    match cached {
        Ok(mount) => Ok(mount.clone()),
        Err(reason) => Err(Error::Cgroup {
            what: format!("'{}' hierarchy", subsystem),
            reason: reason.clone(),
        }),
    }
}

/// Mount point of the `cpu` hierarchy, resolved once per process.
pub fn cpu_hierarchy() -> Result<Option<PathBuf>> {
    static CPU: OnceLock<std::result::Result<Option<PathBuf>, String>> = OnceLock::new();
    memoized_hierarchy(&CPU, "cpu")
}

/// Mount point of the `memory` hierarchy, resolved once per process.
pub fn memory_hierarchy() -> Result<Option<PathBuf>> {
    static MEMORY: OnceLock<std::result::Result<Option<PathBuf>, String>> = OnceLock::new();
    memoized_hierarchy(&MEMORY, "memory")
}

/// Resolves the group `pid` currently belongs to for `subsystem`, or
/// `None` if the pid is not a member of any such group.
pub fn cgroup_of(pid: i32, subsystem: &str) -> Result<Option<String>> {
    let path = format!("/proc/{}/cgroup", pid);
    let content = fs::read_to_string(&path).map_err(|e| Error::Cgroup {
        what: format!("lookup for pid {}", pid),
        reason: e.to_string(),
    })?;
    Ok(parse_proc_cgroup(&content, subsystem))
}

// =============================================================================
// Control Files
// =============================================================================

fn control_path(hierarchy: &Path, group: &str, control: &str) -> PathBuf {
    hierarchy.join(group.trim_start_matches('/')).join(control)
}

fn read_control(hierarchy: &Path, group: &str, control: &str) -> Result<String> {
    let path = control_path(hierarchy, group, control);
    fs::read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| Error::Cgroup {
            what: format!("read of '{}'", control),
            reason: format!("{}: {}", path.display(), e),
        })
}

fn write_control(hierarchy: &Path, group: &str, control: &str, value: u64) -> Result<()> {
    let path = control_path(hierarchy, group, control);
    fs::write(&path, value.to_string()).map_err(|e| Error::Cgroup {
        what: format!("write of '{}'", control),
        reason: format!("{}: {}", path.display(), e),
    })
}

// =============================================================================
// Limit Application
// =============================================================================

/// Applies a new allocation to the groups the container's root `pid`
/// belongs to.
///
/// Cpu shares are written outright. The memory soft limit is always
/// written, but the hard limit only ever grows: shrinking a running
/// process's hard limit can trigger an immediate OOM, so shrinks are left
/// to an external memory watcher.
pub fn apply_limits(pid: i32, resources: &Resources) -> Result<()> {
    let cpu_hierarchy = cpu_hierarchy()?;
    let memory_hierarchy = memory_hierarchy()?;

    if let Some(cpus) = resources.cpus {
        let group = cgroup_of(pid, "cpu")?;
        if group.is_none() {
            warn!(
                "pid {} does not appear to be a member of a cgroup \
                 where the 'cpu' subsystem is mounted",
                pid
            );
        }

        if let (Some(hierarchy), Some(group)) = (cpu_hierarchy.as_ref(), group.as_ref()) {
            let shares = shares_for_cpus(cpus);
            write_control(hierarchy, group, "cpu.shares", shares)?;
            info!(
                "updated 'cpu.shares' to {} at {}",
                shares,
                control_path(hierarchy, group, "cpu.shares").display()
            );
        }
    }

    if let Some(mem) = resources.mem_bytes {
        let group = cgroup_of(pid, "memory")?;
        if group.is_none() {
            warn!(
                "pid {} does not appear to be a member of a cgroup \
                 where the 'memory' subsystem is mounted",
                pid
            );
        }

        if let (Some(hierarchy), Some(group)) = (memory_hierarchy.as_ref(), group.as_ref()) {
            let limit = clamp_memory_limit(mem);

            // Always set the soft limit.
            write_control(hierarchy, group, "memory.soft_limit_in_bytes", limit)?;
            info!("updated 'memory.soft_limit_in_bytes' to {}", limit);

            let current: u64 = read_control(hierarchy, group, "memory.limit_in_bytes")?
                .parse()
                .map_err(|e| Error::Cgroup {
                    what: "read of 'memory.limit_in_bytes'".to_string(),
                    reason: format!("unparsable value: {}", e),
                })?;

            // Only ever raise the hard limit.
            if limit > current {
                write_control(hierarchy, group, "memory.limit_in_bytes", limit)?;
                info!(
                    "updated 'memory.limit_in_bytes' to {} at {}",
                    limit,
                    control_path(hierarchy, group, "memory.limit_in_bytes").display()
                );
            }
        }
    }

    Ok(())
}
