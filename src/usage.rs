//! Resource-statistics probe.
//!
//! Given a container's root pid, samples cpu and memory counters from
//! `/proc/<pid>/stat`. Sampling the root alone is enough for engine
//! containers: the root process acts as init inside the pid namespace, so
//! no children escape it, and the kernel folds waited-on children's cpu
//! time into the root's `cutime`/`cstime` fields.

use crate::error::{Error, Result};
use crate::spec::ResourceStatistics;
use std::time::{SystemTime, UNIX_EPOCH};

/// Parsed counters from one `/proc/<pid>/stat` line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatSample {
    /// User-mode jiffies of the process itself.
    pub utime: u64,
    /// Kernel-mode jiffies of the process itself.
    pub stime: u64,
    /// User-mode jiffies of waited-on children.
    pub cutime: u64,
    /// Kernel-mode jiffies of waited-on children.
    pub cstime: u64,
    /// Thread count.
    pub num_threads: u32,
    /// Resident set size in pages.
    pub rss_pages: u64,
}

/// Parses a `/proc/<pid>/stat` line.
///
/// The second field (the command name) is parenthesized and may itself
/// contain spaces or parentheses, so fields are counted from the last
/// closing parenthesis.
pub fn parse_stat_line(line: &str) -> Option<StatSample> {
    let rest = &line[line.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // After the command name: fields[0] is the state (field 3 of the
    // documented layout), so utime (field 14) lands at index 11.
    Some(StatSample {
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        cutime: fields.get(13)?.parse::<i64>().ok()?.max(0) as u64,
        cstime: fields.get(14)?.parse::<i64>().ok()?.max(0) as u64,
        num_threads: fields.get(17)?.parse().ok()?,
        rss_pages: fields.get(21)?.parse::<i64>().ok()?.max(0) as u64,
    })
}

fn ticks_per_second() -> f64 {
    #[cfg(unix)]
    {
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 {
            return ticks as f64;
        }
    }
    100.0
}

fn page_size() -> u64 {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as u64;
        }
    }
    4096
}

/// Samples resource usage of the process tree rooted at `pid`.
///
/// With `include_children`, cpu time of waited-on children is folded in;
/// with `include_threads`, the thread count is reported.
pub fn usage(pid: i32, include_children: bool, include_threads: bool) -> Result<ResourceStatistics> {
    let path = format!("/proc/{}/stat", pid);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::Internal(format!("failed to read {}: {}", path, e)))?;

    let sample = parse_stat_line(&content)
        .ok_or_else(|| Error::Internal(format!("malformed stat line in {}", path)))?;

    let ticks = ticks_per_second();
    let mut user_jiffies = sample.utime;
    let mut system_jiffies = sample.stime;
    if include_children {
        user_jiffies += sample.cutime;
        system_jiffies += sample.cstime;
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    Ok(ResourceStatistics {
        timestamp,
        cpus_user_time_secs: user_jiffies as f64 / ticks,
        cpus_system_time_secs: system_jiffies as f64 / ticks,
        cpus_limit: None,
        mem_rss_bytes: sample.rss_pages * page_size(),
        mem_limit_bytes: None,
        threads: include_threads.then_some(sample.num_threads),
    })
}
