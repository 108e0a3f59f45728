//! Container engine client.
//!
//! The engine is an out-of-process daemon the manager cannot parent; it is
//! driven through the capability set in [`ContainerEngine`]. The production
//! implementation, [`DockerCli`], shells out to the docker binary and
//! parses its JSON output; tests substitute a scripted engine.

use crate::error::{Error, Result};
use crate::spec::Resources;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

// =============================================================================
// Engine Capability Set
// =============================================================================

/// An engine-side container as reported by `inspect`.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    /// Engine-assigned container id.
    pub id: String,

    /// Engine-visible name (engines may report a leading slash).
    pub name: String,

    /// Pid of the container's root process; absent if not running.
    pub pid: Option<i32>,

    /// When the root process was started, if it ever was.
    pub started_at: Option<DateTime<Utc>>,
}

/// Capability set the manager consumes from the engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Starts a container detached under `name`.
    async fn run(
        &self,
        image: &str,
        command: &str,
        name: &str,
        resources: &Resources,
        env: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Looks up a container by name or id.
    async fn inspect(&self, name: &str) -> Result<Container>;

    /// Forcibly removes a container. Success means it no longer exists.
    async fn kill(&self, container: &str, force: bool) -> Result<()>;

    /// Enumerates containers whose name carries `prefix`.
    async fn ps(&self, all: bool, prefix: &str) -> Result<Vec<Container>>;
}

// =============================================================================
// Docker CLI Client
// =============================================================================

/// Engine client backed by the docker CLI.
pub struct DockerCli {
    docker: PathBuf,
}

impl DockerCli {
    /// Creates a client using the given docker binary.
    pub fn new(docker: PathBuf) -> Self {
        Self { docker }
    }

    /// Path to the docker binary this client drives.
    pub fn docker(&self) -> &PathBuf {
        &self.docker
    }

    async fn execute(&self, op: &'static str, args: &[String]) -> Result<Output> {
        debug!("docker {}", args.join(" "));

        let output = Command::new(&self.docker)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Engine {
                op,
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::Engine {
                op,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output)
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn run(
        &self,
        image: &str,
        command: &str,
        name: &str,
        resources: &Resources,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];

        if let Some(cpus) = resources.cpus {
            let shares = crate::cgroups::shares_for_cpus(cpus);
            args.push("--cpu-shares".to_string());
            args.push(shares.to_string());
        }

        if let Some(mem) = resources.mem_bytes {
            args.push("--memory".to_string());
            args.push(mem.to_string());
        }

        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(image.to_string());

        if !command.is_empty() {
            args.push("/bin/sh".to_string());
            args.push("-c".to_string());
            args.push(command.to_string());
        }

        self.execute("run", &args).await?;
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<Container> {
        let output = self
            .execute("inspect", &["inspect".to_string(), name.to_string()])
            .await?;

        parse_inspect_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn kill(&self, container: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(container.to_string());

        self.execute("kill", &args).await?;
        Ok(())
    }

    async fn ps(&self, all: bool, prefix: &str) -> Result<Vec<Container>> {
        let mut args = vec!["ps".to_string(), "--no-trunc".to_string(), "-q".to_string()];
        if all {
            args.push("-a".to_string());
        }

        let output = self.execute("ps", &args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        let mut containers = Vec::new();
        for id in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let container = self.inspect(id).await?;
            if container.name.trim_start_matches('/').starts_with(prefix) {
                containers.push(container);
            }
        }

        Ok(containers)
    }
}

// =============================================================================
// Inspect Output Parsing
// =============================================================================

#[derive(Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Pid")]
    pid: i64,
    #[serde(rename = "StartedAt", default)]
    started_at: Option<String>,
}

/// Parses the JSON array printed by `docker inspect`.
pub fn parse_inspect_output(stdout: &str) -> Result<Container> {
    let entries: Vec<InspectEntry> =
        serde_json::from_str(stdout).map_err(|e| Error::Engine {
            op: "inspect",
            reason: format!("malformed inspect output: {}", e),
        })?;

    let entry = entries.into_iter().next().ok_or(Error::Engine {
        op: "inspect",
        reason: "inspect returned no containers".to_string(),
    })?;

    Ok(Container {
        id: entry.id,
        name: entry.name,
        // Docker reports pid 0 for containers with no running root process.
        pid: (entry.state.pid > 0).then_some(entry.state.pid as i32),
        started_at: entry.state.started_at.as_deref().and_then(parse_started_at),
    })
}

fn parse_started_at(raw: &str) -> Option<DateTime<Utc>> {
    // Docker's zero value for a container that never started.
    if raw.starts_with("0001-01-01") {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNNING: &str = r#"[{
        "Id": "8dfafdbc3a40",
        "Name": "/stevedore-c1",
        "State": {"Pid": 4321, "Running": true, "StartedAt": "2024-03-01T12:00:00.123456789Z"}
    }]"#;

    const STOPPED: &str = r#"[{
        "Id": "8dfafdbc3a40",
        "Name": "/stevedore-c1",
        "State": {"Pid": 0, "Running": false, "StartedAt": "0001-01-01T00:00:00Z"}
    }]"#;

    #[test]
    fn parses_running_container() {
        let container = parse_inspect_output(RUNNING).unwrap();
        assert_eq!(container.id, "8dfafdbc3a40");
        assert_eq!(container.name, "/stevedore-c1");
        assert_eq!(container.pid, Some(4321));
        assert!(container.started_at.is_some());
    }

    #[test]
    fn stopped_container_has_no_pid() {
        let container = parse_inspect_output(STOPPED).unwrap();
        assert_eq!(container.pid, None);
        assert_eq!(container.started_at, None);
    }

    #[test]
    fn empty_inspect_is_an_error() {
        assert!(parse_inspect_output("[]").is_err());
        assert!(parse_inspect_output("not json").is_err());
    }
}
