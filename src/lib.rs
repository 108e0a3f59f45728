//! # stevedore
//!
//! **Docker-backed container lifecycle manager for a cluster-agent node.**
//!
//! This crate bridges the agent's containerizer contract (launch, wait,
//! update, usage, destroy, recover, containers) onto an external container
//! engine's primitives (run, inspect, kill, ps), while supervising a local
//! executor child process that acts as each task's controller.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       DockerContainerizer                       │
//! │        launch · wait · update · usage · destroy · recover       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      single-threaded actor                      │
//! │   promises │ exit statuses │ resources │ destroying (mailbox)   │
//! ├──────────────┬──────────────────┬───────────────┬───────────────┤
//! │ ContainerEngine│     Reaper      │  checkpoint   │    cgroups    │
//! │ run/inspect/ │ child-exit       │ forked-pid    │ cpu.shares /  │
//! │ kill/ps      │ notification     │ persistence   │ memory limits │
//! └──────────────┴──────────────────┴───────────────┴───────────────┘
//! ```
//!
//! The engine is an out-of-process daemon with no parent-child relationship
//! to the agent, so three asynchronous worlds have to be stitched together:
//!
//! 1. The engine itself, queried but never parented.
//! 2. A local executor child, whose kernel reaping is the only reliable
//!    termination signal. For task launches the executor's lifetime is tied
//!    to the container via an engine `wait` whose exit code it propagates.
//! 3. The agent's recovery protocol, which must reconcile live engine
//!    containers with persisted metadata without killing live workloads or
//!    leaking orphans.
//!
//! # Ownership Model
//!
//! A container is "owned" exactly while its termination promise exists.
//! Launch creates the promise; destroy resolves it exactly once and purges
//! every record. Destroys initiated externally, by a failed launch, and by
//! the reaper all converge on one idempotent teardown path.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stevedore::{
//!     Config, ContainerId, DockerCli, DockerContainerizer, OsReaper,
//!     TaskLaunch,
//! };
//!
//! #[tokio::main]
//! async fn main() -> stevedore::Result<()> {
//!     let config = Config::default();
//!     let engine = Arc::new(DockerCli::new(config.docker.clone()));
//!     let containerizer = DockerContainerizer::new(config, engine, Arc::new(OsReaper::new()));
//!
//!     // Reconcile with whatever survived the last agent run.
//!     containerizer.recover(None).await?;
//!
//!     // Launch, then wait for the task's terminal state.
//!     let id = ContainerId::from("c1");
//!     containerizer.launch_task(task_launch(&id)).await?;
//!     let termination = containerizer.wait(&id).await?;
//!     println!("{}", termination.message);
//!
//!     Ok(())
//! }
//! ```

// =============================================================================
// Modules
// =============================================================================

pub mod cgroups;
pub mod checkpoint;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod manager;
pub mod name;
pub mod reaper;
pub mod spec;
pub mod state;
pub mod usage;

// =============================================================================
// Facade Re-exports
// =============================================================================

pub use config::Config;
pub use engine::{Container, ContainerEngine, DockerCli};
pub use error::{Error, Result};
pub use manager::{DockerContainerizer, ExecutorLaunch, TaskLaunch};
pub use reaper::{OsReaper, Reaper};
pub use spec::{
    CommandInfo, ContainerId, ExecutorInfo, ImageInfo, ResourceStatistics, Resources, TaskInfo,
    Termination,
};
pub use state::{AgentState, ExecutorState, FrameworkState, RunState};
