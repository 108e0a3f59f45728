//! The container lifecycle manager.
//!
//! A single-threaded actor that bridges the agent's containerizer contract
//! (launch, wait, update, usage, destroy, recover, containers) onto the
//! external engine's primitives while supervising a local executor child
//! per task.
//!
//! # Serialization
//!
//! All per-container state lives in one task draining a mailbox. External
//! callers and asynchronous completions (engine calls, reaper waits) alike
//! become messages, so every state transition is processed in dispatch
//! order and no lock is ever taken. Engine calls run in spawned tasks; the
//! subprocess fork, the pid checkpoint, and the one-byte handshake happen
//! inline in the launch continuation. They are short pipe and file
//! operations, and keeping them inline means a destroy can never
//! interleave with them.
//!
//! # Lifecycle
//!
//! ```text
//! launch ─► run ─► continuation ─► reaper registered
//!    │                                   │ child exits
//!    │ external destroy                  ▼
//!    └────────────► destroy ◄─── reaped(killed=false)
//!                      │ engine kill
//!                      ▼
//!                  _destroy ─► exit status settles ─► __destroy
//!                                                   (resolve + purge)
//! ```

use crate::checkpoint;
use crate::config::Config;
use crate::constants::{
    DOCKER_NAME_PREFIX, ENV_AGENT_ENDPOINT, ENV_AGENT_ID, ENV_CHECKPOINT, ENV_EXECUTOR_DIRECTORY,
    ENV_EXECUTOR_ID, ENV_FRAMEWORK_ID, ENV_RECOVERY_TIMEOUT_SECS, MAILBOX_CAPACITY,
};
use crate::engine::{Container, ContainerEngine};
use crate::error::{Error, Result};
use crate::name;
use crate::reaper::Reaper;
use crate::spec::{ContainerId, ExecutorInfo, ResourceStatistics, Resources, TaskInfo, Termination};
use crate::state::AgentState;
use crate::{cgroups, usage};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

// =============================================================================
// Launch Requests
// =============================================================================

/// Request to launch a container whose root process is the executor.
#[derive(Debug, Clone)]
pub struct ExecutorLaunch {
    /// Container id assigned by the agent.
    pub container_id: ContainerId,
    /// The executor to run.
    pub executor: ExecutorInfo,
    /// Sandbox directory for the run.
    pub directory: PathBuf,
    /// User to run as; accepted for interface parity, the engine runs the
    /// container as the image dictates.
    pub user: Option<String>,
    /// Id of this agent.
    pub agent_id: String,
    /// Endpoint executors report back to.
    pub agent_endpoint: String,
    /// Whether to checkpoint the executor pid for recovery.
    pub checkpoint: bool,
}

/// Request to launch a task container supervised by a locally forked
/// executor.
#[derive(Debug, Clone)]
pub struct TaskLaunch {
    /// Container id assigned by the agent.
    pub container_id: ContainerId,
    /// The task to run inside the engine container.
    pub task: TaskInfo,
    /// The executor forked locally to supervise it.
    pub executor: ExecutorInfo,
    /// Sandbox directory for the run; the executor's stdout/stderr land
    /// here.
    pub directory: PathBuf,
    /// User to run as; accepted for interface parity.
    pub user: Option<String>,
    /// Id of this agent.
    pub agent_id: String,
    /// Endpoint executors report back to.
    pub agent_endpoint: String,
    /// Whether to checkpoint the executor pid for recovery.
    pub checkpoint: bool,
}

// =============================================================================
// Termination Promise
// =============================================================================

/// Single-assignment holder for a container's termination.
///
/// Its presence in the promises table is what "the manager owns this
/// container" means. Resolution happens at most once; a failed destroy
/// leaves the promise failed but in place so a retry remains possible.
struct TerminationPromise {
    state: PromiseState,
}

enum PromiseState {
    Open(Vec<oneshot::Sender<Result<Termination>>>),
    Failed(String),
}

impl TerminationPromise {
    fn new() -> Self {
        Self {
            state: PromiseState::Open(Vec::new()),
        }
    }

    fn subscribe(&mut self, waiter: oneshot::Sender<Result<Termination>>) {
        match &mut self.state {
            PromiseState::Open(waiters) => waiters.push(waiter),
            PromiseState::Failed(reason) => {
                let _ = waiter.send(Err(Error::DestroyFailed {
                    reason: reason.clone(),
                }));
            }
        }
    }

    fn set(self, termination: Termination) {
        if let PromiseState::Open(waiters) = self.state {
            for waiter in waiters {
                let _ = waiter.send(Ok(termination.clone()));
            }
        }
    }

    fn fail(&mut self, reason: String) {
        if let PromiseState::Open(waiters) = std::mem::replace(
            &mut self.state,
            PromiseState::Failed(reason.clone()),
        ) {
            for waiter in waiters {
                let _ = waiter.send(Err(Error::DestroyFailed {
                    reason: reason.clone(),
                }));
            }
        }
    }
}

/// Exit-status entry for a supervised child.
#[derive(Debug, Clone, Copy)]
enum ExitEntry {
    /// Reaper registered, child still running.
    Pending,
    /// Child reaped (or a synthetic no-status completion from destroy).
    Settled(Option<i32>),
}

/// What the reaper should watch for a container.
enum Watched {
    /// A child process we forked ourselves.
    Child(Child),
    /// A pid we adopted (engine container root, or recovery).
    Pid(i32),
}

// =============================================================================
// Mailbox
// =============================================================================

type UnitReply = oneshot::Sender<Result<()>>;
type BoolReply = oneshot::Sender<Result<bool>>;
type StatsReply = oneshot::Sender<Result<ResourceStatistics>>;

enum Msg {
    Recover {
        state: Option<AgentState>,
        reply: UnitReply,
    },
    Reconcile {
        containers: Vec<Container>,
        reply: UnitReply,
    },
    LaunchExecutor {
        launch: Box<ExecutorLaunch>,
        reply: BoolReply,
    },
    ExecutorInspected {
        launch: Box<ExecutorLaunch>,
        container: Container,
        reply: BoolReply,
    },
    LaunchTask {
        launch: Box<TaskLaunch>,
        reply: BoolReply,
    },
    TaskStarted {
        launch: Box<TaskLaunch>,
        reply: BoolReply,
    },
    Update {
        container_id: ContainerId,
        resources: Resources,
        reply: UnitReply,
    },
    UpdateInspected {
        resources: Resources,
        container: Container,
        reply: UnitReply,
    },
    Usage {
        container_id: ContainerId,
        reply: StatsReply,
    },
    UsageInspected {
        container_id: ContainerId,
        container: Container,
        reply: StatsReply,
    },
    Wait {
        container_id: ContainerId,
        reply: oneshot::Sender<Result<Termination>>,
    },
    Destroy {
        container_id: ContainerId,
        killed: bool,
    },
    KillFinished {
        container_id: ContainerId,
        killed: bool,
        result: Result<()>,
    },
    Reaped {
        container_id: ContainerId,
        status: Option<i32>,
    },
    Containers {
        reply: oneshot::Sender<HashSet<ContainerId>>,
    },
}

// =============================================================================
// Public Handle
// =============================================================================

/// Handle to the container lifecycle manager.
///
/// Cheap to clone; all clones talk to the same actor. The actor exits when
/// the last handle is dropped and every in-flight completion has drained.
#[derive(Clone)]
pub struct DockerContainerizer {
    tx: mpsc::Sender<Msg>,
}

impl DockerContainerizer {
    /// Creates a manager over the given engine and reaper and starts its
    /// dispatch task.
    pub fn new(config: Config, engine: Arc<dyn ContainerEngine>, reaper: Arc<dyn Reaper>) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

        let inner = Inner {
            config,
            engine,
            reaper,
            tx: tx.clone(),
            promises: HashMap::new(),
            statuses: HashMap::new(),
            resources: HashMap::new(),
            destroying: HashSet::new(),
            pending_destroy: HashMap::new(),
        };
        tokio::spawn(inner.run(rx));

        Self { tx }
    }

    async fn call<T>(&self, message: Msg, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::Internal("containerizer terminated".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("containerizer dropped the request".to_string()))?
    }

    /// Reconciles persisted run state with the live engine.
    ///
    /// Must be called once at startup, before any launch. Adopts live
    /// executors from the snapshot and garbage-collects engine containers
    /// that carry our name prefix but are no longer known.
    pub async fn recover(&self, state: Option<AgentState>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.call(Msg::Recover { state, reply }, rx).await
    }

    /// Launches a container whose root process is the executor itself.
    ///
    /// Returns `Ok(false)` without creating any state when the executor's
    /// command does not name a recognized docker image; the task belongs
    /// to another containerizer.
    pub async fn launch_executor(&self, launch: ExecutorLaunch) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Msg::LaunchExecutor {
                launch: Box::new(launch),
                reply,
            },
            rx,
        )
        .await
    }

    /// Launches a task container plus a locally forked executor that
    /// supervises it.
    ///
    /// Returns `Ok(false)` without creating any state when the task's
    /// command does not name a recognized docker image.
    pub async fn launch_task(&self, launch: TaskLaunch) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Msg::LaunchTask {
                launch: Box::new(launch),
                reply,
            },
            rx,
        )
        .await
    }

    /// Applies a new resource allocation to a running container.
    ///
    /// A no-op returning success on unknown containers and on non-Linux
    /// platforms; callers must not depend on enforcement.
    pub async fn update(&self, container_id: &ContainerId, resources: Resources) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Msg::Update {
                container_id: container_id.clone(),
                resources,
                reply,
            },
            rx,
        )
        .await
    }

    /// Samples resource usage of a container, annotated with its
    /// last-known limits.
    pub async fn usage(&self, container_id: &ContainerId) -> Result<ResourceStatistics> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Msg::Usage {
                container_id: container_id.clone(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Waits for a container's termination.
    pub async fn wait(&self, container_id: &ContainerId) -> Result<Termination> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Msg::Wait {
                container_id: container_id.clone(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Initiates teardown of a container.
    ///
    /// Idempotent and safe at any point after launch entry; the outcome is
    /// observed through [`wait`](Self::wait).
    pub async fn destroy(&self, container_id: &ContainerId) {
        let _ = self
            .tx
            .send(Msg::Destroy {
                container_id: container_id.clone(),
                killed: true,
            })
            .await;
    }

    /// Returns the set of currently owned container ids.
    pub async fn containers(&self) -> Result<HashSet<ContainerId>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Msg::Containers { reply })
            .await
            .map_err(|_| Error::Internal("containerizer terminated".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("containerizer dropped the request".to_string()))
    }
}

// =============================================================================
// Actor
// =============================================================================

struct Inner {
    config: Config,
    engine: Arc<dyn ContainerEngine>,
    reaper: Arc<dyn Reaper>,
    /// Self-sender: spawned completions fold back into the mailbox.
    tx: mpsc::Sender<Msg>,

    /// Termination promises; presence defines ownership.
    promises: HashMap<ContainerId, TerminationPromise>,
    /// Exit-status entries for supervised children.
    statuses: HashMap<ContainerId, ExitEntry>,
    /// Last-known resource allocation per container.
    resources: HashMap<ContainerId, Resources>,
    /// Containers with a destroy in flight.
    destroying: HashSet<ContainerId>,
    /// Destroys whose engine kill finished but whose exit status is still
    /// pending, keyed to the `killed` flag to report.
    pending_destroy: HashMap<ContainerId, bool>,
}

impl Inner {
    async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        while let Some(message) = rx.recv().await {
            self.dispatch(message).await;
        }
        debug!("containerizer mailbox closed, dispatch task exiting");
    }

    async fn dispatch(&mut self, message: Msg) {
        match message {
            Msg::Recover { state, reply } => self.recover(state, reply),
            Msg::Reconcile { containers, reply } => self.reconcile(containers, reply),
            Msg::LaunchExecutor { launch, reply } => self.launch_executor(*launch, reply),
            Msg::ExecutorInspected {
                launch,
                container,
                reply,
            } => self.executor_inspected(*launch, container, reply),
            Msg::LaunchTask { launch, reply } => self.launch_task(*launch, reply),
            Msg::TaskStarted { launch, reply } => self.task_started(*launch, reply).await,
            Msg::Update {
                container_id,
                resources,
                reply,
            } => self.update(container_id, resources, reply),
            Msg::UpdateInspected {
                resources,
                container,
                reply,
            } => Self::update_inspected(resources, container, reply),
            Msg::Usage {
                container_id,
                reply,
            } => self.usage(container_id, reply),
            Msg::UsageInspected {
                container_id,
                container,
                reply,
            } => self.usage_inspected(container_id, container, reply),
            Msg::Wait {
                container_id,
                reply,
            } => self.wait(container_id, reply),
            Msg::Destroy {
                container_id,
                killed,
            } => self.destroy(container_id, killed),
            Msg::KillFinished {
                container_id,
                killed,
                result,
            } => self.kill_finished(container_id, killed, result),
            Msg::Reaped {
                container_id,
                status,
            } => self.reaped(container_id, status),
            Msg::Containers { reply } => {
                let _ = reply.send(self.promises.keys().cloned().collect());
            }
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    fn recover(&mut self, state: Option<AgentState>, reply: UnitReply) {
        info!("recovering docker containers");

        if let Some(state) = state {
            // Pids we have started reaping, to detect the (very unlikely)
            // case of a pid reused across two runs the agent never saw
            // terminate.
            let mut pids: HashMap<i32, ContainerId> = HashMap::new();

            for framework in state.frameworks.values() {
                for executor in framework.executors.values() {
                    if executor.info.is_none() {
                        warn!(
                            "skipping recovery of executor '{}' of framework {} \
                             because its info could not be recovered",
                            executor.id, framework.id
                        );
                        continue;
                    }

                    let Some(container_id) = executor.latest.clone() else {
                        warn!(
                            "skipping recovery of executor '{}' of framework {} \
                             because its latest run could not be recovered",
                            executor.id, framework.id
                        );
                        continue;
                    };

                    // Only the latest run of the executor matters.
                    let Some(run) = executor.runs.get(&container_id) else {
                        let _ = reply.send(Err(Error::RecoveryFailed(format!(
                            "no run state recorded for latest container {}",
                            container_id
                        ))));
                        return;
                    };

                    if run.id.as_ref() != Some(&container_id) {
                        let _ = reply.send(Err(Error::RecoveryFailed(format!(
                            "run state id {:?} does not match latest container {}",
                            run.id, container_id
                        ))));
                        return;
                    }

                    // Without a pid the reaper has nothing to monitor; the
                    // agent's own wait will surface a failed termination.
                    let Some(pid) = run.forked_pid else {
                        continue;
                    };

                    if run.completed {
                        debug!(
                            "skipping recovery of executor '{}' of framework {} \
                             because its latest run {} is completed",
                            executor.id, framework.id, container_id
                        );
                        continue;
                    }

                    info!(
                        "recovering container '{}' for executor '{}' of framework {}",
                        container_id, executor.id, framework.id
                    );

                    self.promises
                        .insert(container_id.clone(), TerminationPromise::new());
                    self.watch(container_id.clone(), Watched::Pid(pid));

                    if let Some(first) = pids.get(&pid) {
                        // An executor exited, its pid was reused by a newly
                        // launched one, and the agent died between the two
                        // events so both appear live.
                        let _ = reply.send(Err(Error::DuplicatePid {
                            pid,
                            first: first.clone(),
                            second: container_id,
                        }));
                        return;
                    }
                    pids.insert(pid, container_id);
                }
            }
        }

        // Enumerate every engine container carrying our prefix, running or
        // exited, so orphans can be removed.
        let engine = self.engine.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match engine.ps(true, DOCKER_NAME_PREFIX).await {
                Ok(containers) => {
                    let _ = tx.send(Msg::Reconcile { containers, reply }).await;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        });
    }

    fn reconcile(&mut self, containers: Vec<Container>, reply: UnitReply) {
        for container in containers {
            debug!(
                "checking if docker container named '{}' was started by this agent",
                container.name
            );

            let Some(container_id) = name::parse(&container.name) else {
                continue;
            };

            debug!(
                "checking if container with id '{}' has been orphaned",
                container_id
            );

            // Ownership is promise existence; a mid-launch container has a
            // promise before its reaper is registered and must not be
            // treated as an orphan.
            if self.promises.contains_key(&container_id) {
                continue;
            }

            // Orphan: remove it, best-effort.
            // TODO(recovery): retry the removal if it failed but the
            // container still exists.
            let engine = self.engine.clone();
            let engine_id = container.id.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.kill(&engine_id, true).await {
                    warn!("failed to remove orphaned container {}: {}", engine_id, e);
                }
            });
        }

        let _ = reply.send(Ok(()));
    }

    // =========================================================================
    // Executor Launch
    // =========================================================================

    fn launch_executor(&mut self, launch: ExecutorLaunch, reply: BoolReply) {
        let container_id = launch.container_id.clone();

        if self.promises.contains_key(&container_id) {
            let _ = reply.send(Err(Error::AlreadyStarted(container_id)));
            return;
        }

        let command = &launch.executor.command;
        if command.container.is_none() {
            info!("no container info found, skipping launch");
            let _ = reply.send(Ok(false));
            return;
        }
        let Some(image) = command.docker_image() else {
            info!("no docker image found, skipping launch");
            let _ = reply.send(Ok(false));
            return;
        };

        self.promises
            .insert(container_id.clone(), TerminationPromise::new());

        info!(
            "starting container '{}' for executor '{}' and framework '{}'",
            container_id, launch.executor.executor_id, launch.executor.framework_id
        );

        let image = image.to_string();
        let command_line = command.value.clone();
        let container_name = name::container_name(&container_id);
        let resources = launch.executor.resources.clone();

        let mut env = self.executor_environment(&launch.executor, &launch.directory, &launch.agent_id, &launch.agent_endpoint, launch.checkpoint);
        env.extend(command.environment.clone());

        // Start the engine container, then inspect it for the root pid;
        // any failure along the way reaps the remnants via destroy.
        let engine = self.engine.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Err(e) = engine
                .run(&image, &command_line, &container_name, &resources, &env)
                .await
            {
                let _ = tx
                    .send(Msg::Destroy {
                        container_id,
                        killed: false,
                    })
                    .await;
                let _ = reply.send(Err(e));
                return;
            }

            match engine.inspect(&container_name).await {
                Ok(container) => {
                    let _ = tx
                        .send(Msg::ExecutorInspected {
                            launch: Box::new(launch),
                            container,
                            reply,
                        })
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(Msg::Destroy {
                            container_id,
                            killed: false,
                        })
                        .await;
                    let _ = reply.send(Err(e));
                }
            }
        });
    }

    fn executor_inspected(
        &mut self,
        launch: ExecutorLaunch,
        container: Container,
        reply: BoolReply,
    ) {
        let container_id = launch.container_id;

        if !self.promises.contains_key(&container_id) {
            warn!(
                "container '{}' was destroyed before its launch completed",
                container_id
            );
            let _ = reply.send(Err(Error::NotOwned(container_id)));
            return;
        }

        let Some(pid) = container.pid else {
            let _ = reply.send(Err(Error::PidUnavailable(container_id.clone())));
            self.destroy(container_id, false);
            return;
        };

        if launch.checkpoint {
            // TODO(recovery): if the agent dies before this checkpoint
            // lands while the executor keeps running, the container cannot
            // be re-adopted; encoding the identifiers into the engine name
            // would close the hole.
            let path = checkpoint::forked_pid_path(
                &checkpoint::meta_root(&self.config.work_dir),
                &launch.agent_id,
                &launch.executor.framework_id,
                &launch.executor.executor_id,
                &container_id,
            );

            info!(
                "checkpointing executor's forked pid {} to '{}'",
                pid,
                path.display()
            );

            if let Err(e) = checkpoint::checkpoint(&path, &pid.to_string()) {
                error!("{}", e);
                let _ = reply.send(Err(e));
                self.destroy(container_id, false);
                return;
            }
        }

        self.watch(container_id, Watched::Pid(pid));
        let _ = reply.send(Ok(true));
    }

    // =========================================================================
    // Task Launch
    // =========================================================================

    fn launch_task(&mut self, launch: TaskLaunch, reply: BoolReply) {
        let container_id = launch.container_id.clone();

        if self.promises.contains_key(&container_id) {
            let _ = reply.send(Err(Error::AlreadyStarted(container_id)));
            return;
        }

        let Some(command) = launch.task.command.as_ref() else {
            warn!("not expecting a task launch without command info");
            let _ = reply.send(Ok(false));
            return;
        };

        let Some(image) = command.docker_image() else {
            info!("no container info or image is not a docker image, skipping launch");
            let _ = reply.send(Ok(false));
            return;
        };

        self.promises
            .insert(container_id.clone(), TerminationPromise::new());

        // Remember the allocation so usage() can report limits.
        self.resources
            .insert(container_id.clone(), launch.task.resources.clone());

        info!(
            "starting container '{}' for task '{}' (and executor '{}') of framework '{}'",
            container_id,
            launch.task.task_id,
            launch.executor.executor_id,
            launch.executor.framework_id
        );

        let image = image.to_string();
        let command_line = command.value.clone();
        let container_name = name::container_name(&container_id);
        let resources = launch.task.resources.clone();

        // Start the engine container, then fork the supervising executor
        // back on the dispatch task.
        let engine = self.engine.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match engine
                .run(&image, &command_line, &container_name, &resources, &BTreeMap::new())
                .await
            {
                Ok(()) => {
                    let _ = tx
                        .send(Msg::TaskStarted {
                            launch: Box::new(launch),
                            reply,
                        })
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(Msg::Destroy {
                            container_id,
                            killed: false,
                        })
                        .await;
                    let _ = reply.send(Err(e));
                }
            }
        });
    }

    async fn task_started(&mut self, launch: TaskLaunch, reply: BoolReply) {
        let container_id = launch.container_id.clone();

        if !self.promises.contains_key(&container_id) {
            warn!(
                "container '{}' was destroyed before its launch completed",
                container_id
            );
            let _ = reply.send(Err(Error::NotOwned(container_id)));
            return;
        }

        let mut env = self.executor_environment(
            &launch.executor,
            &launch.directory,
            &launch.agent_id,
            &launch.agent_endpoint,
            launch.checkpoint,
        );
        env.extend(launch.executor.command.environment.clone());

        // The executor supervises the engine container by doing an engine
        // `wait` on our name for it; the subshell makes the container's
        // exit code (not the wait CLI's) the executor's own.
        let container_name = name::container_name(&container_id);
        let override_command = format!(
            "/bin/sh -c 'exit `{} wait {}`'",
            self.config.docker.display(),
            container_name
        );
        let command_line = format!(
            "{} --override {}",
            launch.executor.command.value, override_command
        );

        let mut child = match spawn_executor(&command_line, &launch.directory, &env) {
            Ok(child) => child,
            Err(e) => {
                let _ = reply.send(Err(Error::SpawnFailed(e.to_string())));
                self.destroy(container_id, false);
                return;
            }
        };

        let Some(pid) = child.id() else {
            let _ = reply.send(Err(Error::SpawnFailed(
                "child exited before it could be supervised".to_string(),
            )));
            self.destroy(container_id, false);
            return;
        };
        let pid = pid as i32;

        let mut stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = reply.send(Err(Error::SpawnFailed(
                    "child has no stdin pipe".to_string(),
                )));
                self.destroy(container_id, false);
                return;
            }
        };

        // Persist the pid before releasing the child: if this fails the
        // closed pipe makes the handshake read fail and the child aborts,
        // so it never runs unsupervised.
        if launch.checkpoint {
            let path = checkpoint::forked_pid_path(
                &checkpoint::meta_root(&self.config.work_dir),
                &launch.agent_id,
                &launch.executor.framework_id,
                &launch.executor.executor_id,
                &container_id,
            );

            info!(
                "checkpointing executor's forked pid {} to '{}'",
                pid,
                path.display()
            );

            if let Err(e) = checkpoint::checkpoint(&path, &pid.to_string()) {
                error!("{}", e);
                drop(stdin);
                let _ = reply.send(Err(e));
                self.destroy(container_id, false);
                return;
            }
        }

        // Checkpoint complete; release the child.
        if let Err(e) = stdin.write_all(b"\n").await {
            drop(stdin);
            let _ = reply.send(Err(Error::SynchronizeFailed(e.to_string())));
            self.destroy(container_id, false);
            return;
        }
        drop(stdin);

        self.watch(container_id, Watched::Child(child));
        let _ = reply.send(Ok(true));
    }

    // =========================================================================
    // Update
    // =========================================================================

    fn update(&mut self, container_id: ContainerId, resources: Resources, reply: UnitReply) {
        if !self.promises.contains_key(&container_id) {
            warn!("ignoring update of unknown container: {}", container_id);
            let _ = reply.send(Ok(()));
            return;
        }

        // Store the allocation for usage().
        self.resources
            .insert(container_id.clone(), resources.clone());

        // Enforcement needs cgroups; elsewhere the update is a documented
        // no-op.
        if !cfg!(target_os = "linux") {
            let _ = reply.send(Ok(()));
            return;
        }

        if resources.is_empty() {
            warn!("ignoring update as no supported resources are present");
            let _ = reply.send(Ok(()));
            return;
        }

        let container_name = name::container_name(&container_id);
        let engine = self.engine.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match engine.inspect(&container_name).await {
                Ok(container) => {
                    let _ = tx
                        .send(Msg::UpdateInspected {
                            resources,
                            container,
                            reply,
                        })
                        .await;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        });
    }

    fn update_inspected(resources: Resources, container: Container, reply: UnitReply) {
        // The container already exited; nothing to update.
        let Some(pid) = container.pid else {
            let _ = reply.send(Ok(()));
            return;
        };

        tokio::task::spawn_blocking(move || {
            let _ = reply.send(cgroups::apply_limits(pid, &resources));
        });
    }

    // =========================================================================
    // Usage
    // =========================================================================

    fn usage(&mut self, container_id: ContainerId, reply: StatsReply) {
        if !cfg!(target_os = "linux") {
            let _ = reply.send(Err(Error::UnsupportedPlatform("usage()")));
            return;
        }

        if !self.promises.contains_key(&container_id) {
            let _ = reply.send(Err(Error::NotOwned(container_id)));
            return;
        }

        if self.destroying.contains(&container_id) {
            let _ = reply.send(Err(Error::BeingDestroyed(container_id)));
            return;
        }

        let container_name = name::container_name(&container_id);
        let engine = self.engine.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match engine.inspect(&container_name).await {
                Ok(container) => {
                    let _ = tx
                        .send(Msg::UsageInspected {
                            container_id,
                            container,
                            reply,
                        })
                        .await;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        });
    }

    fn usage_inspected(
        &mut self,
        container_id: ContainerId,
        container: Container,
        reply: StatsReply,
    ) {
        let Some(pid) = container.pid else {
            let _ = reply.send(Err(Error::NotRunning(container_id)));
            return;
        };

        // Annotate the sample with the allocation known at this point.
        let limits = self.resources.get(&container_id).cloned();

        tokio::task::spawn_blocking(move || {
            // The root process acts as init inside the container, so
            // sampling it with children and threads covers everything.
            let result = usage::usage(pid, true, true).map(|mut statistics| {
                if let Some(limits) = limits {
                    if let Some(mem) = limits.mem_bytes {
                        statistics.mem_limit_bytes = Some(mem);
                    }
                    if let Some(cpus) = limits.cpus {
                        statistics.cpus_limit = Some(cpus);
                    }
                }
                statistics
            });
            let _ = reply.send(result);
        });
    }

    // =========================================================================
    // Wait
    // =========================================================================

    fn wait(&mut self, container_id: ContainerId, reply: oneshot::Sender<Result<Termination>>) {
        match self.promises.get_mut(&container_id) {
            Some(promise) => promise.subscribe(reply),
            None => {
                let _ = reply.send(Err(Error::NotOwned(container_id)));
            }
        }
    }

    // =========================================================================
    // Destroy
    // =========================================================================

    /// Initiates teardown. `killed` records whether teardown was requested
    /// (externally or by a failed launch) or the supervised child simply
    /// exited.
    fn destroy(&mut self, container_id: ContainerId, killed: bool) {
        if !self.promises.contains_key(&container_id) {
            warn!("ignoring destroy of unknown container: {}", container_id);
            return;
        }

        if self.destroying.contains(&container_id) {
            // Destroy has already been initiated.
            return;
        }
        self.destroying.insert(container_id.clone());

        info!("destroying container '{}'", container_id);

        // Force-remove on the engine. The supervised process (container
        // root, or forked executor doing an engine wait) exits as a
        // consequence and the reaper supplies the exit status. There may
        // be nothing to remove if the launch failed early; removing
        // regardless keeps the teardown path uniform.
        let container_name = name::container_name(&container_id);
        let engine = self.engine.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = engine.kill(&container_name, true).await;
            let _ = tx
                .send(Msg::KillFinished {
                    container_id,
                    killed,
                    result,
                })
                .await;
        });
    }

    fn kill_finished(&mut self, container_id: ContainerId, killed: bool, result: Result<()>) {
        if let Err(e) = result {
            if let Some(promise) = self.promises.get_mut(&container_id) {
                promise.fail(format!("failed to destroy container: {}", e));
            }
            // Leave the container owned so a destroy retry is possible.
            self.destroying.remove(&container_id);
            return;
        }

        // A destroy can arrive before any reaper was registered (the
        // launch failed up front); substitute a settled no-status entry so
        // the final stage is uniform.
        let entry = self
            .statuses
            .entry(container_id.clone())
            .or_insert(ExitEntry::Settled(None));

        match *entry {
            ExitEntry::Settled(status) => self.finish_destroy(container_id, killed, status),
            ExitEntry::Pending => {
                // The exit status arrives with the reaper; finish then.
                self.pending_destroy.insert(container_id, killed);
            }
        }
    }

    /// Final destroy stage: resolve the termination promise and purge
    /// every record for the container.
    fn finish_destroy(&mut self, container_id: ContainerId, killed: bool, status: Option<i32>) {
        let termination = Termination {
            killed,
            status,
            message: if killed {
                "Docker task killed".to_string()
            } else {
                "Docker process terminated".to_string()
            },
        };

        if let Some(promise) = self.promises.remove(&container_id) {
            promise.set(termination);
        }

        self.destroying.remove(&container_id);
        self.pending_destroy.remove(&container_id);
        self.statuses.remove(&container_id);
        self.resources.remove(&container_id);
    }

    // =========================================================================
    // Reaper Glue
    // =========================================================================

    /// Registers the exit-status entry for a container and watches the
    /// supervised process.
    fn watch(&mut self, container_id: ContainerId, watched: Watched) {
        self.statuses.insert(container_id.clone(), ExitEntry::Pending);

        let reaper = self.reaper.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let status = match watched {
                Watched::Child(child) => reaper.reap_child(child).await,
                Watched::Pid(pid) => reaper.reap_pid(pid).await,
            };
            let _ = tx
                .send(Msg::Reaped {
                    container_id,
                    status,
                })
                .await;
        });
    }

    fn reaped(&mut self, container_id: ContainerId, status: Option<i32>) {
        match self.statuses.get_mut(&container_id) {
            Some(entry) => *entry = ExitEntry::Settled(status),
            // Already purged; nothing may produce side effects anymore.
            None => return,
        }

        // A destroy was waiting for exactly this status.
        if let Some(killed) = self.pending_destroy.remove(&container_id) {
            self.finish_destroy(container_id, killed, status);
            return;
        }

        if self.promises.contains_key(&container_id) {
            info!("executor for container '{}' has exited", container_id);
            self.destroy(container_id, false);
        }
    }

    // =========================================================================
    // Executor Environment
    // =========================================================================

    /// Environment the agent supplies to every executor it launches.
    fn executor_environment(
        &self,
        executor: &ExecutorInfo,
        directory: &Path,
        agent_id: &str,
        agent_endpoint: &str,
        checkpoint: bool,
    ) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            ENV_EXECUTOR_DIRECTORY.to_string(),
            directory.display().to_string(),
        );
        env.insert(ENV_AGENT_ID.to_string(), agent_id.to_string());
        env.insert(ENV_AGENT_ENDPOINT.to_string(), agent_endpoint.to_string());
        env.insert(
            ENV_FRAMEWORK_ID.to_string(),
            executor.framework_id.clone(),
        );
        env.insert(ENV_EXECUTOR_ID.to_string(), executor.executor_id.clone());
        env.insert(
            ENV_CHECKPOINT.to_string(),
            if checkpoint { "1" } else { "0" }.to_string(),
        );
        env.insert(
            ENV_RECOVERY_TIMEOUT_SECS.to_string(),
            self.config.recovery_timeout_secs.to_string(),
        );
        env
    }
}

// =============================================================================
// Executor Subprocess
// =============================================================================

/// Forks the executor child with its stdio wired into the sandbox and the
/// synchronization handshake armed.
///
/// The child enters its own session and changes into the sandbox directory
/// before exec, then blocks reading the handshake from stdin before the
/// executor command runs. The parent writes the release byte only after
/// all pre-start persistence succeeded; on any failure it closes the pipe
/// instead, the read sees end-of-file, and the child aborts without ever
/// running unsupervised.
///
/// The blocking read lives on the exec side of the fork rather than in a
/// pre-exec hook: the standard library's spawn does not return until the
/// child has exec'd, so a pre-exec hook that waits for the parent would
/// deadlock the launch.
fn spawn_executor(
    command_line: &str,
    directory: &Path,
    env: &BTreeMap<String, String>,
) -> std::io::Result<Child> {
    let stdout = std::fs::File::create(directory.join("stdout"))?;
    let stderr = std::fs::File::create(directory.join("stderr"))?;

    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        // `read` consumes the single release byte and fails on a closed
        // pipe, which is exactly the abort condition.
        .arg(format!("read REPLY || exit 1; {}", command_line))
        .env_clear()
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;

        // Built ahead of the fork: the pre-exec hook must not allocate.
        let directory = std::ffi::CString::new(directory.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        unsafe {
            command.pre_exec(move || {
                // Own session, so signals aimed at the agent's process
                // group do not cascade into the executor.
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                if libc::chdir(directory.as_ptr()) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
    }

    command.spawn()
}
