//! End-to-end tests for the container lifecycle manager.
//!
//! Drives the manager against a scripted engine and reaper: the engine
//! records every call and answers from canned state, the reaper hands each
//! watch request to the test so it decides when and how the supervised
//! process "exits".

#![cfg(unix)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stevedore::engine::Container;
use stevedore::{
    AgentState, CommandInfo, Config, ContainerEngine, ContainerId, DockerContainerizer, Error,
    ExecutorInfo, ExecutorLaunch, FrameworkState, ImageInfo, Reaper, Resources, RunState,
    TaskInfo, TaskLaunch,
};
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

// =============================================================================
// Scripted Engine
// =============================================================================

#[derive(Default)]
struct MockEngine {
    /// (image, name) per run call.
    runs: Mutex<Vec<(String, String)>>,
    /// Container-or-name per kill call.
    kills: Mutex<Vec<String>>,
    /// Pid reported by inspect.
    inspect_pid: Mutex<Option<i32>>,
    /// Containers reported by ps.
    ps_containers: Mutex<Vec<Container>>,
    fail_run: AtomicBool,
    fail_kill: AtomicBool,
    block_run: AtomicBool,
}

impl MockEngine {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn runs(&self) -> Vec<(String, String)> {
        self.runs.lock().unwrap().clone()
    }

    fn kills(&self) -> Vec<String> {
        self.kills.lock().unwrap().clone()
    }

    fn set_inspect_pid(&self, pid: Option<i32>) {
        *self.inspect_pid.lock().unwrap() = pid;
    }

    fn set_ps(&self, containers: Vec<Container>) {
        *self.ps_containers.lock().unwrap() = containers;
    }
}

fn engine_container(name: &str, pid: Option<i32>) -> Container {
    Container {
        id: format!("engine-{}", name.trim_start_matches('/')),
        name: name.to_string(),
        pid,
        started_at: None,
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn run(
        &self,
        image: &str,
        _command: &str,
        name: &str,
        _resources: &Resources,
        _env: &BTreeMap<String, String>,
    ) -> stevedore::Result<()> {
        self.runs
            .lock()
            .unwrap()
            .push((image.to_string(), name.to_string()));

        while self.block_run.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        if self.fail_run.load(Ordering::SeqCst) {
            return Err(Error::Engine {
                op: "run",
                reason: "no such image".to_string(),
            });
        }
        Ok(())
    }

    async fn inspect(&self, name: &str) -> stevedore::Result<Container> {
        let pid = *self.inspect_pid.lock().unwrap();
        Ok(engine_container(&format!("/{}", name), pid))
    }

    async fn kill(&self, container: &str, _force: bool) -> stevedore::Result<()> {
        self.kills.lock().unwrap().push(container.to_string());
        if self.fail_kill.load(Ordering::SeqCst) {
            return Err(Error::Engine {
                op: "kill",
                reason: "daemon unreachable".to_string(),
            });
        }
        Ok(())
    }

    async fn ps(&self, _all: bool, prefix: &str) -> stevedore::Result<Vec<Container>> {
        Ok(self
            .ps_containers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.name.trim_start_matches('/').starts_with(prefix))
            .cloned()
            .collect())
    }
}

// =============================================================================
// Scripted Reaper
// =============================================================================

/// One watch request surfaced to the test; drop it or answer it.
struct ReapHandle {
    pid: i32,
    respond: oneshot::Sender<Option<i32>>,
}

struct MockReaper {
    tx: mpsc::UnboundedSender<ReapHandle>,
}

impl MockReaper {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ReapHandle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl Reaper for MockReaper {
    async fn reap_child(&self, mut child: tokio::process::Child) -> Option<i32> {
        let pid = child.id().map(|p| p as i32).unwrap_or(-1);

        // Reap the real child so the test host sees no zombies; the
        // scripted status below is what the manager observes.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(ReapHandle { pid, respond });
        rx.await.unwrap_or(None)
    }

    async fn reap_pid(&self, pid: i32) -> Option<i32> {
        let (respond, rx) = oneshot::channel();
        let _ = self.tx.send(ReapHandle { pid, respond });
        rx.await.unwrap_or(None)
    }
}

// =============================================================================
// Fixtures
// =============================================================================

struct Fixture {
    containerizer: DockerContainerizer,
    engine: Arc<MockEngine>,
    reaps: mpsc::UnboundedReceiver<ReapHandle>,
    sandbox: TempDir,
}

fn fixture() -> Fixture {
    // Surface manager logs in failing tests; ignore the error when a
    // previous fixture already installed the subscriber.
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let sandbox = TempDir::new().unwrap();
    let config = Config {
        docker: "/usr/bin/docker".into(),
        work_dir: sandbox.path().to_path_buf(),
        recovery_timeout_secs: 60,
    };

    let engine = MockEngine::new();
    let (reaper, reaps) = MockReaper::new();
    let containerizer = DockerContainerizer::new(config, engine.clone(), reaper);

    Fixture {
        containerizer,
        engine,
        reaps,
        sandbox,
    }
}

fn executor_info(command: CommandInfo) -> ExecutorInfo {
    ExecutorInfo {
        executor_id: "executor-1".to_string(),
        framework_id: "framework-1".to_string(),
        command,
        resources: Resources::default(),
    }
}

fn docker_command(value: &str, image: &str) -> CommandInfo {
    let mut command = CommandInfo::shell(value);
    command.container = Some(ImageInfo {
        image: image.to_string(),
    });
    command
}

fn task_launch(directory: &Path, id: &str, image: &str) -> TaskLaunch {
    TaskLaunch {
        container_id: ContainerId::from(id),
        task: TaskInfo {
            task_id: "task-1".to_string(),
            command: Some(docker_command("echo task", image)),
            resources: Resources::new(1.0, 256 * 1024 * 1024),
        },
        // `true` ignores the appended --override clause and exits
        // immediately once the handshake byte releases it.
        executor: executor_info(CommandInfo::shell("true")),
        directory: directory.to_path_buf(),
        user: None,
        agent_id: "agent-1".to_string(),
        agent_endpoint: "agent@localhost:5051".to_string(),
        checkpoint: false,
    }
}

fn executor_launch(directory: &Path, id: &str, image: &str) -> ExecutorLaunch {
    ExecutorLaunch {
        container_id: ContainerId::from(id),
        executor: executor_info(docker_command("run-executor", image)),
        directory: directory.to_path_buf(),
        user: None,
        agent_id: "agent-1".to_string(),
        agent_endpoint: "agent@localhost:5051".to_string(),
        checkpoint: false,
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within timeout");
}

async fn next_reap(reaps: &mut mpsc::UnboundedReceiver<ReapHandle>) -> ReapHandle {
    tokio::time::timeout(Duration::from_secs(5), reaps.recv())
        .await
        .expect("no reap request within timeout")
        .expect("reaper channel closed")
}

type WaitHandle = tokio::task::JoinHandle<stevedore::Result<stevedore::Termination>>;

/// Subscribes to a container's termination and lets the subscription reach
/// the manager before anything else is enqueued.
async fn subscribe_wait(containerizer: &DockerContainerizer, id: &ContainerId) -> WaitHandle {
    let containerizer = containerizer.clone();
    let id = id.clone();
    let waiter = tokio::spawn(async move { containerizer.wait(&id).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    waiter
}

// =============================================================================
// Launch Ownership Detection
// =============================================================================

#[tokio::test]
async fn test_unrecognized_image_is_declined_without_trace() {
    let f = fixture();
    let id = ContainerId::from("c2");

    let launched = f
        .containerizer
        .launch_task(task_launch(f.sandbox.path(), "c2", "oci:///foo"))
        .await
        .unwrap();
    assert!(!launched);

    // No state was created and the engine was never asked to run anything.
    assert!(matches!(
        f.containerizer.wait(&id).await,
        Err(Error::NotOwned(_))
    ));
    assert!(f.containerizer.containers().await.unwrap().is_empty());
    assert!(f.engine.runs().is_empty());
}

#[tokio::test]
async fn test_executor_without_container_info_is_declined() {
    let f = fixture();

    let launch = ExecutorLaunch {
        executor: executor_info(CommandInfo::shell("run-executor")),
        ..executor_launch(f.sandbox.path(), "c3", "docker:///busybox")
    };

    assert!(!f.containerizer.launch_executor(launch).await.unwrap());
    assert!(f.engine.runs().is_empty());
}

#[tokio::test]
async fn test_task_without_command_is_declined() {
    let f = fixture();

    let mut launch = task_launch(f.sandbox.path(), "c4", "docker:///busybox");
    launch.task.command = None;

    assert!(!f.containerizer.launch_task(launch).await.unwrap());
    assert!(f.engine.runs().is_empty());
}

#[tokio::test]
async fn test_launch_into_owned_id_fails() {
    let f = fixture();
    f.engine.block_run.store(true, Ordering::SeqCst);

    let containerizer = f.containerizer.clone();
    let sandbox = f.sandbox.path().to_path_buf();
    let first = tokio::spawn(async move {
        containerizer
            .launch_task(task_launch(&sandbox, "c1", "docker:///nginx"))
            .await
    });

    // The first launch has entered and is suspended in the engine run.
    eventually(|| !f.engine.runs().is_empty()).await;

    let second = f
        .containerizer
        .launch_task(task_launch(f.sandbox.path(), "c1", "docker:///nginx"))
        .await;
    assert!(matches!(second, Err(Error::AlreadyStarted(_))));

    first.abort();
}

// =============================================================================
// Task Launch / Termination
// =============================================================================

#[tokio::test]
async fn test_happy_path_task_launch() {
    let mut f = fixture();
    let id = ContainerId::from("c1");

    let launched = f
        .containerizer
        .launch_task(task_launch(f.sandbox.path(), "c1", "docker:///nginx"))
        .await
        .unwrap();
    assert!(launched);

    assert_eq!(
        f.engine.runs(),
        vec![("nginx".to_string(), "stevedore-c1".to_string())]
    );

    // The executor's stdio was redirected into the sandbox.
    assert!(f.sandbox.path().join("stdout").exists());
    assert!(f.sandbox.path().join("stderr").exists());

    // Wait is pending until the supervised child exits.
    let waiter = subscribe_wait(&f.containerizer, &id).await;

    // The child exits cleanly; the reaper reports it.
    let reap = next_reap(&mut f.reaps).await;
    assert!(reap.pid > 0);
    reap.respond.send(Some(0)).unwrap();

    let termination = waiter.await.unwrap().unwrap();
    assert!(!termination.killed);
    assert_eq!(termination.status, Some(0));
    assert_eq!(termination.message, "Docker process terminated");

    // The engine container was removed and all state purged.
    eventually(|| !f.engine.kills().is_empty()).await;
    assert_eq!(f.engine.kills(), vec!["stevedore-c1".to_string()]);
    assert!(f.containerizer.containers().await.unwrap().is_empty());
    assert!(matches!(
        f.containerizer.wait(&id).await,
        Err(Error::NotOwned(_))
    ));
}

#[tokio::test]
async fn test_destroy_reports_killed() {
    let mut f = fixture();
    let id = ContainerId::from("c1");

    f.containerizer
        .launch_task(task_launch(f.sandbox.path(), "c1", "docker:///nginx"))
        .await
        .unwrap();

    let waiter = subscribe_wait(&f.containerizer, &id).await;

    f.containerizer.destroy(&id).await;
    eventually(|| !f.engine.kills().is_empty()).await;

    // The kill makes the supervised executor exit.
    let reap = next_reap(&mut f.reaps).await;
    reap.respond.send(Some(137)).unwrap();

    let termination = waiter.await.unwrap().unwrap();
    assert!(termination.killed);
    assert_eq!(termination.message, "Docker task killed");

    assert!(f.containerizer.containers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_destroy_during_launch() {
    let f = fixture();
    let id = ContainerId::from("c1");
    f.engine.block_run.store(true, Ordering::SeqCst);

    let launcher = {
        let containerizer = f.containerizer.clone();
        let sandbox = f.sandbox.path().to_path_buf();
        tokio::spawn(async move {
            containerizer
                .launch_task(task_launch(&sandbox, "c1", "docker:///nginx"))
                .await
        })
    };
    eventually(|| !f.engine.runs().is_empty()).await;

    // Subscribe before destroying: the promise resolves exactly once.
    let waiter = subscribe_wait(&f.containerizer, &id).await;

    // External destroy races the suspended launch.
    f.containerizer.destroy(&id).await;

    let termination = waiter.await.unwrap().unwrap();
    assert!(termination.killed);
    assert_eq!(termination.message, "Docker task killed");
    assert!(f.containerizer.containers().await.unwrap().is_empty());

    // Release the engine run; the late continuation finds the container
    // gone and the launch surfaces that instead of reviving state.
    f.engine.block_run.store(false, Ordering::SeqCst);
    assert!(launcher.await.unwrap().is_err());
    assert!(f.containerizer.containers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_engine_run_destroys_remnants() {
    let f = fixture();

    f.engine.fail_run.store(true, Ordering::SeqCst);

    let result = f
        .containerizer
        .launch_task(task_launch(f.sandbox.path(), "c1", "docker:///nginx"))
        .await;
    assert!(matches!(result, Err(Error::Engine { op: "run", .. })));

    // The failure schedules a destroy that reaps any engine-side remnants
    // and purges the partial state.
    eventually(|| !f.engine.kills().is_empty()).await;
    eventually_purged(&f.containerizer).await;
}

/// Polls until the manager owns no containers.
async fn eventually_purged(containerizer: &DockerContainerizer) {
    for _ in 0..250 {
        if containerizer.containers().await.unwrap().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("containers were not purged within timeout");
}

#[tokio::test]
async fn test_failed_destroy_fails_wait_and_allows_retry() {
    let mut f = fixture();
    let id = ContainerId::from("c1");

    f.containerizer
        .launch_task(task_launch(f.sandbox.path(), "c1", "docker:///nginx"))
        .await
        .unwrap();

    let waiter = subscribe_wait(&f.containerizer, &id).await;

    f.engine.fail_kill.store(true, Ordering::SeqCst);
    f.containerizer.destroy(&id).await;

    // The termination promise fails but the container stays owned so the
    // destroy can be retried.
    assert!(matches!(
        waiter.await.unwrap(),
        Err(Error::DestroyFailed { .. })
    ));
    assert!(f.containerizer.containers().await.unwrap().contains(&id));

    f.engine.fail_kill.store(false, Ordering::SeqCst);
    f.containerizer.destroy(&id).await;

    let reap = next_reap(&mut f.reaps).await;
    reap.respond.send(Some(137)).unwrap();

    eventually_purged(&f.containerizer).await;
}

// =============================================================================
// Executor Launch
// =============================================================================

#[tokio::test]
async fn test_executor_launch_supervises_container_root() {
    let mut f = fixture();
    let id = ContainerId::from("c7");
    f.engine.set_inspect_pid(Some(4242));

    let mut launch = executor_launch(f.sandbox.path(), "c7", "docker:///busybox");
    launch.checkpoint = true;

    assert!(f.containerizer.launch_executor(launch).await.unwrap());

    // The container root pid was checkpointed for recovery.
    let pid_path = f
        .sandbox
        .path()
        .join("meta/agents/agent-1/frameworks/framework-1/executors/executor-1/runs/c7/pids/forked.pid");
    assert_eq!(std::fs::read_to_string(&pid_path).unwrap(), "4242");

    // The reaper watches the engine-reported root pid directly.
    let reap = next_reap(&mut f.reaps).await;
    assert_eq!(reap.pid, 4242);

    let waiter = subscribe_wait(&f.containerizer, &id).await;
    reap.respond.send(Some(3)).unwrap();

    let termination = waiter.await.unwrap().unwrap();
    assert!(!termination.killed);
    assert_eq!(termination.status, Some(3));
}

#[tokio::test]
async fn test_executor_launch_without_pid_fails_and_destroys() {
    let f = fixture();
    f.engine.set_inspect_pid(None);

    let result = f
        .containerizer
        .launch_executor(executor_launch(f.sandbox.path(), "c8", "docker:///busybox"))
        .await;
    assert!(matches!(result, Err(Error::PidUnavailable(_))));

    eventually(|| !f.engine.kills().is_empty()).await;
}

// =============================================================================
// Recovery
// =============================================================================

fn snapshot(entries: &[(&str, &str, &str, Option<i32>, bool)]) -> AgentState {
    let mut state = AgentState::default();
    for (framework_id, executor_id, container, forked_pid, completed) in entries {
        let container_id = ContainerId::from(*container);
        let framework = state
            .frameworks
            .entry(framework_id.to_string())
            .or_insert_with(|| FrameworkState {
                id: framework_id.to_string(),
                executors: Default::default(),
            });

        let mut runs = std::collections::HashMap::new();
        runs.insert(
            container_id.clone(),
            RunState {
                id: Some(container_id.clone()),
                forked_pid: *forked_pid,
                completed: *completed,
            },
        );

        framework.executors.insert(
            executor_id.to_string(),
            stevedore::ExecutorState {
                id: executor_id.to_string(),
                info: Some(executor_info(docker_command("run", "docker:///busybox"))),
                latest: Some(container_id),
                runs,
            },
        );
    }
    state
}

#[tokio::test]
async fn test_recover_adopts_live_executors_and_kills_orphans() {
    let mut f = fixture();
    f.engine.set_ps(vec![
        engine_container("/stevedore-c5", Some(1000)),
        engine_container("/stevedore-c9", None),
        engine_container("/registry", Some(7)),
    ]);

    let state = snapshot(&[("framework-1", "executor-1", "c5", Some(1000), false)]);
    f.containerizer.recover(Some(state)).await.unwrap();

    // The live run was adopted...
    let owned = f.containerizer.containers().await.unwrap();
    assert!(owned.contains(&ContainerId::from("c5")));
    assert_eq!(owned.len(), 1);

    // ...its pid is being watched...
    let reap = next_reap(&mut f.reaps).await;
    assert_eq!(reap.pid, 1000);

    // ...and only the decodable-but-unknown container was removed.
    eventually(|| !f.engine.kills().is_empty()).await;
    assert_eq!(f.engine.kills(), vec!["engine-stevedore-c9".to_string()]);
}

#[tokio::test]
async fn test_recover_skips_completed_and_pidless_runs() {
    let f = fixture();

    let state = snapshot(&[
        ("framework-1", "executor-1", "c1", Some(100), true),
        ("framework-2", "executor-2", "c2", None, false),
    ]);
    f.containerizer.recover(Some(state)).await.unwrap();

    assert!(f.containerizer.containers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recover_detects_duplicate_pids() {
    let f = fixture();

    let state = snapshot(&[
        ("framework-1", "executor-1", "c1", Some(1234), false),
        ("framework-2", "executor-2", "c2", Some(1234), false),
    ]);

    let result = f.containerizer.recover(Some(state)).await;
    assert!(matches!(
        result,
        Err(Error::DuplicatePid { pid: 1234, .. })
    ));
}

#[tokio::test]
async fn test_recover_without_snapshot_cleans_orphans() {
    let f = fixture();
    f.engine.set_ps(vec![engine_container("/stevedore-c9", None)]);

    f.containerizer.recover(None).await.unwrap();

    eventually(|| !f.engine.kills().is_empty()).await;
    assert_eq!(f.engine.kills(), vec!["engine-stevedore-c9".to_string()]);
}

#[tokio::test]
async fn test_recover_adoption_is_idempotent() {
    // Two managers recovering the same snapshot adopt the same set and
    // remove the same orphans.
    let state = snapshot(&[("framework-1", "executor-1", "c5", Some(1000), false)]);
    let ps = vec![
        engine_container("/stevedore-c5", Some(1000)),
        engine_container("/stevedore-c9", None),
    ];

    let mut owned_sets = Vec::new();
    let mut kill_sets = Vec::new();
    for _ in 0..2 {
        let f = fixture();
        f.engine.set_ps(ps.clone());
        f.containerizer.recover(Some(state.clone())).await.unwrap();
        eventually(|| !f.engine.kills().is_empty()).await;

        owned_sets.push(f.containerizer.containers().await.unwrap());
        kill_sets.push(f.engine.kills());
    }

    assert_eq!(owned_sets[0], owned_sets[1]);
    assert_eq!(kill_sets[0], kill_sets[1]);
}

// =============================================================================
// Update / Usage
// =============================================================================

#[tokio::test]
async fn test_update_unknown_container_is_a_noop() {
    let f = fixture();

    f.containerizer
        .update(&ContainerId::from("ghost"), Resources::new(1.0, 1 << 30))
        .await
        .unwrap();

    assert!(f.engine.runs().is_empty());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_usage_reports_limits_from_latest_update() {
    let f = fixture();
    let id = ContainerId::from("c1");

    f.containerizer
        .launch_task(task_launch(f.sandbox.path(), "c1", "docker:///nginx"))
        .await
        .unwrap();

    // Sample against a pid that certainly exists: our own.
    f.engine.set_inspect_pid(Some(std::process::id() as i32));

    // Whether the cgroup pokes apply depends on the host; the allocation
    // is recorded for usage() either way.
    let _ = f
        .containerizer
        .update(&id, Resources::new(2.0, 512 * 1024 * 1024))
        .await;

    let statistics = f.containerizer.usage(&id).await.unwrap();
    assert_eq!(statistics.cpus_limit, Some(2.0));
    assert_eq!(statistics.mem_limit_bytes, Some(512 * 1024 * 1024));
    assert!(statistics.mem_rss_bytes > 0);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_usage_of_unknown_container_fails() {
    let f = fixture();

    assert!(matches!(
        f.containerizer.usage(&ContainerId::from("ghost")).await,
        Err(Error::NotOwned(_))
    ));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_usage_fails_when_container_not_running() {
    let f = fixture();
    let id = ContainerId::from("c1");

    f.containerizer
        .launch_task(task_launch(f.sandbox.path(), "c1", "docker:///nginx"))
        .await
        .unwrap();

    f.engine.set_inspect_pid(None);
    assert!(matches!(
        f.containerizer.usage(&id).await,
        Err(Error::NotRunning(_))
    ));
}

// =============================================================================
// Misc
// =============================================================================

#[tokio::test]
async fn test_destroy_of_unknown_container_is_ignored() {
    let f = fixture();

    f.containerizer.destroy(&ContainerId::from("ghost")).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(f.engine.kills().is_empty());
    assert!(f.containerizer.containers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_wait_on_unknown_container_fails() {
    let f = fixture();

    assert!(matches!(
        f.containerizer.wait(&ContainerId::from("ghost")).await,
        Err(Error::NotOwned(_))
    ));
}
