//! The Runner: acquires the single-instance lock, wires up every other
//! component, and drives the poll loop described in §4.F — dispatching
//! queued tasks, attempting auto-resume on eligible paused tasks, tracking
//! daemon-level pause/resume edges, and reaping finished task activities.
//!
//! `RunnerHandle` is the other half of the capability-interface pair named
//! in the ambient spec (`OrchestratorHandle` going one way, `RunnerHandle`
//! coming back): a cloneable `mpsc::Sender`-wrapping struct, handed to
//! whatever embeds both the Runner and the Orchestrator (the `apexd` binary)
//! so it can read metrics and request a graceful stop without reaching past
//! either capability boundary. Signal handling itself is the embedder's job;
//! the Runner only reacts to an explicit `stop()` call.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, RunnerConfig};
use crate::domain::{Task, TaskStatus};
use crate::error::ApexError;
use crate::events::{ApexEvent, EventBus};
use crate::health::{HealthReport, Watchdog};
use crate::hooks::HookGateway;
use crate::llm::LlmClient;
use crate::orchestrator::{OrchestratorActor, OrchestratorHandle};
use crate::process::{pid_file_path, state_file_path, CapacitySnapshot, PidFile, ProcessControl, ProcessError, StateFile};
use crate::scheduler::{should_pause_tasks, PauseDecision, PauseEdge, PauseEdgeDetector};
use crate::store::StoreActor;
use crate::usage::UsageAccounter;
use crate::workflow::{ToolExecutor, WorkflowDefinition, WorkflowEngine};
use crate::workspace::WorkspaceManager;

/// Failure kinds the `apexd` binary maps to the exit codes named in §6.
#[derive(Debug, Error)]
pub enum RunnerStartError {
    #[error("another apex daemon is already running for this project (pid {0})")]
    AlreadyRunning(u32),
    #[error("permission denied acquiring daemon lock at {0}")]
    PermissionDenied(PathBuf),
    #[error("failed to acquire daemon lock: {0}")]
    LockFailed(String),
    #[error("daemon startup failed: {0}")]
    StartFailed(String),
}

impl RunnerStartError {
    fn from_process_error(err: ProcessError, path: &Path) -> Self {
        if let ProcessError::Io(io_err) = &err {
            if io_err.kind() == io::ErrorKind::PermissionDenied {
                return RunnerStartError::PermissionDenied(path.to_path_buf());
            }
        }
        RunnerStartError::LockFailed(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerMetrics {
    pub active_task_count: usize,
    pub max_concurrent_tasks: u32,
    pub is_paused: bool,
    pub pause_reason: Option<String>,
    pub health: HealthReport,
}

enum RunnerRequest {
    GetMetrics { reply: oneshot::Sender<RunnerMetrics> },
    Stop { reply: oneshot::Sender<()> },
}

/// Cheap, cloneable handle to the running [`Runner`]. This is the
/// capability interface given to whatever embeds the daemon.
#[derive(Clone)]
pub struct RunnerHandle {
    tx: mpsc::Sender<RunnerRequest>,
}

impl RunnerHandle {
    /// `None` if the Runner has already shut down.
    pub async fn get_metrics(&self) -> Option<RunnerMetrics> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RunnerRequest::GetMetrics { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Requests a graceful stop and waits for the shutdown sequence (drain
    /// in-flight tasks up to `shutdownTimeoutMs`, close the Store, remove
    /// the PID file) to finish.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RunnerRequest::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

enum Dispatch {
    Execute,
    Resume,
}

enum DispatchOutcome {
    Finished { task_id: String },
    Errored { task_id: String, error: ApexError },
}

/// Owns nothing the Orchestrator owns; only the poll-loop bookkeeping
/// (in-flight activity handles, pause-edge state, daemon state-file path).
pub struct Runner {
    config: RunnerConfig,
    pid_path: PathBuf,
    state_path: PathBuf,
    orchestrator: OrchestratorHandle,
    events: EventBus,
    usage: Arc<UsageAccounter>,
    watchdog: Arc<Watchdog>,
    tasks: HashMap<String, JoinHandle<DispatchOutcome>>,
    pause_detector: PauseEdgeDetector,
    is_paused: bool,
    pause_reason: Option<String>,
    started_at: DateTime<Utc>,
    rx: mpsc::Receiver<RunnerRequest>,
}

impl Runner {
    /// Startup sequence (§4.F): acquire the single-instance PID file, then
    /// initialize Store, UsageAccounter, WorkspaceManager, WorkflowEngine
    /// and Orchestrator in order. Only the Store can fail once the PID file
    /// is written (every later step is infallible), so on that failure the
    /// PID file is removed before returning — the one reverse-order cleanup
    /// this sequence needs.
    pub async fn start(
        config: Config,
        project_path: impl Into<PathBuf>,
        llm: Arc<dyn LlmClient>,
        tool_executor: Arc<dyn ToolExecutor>,
        workflows: Vec<WorkflowDefinition>,
    ) -> Result<(RunnerHandle, OrchestratorHandle), RunnerStartError> {
        let project_path = project_path.into();
        let pid_path = pid_file_path(&project_path);
        let state_path = state_file_path(&project_path);

        if let Some(pid) = ProcessControl::check_existing(&pid_path)
            .map_err(|e| RunnerStartError::from_process_error(e, &pid_path))?
        {
            return Err(RunnerStartError::AlreadyRunning(pid));
        }

        let pid_file = PidFile::new(std::process::id(), project_path.display().to_string());
        pid_file
            .write(&pid_path)
            .map_err(|e| RunnerStartError::from_process_error(e, &pid_path))?;

        let store = match StoreActor::spawn(project_path.join(".apex").join("store")) {
            Ok(store) => store,
            Err(e) => {
                let _ = PidFile::remove(&pid_path);
                return Err(RunnerStartError::StartFailed(e.to_string()));
            }
        };

        let usage = Arc::new(UsageAccounter::new(config.usage.clone()));
        let watchdog = Arc::new(Watchdog::new(config.watchdog.clone()));
        let workspace = Arc::new(WorkspaceManager::new(config.workspace.clone(), &project_path));
        let hooks = HookGateway::new(config.hooks.timeout_ms);
        let events = EventBus::new(1024);

        let mut engine = WorkflowEngine::new(
            store.clone(),
            llm,
            tool_executor,
            hooks,
            usage.clone(),
            events.clone(),
            config.workflow.max_turns,
            config.workflow.session_limit_utilization,
            config.workflow.context_window_tokens,
            config.llm.model.clone(),
        );
        for workflow in workflows {
            if let Err(e) = engine.register_workflow(workflow) {
                let _ = PidFile::remove(&pid_path);
                return Err(RunnerStartError::StartFailed(e.to_string()));
            }
        }

        let orchestrator = OrchestratorActor::spawn(store, Arc::new(engine), workspace, events.clone());

        if let Err(e) = orchestrator.recover_interrupted_tasks().await {
            warn!(error = %e, "crash recovery scan failed");
        }

        let (tx, rx) = mpsc::channel(64);
        let runner = Runner {
            config: config.runner,
            pid_path,
            state_path,
            orchestrator: orchestrator.clone(),
            events,
            usage,
            watchdog,
            tasks: HashMap::new(),
            pause_detector: PauseEdgeDetector::default(),
            is_paused: false,
            pause_reason: None,
            started_at: Utc::now(),
            rx,
        };
        tokio::spawn(runner.run());

        Ok((RunnerHandle { tx }, orchestrator))
    }

    async fn run(mut self) {
        info!("Runner starting poll loop");
        let poll_interval = Duration::from_millis(self.config.clamped_poll_interval_ms());
        let mut interval = tokio::time::interval(poll_interval);
        let mut stop_reply = None;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                request = self.rx.recv() => {
                    match request {
                        Some(RunnerRequest::GetMetrics { reply }) => {
                            let _ = reply.send(self.metrics());
                        }
                        Some(RunnerRequest::Stop { reply }) => {
                            stop_reply = Some(reply);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        self.shutdown().await;
        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
    }

    async fn tick(&mut self) {
        self.watchdog.perform_health_check(true);
        self.reap_completed_tasks().await;

        let decision = should_pause_tasks(&self.usage);
        self.is_paused = decision.should_pause;
        self.pause_reason = decision.reason.clone();

        match self.pause_detector.observe(decision.should_pause) {
            PauseEdge::JustPaused => {
                self.events.publish(ApexEvent::DaemonPaused {
                    reason: decision.reason.clone().unwrap_or_else(|| "unknown".to_string()),
                });
            }
            PauseEdge::JustResumed => {
                self.events.publish(ApexEvent::DaemonResumed);
            }
            PauseEdge::None => {}
        }

        if !decision.should_pause {
            self.dispatch_next_queued().await;
            self.dispatch_eligible_resumes().await;
        }

        self.write_state_file(&decision);
    }

    async fn dispatch_next_queued(&mut self) {
        let limit = self.usage.get_base_limits().max_concurrent_tasks as usize;
        if self.tasks.len() >= limit {
            return;
        }
        match self.orchestrator.get_next_queued_task().await {
            Ok(Some(task)) => self.dispatch(task, Dispatch::Execute),
            Ok(None) => {}
            Err(e) => error!(error = %e, "failed to fetch next queued task"),
        }
    }

    async fn dispatch_eligible_resumes(&mut self) {
        let paused = match self.orchestrator.get_paused_tasks_for_resume().await {
            Ok(paused) => paused,
            Err(e) => {
                error!(error = %e, "failed to fetch paused tasks for resume");
                return;
            }
        };
        let limit = self.usage.get_base_limits().max_concurrent_tasks as usize;
        for task in paused {
            if self.tasks.len() >= limit {
                break;
            }
            if !self.tasks.contains_key(&task.id) {
                self.dispatch(task, Dispatch::Resume);
            }
        }
    }

    /// Runs the task as an independent concurrent activity, tracked by id so
    /// shutdown and `getMetrics` can see what's in flight.
    fn dispatch(&mut self, task: Task, mode: Dispatch) {
        let task_id = task.id.clone();
        let orchestrator = self.orchestrator.clone();
        let usage = self.usage.clone();
        self.usage.track_task_start(&task_id);

        let handle = tokio::spawn(async move {
            let result = match mode {
                Dispatch::Execute => orchestrator.execute_task(&task_id).await,
                Dispatch::Resume => orchestrator.resume_task(&task_id).await,
            };

            let final_task = orchestrator.get_task(&task_id).await.ok().flatten();
            let success = matches!(final_task.as_ref().map(|t| t.status), Some(TaskStatus::Completed));
            let spent = final_task.map(|t| t.usage).unwrap_or_default();
            usage.track_task_completion(&task_id, spent, success);

            match result {
                Ok(()) => DispatchOutcome::Finished { task_id },
                Err(error) => DispatchOutcome::Errored { task_id, error },
            }
        });

        self.tasks.insert(task.id, handle);
    }

    async fn reap_completed_tasks(&mut self) {
        let finished: Vec<String> =
            self.tasks.iter().filter(|(_, handle)| handle.is_finished()).map(|(id, _)| id.clone()).collect();

        for task_id in finished {
            if let Some(handle) = self.tasks.remove(&task_id) {
                match handle.await {
                    Ok(DispatchOutcome::Finished { task_id }) => {
                        debug!(task_id = %task_id, "task activity finished");
                    }
                    Ok(DispatchOutcome::Errored { task_id, error }) => {
                        warn!(task_id = %task_id, error = %error, "task activity errored");
                    }
                    Err(join_err) => {
                        error!(task_id = %task_id, error = %join_err, "task activity panicked");
                        self.watchdog.perform_health_check(false);
                        self.watchdog.record_restart(format!("task '{task_id}' panicked"), None, false);
                    }
                }
            }
        }
    }

    fn metrics(&self) -> RunnerMetrics {
        RunnerMetrics {
            active_task_count: self.tasks.len(),
            max_concurrent_tasks: self.usage.get_base_limits().max_concurrent_tasks,
            is_paused: self.is_paused,
            pause_reason: self.pause_reason.clone(),
            health: self.watchdog.get_health_report(),
        }
    }

    fn write_state_file(&self, decision: &PauseDecision) {
        let usage_now = self.usage.get_current_usage();
        let state = StateFile {
            timestamp: taskstore::now_ms(),
            pid: std::process::id(),
            started_at: self.started_at,
            capacity: CapacitySnapshot {
                mode: usage_now.current_mode,
                threshold: decision.capacity.threshold,
                usage_percent: decision.capacity.current_percentage,
                is_auto_paused: decision.should_pause,
                pause_reason: decision.reason.clone(),
                next_mode_switch: usage_now.next_mode_switch,
                time_based_enabled: self.usage.config().time_based_enabled,
            },
            health: self.watchdog.get_health_report(),
        };
        if let Err(e) = state.write(&self.state_path) {
            warn!(error = %e, "failed to write daemon state file");
        }
    }

    /// Graceful shutdown: stop accepting new dispatches (the loop already
    /// exited), wait up to `shutdownTimeoutMs` for in-flight activities,
    /// force-abort whatever's left, close the Store, then remove the PID
    /// file. Every failure here is logged and swallowed, per §7's
    /// propagation policy for shutdown-path errors.
    async fn shutdown(&mut self) {
        info!(timeout_ms = self.config.shutdown_timeout_ms, active = self.tasks.len(), "Runner shutting down");

        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.shutdown_timeout_ms);
        while !self.tasks.is_empty() && tokio::time::Instant::now() < deadline {
            self.reap_completed_tasks().await;
            if self.tasks.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        if !self.tasks.is_empty() {
            warn!(count = self.tasks.len(), "aborting unfinished task activities after shutdown timeout");
            for (_, handle) in self.tasks.drain() {
                handle.abort();
            }
        }

        self.orchestrator.close_store().await;

        if let Err(e) = PidFile::remove(&self.pid_path) {
            warn!(error = %e, "failed to remove pid file on shutdown");
        }

        info!("Runner shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::config::Config;
    use crate::llm::mock::MockLlmClient;
    use crate::llm::{CompletionResponse, StopReason as SR, TokenUsage};
    use crate::orchestrator::CreateTaskParams;
    use crate::usage::UsageConfig;
    use crate::workflow::StageDefinition;

    struct NoopToolExecutor;

    #[async_trait::async_trait]
    impl ToolExecutor for NoopToolExecutor {
        async fn execute(&self, _task_id: &str, _call: &crate::llm::ToolCall) -> String {
            "ok".to_string()
        }
    }

    fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            content: Some(text.to_string()),
            thinking: None,
            tool_calls: vec![],
            stop_reason: SR::EndTurn,
            usage: TokenUsage::default(),
        }
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.runner.poll_interval_ms = 20;
        config.runner.min_poll_ms = 10;
        config.runner.max_poll_ms = 50;
        config.runner.shutdown_timeout_ms = 2_000;
        config.usage = UsageConfig {
            time_based_enabled: false,
            ..UsageConfig::default()
        };
        config
    }

    fn default_workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "default".to_string(),
            stages: vec![StageDefinition {
                name: "implement".to_string(),
                agent: "coder".to_string(),
                dependencies: vec![],
                prompt_template: "do the task: {{task.description}}".to_string(),
            }],
        }
    }

    async fn start(dir: &TempDir, responses: Vec<CompletionResponse>) -> (RunnerHandle, OrchestratorHandle) {
        Runner::start(
            fast_config(),
            dir.path().to_path_buf(),
            Arc::new(MockLlmClient::new(responses)),
            Arc::new(NoopToolExecutor),
            vec![default_workflow()],
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn start_writes_pid_file_and_reports_zero_active_tasks() {
        let dir = TempDir::new().unwrap();
        let (runner, _orchestrator) = start(&dir, vec![]).await;

        assert!(pid_file_path(dir.path()).exists());
        let metrics = runner.get_metrics().await.unwrap();
        assert_eq!(metrics.active_task_count, 0);

        runner.stop().await;
    }

    #[tokio::test]
    async fn starting_twice_against_the_same_project_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (runner, _orchestrator) = start(&dir, vec![]).await;

        let second = Runner::start(
            fast_config(),
            dir.path().to_path_buf(),
            Arc::new(MockLlmClient::new(vec![])),
            Arc::new(NoopToolExecutor),
            vec![default_workflow()],
        )
        .await;
        assert!(matches!(second, Err(RunnerStartError::AlreadyRunning(_))));

        runner.stop().await;
    }

    #[tokio::test]
    async fn stop_removes_the_pid_file() {
        let dir = TempDir::new().unwrap();
        let (runner, _orchestrator) = start(&dir, vec![]).await;

        runner.stop().await;
        assert!(!pid_file_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn poll_loop_dispatches_queued_task_to_completion() {
        let dir = TempDir::new().unwrap();
        let (runner, orchestrator) = start(&dir, vec![text_response("done")]).await;

        let task = orchestrator
            .create_task(CreateTaskParams {
                description: "write a function".into(),
                workflow: "default".into(),
                project_path: dir.path().display().to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut attempts = 0;
        loop {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let reloaded = orchestrator.get_task(&task.id).await.unwrap().unwrap();
            if reloaded.status == TaskStatus::Completed {
                break;
            }
            attempts += 1;
            assert!(attempts < 50, "task never completed: {:?}", reloaded.status);
        }

        runner.stop().await;
    }
}
