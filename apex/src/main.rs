//! apexd - daemon binary entry point.
//!
//! Thin and deliberately small: the CLI/TUI front-end is an external
//! collaborator per the core's scope boundary, so this binary's job is just
//! to read the handful of `APEX_*` environment variables, load config,
//! construct the LLM client and workflow set, start the Runner, and forward
//! SIGINT/SIGTERM into a graceful stop. Everything interesting happens in
//! the library crate.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{error, info, warn};

use apex::llm::ToolCall;
use apex::workflow::{ToolExecutor, WorkflowDefinition};
use apex::{Config, Runner, RunnerStartError, create_client};

/// Concrete tool execution (bash/edit/read/etc.) is an out-of-scope
/// collaborator: apexd shells out to a configured command for each tool
/// call rather than embedding one. The command receives the serialized
/// `ToolCall` on stdin and its trimmed stdout becomes the tool result.
struct ExternalProcessToolExecutor {
    command: Option<String>,
}

#[async_trait::async_trait]
impl ToolExecutor for ExternalProcessToolExecutor {
    async fn execute(&self, task_id: &str, call: &ToolCall) -> String {
        let Some(command) = &self.command else {
            return format!("error: no tool executor configured for tool '{}'", call.name);
        };

        let payload = serde_json::json!({
            "task_id": task_id,
            "id": call.id,
            "name": call.name,
            "input": call.input,
        });

        let mut child = match tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return format!("error: failed to spawn tool executor: {e}"),
        };

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            if let Err(e) = stdin.write_all(payload.to_string().as_bytes()).await {
                return format!("error: failed to write tool call to executor: {e}");
            }
        }

        match child.wait_with_output().await {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout).trim().to_string(),
            Ok(output) => format!(
                "error: tool executor exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => format!("error: failed to run tool executor: {e}"),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "apexd", about = "Local autonomous task orchestrator daemon")]
struct Args {
    /// Project directory the daemon manages. Falls back to APEX_PROJECT_PATH, then cwd.
    #[arg(long)]
    project_path: Option<PathBuf>,

    /// Path to a YAML config file, overriding the `.apex/config.yaml` fallback chain.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn project_path(args: &Args) -> Result<PathBuf> {
    if let Some(path) = &args.project_path {
        return Ok(path.clone());
    }
    if let Ok(path) = std::env::var("APEX_PROJECT_PATH") {
        return Ok(PathBuf::from(path));
    }
    std::env::current_dir().context("Failed to resolve project path from cwd")
}

fn setup_logging(project_path: &std::path::Path) -> Result<()> {
    let log_dir = project_path.join(".apex");
    std::fs::create_dir_all(&log_dir).context("Failed to create .apex directory")?;
    let log_path = log_dir.join("daemon.log");

    let level = match std::env::var("APEX_LOG_LEVEL").as_deref() {
        Ok("debug") => tracing::Level::DEBUG,
        Ok("warn") => tracing::Level::WARN,
        Ok("error") => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    let debug_to_stderr = std::env::var("APEX_DAEMON_DEBUG").as_deref() == Ok("1");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open daemon log file")?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(move || -> Box<dyn std::io::Write + Send> {
            if debug_to_stderr {
                Box::new(std::io::stderr())
            } else {
                Box::new(log_file.try_clone().expect("failed to clone log file handle"))
            }
        });

    subscriber.init();
    Ok(())
}

fn load_workflows(project_path: &std::path::Path) -> Result<Vec<WorkflowDefinition>> {
    let dir = project_path.join(".apex").join("workflows");
    let mut workflows = Vec::new();
    if !dir.exists() {
        return Ok(workflows);
    }
    for entry in std::fs::read_dir(&dir).context("Failed to read workflows directory")? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let contents = std::fs::read_to_string(&path).context(format!("Failed to read {}", path.display()))?;
        let workflow: WorkflowDefinition =
            serde_yaml::from_str(&contents).context(format!("Failed to parse workflow {}", path.display()))?;
        workflows.push(workflow);
    }
    Ok(workflows)
}

fn exit_code_for(err: &RunnerStartError) -> ExitCode {
    match err {
        RunnerStartError::AlreadyRunning(_) => ExitCode::from(3),
        RunnerStartError::PermissionDenied(_) => ExitCode::from(4),
        RunnerStartError::LockFailed(_) => ExitCode::from(5),
        RunnerStartError::StartFailed(_) => ExitCode::from(6),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let project_path = match project_path(&args) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("apexd: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = setup_logging(&project_path) {
        eprintln!("apexd: failed to set up logging: {e:#}");
        return ExitCode::FAILURE;
    }

    info!(project_path = %project_path.display(), "apexd starting");

    let config = if let Ok(payload) = std::env::var("APEX_CONFIG_JSON") {
        match Config::from_json(&payload) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "failed to parse APEX_CONFIG_JSON");
                return ExitCode::FAILURE;
            }
        }
    } else {
        match Config::load(args.config.as_ref(), Some(&project_path)) {
            Ok(mut config) => {
                if let Ok(interval) = std::env::var("APEX_POLL_INTERVAL") {
                    if let Ok(ms) = interval.parse::<u64>() {
                        config.runner.poll_interval_ms = ms;
                    }
                }
                config
            }
            Err(e) => {
                error!(error = %e, "failed to load configuration");
                return ExitCode::FAILURE;
            }
        }
    };

    let llm = match create_client(&config.llm) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to construct LLM client");
            return ExitCode::FAILURE;
        }
    };

    let workflows = match load_workflows(&project_path) {
        Ok(workflows) => workflows,
        Err(e) => {
            error!(error = %e, "failed to load workflow definitions");
            return ExitCode::FAILURE;
        }
    };
    if workflows.is_empty() {
        warn!("no workflow definitions found under .apex/workflows; tasks will fail to resolve a workflow");
    }

    let tool_executor = Arc::new(ExternalProcessToolExecutor {
        command: std::env::var("APEX_TOOL_COMMAND").ok(),
    });

    let (runner, _orchestrator) =
        match Runner::start(config, project_path.clone(), llm, tool_executor, workflows).await {
            Ok(started) => started,
            Err(e) => {
                error!(error = %e, "apexd failed to start");
                return exit_code_for(&e);
            }
        };

    let mut shutdown = match signal_stream() {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    shutdown.recv().await;
    info!("apexd received shutdown signal");
    runner.stop().await;
    info!("apexd exiting");
    ExitCode::SUCCESS
}

#[cfg(unix)]
fn signal_stream() -> Result<tokio::sync::mpsc::Receiver<()>> {
    use tokio::signal::unix::{SignalKind, signal};
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        let _ = tx.send(()).await;
    });
    Ok(rx)
}

#[cfg(not(unix))]
fn signal_stream() -> Result<tokio::sync::mpsc::Receiver<()>> {
    let (tx, rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = tx.send(()).await;
    });
    Ok(rx)
}
