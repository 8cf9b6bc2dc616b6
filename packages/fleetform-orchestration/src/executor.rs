//! Concurrent executor: a pool of workers that pull ready steps from the
//! plan, run the engine's subprocess sequence for each step, and report
//! outcomes back.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use fleetform_storage::DeploymentKey;

use crate::credentials::CredentialCache;
use crate::engines::{
    PackageCommand, PostprocessRequest, PrepareRequest, StepCommand, StepOutcome,
};
use crate::error::OrchestrationError;
use crate::planner::{DeploymentPlan, NextStep};
use crate::Result;

/// Workers used when the manifest does not set `ConcurrentWorkers`.
pub const DEFAULT_CONCURRENT_WORKERS: usize = 10;

/// How often a worker observes its subprocess and the escalation flags.
const SUBPROCESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a worker sleeps when no step is processable yet.
const IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub command: PackageCommand,
    pub workers: usize,
    pub keep_deployment_cache: bool,
}

impl ExecutorConfig {
    pub fn new(command: PackageCommand) -> Self {
        Self {
            command,
            workers: DEFAULT_CONCURRENT_WORKERS,
            keep_deployment_cache: false,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_keep_deployment_cache(mut self, keep: bool) -> Self {
        self.keep_deployment_cache = keep;
        self
    }
}

/// Escalation flags shared between the signal listener and the workers.
struct SignalFlags {
    stop_workers: AtomicBool,
    send_interrupt: AtomicBool,
    send_terminate: AtomicBool,
}

impl SignalFlags {
    fn new() -> Self {
        Self {
            stop_workers: AtomicBool::new(false),
            send_interrupt: AtomicBool::new(false),
            send_terminate: AtomicBool::new(false),
        }
    }
}

/// Which signal to forward to a running subprocess.
#[derive(Clone, Copy)]
enum ForwardSignal {
    Interrupt,
    Terminate,
}

struct WorkerContext {
    plan: Arc<DeploymentPlan>,
    credentials: Arc<CredentialCache>,
    signals: SignalFlags,
    command: PackageCommand,
    keep_deployment_cache: bool,
    engine_cache_dirs: HashMap<&'static str, PathBuf>,
    deployments_cache_dir: PathBuf,
    root_logs_dir: PathBuf,
}

/// Where a step failed, and how.
struct StepFailure {
    section: String,
    message: String,
}

impl StepFailure {
    fn new(section: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self {
            section: section.into(),
            message: message.to_string(),
        }
    }

    fn other(message: impl std::fmt::Display) -> Self {
        Self::new("other", message)
    }
}

pub struct Executor {
    context: Arc<WorkerContext>,
    workers: usize,
}

impl Executor {
    /// Create the temporary directory layout and an executor ready to run.
    ///
    /// Under `temp_dir`: one cache directory per engine (preserved across
    /// runs), a deployments cache root (wiped now), and a timestamped logs
    /// directory.
    pub fn new(
        plan: Arc<DeploymentPlan>,
        credentials: Arc<CredentialCache>,
        temp_dir: &Path,
        config: ExecutorConfig,
    ) -> Result<Self> {
        let cache_dir = temp_dir.join("cache");
        let mut engine_cache_dirs = HashMap::new();
        for engine in plan.registry().engine_names() {
            let engine_dir = cache_dir.join("engines").join(engine);
            std::fs::create_dir_all(&engine_dir)?;
            engine_cache_dirs.insert(engine, engine_dir);
        }

        let deployments_cache_dir = cache_dir.join("deployments");
        if deployments_cache_dir.exists() {
            let _ = std::fs::remove_dir_all(&deployments_cache_dir);
        }
        std::fs::create_dir_all(&deployments_cache_dir)?;

        let root_logs_dir = temp_dir
            .join("logs")
            .join(Utc::now().format("%Y%m%d-%H%M%S").to_string());
        std::fs::create_dir_all(&root_logs_dir)?;

        Ok(Self {
            context: Arc::new(WorkerContext {
                plan,
                credentials,
                signals: SignalFlags::new(),
                command: config.command,
                keep_deployment_cache: config.keep_deployment_cache,
                engine_cache_dirs,
                deployments_cache_dir,
                root_logs_dir,
            }),
            workers: config.workers,
        })
    }

    pub fn root_logs_dir(&self) -> &Path {
        &self.context.root_logs_dir
    }

    /// Execute the plan to completion, or until interrupted.
    ///
    /// An interrupt listener escalates with each press: stop pulling new
    /// steps, forward a soft interrupt to subprocesses, forward a terminate,
    /// and finally persist the state and abort the run.
    pub async fn run(&self) -> Result<()> {
        let run_id = Uuid::new_v4();
        info!("Starting run {run_id} with {} workers", self.workers);

        let abort = CancellationToken::new();
        let listener = {
            let context = Arc::clone(&self.context);
            let abort = abort.clone();
            tokio::spawn(async move {
                let mut presses = 0u32;
                loop {
                    if tokio::signal::ctrl_c().await.is_err() {
                        return;
                    }
                    presses += 1;
                    match presses {
                        1 => {
                            context.signals.stop_workers.store(true, Ordering::SeqCst);
                            info!("Interrupted - Waiting for current deployments to complete");
                        }
                        2 => {
                            context.signals.send_interrupt.store(true, Ordering::SeqCst);
                            info!("Interrupted - Sending an interrupt to subprocesses");
                        }
                        3 => {
                            context.signals.send_terminate.store(true, Ordering::SeqCst);
                            info!("Interrupted - Sending a terminate to subprocesses");
                        }
                        _ => {
                            let _ = context.plan.save(false).await;
                            info!("Interrupted - Forcing deployments to abort");
                            abort.cancel();
                        }
                    }
                }
            })
        };

        let handles: Vec<_> = (0..self.workers)
            .map(|worker_id| {
                let context = Arc::clone(&self.context);
                tokio::spawn(async move { worker(context, worker_id).await })
            })
            .collect();

        let outcome = tokio::select! {
            _ = abort.cancelled() => Err(OrchestrationError::Interrupted),
            _ = futures::future::join_all(handles) => Ok(()),
        };
        listener.abort();

        // Persist the state before exiting, whatever happened.
        self.context.plan.save(false).await?;
        if !self.context.keep_deployment_cache {
            let _ = std::fs::remove_dir_all(&self.context.deployments_cache_dir);
        }
        outcome
    }
}

async fn worker(context: Arc<WorkerContext>, worker_id: usize) {
    debug!("Starting worker {worker_id}");
    loop {
        if context.signals.stop_workers.load(Ordering::SeqCst) {
            break;
        }
        let step = match context.plan.next(context.command) {
            Ok(step) => step,
            Err(OrchestrationError::NoProcessableStep) => {
                tokio::time::sleep(IDLE_WAIT).await;
                continue;
            }
            Err(OrchestrationError::NoMorePendingStep) => break,
            Err(err) => {
                error!("Worker failed to get the next deployment to process: {err}");
                break;
            }
        };
        info!(
            "{} Starting to {} (Attempt {}/{})",
            step.key, step.action, step.nb_attempts, step.max_attempts
        );

        if context.command == PackageCommand::UpdateHash {
            match context.plan.update_hash(&step.key) {
                Ok(true) => info!("{} Updated the value of the module hash", step.key),
                Ok(false) => info!("{} No action needed", step.key),
                Err(err) => error!("{} Failed to update the module hash: {err}", step.key),
            }
            continue;
        }

        let deployment_cache_dir = context
            .deployments_cache_dir
            .join(&step.key.module)
            .join(&step.key.account_id)
            .join(&step.key.region);

        match execute_step(&context, &step, &deployment_cache_dir).await {
            Ok(outcome) => {
                let completed = context.plan.complete(
                    context.command,
                    &step.key,
                    outcome.made_changes,
                    outcome.result.clone(),
                    outcome.detailed_results,
                    outcome.outputs,
                );
                match completed {
                    Ok(()) => info!("{} Completed - {}", step.key, outcome.result),
                    Err(err) => error!("{} Failed to record the completion: {err}", step.key),
                }
            }
            Err(failure) => {
                error!("{} Failed. See logs for details", step.key);
                let detailed_results = json!({
                    "FailedSection": failure.section,
                    "ErrorMessage": failure.message,
                });
                if let Err(err) = context.plan.fail(&step.key, "Failed", Some(detailed_results)) {
                    error!("{} Failed to record the failure: {err}", step.key);
                }
            }
        }

        if !context.keep_deployment_cache {
            let _ = tokio::fs::remove_dir_all(&deployment_cache_dir).await;
        }
    }
}

/// Run the engine sequence for one step: prepare, subprocesses, postprocess.
/// The error carries the section that failed for the detailed results.
async fn execute_step(
    context: &WorkerContext,
    step: &NextStep,
    deployment_cache_dir: &Path,
) -> std::result::Result<StepOutcome, StepFailure> {
    let started = Instant::now();
    tokio::fs::create_dir_all(deployment_cache_dir)
        .await
        .map_err(StepFailure::other)?;

    let module = context
        .plan
        .registry()
        .get(&step.key.module)
        .ok_or_else(|| StepFailure::other(format!("unknown module {}", step.key.module)))?;
    let module_config = context
        .plan
        .module_config(&step.key)
        .map_err(StepFailure::other)?;
    let variables = context
        .plan
        .variables_for(&step.key, step.action)
        .map_err(StepFailure::other)?;
    let engine_cache_dir = context.engine_cache_dirs[module.engine.name()].clone();

    debug!("{} Executing prepare", step.key);
    let commands = module
        .engine
        .prepare(PrepareRequest {
            key: &step.key,
            command: context.command,
            action: step.action,
            variables: &variables,
            module_config: &module_config,
            module_dir: &module.dir,
            deployment_cache_dir,
            engine_cache_dir: &engine_cache_dir,
        })
        .await
        .map_err(|err| StepFailure::new("prepare", err))?;

    for command in &commands {
        run_subprocess(context, &step.key, step.nb_attempts, command, &module_config).await?;
    }

    debug!("{} Executing postprocess", step.key);
    let outcome = module
        .engine
        .postprocess(PostprocessRequest {
            key: &step.key,
            command: context.command,
            action: step.action,
            module_config: &module_config,
            deployment_cache_dir,
        })
        .await
        .map_err(|err| StepFailure::new("postprocess", err))?;

    debug!(
        "{} Execution time: {:.3} seconds",
        step.key,
        started.elapsed().as_secs_f64()
    );
    Ok(outcome)
}

/// Spawn one subprocess in its own process group, poll it on a short tick to
/// observe the escalation flags, and capture its output into the logs
/// directory.
async fn run_subprocess(
    context: &WorkerContext,
    key: &DeploymentKey,
    nb_attempts: u32,
    command: &StepCommand,
    module_config: &crate::manifest::ConfigMap,
) -> std::result::Result<(), StepFailure> {
    let section = format!("subprocess '{}'", command.name);
    let failure = |message: &str| StepFailure::new(section.clone(), message);

    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(command.env.clone());
    if command.assume_role {
        if let Some(role) = module_config.get("AssumeRole").and_then(Value::as_str) {
            let credentials = context
                .credentials
                .credentials(role)
                .await
                .map_err(|err| StepFailure::new(section.clone(), err))?;
            for (name, value) in credentials.env_vars() {
                env.insert(name.to_string(), value.to_string());
            }
        }
    }

    debug!("{key} Executing subprocess '{}'", command.name);
    debug!("{key} Command: {}", command.args.join(" "));
    debug!("{key} Cwd: {}", command.cwd.display());

    let (program, args) = command
        .args
        .split_first()
        .ok_or_else(|| failure("Command is empty"))?;
    let mut child_command = tokio::process::Command::new(program);
    child_command
        .args(args)
        .current_dir(&command.cwd)
        .env_clear()
        .envs(&env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    child_command.process_group(0);

    let mut child = child_command
        .spawn()
        .map_err(|err| StepFailure::new(section.clone(), err))?;

    let mut stdout_pipe = child.stdout.take();
    let stdout_task = tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buffer).await;
        }
        buffer
    });
    let mut stderr_pipe = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buffer).await;
        }
        buffer
    });

    let mut sent_interrupt = false;
    let mut sent_terminate = false;
    let status = loop {
        match tokio::time::timeout(SUBPROCESS_POLL_INTERVAL, child.wait()).await {
            Ok(status) => break status.map_err(|err| StepFailure::new(section.clone(), err))?,
            Err(_) => {
                if context.signals.send_interrupt.load(Ordering::SeqCst) && !sent_interrupt {
                    forward_signal(&child, ForwardSignal::Interrupt);
                    sent_interrupt = true;
                }
                if context.signals.send_terminate.load(Ordering::SeqCst) && !sent_terminate {
                    forward_signal(&child, ForwardSignal::Terminate);
                    sent_terminate = true;
                }
            }
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    write_subprocess_logs(
        &context.root_logs_dir,
        key,
        &command.name,
        nb_attempts,
        "stdout.log",
        &stdout,
    )
    .map_err(|err| StepFailure::new(section.clone(), err))?;
    write_subprocess_logs(
        &context.root_logs_dir,
        key,
        &command.name,
        nb_attempts,
        "stderr.log",
        &stderr,
    )
    .map_err(|err| StepFailure::new(section.clone(), err))?;
    if let Some(stdout_file) = &command.stdout_file {
        tokio::fs::write(stdout_file, &stdout)
            .await
            .map_err(|err| StepFailure::new(section.clone(), err))?;
    }

    if !status.success() {
        return Err(failure("Exit code is not 0"));
    }
    if sent_interrupt || sent_terminate {
        return Err(failure("Subprocess interrupted"));
    }
    Ok(())
}

#[cfg(unix)]
fn forward_signal(child: &tokio::process::Child, signal: ForwardSignal) {
    let number = match signal {
        ForwardSignal::Interrupt => libc::SIGINT,
        ForwardSignal::Terminate => libc::SIGTERM,
    };
    if let Some(pid) = child.id() {
        let pid = pid as libc::pid_t;
        let pgid = unsafe { libc::getpgid(pid) };
        if pgid != -1 {
            unsafe { libc::killpg(pgid, number) };
        }
    }
}

#[cfg(not(unix))]
fn forward_signal(_child: &tokio::process::Child, _signal: ForwardSignal) {}

/// Append captured subprocess output to the step's log file, with a banner
/// per attempt.
fn write_subprocess_logs(
    root_logs_dir: &Path,
    key: &DeploymentKey,
    command_name: &str,
    nb_attempts: u32,
    filename: &str,
    content: &[u8],
) -> std::io::Result<()> {
    let log_dir = root_logs_dir
        .join(&key.module)
        .join(&key.account_id)
        .join(&key.region);
    std::fs::create_dir_all(&log_dir)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(filename))?;
    writeln!(file, "################################")?;
    writeln!(file, "# Subprocess '{command_name}' - Attempt #{nb_attempts}")?;
    writeln!(file, "################################")?;
    file.write_all(content)?;
    writeln!(file)?;
    Ok(())
}
