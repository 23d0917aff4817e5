//! Drives one agent invocation end to end: command construction, spawn,
//! concurrent stream readers, stagnation polling, timeout, and cancellation.
//!
//! `run()` always produces exactly one [`ExecutionResponse`], whatever the
//! outcome. Failure classification for retry purposes lives with the agent
//! layer; the runner only reports what happened.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::EXIT_SIGNAL;
use crate::POLL_INTERVAL_MS;
use crate::breaker::CircuitBreaker;
use crate::errors::ExecError;
use crate::process::ProcessSession;
use crate::reader::{OutputHook, ReadOutcome, RunFlags, StreamReader};
use crate::stream::{StreamParser, TokenUsage, UsageHook};

/// Cadence of the task-stagnation poller.
const STAGNATION_POLL_SECS: u64 = 1;

/// Parameters for one agent invocation.
pub struct ExecutionRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub timeout: Duration,
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub on_output: Option<OutputHook>,
    pub on_usage: Option<UsageHook>,
}

impl ExecutionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            timeout: Duration::from_secs(300),
            breaker: None,
            on_output: None,
            on_usage: None,
        }
    }
}

/// Everything observed during one invocation.
#[derive(Debug, Default)]
pub struct ExecutionResponse {
    pub output: String,
    pub exit_signal: bool,
    pub return_code: i32,
    pub timed_out: bool,
    pub circuit_breaker_triggered: bool,
    pub token_usage: TokenUsage,
    pub total_cost_usd: f64,
    /// Set when the agent binary could not be spawned at all.
    pub launch_error: Option<String>,
}

impl ExecutionResponse {
    pub fn success(&self) -> bool {
        self.return_code == 0
            && self.exit_signal
            && !self.timed_out
            && !self.circuit_breaker_triggered
            && self.launch_error.is_none()
    }

    fn launch_failed(message: String) -> Self {
        Self {
            return_code: -1,
            launch_error: Some(message),
            ..Default::default()
        }
    }
}

/// Cross-thread cancellation handle for a runner's current invocation.
#[derive(Clone)]
pub struct AbortHandle(Arc<RunFlags>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.request_cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.0.cancelled()
    }
}

/// Slot holding the abort handle of whatever invocation is currently in
/// flight, so an external caller can cancel across retry attempts.
#[derive(Clone, Default)]
pub struct AbortRegistry {
    current: Arc<std::sync::Mutex<Option<AbortHandle>>>,
}

impl AbortRegistry {
    pub fn register(&self, handle: AbortHandle) {
        *self.current.lock().expect("abort registry poisoned") = Some(handle);
    }

    pub fn abort(&self) {
        if let Some(handle) = &*self.current.lock().expect("abort registry poisoned") {
            handle.abort();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.current
            .lock()
            .expect("abort registry poisoned")
            .as_ref()
            .is_some_and(AbortHandle::is_aborted)
    }
}

/// One runner per invocation attempt. The shared flags let `abort()` take
/// effect from another task within one poll interval.
pub struct ExecutionRunner {
    binary: String,
    project_dir: PathBuf,
    flags: Arc<RunFlags>,
}

impl ExecutionRunner {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self::with_binary("claude", project_dir)
    }

    pub fn with_binary(binary: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            project_dir: project_dir.into(),
            flags: Arc::new(RunFlags::default()),
        }
    }

    pub fn handle(&self) -> AbortHandle {
        AbortHandle(Arc::clone(&self.flags))
    }

    pub fn abort(&self) {
        self.flags.request_cancel();
    }

    /// Invoke the agent binary with the request's prompt.
    pub async fn run(&self, request: ExecutionRequest) -> ExecutionResponse {
        let command = self.build_command(&request);
        self.execute(command, request).await
    }

    fn build_command(&self, request: &ExecutionRequest) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--print")
            .arg("--dangerously-skip-permissions")
            .arg("--output-format=stream-json")
            .arg("--verbose");
        if let Some(model) = &request.model {
            command.arg("--model").arg(model);
        }
        command.arg("-p").arg(&request.prompt);
        command
    }

    /// Lower-level entry taking a prebuilt command. `run()` delegates here.
    pub async fn execute(&self, command: Command, request: ExecutionRequest) -> ExecutionResponse {
        let mut session = match ProcessSession::spawn(command, &self.project_dir) {
            Ok(session) => session,
            Err(source) => {
                let err = ExecError::LaunchFailed {
                    binary: self.binary.clone(),
                    source,
                };
                tracing::error!(%err, "failed to launch agent");
                return ExecutionResponse::launch_failed(err.to_string());
            }
        };
        tracing::debug!(pid = ?session.id(), "agent started");

        let flags = Arc::clone(&self.flags);
        let parser = StreamParser::new(request.on_usage);

        let stdout_task = session.take_stdout().map(|stdout| {
            let reader = StreamReader::json(
                Arc::clone(&flags),
                request.breaker.clone(),
                request.on_output.clone(),
                parser,
            );
            tokio::spawn(reader.read(stdout))
        });
        let stderr_task = session.take_stderr().map(|stderr| {
            let reader = StreamReader::secondary(
                Arc::clone(&flags),
                request.breaker.clone(),
                request.on_output.clone(),
            );
            tokio::spawn(reader.read(stderr))
        });

        let stagnation_task = request.breaker.as_ref().map(|breaker| {
            let breaker = Arc::clone(breaker);
            let flags = Arc::clone(&flags);
            tokio::spawn(async move {
                while !flags.cancelled() && !flags.process_exited.load(Ordering::SeqCst) {
                    if breaker.check_task_stagnation().is_some() {
                        flags.breaker_tripped.store(true, Ordering::SeqCst);
                        flags.request_cancel();
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(STAGNATION_POLL_SECS)).await;
                }
            })
        });

        let started = Instant::now();
        let mut timed_out = false;
        let mut return_code = -1;
        loop {
            match session.try_wait() {
                Ok(Some(code)) => {
                    return_code = code;
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(%err, "wait on agent process failed");
                    break;
                }
            }
            if flags.cancelled() {
                session.kill().await;
                return_code = session.wait().await.unwrap_or(-1);
                break;
            }
            if started.elapsed() >= request.timeout {
                tracing::warn!(elapsed = ?started.elapsed(), "agent exceeded overall timeout");
                timed_out = true;
                flags.request_cancel();
                session.kill().await;
                return_code = session.wait().await.unwrap_or(-1);
                break;
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
        flags.process_exited.store(true, Ordering::SeqCst);

        // Join the readers before touching the output so nothing is lost.
        let stdout_outcome = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => ReadOutcome::default(),
        };
        let stderr_outcome = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => ReadOutcome::default(),
        };
        if let Some(task) = stagnation_task {
            task.abort();
        }
        session.cleanup();

        let mut output = stdout_outcome.lines.concat();
        output.push_str(&stderr_outcome.lines.concat());

        let response = ExecutionResponse {
            exit_signal: output.contains(EXIT_SIGNAL),
            output,
            return_code,
            timed_out,
            circuit_breaker_triggered: flags.breaker_tripped.load(Ordering::SeqCst),
            token_usage: stdout_outcome.token_usage,
            total_cost_usd: stdout_outcome.total_cost,
            launch_error: None,
        };
        tracing::debug!(
            success = response.success(),
            code = response.return_code,
            "agent invocation finished"
        );
        response
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }
}
