//! Code execution engine: runs caller-supplied source in an external
//! runtime, reconciling three lifecycles: synchronous completion within a
//! capture window, timeout-triggered background continuation, and tool
//! calls issued by the running code on its own stdout.
//!
//! Each execution stages source to a temp file and spawns the runtime with
//! piped stdio. A waiter task owns the child and is the single place where
//! exit is observed, the final report is produced, and the staged files are
//! released. The planner is never blocked on a long-running child: when the
//! capture window fires first the session hands over to a background
//! monitor that reports output deltas through the eager prompt queue.

pub mod runtime;

use crate::config::ExecutionConfig;
use crate::eager::EagerPromptQueue;
use crate::history::HistoryStore;
use crate::manager::ToolDispatcher;
use crate::protocol::{self, ChildLine};
use self::runtime::{Runtime, StagedCommand, StagedProgram, ValidationError, stage, validate_code};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

const COMPILE_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("failed to stage execution source: {0}")]
    Stage(#[from] std::io::Error),
    #[error("execution '{0}' not found")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub code: String,
    pub runtime: String,
    pub timeout_ms: Option<u64>,
}

/// Terminal account of one execution. Nonzero exit and spawn failures are
/// reported through this shape as data, never as a crash.
#[derive(Debug, Clone)]
pub struct ExecReport {
    pub execution_id: String,
    pub success: bool,
    pub output: String,
    pub error: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub enum ExecOutcome {
    Completed(ExecReport),
    /// The capture window fired before the child exited. The child keeps
    /// running; `output_so_far` counts as already reported.
    Handover {
        execution_id: String,
        output_so_far: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Synchronous,
    Backgrounded,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ExecStatus {
    pub execution_id: String,
    pub phase: Phase,
    pub new_output: String,
    pub exit_code: Option<i32>,
}

struct ExecState {
    phase: Phase,
    stdout: String,
    stderr: String,
    /// Byte offset into `stdout` already delivered to the planner. Advanced
    /// only while taking a delta, so no byte is ever shown twice.
    reported: usize,
    exit_code: Option<i32>,
}

struct SessionHandle {
    state: Arc<Mutex<ExecState>>,
    kill: watch::Sender<bool>,
}

pub struct ExecutionEngine {
    dispatcher: Arc<dyn ToolDispatcher>,
    queue: Arc<EagerPromptQueue>,
    history: Arc<HistoryStore>,
    config: ExecutionConfig,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl ExecutionEngine {
    pub fn new(
        dispatcher: Arc<dyn ToolDispatcher>,
        queue: Arc<EagerPromptQueue>,
        history: Arc<HistoryStore>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            dispatcher,
            queue,
            history,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Run `code` under the requested runtime. Validation failures and
    /// unknown runtimes are request errors raised before any spawn; every
    /// post-spawn failure comes back as a failure result.
    pub async fn execute(&self, request: ExecRequest) -> Result<ExecOutcome, ExecError> {
        let runtime = Runtime::parse(&request.runtime)?;
        validate_code(&request.code)?;

        let execution_id = Uuid::new_v4().to_string();
        info!(execution = %execution_id, runtime = runtime.identifier(), "starting execution");
        self.history
            .record_execution_input(&execution_id, runtime.identifier(), &request.code);

        let staged = stage(runtime, &request.code)?;

        if let Some(compile) = staged.compile.clone() {
            if let Some(report) = self.compile_step(&execution_id, &compile).await {
                self.history
                    .record_execution_output(&execution_id, false, &report.error);
                return Ok(ExecOutcome::Completed(report));
            }
        }

        let snapshot = self.dispatcher.descriptor_snapshot().await;
        let mut command = Command::new(&staged.run.program);
        command
            .args(&staged.run.args)
            .env("CODEHARNESS_TOOLS", snapshot.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let report = self.spawn_failure(
                    &execution_id,
                    format!("failed to spawn '{}': {source}", staged.run.program),
                );
                return Ok(ExecOutcome::Completed(report));
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill().await;
            let report =
                self.spawn_failure(&execution_id, "failed to capture child pipes".to_string());
            return Ok(ExecOutcome::Completed(report));
        };

        let state = Arc::new(Mutex::new(ExecState {
            phase: Phase::Synchronous,
            stdout: String::new(),
            stderr: String::new(),
            reported: 0,
            exit_code: None,
        }));

        let stdin = Arc::new(AsyncMutex::new(stdin));
        let stdout_task = tokio::spawn(pump_stdout(
            stdout,
            stdin,
            Arc::clone(&self.dispatcher),
            Arc::clone(&state),
            execution_id.clone(),
            self.config.output_limit_bytes,
        ));
        let stderr_task = tokio::spawn(pump_stderr(
            stderr,
            Arc::clone(&state),
            self.config.output_limit_bytes,
        ));

        let (done_tx, done_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = watch::channel(false);

        {
            let mut sessions = self.sessions.lock().expect("session registry lock");
            sessions.insert(
                execution_id.clone(),
                SessionHandle {
                    state: Arc::clone(&state),
                    kill: kill_tx,
                },
            );
        }

        // The waiter owns the child and the staged files: it observes exit
        // exactly once, drains the readers, produces the final report, and
        // releases the temp files.
        tokio::spawn(waiter(
            child,
            staged,
            kill_rx,
            stdout_task,
            stderr_task,
            Arc::clone(&state),
            Arc::clone(&self.queue),
            Arc::clone(&self.history),
            execution_id.clone(),
            done_tx,
        ));

        let window = Duration::from_millis(
            request
                .timeout_ms
                .unwrap_or(self.config.capture_window_ms),
        );
        let mut done_wait = done_rx.clone();
        if time::timeout(window, done_wait.wait_for(|done| *done))
            .await
            .is_ok()
        {
            let report = {
                let state = state.lock().expect("execution state lock");
                terminal_report(&execution_id, &state)
            };
            self.evict(&execution_id);
            return Ok(ExecOutcome::Completed(report));
        }

        // Capture window fired first. Hand over without killing the child;
        // the phase transition and the reported watermark move under one
        // lock so a racing exit cannot double-report. A waiter that won the
        // race has already parked the phase at a terminal state; it must
        // never regress to Backgrounded, even for a signal-killed child
        // that carries no exit code.
        let decision = {
            let mut state = state.lock().expect("execution state lock");
            match begin_handover(&mut state) {
                Some(output) => Ok(output),
                None => Err(terminal_report(&execution_id, &state)),
            }
        };
        let output_so_far = match decision {
            Ok(output) => output,
            Err(report) => {
                self.evict(&execution_id);
                return Ok(ExecOutcome::Completed(report));
            }
        };

        info!(execution = %execution_id, "capture window elapsed; handing over to background monitoring");
        tokio::spawn(monitor(
            Arc::clone(&state),
            Arc::clone(&self.queue),
            execution_id.clone(),
            Duration::from_millis(self.config.monitor_interval_ms),
            done_rx,
        ));

        Ok(ExecOutcome::Handover {
            execution_id,
            output_so_far,
        })
    }

    /// Unreported output since the last report, plus current phase and exit
    /// code. Taking the delta advances the watermark. A terminal status is
    /// delivered once; the session is evicted with it.
    pub fn status(&self, execution_id: &str) -> Option<ExecStatus> {
        let mut sessions = self.sessions.lock().expect("session registry lock");
        let handle = sessions.get(execution_id)?;
        let status = {
            let mut state = handle.state.lock().expect("execution state lock");
            let delta = state.stdout[state.reported..].to_string();
            state.reported = state.stdout.len();
            ExecStatus {
                execution_id: execution_id.to_string(),
                phase: state.phase,
                new_output: delta,
                exit_code: state.exit_code,
            }
        };
        if matches!(status.phase, Phase::Completed | Phase::Failed) {
            sessions.remove(execution_id);
        }
        Some(status)
    }

    /// Explicitly terminate a running execution. This is the only way a
    /// backgrounded child is ever killed.
    pub fn kill(&self, execution_id: &str) -> Result<(), ExecError> {
        let sessions = self.sessions.lock().expect("session registry lock");
        let handle = sessions
            .get(execution_id)
            .ok_or_else(|| ExecError::NotFound(execution_id.to_string()))?;
        let _ = handle.kill.send(true);
        Ok(())
    }

    async fn compile_step(
        &self,
        execution_id: &str,
        compile: &StagedCommand,
    ) -> Option<ExecReport> {
        let mut command = Command::new(&compile.program);
        command.args(&compile.args);
        let failure = |error: String, exit_code: Option<i32>| ExecReport {
            execution_id: execution_id.to_string(),
            success: false,
            output: String::new(),
            error,
            exit_code,
        };

        match time::timeout(COMPILE_DEADLINE, command.output()).await {
            Ok(Ok(output)) if output.status.success() => None,
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                let error = if stderr.trim().is_empty() {
                    format!("compilation failed with status {}", output.status)
                } else {
                    stderr
                };
                Some(failure(error, output.status.code()))
            }
            Ok(Err(source)) => Some(failure(
                format!("failed to run compiler '{}': {source}", compile.program),
                None,
            )),
            Err(_) => Some(failure("compilation timed out".to_string(), None)),
        }
    }

    fn evict(&self, execution_id: &str) {
        let mut sessions = self.sessions.lock().expect("session registry lock");
        sessions.remove(execution_id);
    }

    fn spawn_failure(&self, execution_id: &str, error: String) -> ExecReport {
        warn!(execution = %execution_id, error = %error, "execution failed before running");
        self.history
            .record_execution_output(execution_id, false, &error);
        ExecReport {
            execution_id: execution_id.to_string(),
            success: false,
            output: String::new(),
            error,
            exit_code: None,
        }
    }
}

/// Line-buffer the child's stdout. Lines matching the tool-call envelope
/// are dispatched and answered on the child's stdin; everything else is
/// ordinary output.
async fn pump_stdout(
    stdout: ChildStdout,
    stdin: Arc<AsyncMutex<ChildStdin>>,
    dispatcher: Arc<dyn ToolDispatcher>,
    state: Arc<Mutex<ExecState>>,
    execution_id: String,
    limit: usize,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match ChildLine::classify(&line) {
            ChildLine::ToolCall(envelope) => {
                debug!(
                    execution = %execution_id,
                    tool = %envelope.params.name,
                    "intercepted tool call from child"
                );
                let reply = match dispatcher
                    .dispatch_tool(&envelope.params.name, envelope.params.arguments.clone())
                    .await
                {
                    Ok(text) => protocol::response(envelope.id, protocol::text_content(&text)),
                    Err(err) => protocol::error_response(envelope.id, -32000, &err.to_string()),
                };
                let mut writer = stdin.lock().await;
                let encoded = reply.to_string();
                if writer.write_all(encoded.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    debug!(
                        execution = %execution_id,
                        "child stdin closed before tool result could be written"
                    );
                }
            }
            ChildLine::Text(text) => {
                let mut state = state.lock().expect("execution state lock");
                append_limited(&mut state.stdout, &text, limit);
            }
        }
    }
}

async fn pump_stderr(stderr: ChildStderr, state: Arc<Mutex<ExecState>>, limit: usize) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut state = state.lock().expect("execution state lock");
        append_limited(&mut state.stderr, &line, limit);
    }
}

#[allow(clippy::too_many_arguments)]
async fn waiter(
    mut child: tokio::process::Child,
    staged: StagedProgram,
    kill_rx: watch::Receiver<bool>,
    stdout_task: tokio::task::JoinHandle<()>,
    stderr_task: tokio::task::JoinHandle<()>,
    state: Arc<Mutex<ExecState>>,
    queue: Arc<EagerPromptQueue>,
    history: Arc<HistoryStore>,
    execution_id: String,
    done_tx: watch::Sender<bool>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = killed(kill_rx) => {
            info!(execution = %execution_id, "killing execution on request");
            let _ = child.kill().await;
            child.wait().await
        }
    };

    // Readers finish at pipe EOF, which follows the exit just observed.
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let exit_code = status.as_ref().ok().and_then(|s| s.code());
    let success = status.as_ref().map(|s| s.success()).unwrap_or(false);

    let (was_backgrounded, delta, output, stderr) = {
        let mut state = state.lock().expect("execution state lock");
        state.exit_code = exit_code;
        let was_backgrounded = state.phase == Phase::Backgrounded;
        state.phase = if success { Phase::Completed } else { Phase::Failed };
        let delta = state.stdout[state.reported..].to_string();
        if was_backgrounded {
            state.reported = state.stdout.len();
        }
        (was_backgrounded, delta, state.stdout.clone(), state.stderr.clone())
    };

    if was_backgrounded {
        let message = match exit_code {
            Some(code) => format!("execution {execution_id} finished with exit code {code}"),
            None => format!("execution {execution_id} terminated by signal"),
        };
        queue.push(&execution_id, message, delta);
    }

    let summary = if success || stderr.trim().is_empty() {
        output
    } else {
        stderr
    };
    history.record_execution_output(&execution_id, success, &summary);
    info!(execution = %execution_id, success, exit_code = ?exit_code, "execution finished");

    // Staged source (and compiled artifact) are removed here, exactly once.
    drop(staged);
    let _ = done_tx.send(true);
}

/// Recurring delta reporter for a handed-over execution. Cancelled
/// deterministically by the done signal; the final report belongs to the
/// waiter.
async fn monitor(
    state: Arc<Mutex<ExecState>>,
    queue: Arc<EagerPromptQueue>,
    execution_id: String,
    interval: Duration,
    mut done: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = time::sleep(interval) => {
                let delta = {
                    let mut state = state.lock().expect("execution state lock");
                    if state.phase != Phase::Backgrounded {
                        None
                    } else {
                        let delta = state.stdout[state.reported..].to_string();
                        if delta.is_empty() {
                            None
                        } else {
                            state.reported = state.stdout.len();
                            Some(delta)
                        }
                    }
                };
                if let Some(delta) = delta {
                    queue.push(
                        &execution_id,
                        format!("execution {execution_id} produced new output"),
                        delta,
                    );
                }
            }
            _ = done.wait_for(|finished| *finished) => break,
        }
    }
}

async fn killed(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Kill sender gone; nothing will ever signal. Park forever and
            // let the natural-exit arm win the select.
            std::future::pending::<()>().await;
        }
    }
}

/// Transition a live session to Backgrounded and take the handover
/// snapshot, counting those bytes as reported. Returns `None` when the
/// waiter already parked the phase at a terminal state; terminal phases
/// are final and never regress.
fn begin_handover(state: &mut ExecState) -> Option<String> {
    if matches!(state.phase, Phase::Completed | Phase::Failed) {
        return None;
    }
    state.phase = Phase::Backgrounded;
    state.reported = state.stdout.len();
    Some(state.stdout.clone())
}

fn terminal_report(execution_id: &str, state: &ExecState) -> ExecReport {
    ExecReport {
        execution_id: execution_id.to_string(),
        success: state.phase == Phase::Completed,
        output: state.stdout.clone(),
        error: state.stderr.clone(),
        exit_code: state.exit_code,
    }
}

fn append_limited(buffer: &mut String, line: &str, limit: usize) {
    if buffer.len() >= limit {
        return;
    }
    let remaining = limit - buffer.len();
    if line.len() + 1 <= remaining {
        buffer.push_str(line);
        buffer.push('\n');
        return;
    }
    let mut taken = String::new();
    for ch in line.chars() {
        if taken.len() + ch.len_utf8() > remaining {
            break;
        }
        taken.push(ch);
    }
    buffer.push_str(&taken);
    buffer.push_str("\n[output truncated]\n");
}
