//! Process-level sandbox for generated scripts.
//!
//! Isolation is a per-attempt working directory, a wall-clock timeout and
//! `kill_on_drop`. It is not a security boundary.
//!
//! On unix each script leads its own process group. The group is killed once
//! the script exits, times out or is cancelled, so background jobs it started
//! cannot outlive the attempt or hold its output pipes open.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::result::{ExecutionOutput, TailBuffer};
use super::{ScriptExecutor, ScriptJob};

/// Environment variable holding the attempt's working directory.
pub const RUN_DIR_ENV: &str = "AUTOML_RUN_DIR";

/// Environment variable holding the pipeline run id.
pub const RUN_ID_ENV: &str = "AUTOML_RUN_ID";

/// How long to wait for stream readers after the child is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Errors that can occur while running a script.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox setup failed: {0}")]
    Setup(String),

    #[error("Failed to spawn interpreter '{interpreter}': {message}")]
    Spawn { interpreter: String, message: String },

    #[error("Execution was cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the process sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Interpreter binary (e.g. `python3`).
    pub interpreter: String,
    /// Root of per-run working directories.
    pub workspace_root: PathBuf,
    /// File name the script is written to.
    pub script_name: String,
    /// Wall-clock budget per execution.
    pub timeout: Duration,
    /// Capture limit per stream, in bytes.
    pub output_limit_bytes: usize,
    /// Extra environment variables.
    pub env_vars: Vec<(String, String)>,
}

impl SandboxConfig {
    /// Creates a configuration with a 60s timeout.
    pub fn new(interpreter: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            workspace_root: workspace_root.into(),
            script_name: "pipeline.py".to_string(),
            timeout: Duration::from_secs(60),
            output_limit_bytes: 256 * 1024,
            env_vars: Vec::new(),
        }
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the script file name.
    pub fn with_script_name(mut self, name: impl Into<String>) -> Self {
        self.script_name = name.into();
        self
    }

    /// Sets the per-stream capture limit.
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }
}

/// Runs scripts as local child processes.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    config: SandboxConfig,
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Working directory for one attempt.
    pub fn attempt_dir(&self, job: &ScriptJob) -> PathBuf {
        self.config
            .workspace_root
            .join(&job.run_id)
            .join(format!("attempt-{}", job.attempt))
    }

    async fn prepare(&self, job: &ScriptJob) -> Result<PathBuf, SandboxError> {
        validate_run_id(&job.run_id)?;

        let dir = self.attempt_dir(job);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            SandboxError::Setup(format!("cannot create {}: {}", dir.display(), e))
        })?;
        let dir = tokio::fs::canonicalize(&dir).await?;
        tokio::fs::write(dir.join(&self.config.script_name), &job.code).await?;
        Ok(dir)
    }

    fn command(&self, job: &ScriptJob, dir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.interpreter);
        cmd.arg(&self.config.script_name)
            .current_dir(dir)
            .env(RUN_DIR_ENV, dir)
            .env(RUN_ID_ENV, &job.run_id)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }
        cmd
    }
}

#[async_trait]
impl ScriptExecutor for ProcessSandbox {
    async fn execute(
        &self,
        job: &ScriptJob,
        cancel: &CancellationToken,
        lines: Option<mpsc::Sender<String>>,
    ) -> Result<ExecutionOutput, SandboxError> {
        let dir = self.prepare(job).await?;
        let start = Instant::now();

        let mut child = self.command(job, &dir).spawn().map_err(|e| SandboxError::Spawn {
            interpreter: self.config.interpreter.clone(),
            message: e.to_string(),
        })?;

        let pid = child.id();

        info!(
            run_id = %job.run_id,
            attempt = job.attempt,
            pid = ?pid,
            dir = %dir.display(),
            "Started script"
        );

        let limit = self.config.output_limit_bytes;
        let stdout_tail = SharedTail::new(limit);
        let stderr_tail = SharedTail::new(limit);
        let stdout_task = child
            .stdout
            .take()
            .map(|stream| tokio::spawn(capture(stream, stdout_tail.clone(), lines)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stream| tokio::spawn(capture(stream, stderr_tail.clone(), None)));

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => Waited::Cancelled,
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(self.config.timeout) => Waited::TimedOut,
        };

        let (exit_code, timed_out) = match waited {
            Waited::Exited(status) => {
                // Leftover background jobs would keep the pipes open.
                kill_process_group(pid);
                (status?.code(), false)
            }
            Waited::TimedOut => {
                warn!(
                    run_id = %job.run_id,
                    attempt = job.attempt,
                    timeout_secs = self.config.timeout.as_secs(),
                    "Script exceeded time budget, killing"
                );
                terminate(&mut child, pid).await;
                (None, true)
            }
            Waited::Cancelled => {
                info!(run_id = %job.run_id, attempt = job.attempt, "Cancelling script");
                terminate(&mut child, pid).await;
                abort_reader(stdout_task);
                abort_reader(stderr_task);
                return Err(SandboxError::Cancelled);
            }
        };

        let (stdout, stdout_truncated) = join_reader(stdout_task, &stdout_tail, "stdout").await;
        let (stderr, stderr_truncated) = join_reader(stderr_task, &stderr_tail, "stderr").await;
        let duration_ms = start.elapsed().as_millis() as u64;

        debug!(
            run_id = %job.run_id,
            attempt = job.attempt,
            exit_code = ?exit_code,
            timed_out = timed_out,
            duration_ms = duration_ms,
            "Script finished"
        );

        Ok(ExecutionOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
            duration_ms,
            truncated: stdout_truncated || stderr_truncated,
            work_dir: Some(dir),
        })
    }

    async fn cleanup(&self, run_id: &str) -> Result<(), SandboxError> {
        validate_run_id(run_id)?;
        let dir = self.config.workspace_root.join(run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(run_id = %run_id, dir = %dir.display(), "Removed run workspace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::Io(e)),
        }
    }
}

/// Tail buffer shared with a reader task, so whatever was read survives the
/// task being abandoned.
#[derive(Clone)]
struct SharedTail(Arc<Mutex<TailBuffer>>);

impl SharedTail {
    fn new(limit: usize) -> Self {
        Self(Arc::new(Mutex::new(TailBuffer::new(limit))))
    }

    fn push(&self, line: String) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(line);
    }

    fn take(&self) -> (String, bool) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Reads a stream line by line into `tail`, forwarding each line.
async fn capture<R>(stream: R, tail: SharedTail, mut lines: Option<mpsc::Sender<String>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut raw = Vec::new();

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&raw).into_owned();
                if let Some(tx) = &lines {
                    let text = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(text).await.is_err() {
                        lines = None;
                    }
                }
                tail.push(line);
            }
            Err(e) => {
                warn!(error = %e, "Stream read failed");
                break;
            }
        }
    }
}

fn validate_run_id(run_id: &str) -> Result<(), SandboxError> {
    let valid = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SandboxError::Setup(format!("invalid run id '{}'", run_id)))
    }
}

/// Sends SIGKILL to the process group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal to the group the script was spawned into.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid = pgid, error = %err, "Failed to kill script process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_process_group(pid);
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill script process");
    }
}

fn abort_reader(task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        task.abort();
    }
}

/// Waits for a reader task, giving up after a grace period. A process that
/// left the script's group can keep the pipe open; what was read so far is
/// returned either way.
async fn join_reader(
    task: Option<JoinHandle<()>>,
    tail: &SharedTail,
    stream: &str,
) -> (String, bool) {
    if let Some(mut task) = task {
        match tokio::time::timeout(READER_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(stream = stream, error = %e, "Reader task failed"),
            Err(_) => {
                warn!(stream = stream, "Reader task outlived the script, abandoning");
                task.abort();
            }
        }
    }
    tail.take()
}
