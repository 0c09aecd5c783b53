//! Process isolation for scraper runs.
//!
//! Every run is a separate OS process. The deadline is enforced here, not by the
//! child: on expiry or cancellation the child is killed and reaped before
//! `launch` returns.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use civic_common::Config;

use crate::worker::WorkerRequest;

/// Cap per captured stream (8 MiB).
const MAX_OUTPUT_BYTES: u64 = 8 * 1024 * 1024;

/// How long to wait for pipes to drain after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Program and leading arguments used to start a worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `SCRAPER_WORKER_BIN worker`, or the current executable's `worker` subcommand.
    pub fn from_config(config: &Config) -> Result<Self> {
        let program = match &config.worker_bin {
            Some(bin) => bin.clone(),
            None => std::env::current_exe().context("Failed to locate current executable")?,
        };
        Ok(Self::new(program, ["worker"]))
    }
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub worker: WorkerRequest,
    pub timeout: Duration,
}

#[derive(Debug)]
pub enum LaunchOutcome {
    Exited {
        success: bool,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// Deadline passed; the child was killed.
    TimedOut { stderr: String },
    /// Cancellation requested; the child was killed.
    Cancelled,
    /// The child could not be started or waited on.
    Failed(String),
}

#[derive(Debug)]
pub struct Launch {
    pub pid: Option<u32>,
    pub outcome: LaunchOutcome,
}

/// Starts one isolated scraper run and waits for it to end.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest, cancel: &CancellationToken) -> Launch;
}

#[async_trait]
impl<L: Launcher + ?Sized> Launcher for Arc<L> {
    async fn launch(&self, request: &LaunchRequest, cancel: &CancellationToken) -> Launch {
        (**self).launch(request, cancel).await
    }
}

pub struct ProcessLauncher {
    command: WorkerCommand,
}

impl ProcessLauncher {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, request: &LaunchRequest, cancel: &CancellationToken) -> Launch {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .args(request.worker.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Launch {
                    pid: None,
                    outcome: LaunchOutcome::Failed(format!(
                        "{}: {e}",
                        self.command.program.display()
                    )),
                }
            }
        };
        let pid = child.id();
        debug!(pid, scraper = %request.worker.scraper_id, "Worker spawned");

        // Read pipes on their own tasks so `wait` can borrow the child.
        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(request.timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        let outcome = match waited {
            Waited::Exited(Ok(status)) => LaunchOutcome::Exited {
                success: status.success(),
                exit_code: status.code(),
                stdout: drain(stdout_task).await,
                stderr: drain(stderr_task).await,
            },
            Waited::Exited(Err(e)) => {
                terminate(&mut child, pid).await;
                stdout_task.abort();
                stderr_task.abort();
                LaunchOutcome::Failed(format!("wait failed: {e}"))
            }
            Waited::TimedOut => {
                warn!(pid, scraper = %request.worker.scraper_id, "Worker deadline passed, killing");
                terminate(&mut child, pid).await;
                stdout_task.abort();
                LaunchOutcome::TimedOut {
                    stderr: drain(stderr_task).await,
                }
            }
            Waited::Cancelled => {
                terminate(&mut child, pid).await;
                stdout_task.abort();
                stderr_task.abort();
                LaunchOutcome::Cancelled
            }
        };

        Launch { pid, outcome }
    }
}

/// Kill and reap. The child may already be gone.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Err(e) = child.kill().await {
        debug!(pid, error = %e, "Kill failed, child already exited");
    }
}

/// Capture up to `MAX_OUTPUT_BYTES`, then keep draining so the child never
/// blocks or dies on a closed pipe. A line cut by the cap is dropped.
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut h) = handle else {
        return buf;
    };
    let _ = (&mut h).take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).await;
    if buf.len() as u64 >= MAX_OUTPUT_BYTES {
        let keep = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        buf.truncate(keep);
        match tokio::io::copy(&mut h, &mut tokio::io::sink()).await {
            Ok(0) => {}
            Ok(discarded) => debug!(discarded, "Output cap reached, discarded the rest"),
            Err(e) => debug!(error = %e, "Pipe closed while discarding output"),
        }
    }
    buf
}

/// Collect a reader task. Grandchildren can hold a pipe open, so this is bounded.
async fn drain(task: JoinHandle<Vec<u8>>) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => {
            abort.abort();
            String::new()
        }
    }
}
