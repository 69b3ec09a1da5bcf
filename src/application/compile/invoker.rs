use std::{
    ffi::OsString,
    io::{self, ErrorKind},
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStderr, Command},
    task::JoinHandle,
};
use tracing::{info, warn};

use super::types::{CompilerOutcome, ExitKind};

const MAX_STDERR_BYTES: usize = 1024 * 1024;
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// One external compiler run: what to execute, where, and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("compiler `{program}` is not installed")]
    NotFound {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn compiler `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for compiler")]
    Wait(#[source] io::Error),
}

/// Capability to run an external program under a time bound.
///
/// The pipeline only depends on this trait, so tests can swap in a fake
/// runner instead of real TeX binaries.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<CompilerOutcome, InvokeError>;
}

/// Runs the compiler as a tokio child process.
///
/// The child leads its own process group and is spawned with `kill_on_drop`,
/// so dropping the future (client went away, request deadline hit) kills the
/// compiler and anything it started.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildProcessRunner;

#[async_trait]
impl ProcessRunner for ChildProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CompilerOutcome, InvokeError> {
        let started_at = Instant::now();
        let program = invocation.program.display().to_string();

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| {
            warn!(
                target = "application::compile::invoker",
                op = "invoker::run",
                result = "error",
                error_code = "spawn",
                program = %program,
                error = %source,
                "Failed to spawn compiler"
            );
            if source.kind() == ErrorKind::NotFound {
                InvokeError::NotFound {
                    program: program.clone(),
                    source,
                }
            } else {
                InvokeError::Spawn {
                    program: program.clone(),
                    source,
                }
            }
        })?;

        // Dropped before `child`; `kill_on_drop` alone only reaches the leader.
        let mut group = ProcessGroup::of(&child);
        let capture = StderrCapture::spawn(child.stderr.take());

        let exit = match tokio::time::timeout(invocation.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => ExitKind::Success,
            Ok(Ok(status)) => ExitKind::Failed {
                code: status.code(),
            },
            Ok(Err(err)) => {
                capture.abort();
                return Err(InvokeError::Wait(err));
            }
            Err(_) => {
                group.kill();
                if let Err(err) = child.kill().await {
                    warn!(
                        target = "application::compile::invoker",
                        op = "invoker::run",
                        program = %program,
                        error = %err,
                        "Failed to kill timed out compiler"
                    );
                }
                ExitKind::TimedOut {
                    after_secs: invocation.timeout.as_secs(),
                }
            }
        };

        // Leftover background jobs must not hold the pipe open.
        group.kill();
        let stderr = capture.collect(STDERR_DRAIN_GRACE).await;

        let (result, exit_code) = match exit {
            ExitKind::Success => ("success", 0),
            ExitKind::Failed { code } => ("failed", code.map(i64::from).unwrap_or(-1)),
            ExitKind::TimedOut { .. } => ("timeout", -1),
        };
        info!(
            target = "application::compile::invoker",
            op = "invoker::run",
            result,
            exit_code,
            program = %program,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            stderr_bytes = stderr.len(),
            "Compiler finished"
        );

        Ok(CompilerOutcome {
            exit,
            stderr,
            diagnostics: None,
        })
    }
}

/// The compiler's process group; killed on drop.
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.take() {
            // SAFETY: killpg only delivers a signal; an empty group yields ESRCH.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Stderr bytes read so far, kept in a shared buffer so they survive an
/// aborted reader.
struct StderrCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl StderrCapture {
    fn spawn(stderr: Option<ChildStderr>) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let task = tokio::spawn(async move {
            let Some(mut stderr) = stderr else {
                return;
            };
            let mut chunk = [0u8; 8192];
            // Keep reading past the cap so a chatty compiler never blocks on a full pipe.
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => {
                        let mut captured = lock(&sink);
                        let room = MAX_STDERR_BYTES.saturating_sub(captured.len());
                        captured.extend_from_slice(&chunk[..read.min(room)]);
                    }
                }
            }
        });
        Self { buffer, task }
    }

    fn abort(self) {
        self.task.abort();
    }

    async fn collect(mut self, grace: Duration) -> String {
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            self.task.abort();
        }
        let bytes = std::mem::take(&mut *lock(&self.buffer));
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn lock(buffer: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}
