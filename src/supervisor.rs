//! Child-process supervision for the execution service.
//!
//! One [`run`] call owns one child from spawn to reap: both output streams
//! are drained concurrently under a hard byte cap, a wall-clock timer
//! enforces the deadline, and termination escalates from a graceful stop
//! signal to a forced kill after the grace interval. Exactly one outcome —
//! natural exit, timeout, or overflow — settles the run; whichever marks the
//! settlement slot first wins.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::{DEFAULT_KILL_GRACE_MS, DEFAULT_STREAM_CAP_BYTES};
use crate::counter::ActiveProcessCounter;
use crate::error::{RestexecError, Result};

/// Read-chunk size for stream draining.
const READ_CHUNK: usize = 8 * 1024;

/// One child-interpreter invocation.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Identifier carried into errors and logs (the artifact id).
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// The child's entire environment; nothing is inherited.
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    pub stream_cap_bytes: usize,
    pub kill_grace: Duration,
}

impl RunSpec {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            timeout: Duration::from_millis(30_000),
            stream_cap_bytes: DEFAULT_STREAM_CAP_BYTES,
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
        }
    }
}

/// Raw result of a completed supervision.
#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub elapsed: Duration,
}

/// The single outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Exit,
    Timeout,
    Overflow { stream: &'static str },
}

/// Run one child to completion under bounded output and bounded time.
///
/// The child is guaranteed reaped before this returns, on every path. The
/// gauge is incremented before any stream I/O and released on all exits via
/// a drop guard.
pub async fn run(spec: RunSpec, counter: &ActiveProcessCounter) -> Result<RunOutput> {
    let started = tokio::time::Instant::now();
    let deadline = started + spec.timeout;

    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .env_clear()
        .envs(&spec.env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref cwd) = spec.cwd {
        cmd.current_dir(cwd);
    }
    // Own process group, so termination reaches interpreter grandchildren
    // and the output pipes actually close.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| RestexecError::SpawnFailure(e.to_string()))?;

    let _active = counter.acquire();

    let stdout_pipe = child.stdout.take().ok_or_else(|| {
        RestexecError::Internal("stdout pipe was unexpectedly not available".to_string())
    })?;
    let stderr_pipe = child.stderr.take().ok_or_else(|| {
        RestexecError::Internal("stderr pipe was unexpectedly not available".to_string())
    })?;

    let settled: Arc<OnceLock<Settlement>> = Arc::new(OnceLock::new());
    let terminate = CancellationToken::new();

    let stdout_task = tokio::spawn(drain_capped(
        stdout_pipe,
        spec.stream_cap_bytes,
        "stdout",
        settled.clone(),
        terminate.clone(),
    ));
    let stderr_task = tokio::spawn(drain_capped(
        stderr_pipe,
        spec.stream_cap_bytes,
        "stderr",
        settled.clone(),
        terminate.clone(),
    ));

    enum Wakeup {
        Exited(std::io::Result<ExitStatus>),
        Deadline,
        Terminate,
    }

    let wakeup = tokio::select! {
        status = child.wait() => Wakeup::Exited(status),
        _ = tokio::time::sleep_until(deadline) => Wakeup::Deadline,
        // A drain task settled overflow and asked for termination.
        _ = terminate.cancelled() => Wakeup::Terminate,
    };
    let status = match wakeup {
        Wakeup::Exited(status) => {
            let _ = settled.set(Settlement::Exit);
            status.map_err(|e| RestexecError::Internal(format!("wait failed: {e}")))?
        }
        Wakeup::Deadline => {
            let _ = settled.set(Settlement::Timeout);
            terminate_child(&mut child, spec.kill_grace).await?
        }
        Wakeup::Terminate => terminate_child(&mut child, spec.kill_grace).await?,
    };

    let stdout_buf = collect_drain(stdout_task, spec.kill_grace, "stdout").await;
    let stderr_buf = collect_drain(stderr_task, spec.kill_grace, "stderr").await;

    let elapsed = started.elapsed();

    match settled.get().copied().unwrap_or(Settlement::Exit) {
        Settlement::Timeout => {
            tracing::warn!(
                id = %spec.id,
                timeout_ms = spec.timeout.as_millis() as u64,
                elapsed_ms = elapsed.as_millis() as u64,
                "child killed after deadline"
            );
            Err(RestexecError::Timeout {
                id: spec.id,
                timeout_ms: spec.timeout.as_millis() as u64,
            })
        }
        Settlement::Overflow { stream } => {
            tracing::warn!(
                id = %spec.id,
                stream,
                cap_bytes = spec.stream_cap_bytes,
                "child killed after exceeding output cap"
            );
            Err(RestexecError::BufferOverflow {
                id: spec.id,
                stream,
                cap_bytes: spec.stream_cap_bytes,
            })
        }
        Settlement::Exit => {
            let exit_code = status.code();
            let signal = exit_signal(&status);
            tracing::debug!(
                id = %spec.id,
                exit_code = ?exit_code,
                signal = ?signal,
                elapsed_ms = elapsed.as_millis() as u64,
                "child reaped"
            );
            Ok(RunOutput {
                stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
                exit_code,
                signal,
                elapsed,
            })
        }
    }
}

/// Drain one stream into a buffer, enforcing the byte cap before each append.
///
/// On overflow the settlement slot is claimed and termination requested, but
/// reading continues (discarding) until EOF so the dying child is never
/// blocked on a full pipe. Read errors from a dead stream end the drain
/// quietly; they are never fatal to the supervisor.
async fn drain_capped<R>(
    mut reader: R,
    cap: usize,
    stream: &'static str,
    settled: Arc<OnceLock<Settlement>>,
    terminate: CancellationToken,
) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut tmp = [0u8; READ_CHUNK];
    let mut overflowed = false;
    loop {
        let n = match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if overflowed {
            continue;
        }
        if buf.len() + n > cap {
            overflowed = true;
            let _ = settled.set(Settlement::Overflow { stream });
            terminate.cancel();
            continue;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    buf
}

/// Collect a drain task's buffer, bounded so a pipe held open by a stray
/// grandchild cannot wedge the supervisor after reap.
async fn collect_drain(
    mut task: tokio::task::JoinHandle<Vec<u8>>,
    grace: Duration,
    stream: &'static str,
) -> Vec<u8> {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(e)) => {
            tracing::warn!(stream, error = %e, "drain task failed");
            Vec::new()
        }
        Err(_) => {
            task.abort();
            tracing::warn!(stream, "stream still open after reap, discarding output");
            Vec::new()
        }
    }
}

/// Two-stage termination: graceful stop, grace interval, forced kill, reap.
///
/// Signals go to the child's process group so interpreter grandchildren die
/// with it. Signaling an already-dead group is ignored; the reap result is
/// what matters.
async fn terminate_child(child: &mut Child, kill_grace: Duration) -> Result<ExitStatus> {
    #[cfg(unix)]
    signal_group(child, libc::SIGTERM);
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(kill_grace, child.wait()).await {
        Ok(status) => status.map_err(|e| RestexecError::Internal(format!("wait failed: {e}"))),
        Err(_) => {
            #[cfg(unix)]
            signal_group(child, libc::SIGKILL);
            let _ = child.start_kill();
            child
                .wait()
                .await
                .map_err(|e| RestexecError::Internal(format!("wait failed: {e}")))
        }
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        // SAFETY: plain signal send to the group created by setsid; ESRCH
        // for an already-reaped group is harmless and intentionally ignored.
        unsafe {
            libc::kill(-(pid as libc::pid_t), signal);
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
