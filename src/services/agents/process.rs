//! Agent Process Control
//!
//! Spawns agent CLI subprocesses in their own process group, captures
//! stdout/stderr into bounded buffers, and tears the whole group down on
//! timeout or cancellation (SIGTERM, then SIGKILL after a grace period) so
//! child tools spawned by the agent are not orphaned.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Marker appended when a capture buffer overflows.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Grace between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Stderr capture ceiling. Stdout's ceiling comes from configuration.
const STDERR_CAP: usize = 256 * 1024;

/// Why a process run did not produce a normal exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessFailure {
    /// The binary could not be spawned at all
    Spawn(String),
    /// Deadline elapsed; the process group was terminated
    Timeout,
    /// Cancellation was requested; the process group was terminated
    Cancelled,
}

/// Captured output of a completed process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl ProcessOutput {
    /// Last `n` lines of stderr, for crash reports.
    pub fn stderr_tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// Run a command to completion with bounded capture.
///
/// The child is placed in a fresh process group. On timeout or cancel the
/// entire group is signalled and the corresponding `ProcessFailure` is
/// returned; the group is guaranteed dead before this function returns.
pub async fn run_captured(
    mut cmd: Command,
    timeout: Duration,
    stdout_cap: usize,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, ProcessFailure> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.as_std_mut().process_group(0);
    }

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProcessFailure::Spawn("binary not found in PATH".to_string())
        } else {
            ProcessFailure::Spawn(e.to_string())
        }
    })?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let stdout_task = tokio::spawn(read_capped(stdout, stdout_cap));
    let stderr_task = tokio::spawn(read_capped(stderr, STDERR_CAP));

    let exit = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Some(status.code()),
            Err(e) => return Err(ProcessFailure::Spawn(format!("wait failed: {}", e))),
        },
        _ = tokio::time::sleep(timeout) => {
            terminate_group(&mut child).await;
            None
        }
        _ = cancel.cancelled() => {
            terminate_group(&mut child).await;
            None
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    match exit {
        Some(code) => Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code: code,
            duration: started.elapsed(),
        }),
        None if cancel.is_cancelled() => Err(ProcessFailure::Cancelled),
        None => Err(ProcessFailure::Timeout),
    }
}

/// Read a stream into a string, stopping at `cap` bytes plus a marker.
async fn read_capped(mut stream: impl AsyncReadExt + Unpin, cap: usize) -> String {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buffer.len() < cap {
                    let take = n.min(cap - buffer.len());
                    buffer.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    // Keep draining so the child is never blocked on a full pipe
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }

    let mut text = String::from_utf8_lossy(&buffer).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

/// SIGTERM the child's process group, wait out the grace period, SIGKILL
/// whatever is left, then reap.
async fn terminate_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let pgid = pid as libc::pid_t;
            unsafe {
                libc::killpg(pgid, libc::SIGTERM);
            }
            let reaped = tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok();
            if !reaped {
                unsafe {
                    libc::killpg(pgid, libc::SIGKILL);
                }
                let _ = child.wait().await;
            }
            return;
        }
    }
    let _ = child.kill().await;
}
