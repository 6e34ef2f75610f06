//! Supervised subprocess execution.
//!
//! Commands run with piped stdout/stderr, an overall timeout, and a cancel
//! token.  On timeout or cancel the child receives a graceful termination
//! signal first; after the grace period it is force-killed.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ValidationError;

/// What to run and under which budget.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    /// Delay between the graceful signal and the forced kill.
    pub kill_grace: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: Duration::from_secs(600),
            kill_grace: Duration::from_secs(5),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a completed command.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

enum Interrupt {
    Timeout,
    Cancelled,
}

/// Run one command under supervision.
///
/// Returns `CommandFailed` for a non-zero exit (retryable by the caller's
/// policy), `Timeout`/`Cancelled` when interrupted.  The child is always
/// dead when this returns; `kill_on_drop` also covers the caller's future
/// being dropped mid-await.
pub async fn run_supervised(
    spec: &CommandSpec,
    cancel: &CancellationToken,
) -> Result<CommandOutput, ValidationError> {
    let started = Instant::now();

    let mut command = tokio::process::Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn()?;
    debug!(command = %spec.display(), "process spawned");

    // Readers run concurrently with the wait so pipes never fill up.
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    });

    let waited = tokio::select! {
        status = child.wait() => Ok(status?),
        _ = tokio::time::sleep(spec.timeout) => Err(Interrupt::Timeout),
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
    };

    match waited {
        Ok(status) => {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            let duration = started.elapsed();

            if status.success() {
                Ok(CommandOutput { stdout, stderr, exit_code: status.code(), duration })
            } else {
                Err(ValidationError::CommandFailed {
                    command: spec.display(),
                    code: status.code(),
                    stderr: truncate(&stderr, 2048),
                })
            }
        }
        Err(interrupt) => {
            escalate_kill(&mut child, spec.kill_grace).await;
            stdout_task.abort();
            stderr_task.abort();
            match interrupt {
                Interrupt::Timeout => {
                    warn!(command = %spec.display(), timeout = ?spec.timeout, "process timed out");
                    Err(ValidationError::Timeout(spec.timeout))
                }
                Interrupt::Cancelled => {
                    debug!(command = %spec.display(), "process cancelled");
                    Err(ValidationError::Cancelled)
                }
            }
        }
    }
}

/// Run with exponential backoff on retryable (command-style) failures.
/// Delays are `1s, 2s, 4s, …` capped at 10 s; the sleep is cancel-aware.
pub async fn run_with_retries(
    spec: &CommandSpec,
    cancel: &CancellationToken,
    max_retries: u32,
) -> Result<CommandOutput, ValidationError> {
    let mut attempt = 0u32;
    loop {
        match run_supervised(spec, cancel).await {
            Ok(output) => return Ok(output),
            Err(err) if err.is_retryable() && attempt < max_retries => {
                let delay = backoff_delay(attempt);
                warn!(command = %spec.display(), attempt = attempt + 1, ?delay, %err,
                    "command failed; backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ValidationError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// `min(2^attempt seconds, 10s)`.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(4);
    Duration::from_secs(secs.min(10))
}

/// Graceful signal, grace period, then forced kill.
async fn escalate_kill(child: &mut Child, grace: Duration) {
    terminate_gracefully(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("process ignored graceful termination; killing");
            let _ = child.kill().await;
        }
    }
}

#[cfg(unix)]
fn terminate_gracefully(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: signalling a pid we spawned and still own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(child: &Child) {
    // No graceful signal available; the forced kill follows after grace.
    let _ = child;
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let spec = sh("echo out; echo err >&2");
        let output = run_supervised(&spec, &CancellationToken::new()).await.unwrap();
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.exit_code, Some(0));
    }

    #[tokio::test]
    async fn non_zero_exit_is_command_failed() {
        let spec = sh("echo broken >&2; exit 3");
        let err = run_supervised(&spec, &CancellationToken::new()).await.unwrap_err();
        match &err {
            ValidationError::CommandFailed { code, stderr, .. } => {
                assert_eq!(*code, Some(3));
                assert!(stderr.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let spec = sh("sleep 60")
            .timeout(Duration::from_millis(100))
            .kill_grace(Duration::from_millis(100));

        let started = Instant::now();
        let err = run_supervised(&spec, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ValidationError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancel_interrupts_the_child() {
        let spec = sh("sleep 60").kill_grace(Duration::from_millis(100));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = run_supervised(&spec, &cancel).await.unwrap_err();
        assert!(matches!(err, ValidationError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn retries_back_off_then_succeed() {
        // The script fails until the marker file exists, which the first
        // run creates.
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!(
            "if [ -f {m} ]; then echo done; else touch {m}; exit 1; fi",
            m = marker.display()
        );
        let spec = sh(&script);

        let output = run_with_retries(&spec, &CancellationToken::new(), 3).await.unwrap();
        assert_eq!(output.stdout.trim(), "done");
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let spec = sh("exit 1");
        let err = run_with_retries(&spec, &CancellationToken::new(), 1).await.unwrap_err();
        assert!(matches!(err, ValidationError::CommandFailed { .. }));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(5), Duration::from_secs(10));
        assert_eq!(backoff_delay(30), Duration::from_secs(10));
    }
}
