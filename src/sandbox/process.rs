//! Scoped spawn-and-terminate for one subprocess.
//!
//! The child runs in its own process group with a cleared environment. When
//! the run ends, for any reason, the whole group is sent SIGKILL so no
//! background process outlives it.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Environment variables passed through from the parent.
const PRESERVED_ENV: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR"];

/// Grace period for draining pipes after the child has exited or been killed.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// `code` is `None` when the child died from a signal.
    Exited { code: Option<i32> },
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub outcome: ProcessOutcome,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.outcome == ProcessOutcome::Exited { code: Some(0) }
    }
}

fn configure(spec: &ProcessSpec) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.process_group(0);
    cmd.args(&spec.args);
    cmd.current_dir(&spec.cwd);
    cmd.env_clear();
    for var in PRESERVED_ENV {
        if let Ok(value) = std::env::var(var) {
            cmd.env(var, value);
        }
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    cmd.stdin(if spec.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // ESRCH here just means the group is already gone.
    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
}

async fn drain<R>(handle: tokio::task::JoinHandle<R>) -> R
where
    R: Default,
{
    match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
        Ok(Ok(value)) => value,
        _ => R::default(),
    }
}

/// Run a process to completion or until its timeout.
pub async fn run_process(spec: &ProcessSpec) -> Result<ProcessOutput, String> {
    let start = Instant::now();
    let mut child = configure(spec)
        .spawn()
        .map_err(|e| format!("failed to spawn {}: {}", spec.program, e))?;
    let pid = child.id();
    tracing::debug!(program = %spec.program, ?pid, cwd = %spec.cwd.display(), "spawned");

    if let (Some(mut stdin), Some(data)) = (child.stdin.take(), spec.stdin.clone()) {
        tokio::spawn(async move {
            let _ = stdin.write_all(&data).await;
            let _ = stdin.shutdown().await;
        });
    }

    let mut stdout = child.stdout.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(out) = stdout.as_mut() {
            let _ = out.read_to_end(&mut buf).await;
        }
        buf
    });
    let mut stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(err) = stderr.as_mut() {
            let _ = err.read_to_end(&mut buf).await;
        }
        buf
    });

    let outcome = match tokio::time::timeout(spec.timeout, child.wait()).await {
        Ok(Ok(status)) => ProcessOutcome::Exited {
            code: status.code(),
        },
        Ok(Err(e)) => {
            kill_group(pid);
            return Err(format!("wait error: {}", e));
        }
        Err(_) => {
            tracing::warn!(program = %spec.program, ?pid, timeout = ?spec.timeout, "timed out, killing process group");
            kill_group(pid);
            let _ = child.kill().await;
            ProcessOutcome::TimedOut
        }
    };
    kill_group(pid);

    let stdout = drain(stdout_task).await;
    let stderr = drain(stderr_task).await;
    let elapsed = start.elapsed();
    tracing::debug!(program = %spec.program, ?outcome, ?elapsed, "finished");

    Ok(ProcessOutput {
        outcome,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bash(script: &str, timeout: Duration) -> ProcessSpec {
        ProcessSpec {
            program: "bash".into(),
            args: vec!["-c".into(), script.into()],
            cwd: std::env::temp_dir(),
            env: vec![("REGRID_TEST".into(), "1".into())],
            stdin: None,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_echo() {
        let out = run_process(&bash("echo hello", Duration::from_secs(10))).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_exit_code_and_stderr() {
        let out = run_process(&bash("echo bad >&2; exit 42", Duration::from_secs(10))).await.unwrap();
        assert_eq!(out.outcome, ProcessOutcome::Exited { code: Some(42) });
        assert!(out.stderr.contains("bad"));
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        std::env::set_var("REGRID_LEAK_CHECK", "leaked");
        let out = run_process(&bash(
            "echo \"${REGRID_LEAK_CHECK:-clean} $REGRID_TEST\"",
            Duration::from_secs(10),
        ))
        .await
        .unwrap();
        assert_eq!(out.stdout.trim(), "clean 1");
    }

    #[tokio::test]
    async fn test_stdin_is_delivered() {
        let mut spec = bash("tr a-z A-Z", Duration::from_secs(10));
        spec.stdin = Some(b"abc".to_vec());
        let out = run_process(&spec).await.unwrap();
        assert_eq!(out.stdout, "ABC");
    }

    #[tokio::test]
    async fn test_timeout_kills_group() {
        let out = run_process(&bash(
            "sleep 30 & while true; do sleep 0.1; done",
            Duration::from_millis(500),
        ))
        .await
        .unwrap();
        assert_eq!(out.outcome, ProcessOutcome::TimedOut);
        assert!(out.elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut spec = bash("true", Duration::from_secs(1));
        spec.program = "/nonexistent/interpreter".into();
        assert!(run_process(&spec).await.is_err());
    }
}
