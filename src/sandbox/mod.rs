//! Sandboxed executor for synthesized scripts.
//!
//! Each run gets a fresh temp directory, its own process group and a cleared
//! environment. Output is written inside the sandbox and copied to its
//! destination only after exit 0 and a successful read-back, so failed or
//! timed-out runs never leave partial files behind.

pub mod process;

use crate::core::script::Script;
use crate::core::sheet_io::read_table;
use crate::core::table::Table;
use crate::error::{RegridError, Result};
use crate::provenance::hasher::hash_string;
use process::{run_process, ProcessOutcome, ProcessSpec};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Captured stdout/stderr are cut to this many characters.
pub const MAX_CAPTURE_CHARS: usize = 3000;

/// Script file name inside the sandbox.
const SCRIPT_NAME: &str = "transform.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Failure,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        }
    }
}

/// Outcome of one sandboxed run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    /// Output read back from the sandbox; set only on success.
    pub table: Option<Table>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub limit: Duration,
    pub script_identity: String,
    /// Where the output was copied, when a destination was given.
    pub output_path: Option<PathBuf>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// The error a failed run maps to; `None` on success.
    pub fn to_error(&self) -> Option<RegridError> {
        match self.status {
            ExecutionStatus::Success => None,
            ExecutionStatus::Timeout => Some(RegridError::ExecutorTimeout(self.limit)),
            ExecutionStatus::Failure => Some(RegridError::ExecutorRuntime {
                code: self.exit_code,
                stderr: self.stderr.clone(),
            }),
        }
    }

    /// The output table, or the run's error.
    pub fn into_table(self) -> Result<Table> {
        if let Some(err) = self.to_error() {
            return Err(err);
        }
        self.table
            .ok_or_else(|| RegridError::ExecutorRuntime {
                code: self.exit_code,
                stderr: "no output table".to_string(),
            })
    }
}

/// Keep the tail of captured output; diagnostics usually end there.
pub fn truncate_capture(text: &str) -> String {
    let count = text.chars().count();
    if count <= MAX_CAPTURE_CHARS {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - MAX_CAPTURE_CHARS).collect();
    format!("…{}", tail)
}

/// Runs scripts with a fixed timeout and runtime binary.
#[derive(Debug, Clone)]
pub struct Executor {
    timeout: Duration,
    runtime_bin: PathBuf,
}

impl Executor {
    pub fn new(timeout: Duration, runtime_bin: Option<PathBuf>) -> Self {
        Self {
            timeout,
            runtime_bin: resolve_runtime_bin(runtime_bin),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn runtime_bin(&self) -> &Path {
        &self.runtime_bin
    }

    /// Run a synthesized script against one input file.
    pub async fn execute(
        &self,
        script: &Script,
        input: &Path,
        destination: Option<&Path>,
    ) -> Result<ExecutionResult> {
        self.execute_source(&script.text, input, destination).await
    }

    /// Run script text (a saved `transform.sh`) against one input file.
    pub async fn execute_source(
        &self,
        script_text: &str,
        input: &Path,
        destination: Option<&Path>,
    ) -> Result<ExecutionResult> {
        let input = input.canonicalize().map_err(|e| {
            RegridError::Profile(format!("cannot access input {}: {}", input.display(), e))
        })?;
        let sandbox = tempfile::Builder::new().prefix("regrid-run-").tempdir()?;
        let script_path = sandbox.path().join(SCRIPT_NAME);
        std::fs::write(&script_path, script_text)?;

        let extension = destination
            .and_then(|d| d.extension())
            .and_then(|e| e.to_str())
            .unwrap_or("xlsx");
        let sandbox_output = sandbox.path().join(format!("output.{}", extension));

        let spec = ProcessSpec {
            program: "bash".to_string(),
            args: vec![
                script_path.to_string_lossy().to_string(),
                input.to_string_lossy().to_string(),
                sandbox_output.to_string_lossy().to_string(),
            ],
            cwd: sandbox.path().to_path_buf(),
            env: vec![(
                "REGRID_BIN".to_string(),
                self.runtime_bin.to_string_lossy().to_string(),
            )],
            stdin: None,
            timeout: self.timeout,
        };
        tracing::debug!(input = %input.display(), sandbox = %sandbox.path().display(), "executing script");
        let output = run_process(&spec).await.map_err(|e| RegridError::ExecutorRuntime {
            code: None,
            stderr: e,
        })?;

        let mut result = ExecutionResult {
            status: ExecutionStatus::Failure,
            table: None,
            exit_code: None,
            stdout: truncate_capture(&output.stdout),
            stderr: truncate_capture(&output.stderr),
            elapsed: output.elapsed,
            limit: self.timeout,
            script_identity: hash_string(script_text),
            output_path: None,
        };

        match output.outcome {
            ProcessOutcome::TimedOut => {
                result.status = ExecutionStatus::Timeout;
                return Ok(result);
            }
            ProcessOutcome::Exited { code } => {
                result.exit_code = code;
                if code != Some(0) {
                    return Ok(result);
                }
            }
        }

        if !sandbox_output.exists() {
            result.stderr = append_diagnostic(&result.stderr, "script exited 0 but wrote no output");
            return Ok(result);
        }
        let table = match read_table(&sandbox_output) {
            Ok(t) => t,
            Err(e) => {
                result.stderr = append_diagnostic(&result.stderr, &format!("output unreadable: {}", e));
                return Ok(result);
            }
        };

        if let Some(dest) = destination {
            publish(&sandbox_output, dest).map_err(RegridError::Store)?;
            result.output_path = Some(dest.to_path_buf());
        }
        result.status = ExecutionStatus::Success;
        result.table = Some(table);
        Ok(result)
    }
}

fn append_diagnostic(stderr: &str, message: &str) -> String {
    if stderr.trim().is_empty() {
        message.to_string()
    } else {
        format!("{}\n{}", stderr.trim_end(), message)
    }
}

/// Runtime binary: explicit setting, then `REGRID_BIN`, then this executable.
pub fn resolve_runtime_bin(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os("REGRID_BIN").map(PathBuf::from))
        .or_else(|| std::env::current_exe().ok())
        .unwrap_or_else(|| PathBuf::from("regrid"))
}

/// Copy the sandbox output to its destination: temp file, then rename.
fn publish(from: &Path, to: &Path) -> std::result::Result<(), String> {
    if let Some(parent) = to.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
        }
    }
    let file_name = to
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| format!("invalid output path {}", to.display()))?;
    let tmp = to.with_file_name(format!(".{}.tmp", file_name));
    std::fs::copy(from, &tmp).map_err(|e| format!("cannot copy output: {}", e))?;
    std::fs::rename(&tmp, to).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        format!("cannot move output to {}: {}", to.display(), e)
    })
}
