//! Re-run engine: apply a saved project script to new files.
//!
//! No regeneration and no collaborator: the stored `transform.sh` runs as-is
//! through the sandboxed executor, one sandbox per file, at most `jobs` at a
//! time.

use super::project::{rerun_output_path, ProjectStore, SCRIPT_FILE};
use crate::error::{RegridError, Result};
use crate::provenance::eventlog::{append_event, generate_run_id, ProvenanceEvent};
use crate::sandbox::{ExecutionStatus, Executor};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Output rows kept per file for display.
pub const PREVIEW_ROWS: usize = 10;

/// Result for one input file.
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub input: PathBuf,
    pub status: ExecutionStatus,
    pub elapsed: Duration,
    pub rows: usize,
    pub columns: Vec<String>,
    pub preview: Vec<Vec<String>>,
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl FileOutcome {
    fn failed(input: PathBuf, status: ExecutionStatus, elapsed: Duration, error: String) -> Self {
        Self {
            input,
            status,
            elapsed,
            rows: 0,
            columns: Vec::new(),
            preview: Vec::new(),
            output_path: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RerunSummary {
    pub project: String,
    pub run_id: String,
    pub files: Vec<FileOutcome>,
    pub elapsed: Duration,
}

impl RerunSummary {
    pub fn succeeded(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.status == ExecutionStatus::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.files.len() - self.succeeded()
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Expand file arguments. Glob patterns must match at least one file;
/// plain paths are kept as given. Duplicates are dropped, order is kept.
pub fn expand_inputs(patterns: &[String]) -> std::result::Result<Vec<PathBuf>, String> {
    let mut files: Vec<PathBuf> = Vec::new();
    for pattern in patterns {
        if !is_glob(pattern) {
            let path = PathBuf::from(pattern);
            if !files.contains(&path) {
                files.push(path);
            }
            continue;
        }
        let entries =
            glob::glob(pattern).map_err(|e| format!("invalid pattern '{}': {}", pattern, e))?;
        let mut matched = 0;
        for entry in entries {
            let path = entry.map_err(|e| format!("cannot read match of '{}': {}", pattern, e))?;
            if path.is_file() {
                matched += 1;
                if !files.contains(&path) {
                    files.push(path);
                }
            }
        }
        if matched == 0 {
            return Err(format!("pattern '{}' matched no files", pattern));
        }
    }
    if files.is_empty() {
        return Err("no input files given".to_string());
    }
    Ok(files)
}

fn log_event(project_dir: &Path, event: ProvenanceEvent) {
    if let Err(e) = append_event(project_dir, event) {
        tracing::warn!(dir = %project_dir.display(), error = %e, "cannot append event");
    }
}

async fn run_one(
    executor: &Executor,
    script: &str,
    input: PathBuf,
    output: PathBuf,
) -> FileOutcome {
    let start = Instant::now();
    match executor.execute_source(script, &input, Some(&output)).await {
        Ok(result) => match result.status {
            ExecutionStatus::Success => {
                let table = result.table.unwrap_or_default();
                FileOutcome {
                    input,
                    status: ExecutionStatus::Success,
                    elapsed: result.elapsed,
                    rows: table.len(),
                    columns: table.columns.clone(),
                    preview: table.preview(PREVIEW_ROWS),
                    output_path: result.output_path,
                    error: None,
                }
            }
            status => {
                let error = result
                    .to_error()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                FileOutcome::failed(input, status, result.elapsed, error)
            }
        },
        Err(e) => FileOutcome::failed(input, ExecutionStatus::Failure, start.elapsed(), e.to_string()),
    }
}

/// Run a project's saved script on every input. Outputs go to the project
/// directory unless `output_dir` is given.
pub async fn rerun(
    store: &ProjectStore,
    project: &str,
    inputs: &[PathBuf],
    executor: &Executor,
    jobs: usize,
    output_dir: Option<&Path>,
) -> Result<RerunSummary> {
    let project_dir = store.project_dir(project);
    if !project_dir.is_dir() {
        return Err(RegridError::Store(format!(
            "project '{}' not found under {}",
            project,
            store.root().display()
        )));
    }
    let start = Instant::now();
    let run_id = generate_run_id();
    log_event(
        &project_dir,
        ProvenanceEvent::RerunStarted {
            project: project.to_string(),
            run_id: run_id.clone(),
            files: inputs.len(),
        },
    );
    tracing::info!(project, run_id = %run_id, files = inputs.len(), jobs, "re-run started");

    let script_path = project_dir.join(SCRIPT_FILE);
    let files = match std::fs::read_to_string(&script_path) {
        Err(e) => {
            let error = format!("no {} in {}: {}", SCRIPT_FILE, project_dir.display(), e);
            inputs
                .iter()
                .map(|i| {
                    FileOutcome::failed(
                        i.clone(),
                        ExecutionStatus::Failure,
                        Duration::ZERO,
                        error.clone(),
                    )
                })
                .collect()
        }
        Ok(script) => {
            let dest_dir = output_dir.unwrap_or(project_dir.as_path());
            let stamp = chrono::Local::now().naive_local();
            let mut outputs: Vec<PathBuf> = Vec::with_capacity(inputs.len());
            for input in inputs {
                let path = rerun_output_path(dest_dir, input, &stamp, &outputs);
                outputs.push(path);
            }
            let script = script.as_str();
            let mut indexed: Vec<(usize, FileOutcome)> = stream::iter(
                inputs.iter().cloned().zip(outputs).enumerate(),
            )
            .map(|(i, (input, output))| async move {
                (i, run_one(executor, script, input, output).await)
            })
            .buffer_unordered(jobs.max(1))
            .collect()
            .await;
            indexed.sort_by_key(|(i, _)| *i);
            indexed.into_iter().map(|(_, f)| f).collect()
        }
    };

    let summary = RerunSummary {
        project: project.to_string(),
        run_id,
        files,
        elapsed: start.elapsed(),
    };
    for f in &summary.files {
        let event = match (&f.output_path, &f.error) {
            (Some(output), None) => ProvenanceEvent::FileProcessed {
                project: project.to_string(),
                run_id: summary.run_id.clone(),
                input: f.input.display().to_string(),
                output: output.display().to_string(),
                rows: f.rows,
                duration_seconds: f.elapsed.as_secs_f64(),
            },
            _ => {
                tracing::warn!(input = %f.input.display(), status = f.status.as_str(), "re-run file failed");
                ProvenanceEvent::FileFailed {
                    project: project.to_string(),
                    run_id: summary.run_id.clone(),
                    input: f.input.display().to_string(),
                    status: f.status.as_str().to_string(),
                    error: f.error.clone().unwrap_or_default(),
                }
            }
        };
        log_event(&project_dir, event);
    }
    log_event(
        &project_dir,
        ProvenanceEvent::RerunCompleted {
            project: project.to_string(),
            run_id: summary.run_id.clone(),
            succeeded: summary.succeeded() as u32,
            failed: summary.failed() as u32,
            total_seconds: summary.elapsed.as_secs_f64(),
        },
    );
    tracing::info!(
        project,
        succeeded = summary.succeeded(),
        failed = summary.failed(),
        "re-run completed"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sheet_io::write_table;
    use crate::core::table::Table;
    use crate::provenance::eventlog::read_events;

    /// Project whose script copies a prebuilt workbook, failing for inputs
    /// whose name contains "bad".
    fn project_with_script(root: &Path) -> PathBuf {
        let dir = root.join("sales");
        std::fs::create_dir_all(&dir).unwrap();
        let fixture = root.join("fixture.xlsx");
        write_table(
            &fixture,
            &Table::from_strings(&["region", "units"], &[&["North", "12"], &["South", "7"]]),
        )
        .unwrap();
        std::fs::write(
            dir.join(SCRIPT_FILE),
            format!(
                "set -e\ncase \"$(basename \"$1\")\" in *bad*) echo 'step 2 (cast) failed' >&2; exit 1;; esac\ncp '{}' \"$2\"\n",
                fixture.display()
            ),
        )
        .unwrap();
        dir
    }

    fn inputs(root: &Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|n| {
                let p = root.join(n);
                std::fs::write(&p, "a,b\n1,2\n").unwrap();
                p
            })
            .collect()
    }

    fn executor() -> Executor {
        Executor::new(Duration::from_secs(20), Some(PathBuf::from("/bin/false")))
    }

    #[tokio::test]
    async fn test_rerun_all_files() {
        let root = tempfile::tempdir().unwrap();
        let dir = project_with_script(root.path());
        let files = inputs(root.path(), &["march.csv", "april.csv", "may.csv"]);
        let store = ProjectStore::new(root.path());
        let summary = rerun(&store, "sales", &files, &executor(), 2, None).await.unwrap();
        assert_eq!(summary.succeeded(), 3);
        assert_eq!(summary.files[0].input, files[0]);
        let out = summary.files[1].output_path.as_ref().unwrap();
        assert!(out.exists());
        assert!(out.starts_with(&dir));
        assert!(out.file_name().unwrap().to_string_lossy().starts_with("output_april_"));
        assert_eq!(summary.files[2].rows, 2);
        assert_eq!(summary.files[2].preview[0], vec!["North", "12"]);

        let events = read_events(&dir).unwrap();
        assert_eq!(events.len(), 5);
        assert!(matches!(events[4].event, ProvenanceEvent::RerunCompleted { succeeded: 3, failed: 0, .. }));
    }

    #[tokio::test]
    async fn test_rerun_mixed_results() {
        let root = tempfile::tempdir().unwrap();
        project_with_script(root.path());
        let files = inputs(root.path(), &["good.csv", "bad.csv"]);
        let out_dir = root.path().join("outputs");
        let store = ProjectStore::new(root.path());
        let summary = rerun(&store, "sales", &files, &executor(), 1, Some(&out_dir))
            .await
            .unwrap();
        assert_eq!(summary.succeeded(), 1);
        assert!(summary.files[0].output_path.as_ref().unwrap().starts_with(&out_dir));
        assert_eq!(summary.files[1].status, ExecutionStatus::Failure);
        assert!(summary.files[1].error.as_ref().unwrap().contains("step 2 (cast) failed"));
    }

    #[tokio::test]
    async fn test_missing_script_fails_every_file() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("empty")).unwrap();
        let files = inputs(root.path(), &["a.csv", "b.csv"]);
        let store = ProjectStore::new(root.path());
        let summary = rerun(&store, "empty", &files, &executor(), 2, None).await.unwrap();
        assert_eq!(summary.failed(), 2);
        assert_eq!(summary.files[0].error, summary.files[1].error);
        assert!(summary.files[0].error.as_ref().unwrap().contains(SCRIPT_FILE));
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let root = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(root.path());
        assert!(rerun(&store, "ghost", &[], &executor(), 1, None).await.is_err());
    }

    #[test]
    fn test_expand_inputs() {
        let root = tempfile::tempdir().unwrap();
        inputs(root.path(), &["jan.xlsx", "feb.xlsx", "notes.txt"]);
        let pattern = format!("{}/*.xlsx", root.path().display());
        let literal = root.path().join("notes.txt").display().to_string();
        let files = expand_inputs(&[pattern.clone(), literal, pattern]).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[0].ends_with("feb.xlsx"));
        assert!(files[2].ends_with("notes.txt"));

        let none = format!("{}/*.ods", root.path().display());
        assert!(expand_inputs(&[none]).unwrap_err().contains("matched no files"));
        assert!(expand_inputs(&[]).is_err());
    }
}
