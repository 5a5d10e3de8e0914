//! Append-only JSONL event log, one per project.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Provenance event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    ProjectCreated {
        project: String,
        script_hash: String,
        plan_hash: String,
        regrid_version: String,
    },
    RerunStarted {
        project: String,
        run_id: String,
        files: usize,
    },
    FileProcessed {
        project: String,
        run_id: String,
        input: String,
        output: String,
        rows: usize,
        duration_seconds: f64,
    },
    FileFailed {
        project: String,
        run_id: String,
        input: String,
        status: String,
        error: String,
    },
    RerunCompleted {
        project: String,
        run_id: String,
        succeeded: u32,
        failed: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

/// ISO 8601 UTC timestamp.
pub fn now_iso8601() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default() as u64;
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Event log path inside a project directory.
pub fn event_log_path(project_dir: &Path) -> PathBuf {
    project_dir.join("events.jsonl")
}

/// Append an event to the project's log.
pub fn append_event(project_dir: &Path, event: ProvenanceEvent) -> Result<(), String> {
    let path = event_log_path(project_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create project dir: {}", e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;

    writeln!(file, "{}", json).map_err(|e| format!("write error: {}", e))?;

    Ok(())
}

/// Read every event; a missing log is empty. Unparseable lines are skipped.
pub fn read_events(project_dir: &Path) -> Result<Vec<TimestampedEvent>, String> {
    let path = event_log_path(project_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read event log {}: {}", path.display(), e))?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str(l) {
            Ok(ev) => Some(ev),
            Err(e) => {
                tracing::warn!(log = %path.display(), error = %e, "skipping malformed event");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_iso8601() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
        assert_eq!(ts.len(), 20);
    }

    #[test]
    fn test_generate_run_id() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        append_event(
            dir.path(),
            ProvenanceEvent::RerunStarted {
                project: "prices".into(),
                run_id: "r-abc".into(),
                files: 2,
            },
        )
        .unwrap();
        append_event(
            dir.path(),
            ProvenanceEvent::FileFailed {
                project: "prices".into(),
                run_id: "r-abc".into(),
                input: "march.xlsx".into(),
                status: "timeout".into(),
                error: "script exceeded the 1m execution timeout".into(),
            },
        )
        .unwrap();

        let content = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert!(content.contains("\"event\":\"rerun_started\""));
        let events = read_events(dir.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1].event, ProvenanceEvent::FileFailed { .. }));
    }

    #[test]
    fn test_read_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_events(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_read_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("events.jsonl"), "not json\n\n").unwrap();
        assert!(read_events(dir.path()).unwrap().is_empty());
    }
}
