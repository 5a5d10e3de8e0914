//! Project store: approved plans with their script, docs and output.
//!
//! Layout of `<root>/<name>/`:
//! - transform.sh, transform_plan.yaml, transform_doc.md, output.xlsx
//! - project.yaml (manifest), events.jsonl (provenance)
//! - output_<stem>_<timestamp>.xlsx per re-run
//!
//! A project is written into a staging directory under the root and renamed
//! into place, so a reader never sees a half-written project.

use super::compare::{Coverage, ValidationReport};
use super::parser::{parse_plan_file, plan_to_yaml};
use super::profile::FileProfile;
use super::script::Script;
use super::sheet_io::write_table;
use super::table::Table;
use super::types::{CompiledPlan, TransformPlan};
use crate::error::{RegridError, Result};
use crate::provenance::eventlog::{append_event, now_iso8601, ProvenanceEvent};
use crate::provenance::hasher::{hash_file, hash_string};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SCRIPT_FILE: &str = "transform.sh";
pub const PLAN_FILE: &str = "transform_plan.yaml";
pub const DOC_FILE: &str = "transform_doc.md";
pub const OUTPUT_FILE: &str = "output.xlsx";
pub const MANIFEST_FILE: &str = "project.yaml";

/// Contents of project.yaml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectManifest {
    pub schema: String,
    pub name: String,
    pub created_at: String,
    pub generator: String,
    pub source_file: String,
    pub sheet_name: String,
    pub script_hash: String,
    pub plan_hash: String,
    /// `full` or `partial`
    pub coverage: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unverified_steps: Vec<u32>,
    pub output_rows: usize,
    pub output_columns: Vec<String>,
}

/// Everything an approval persists.
#[derive(Debug, Clone, Copy)]
pub struct ApprovedBuild<'a> {
    pub name: &'a str,
    pub plan: &'a CompiledPlan,
    pub script: &'a Script,
    pub output: &'a Table,
    pub profile: &'a FileProfile,
    pub report: &'a ValidationReport,
}

/// A project read back from disk.
#[derive(Debug, Clone)]
pub struct Project {
    pub dir: PathBuf,
    pub manifest: ProjectManifest,
    pub plan: TransformPlan,
}

impl Project {
    pub fn script_path(&self) -> PathBuf {
        self.dir.join(SCRIPT_FILE)
    }
}

/// Project names become directory names.
pub fn validate_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() || name.len() > 64 {
        return Err("project name must be 1-64 characters".to_string());
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(format!("project name '{}' cannot start with '.' or '-'", name));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("project name '{}' contains invalid character '{}'", name, bad));
    }
    Ok(())
}

/// `transform_doc.md` for a plan.
pub fn render_doc(name: &str, plan: &CompiledPlan, report: &ValidationReport) -> String {
    let p = &plan.plan;
    let mut out = Vec::new();
    out.push(format!("# Transformation: {}\n", name));
    out.push(format!("## Source\n{}\n", or_dash(&p.source_description)));
    out.push(format!("## Target\n{}\n", or_dash(&p.target_description)));
    if !p.assumptions.is_empty() {
        out.push("## Assumptions\n".to_string());
        for a in &p.assumptions {
            out.push(format!("- {}", a));
        }
        out.push(String::new());
    }
    out.push("## Steps\n".to_string());
    for step in &p.steps {
        out.push(format!("### Step {}: {}", step.step, step.action));
        if !step.description.is_empty() {
            out.push(step.description.clone());
        }
        if !step.params.is_empty() {
            let params = serde_yaml_ng::to_string(&step.params).unwrap_or_default();
            out.push(format!("\n```yaml\n{}```", params));
        }
        out.push(String::new());
    }
    out.push(format!("## Validation\n{}\n", report));
    out.push(format!(
        "## Script\nSee `{}`. Run it as `bash {} <input> <output>`; it needs `regrid` on PATH or `REGRID_BIN`.",
        SCRIPT_FILE, SCRIPT_FILE
    ));
    out.join("\n")
}

fn or_dash(s: &str) -> &str {
    if s.trim().is_empty() {
        "-"
    } else {
        s
    }
}

fn store_err(context: &str, e: impl std::fmt::Display) -> RegridError {
    RegridError::Store(format!("{}: {}", context, e))
}

/// Projects under one root directory.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    root: PathBuf,
}

impl ProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Persist an approved build. Projects are read-only once created, so an
    /// existing name is refused.
    pub fn save(&self, build: &ApprovedBuild<'_>) -> Result<PathBuf> {
        validate_name(build.name).map_err(RegridError::Store)?;
        let target = self.project_dir(build.name);
        if target.exists() {
            return Err(RegridError::Store(format!(
                "project '{}' already exists at {}; approve under another name",
                build.name,
                target.display()
            )));
        }
        std::fs::create_dir_all(&self.root)
            .map_err(|e| store_err(&format!("cannot create {}", self.root.display()), e))?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)?;
        let dir = staging.path();

        std::fs::write(dir.join(SCRIPT_FILE), &build.script.text)?;
        let plan_yaml = plan_to_yaml(&build.plan.plan).map_err(RegridError::Store)?;
        std::fs::write(dir.join(PLAN_FILE), &plan_yaml)?;
        std::fs::write(
            dir.join(DOC_FILE),
            render_doc(build.name, build.plan, build.report),
        )?;
        write_table(&dir.join(OUTPUT_FILE), build.output).map_err(RegridError::Store)?;

        let (coverage, unverified_steps) = match &build.report.coverage {
            Coverage::Full => ("full", Vec::new()),
            Coverage::Partial { unverified_steps } => ("partial", unverified_steps.clone()),
        };
        let manifest = ProjectManifest {
            schema: "1.0".to_string(),
            name: build.name.to_string(),
            created_at: now_iso8601(),
            generator: format!("regrid {}", env!("CARGO_PKG_VERSION")),
            source_file: build.profile.file_path.clone(),
            sheet_name: build.profile.sheet_name.clone(),
            script_hash: hash_file(&dir.join(SCRIPT_FILE)).map_err(RegridError::Store)?,
            plan_hash: hash_string(&plan_yaml),
            coverage: coverage.to_string(),
            unverified_steps,
            output_rows: build.output.len(),
            output_columns: build.output.columns.clone(),
        };
        let manifest_yaml =
            serde_yaml_ng::to_string(&manifest).map_err(|e| store_err("manifest", e))?;
        std::fs::write(dir.join(MANIFEST_FILE), manifest_yaml)?;

        append_event(
            dir,
            ProvenanceEvent::ProjectCreated {
                project: build.name.to_string(),
                script_hash: manifest.script_hash.clone(),
                plan_hash: manifest.plan_hash.clone(),
                regrid_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        )
        .map_err(RegridError::Store)?;

        std::fs::rename(dir, &target)
            .map_err(|e| store_err(&format!("cannot create {}", target.display()), e))?;
        tracing::info!(project = build.name, dir = %target.display(), "project saved");
        Ok(target)
    }

    pub fn load(&self, name: &str) -> Result<Project> {
        validate_name(name).map_err(RegridError::Store)?;
        let dir = self.project_dir(name);
        if !dir.is_dir() {
            return Err(RegridError::Store(format!(
                "project '{}' not found under {}",
                name,
                self.root.display()
            )));
        }
        let manifest_path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&manifest_path)
            .map_err(|e| store_err(&format!("cannot read {}", manifest_path.display()), e))?;
        let manifest: ProjectManifest = serde_yaml_ng::from_str(&content)
            .map_err(|e| store_err(&format!("invalid manifest {}", manifest_path.display()), e))?;
        let plan = parse_plan_file(&dir.join(PLAN_FILE)).map_err(RegridError::Store)?;
        Ok(Project {
            dir,
            manifest,
            plan,
        })
    }

    /// Manifests of every project, sorted by name. Directories without a
    /// readable manifest are skipped.
    pub fn list(&self) -> Result<Vec<ProjectManifest>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut manifests = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            match self.load(&name) {
                Ok(project) => manifests.push(project.manifest),
                Err(e) => tracing::warn!(dir = %entry.path().display(), error = %e, "skipping"),
            }
        }
        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(manifests)
    }
}

/// `<dir>/output_<stem>_<YYYYmmdd_HHMMSS>.xlsx`, with `_2`, `_3`, … when
/// that path is taken or already `reserved` by a concurrent file.
pub fn rerun_output_path(
    dir: &Path,
    input: &Path,
    stamp: &chrono::NaiveDateTime,
    reserved: &[PathBuf],
) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "input".to_string());
    let base = format!("output_{}_{}", stem, stamp.format("%Y%m%d_%H%M%S"));
    let taken = |p: &PathBuf| p.exists() || reserved.contains(p);
    let mut candidate = dir.join(format!("{}.xlsx", base));
    let mut n = 2;
    while taken(&candidate) {
        candidate = dir.join(format!("{}_{}.xlsx", base, n));
        n += 1;
    }
    candidate
}
