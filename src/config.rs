//! Settings loaded from `regrid.toml`.
//!
//! Every field has a default; a missing file means all defaults. CLI flags
//! override individual values after loading.

use crate::core::profile::ProfileLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory.
pub const SETTINGS_FILE: &str = "regrid.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegridSettings {
    /// Wall-clock limit for one script run
    #[serde(with = "humantime_serde", default = "default_execution_timeout")]
    pub execution_timeout: Duration,

    /// Synthesis attempts before the workflow halts
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    #[serde(default = "default_max_sample_rows")]
    pub max_sample_rows: usize,

    #[serde(default = "default_max_profile_columns")]
    pub max_profile_columns: usize,

    /// Rows compared against the reference (plus the last row)
    #[serde(default = "default_compare_sample_rows")]
    pub compare_sample_rows: usize,

    /// Files processed concurrently during a re-run
    #[serde(default = "default_rerun_jobs")]
    pub rerun_jobs: usize,

    #[serde(default = "default_projects_root")]
    pub projects_root: PathBuf,

    /// Binary invoked by generated scripts; defaults to this executable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_bin: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collaborator: Option<CollaboratorSettings>,
}

/// External command used as the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollaboratorSettings {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(with = "humantime_serde", default = "default_collaborator_timeout")]
    pub timeout: Duration,
    /// Environment variables passed through (API keys and the like)
    #[serde(default)]
    pub pass_env: Vec<String>,
}

fn default_execution_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_budget() -> u32 {
    3
}

fn default_max_sample_rows() -> usize {
    15
}

fn default_max_profile_columns() -> usize {
    50
}

fn default_compare_sample_rows() -> usize {
    20
}

fn default_rerun_jobs() -> usize {
    2
}

fn default_projects_root() -> PathBuf {
    PathBuf::from("projects")
}

fn default_collaborator_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for RegridSettings {
    fn default() -> Self {
        Self {
            execution_timeout: default_execution_timeout(),
            retry_budget: default_retry_budget(),
            max_sample_rows: default_max_sample_rows(),
            max_profile_columns: default_max_profile_columns(),
            compare_sample_rows: default_compare_sample_rows(),
            rerun_jobs: default_rerun_jobs(),
            projects_root: default_projects_root(),
            runtime_bin: None,
            collaborator: None,
        }
    }
}

impl RegridSettings {
    /// Parse settings from TOML text.
    pub fn parse(text: &str) -> Result<Self, String> {
        let settings: Self =
            toml::from_str(text).map_err(|e| format!("invalid settings: {}", e))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        Self::parse(&text).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.execution_timeout.is_zero() {
            return Err("execution_timeout must be positive".to_string());
        }
        if self.retry_budget == 0 {
            return Err("retry_budget must be at least 1".to_string());
        }
        if self.rerun_jobs == 0 {
            return Err("rerun_jobs must be at least 1".to_string());
        }
        if self.max_sample_rows == 0 || self.max_profile_columns == 0 {
            return Err("profile limits must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn profile_limits(&self) -> ProfileLimits {
        ProfileLimits {
            max_sample_rows: self.max_sample_rows,
            max_profile_columns: self.max_profile_columns,
        }
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("cannot serialize settings: {}", e))
    }
}
