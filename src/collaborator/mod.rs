//! Plan-authoring collaborator contract.
//!
//! The collaborator writes plans and the code for `custom` steps. Its answers
//! are untrusted text: plans are extracted, parsed and schema-validated here,
//! and anything non-conforming is rejected whole.

use crate::core::parser::{compile_plan, parse_plan, plan_schema, ACTION_PARAMS};
use crate::core::profile::FileProfile;
use crate::core::types::CompiledPlan;
use crate::sandbox::process::{run_process, ProcessOutcome, ProcessSpec};
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("collaborator response rejected: {0}")]
    Malformed(String),
}

/// Request for a new or revised plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest {
    pub profiles: Vec<FileProfile>,
    pub instructions: String,
    /// Operator feedback, oldest first.
    pub feedback: Vec<String>,
    /// YAML of the plan being revised.
    pub current_plan: Option<String>,
    /// Profile of an example of the desired output.
    pub example: Option<FileProfile>,
    pub plan_schema: String,
    pub actions: Vec<ActionDoc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionDoc {
    pub action: String,
    pub params: String,
}

impl PlanRequest {
    pub fn new(profiles: Vec<FileProfile>, instructions: impl Into<String>) -> Self {
        Self {
            profiles,
            instructions: instructions.into(),
            feedback: Vec::new(),
            current_plan: None,
            example: None,
            plan_schema: plan_schema(),
            actions: ACTION_PARAMS
                .iter()
                .map(|(action, params)| ActionDoc {
                    action: action.to_string(),
                    params: params.to_string(),
                })
                .collect(),
        }
    }
}

/// Request for the code of one `custom` step.
#[derive(Debug, Clone, Serialize)]
pub struct CodeRequest {
    pub step: u32,
    pub logic: String,
    pub plan_description: String,
    /// Columns of the table the step receives, when known.
    pub input_columns: Vec<String>,
    pub sample_rows: Vec<Vec<String>>,
    /// Failures of earlier attempts, oldest first.
    pub feedback: Vec<String>,
    /// How the code is run: CSV on stdin, CSV on stdout.
    pub contract: String,
}

pub const CODE_CONTRACT: &str = "bash command: reads the table as CSV with a header row on stdin, \
writes the transformed table as CSV with a header row to stdout, exits non-zero on error";

#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Return the text of a plan (YAML or JSON, optionally fenced).
    async fn author_plan(&self, request: &PlanRequest) -> Result<String, CollaboratorError>;

    /// Return a bash command implementing one custom step.
    async fn author_step_code(&self, request: &CodeRequest) -> Result<String, CollaboratorError>;
}

/// First fenced block whose language is one of `langs` (or unlabeled),
/// otherwise the whole trimmed text.
fn extract_block(response: &str, langs: &[&str]) -> String {
    let Ok(fence) = Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_-]*)[ \t]*\r?\n(.*?)```") else {
        return response.trim().to_string();
    };
    for caps in fence.captures_iter(response) {
        let lang = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        if lang.is_empty() || langs.iter().any(|l| l.eq_ignore_ascii_case(lang)) {
            return caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
        }
    }
    response.trim().to_string()
}

/// Extract, parse and validate a plan from a collaborator response.
pub fn extract_plan(
    response: &str,
    profile: Option<&FileProfile>,
) -> Result<CompiledPlan, CollaboratorError> {
    let body = extract_block(response, &["yaml", "yml", "json"]);
    if body.is_empty() {
        return Err(CollaboratorError::Malformed("empty response".to_string()));
    }
    let plan = parse_plan(&body).map_err(CollaboratorError::Malformed)?;
    compile_plan(&plan, profile).map_err(|issues| {
        CollaboratorError::Malformed(format!(
            "plan fails schema validation: {}",
            issues
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        ))
    })
}

/// Extract the command text from a code response.
pub fn extract_code(response: &str) -> Result<String, CollaboratorError> {
    let code = extract_block(response, &["bash", "sh", "shell"]);
    if code.is_empty() {
        return Err(CollaboratorError::Malformed("no code in response".to_string()));
    }
    Ok(code)
}

// ============================================================================
// External command collaborator
// ============================================================================

#[derive(Serialize)]
struct WireRequest<'a, T: Serialize> {
    kind: &'static str,
    request: &'a T,
}

/// Collaborator backed by an external command: the JSON request goes to its
/// stdin, the response is read from its stdout.
#[derive(Debug, Clone)]
pub struct CommandCollaborator {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Extra environment variables passed through to the command.
    pub pass_env: Vec<String>,
}

impl CommandCollaborator {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            pass_env: Vec::new(),
        }
    }

    async fn call<T: Serialize + Sync>(
        &self,
        kind: &'static str,
        request: &T,
    ) -> Result<String, CollaboratorError> {
        let payload = serde_json::to_vec(&WireRequest { kind, request })
            .map_err(|e| CollaboratorError::Unavailable(format!("cannot encode request: {}", e)))?;
        let spec = ProcessSpec {
            program: self.program.clone(),
            args: self.args.clone(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env: self
                .pass_env
                .iter()
                .filter_map(|k| std::env::var(k).ok().map(|v| (k.clone(), v)))
                .collect(),
            stdin: Some(payload),
            timeout: self.timeout,
        };
        tracing::debug!(program = %self.program, kind, "calling collaborator");
        let output = run_process(&spec)
            .await
            .map_err(CollaboratorError::Unavailable)?;
        match output.outcome {
            ProcessOutcome::TimedOut => Err(CollaboratorError::Unavailable(format!(
                "{} did not answer within {:?}",
                self.program, self.timeout
            ))),
            ProcessOutcome::Exited { code: Some(0) } => Ok(output.stdout),
            ProcessOutcome::Exited { code } => Err(CollaboratorError::Unavailable(format!(
                "{} exited with {:?}: {}",
                self.program,
                code,
                output.stderr.trim()
            ))),
        }
    }
}

#[async_trait]
impl Collaborator for CommandCollaborator {
    async fn author_plan(&self, request: &PlanRequest) -> Result<String, CollaboratorError> {
        self.call("plan", request).await
    }

    async fn author_step_code(&self, request: &CodeRequest) -> Result<String, CollaboratorError> {
        self.call("step_code", request).await
    }
}
