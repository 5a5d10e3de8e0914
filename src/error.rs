//! Error kinds surfaced by the pipeline.
//!
//! Kernels and I/O helpers return `Result<_, String>` and are wrapped into a
//! [`RegridError`] at the component boundary, where the step number or the
//! run context is known.

use crate::collaborator::CollaboratorError;
use crate::core::compare::ValidationReport;
use crate::core::parser::ValidationError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegridError {
    /// Input file unreadable or not a recognized spreadsheet.
    #[error("profile error: {0}")]
    Profile(String),

    /// Plan fails schema validation; every offending step is listed.
    #[error("plan schema error:\n{}", format_issues(.0))]
    PlanSchema(Vec<ValidationError>),

    #[error("step {step} ({action}) failed: {cause}")]
    StepExecution {
        step: u32,
        action: String,
        cause: String,
    },

    /// Script output diverged from the interpreter's reference.
    #[error("generated script output does not match the plan: {}", .0.summary())]
    CodegenMismatch(Box<ValidationReport>),

    #[error("script exceeded the {} execution timeout", humantime_serde::re::humantime::format_duration(*.0))]
    ExecutorTimeout(Duration),

    #[error("script exited with {}: {stderr}", format_code(.code))]
    ExecutorRuntime { code: Option<i32>, stderr: String },

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("project store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not allowed in the current workflow phase.
    #[error("invalid transition: {0}")]
    Phase(String),
}

pub type Result<T> = std::result::Result<T, RegridError>;

fn format_issues(issues: &[ValidationError]) -> String {
    issues
        .iter()
        .map(|i| format!("  - {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {}", c),
        None => "no exit code (killed by signal)".to_string(),
    }
}

impl RegridError {
    /// Failures the retry loop feeds back to the synthesizer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CodegenMismatch(_) | Self::ExecutorTimeout(_) | Self::ExecutorRuntime { .. }
        )
    }
}
