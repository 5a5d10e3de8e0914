//! Plan model types.
//!
//! A [`TransformPlan`] is what humans and the collaborator edit: YAML with a
//! free-form `params` mapping per step. Schema validation turns it into a
//! [`CompiledPlan`] of typed [`StepKind`]s, which is the only form the
//! interpreter and the synthesizer accept.

use super::predicate::{Pattern, RowPredicate, ValueExpr};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// transform_plan.yaml
// ============================================================================

/// Declarative description of how to normalize one kind of spreadsheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TransformPlan {
    /// What the raw input looks like
    #[serde(default)]
    pub source_description: String,

    /// What the normalized output should look like
    #[serde(default)]
    pub target_description: String,

    /// Assumptions the plan relies on
    #[serde(default)]
    pub assumptions: Vec<String>,

    /// Ordered steps, numbered from 1
    pub steps: Vec<PlanStep>,
}

/// One step as written in the plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanStep {
    /// 1-based position in the plan
    pub step: u32,

    /// One of the closed action names (see [`ACTIONS`])
    pub action: String,

    /// Human-readable intent
    #[serde(default)]
    pub description: String,

    /// Action parameters; keys are fixed by the action
    #[serde(default)]
    pub params: IndexMap<String, serde_json::Value>,
}

/// Every action a plan may use.
pub const ACTIONS: &[&str] = &[
    "skip_rows",
    "set_header_row",
    "detect_group_headers",
    "forward_fill_group",
    "drop_non_data_rows",
    "rename_columns",
    "split_column",
    "unpivot",
    "cast_types",
    "filter",
    "add_column",
    "custom",
];

// ============================================================================
// Typed steps
// ============================================================================

/// Target type of `cast_types`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CastType {
    String,
    Int,
    Float,
    Bool,
    Date,
}

impl CastType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "str" | "text" => Some(Self::String),
            "int" | "integer" | "int64" => Some(Self::Int),
            "float" | "number" | "double" | "float64" => Some(Self::Float),
            "bool" | "boolean" => Some(Self::Bool),
            "date" | "datetime" => Some(Self::Date),
            _ => None,
        }
    }
}

impl fmt::Display for CastType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Date => "date",
        };
        write!(f, "{}", s)
    }
}

/// What to do when a cell cannot be converted or split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Fail,
    Null,
}

impl OnError {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fail" | "error" | "raise" => Some(Self::Fail),
            "null" | "coerce" => Some(Self::Null),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSpec {
    pub source: String,
    pub delimiter: String,
    pub into: Vec<String>,
    #[serde(default)]
    pub missing: OnError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnpivotSpec {
    pub id_vars: Vec<String>,
    pub var_name: String,
    pub value_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_vars: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Pattern>,
}

/// A validated step with typed parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    SkipRows {
        count: usize,
    },
    SetHeaderRow {
        row_index: usize,
    },
    DetectGroupHeaders {
        rule: RowPredicate,
        field: String,
        strip_prefix: Option<String>,
    },
    ForwardFillGroup {
        field: String,
        /// Set when an earlier `detect_group_headers` step wrote `field`;
        /// the tagged header rows are then removed.
        drop_headers: bool,
    },
    DropNonDataRows {
        rules: Vec<RowPredicate>,
    },
    RenameColumns {
        mapping: IndexMap<String, String>,
    },
    SplitColumn(SplitSpec),
    Unpivot(UnpivotSpec),
    CastTypes {
        columns: IndexMap<String, CastType>,
        on_error: OnError,
    },
    Filter {
        condition: RowPredicate,
    },
    AddColumn {
        name: String,
        value: ValueExpr,
    },
    /// Natural-language logic; only executable through synthesized code.
    Custom {
        logic: String,
    },
}

impl StepKind {
    pub fn action(&self) -> &'static str {
        match self {
            Self::SkipRows { .. } => "skip_rows",
            Self::SetHeaderRow { .. } => "set_header_row",
            Self::DetectGroupHeaders { .. } => "detect_group_headers",
            Self::ForwardFillGroup { .. } => "forward_fill_group",
            Self::DropNonDataRows { .. } => "drop_non_data_rows",
            Self::RenameColumns { .. } => "rename_columns",
            Self::SplitColumn(_) => "split_column",
            Self::Unpivot(_) => "unpivot",
            Self::CastTypes { .. } => "cast_types",
            Self::Filter { .. } => "filter",
            Self::AddColumn { .. } => "add_column",
            Self::Custom { .. } => "custom",
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Self::Custom { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStep {
    pub step: u32,
    pub description: String,
    pub kind: StepKind,
}

/// A plan that passed schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPlan {
    pub plan: TransformPlan,
    pub steps: Vec<CompiledStep>,
}

impl CompiledPlan {
    /// Step numbers of `custom` steps.
    pub fn custom_steps(&self) -> Vec<u32> {
        self.steps
            .iter()
            .filter(|s| s.kind.is_custom())
            .map(|s| s.step)
            .collect()
    }

    pub fn is_declarative(&self) -> bool {
        self.steps.iter().all(|s| !s.kind.is_custom())
    }
}

impl fmt::Display for CompiledPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in &self.steps {
            writeln!(f, "  {:>2}. {:<22} {}", s.step, s.kind.action(), s.description)?;
        }
        Ok(())
    }
}
