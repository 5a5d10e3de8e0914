//! Transform script format and its runtime.
//!
//! A synthesized script is a bash file that hands a heredoc of JSONL column
//! operations to `regrid run-script <input> <output>`. The runtime applies the
//! operations with the same kernels the interpreter uses and writes the
//! output atomically.

use super::predicate::{RowPredicate, ValueExpr};
use super::sheet_io::{csv_to_table, read_sheet, table_to_csv, write_table};
use super::table::Table;
use super::types::{CastType, OnError, SplitSpec, UnpivotSpec};
use crate::provenance::hasher::hash_string;
use crate::steps::{columns, groups, reshape, rows};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

/// Heredoc delimiter between the bash preamble and the operations.
pub const OPS_MARKER: &str = "REGRID_OPS";

/// One primitive operation of a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ColumnOp {
    DropHead {
        count: usize,
    },
    PromoteHeader {
        row_index: usize,
    },
    TagGroups {
        rule: RowPredicate,
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strip_prefix: Option<String>,
    },
    FillGroups {
        field: String,
        #[serde(default = "default_drop_headers")]
        drop_headers: bool,
    },
    /// Keep rows where `predicate == keep`.
    Retain {
        predicate: RowPredicate,
        keep: bool,
    },
    Rename {
        mapping: IndexMap<String, String>,
    },
    SplitFirst(SplitSpec),
    Melt(UnpivotSpec),
    Cast {
        column: String,
        to: CastType,
        #[serde(default)]
        on_error: OnError,
    },
    Derive {
        name: String,
        value: ValueExpr,
    },
    /// Table piped as CSV through `bash -c command`, CSV read back from stdout.
    Shell {
        command: String,
    },
}

impl ColumnOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DropHead { .. } => "drop_head",
            Self::PromoteHeader { .. } => "promote_header",
            Self::TagGroups { .. } => "tag_groups",
            Self::FillGroups { .. } => "fill_groups",
            Self::Retain { .. } => "retain",
            Self::Rename { .. } => "rename",
            Self::SplitFirst(_) => "split_first",
            Self::Melt(_) => "melt",
            Self::Cast { .. } => "cast",
            Self::Derive { .. } => "derive",
            Self::Shell { .. } => "shell",
        }
    }
}

// Scripts written before `drop_headers` existed always removed header rows.
fn default_drop_headers() -> bool {
    true
}

/// An operation tagged with the plan step it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptLine {
    pub step: u32,
    #[serde(flatten)]
    pub op: ColumnOp,
}

/// A synthesized script: text plus the operations it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub text: String,
    pub lines: Vec<ScriptLine>,
    /// BLAKE3 of `text`
    pub identity: String,
}

impl Script {
    /// Render the bash file for a list of operations.
    pub fn render(plan_description: &str, lines: Vec<ScriptLine>) -> Result<Self, String> {
        let description: String = plan_description
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let mut text = String::new();
        text.push_str("#!/usr/bin/env bash\n");
        text.push_str("# regrid transform script\n");
        text.push_str(&format!(
            "# plan: {}   requires: regrid {}\n",
            if description.is_empty() { "-" } else { &description },
            env!("CARGO_PKG_VERSION")
        ));
        text.push_str("# usage: transform.sh <input> <output>\n");
        text.push_str("set -euo pipefail\n");
        text.push_str(&format!(
            "exec \"${{REGRID_BIN:-regrid}}\" run-script \"$1\" \"$2\" <<'{}'\n",
            OPS_MARKER
        ));
        for line in &lines {
            let json =
                serde_json::to_string(line).map_err(|e| format!("JSON serialize error: {}", e))?;
            text.push_str(&json);
            text.push('\n');
        }
        text.push_str(OPS_MARKER);
        text.push('\n');
        let identity = hash_string(&text);
        Ok(Self {
            text,
            lines,
            identity,
        })
    }

    /// Recover the operations from a script file's text.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut in_ops = false;
        let mut body = String::new();
        let mut closed = false;
        for line in text.lines() {
            if !in_ops {
                if line.contains(&format!("<<'{}'", OPS_MARKER)) {
                    in_ops = true;
                }
                continue;
            }
            if line == OPS_MARKER {
                closed = true;
                break;
            }
            body.push_str(line);
            body.push('\n');
        }
        if !in_ops || !closed {
            return Err("not a regrid transform script (operations block not found)".to_string());
        }
        Ok(Self {
            text: text.to_string(),
            lines: parse_ops(&body)?,
            identity: hash_string(text),
        })
    }

    /// Plan steps implemented by shell code.
    pub fn shell_steps(&self) -> Vec<u32> {
        let mut steps: Vec<u32> = self
            .lines
            .iter()
            .filter(|l| matches!(l.op, ColumnOp::Shell { .. }))
            .map(|l| l.step)
            .collect();
        steps.dedup();
        steps
    }
}

/// Parse JSONL operations (the runtime's stdin).
pub fn parse_ops(body: &str) -> Result<Vec<ScriptLine>, String> {
    body.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str(l).map_err(|e| format!("invalid operation on line {}: {}", i + 1, e))
        })
        .collect()
}

/// Apply one operation.
pub fn apply_op(op: &ColumnOp, table: Table) -> Result<Table, String> {
    match op {
        ColumnOp::DropHead { count } => rows::drop_head(table, *count),
        ColumnOp::PromoteHeader { row_index } => rows::promote_header(table, *row_index),
        ColumnOp::TagGroups {
            rule,
            field,
            strip_prefix,
        } => groups::tag_groups(table, rule, field, strip_prefix.as_deref()),
        ColumnOp::FillGroups {
            field,
            drop_headers,
        } => groups::fill_groups(table, field, *drop_headers),
        ColumnOp::Retain { predicate, keep } => rows::retain(table, predicate, *keep),
        ColumnOp::Rename { mapping } => columns::rename(table, mapping),
        ColumnOp::SplitFirst(spec) => columns::split_first(table, spec),
        ColumnOp::Melt(spec) => reshape::melt(table, spec),
        ColumnOp::Cast {
            column,
            to,
            on_error,
        } => columns::cast(table, column, *to, *on_error),
        ColumnOp::Derive { name, value } => columns::derive(table, name, value),
        ColumnOp::Shell { command } => run_shell(command, &table),
    }
}

/// Apply operations in order to an in-memory table.
pub fn apply_ops(lines: &[ScriptLine], table: Table) -> Result<Table, String> {
    let mut table = table;
    for line in lines {
        table = apply_op(&line.op, table)
            .map_err(|e| format!("step {} ({}) failed: {}", line.step, line.op.name(), e))?;
    }
    Ok(table)
}

/// The `run-script` runtime: read input, apply, write output atomically.
pub fn run_script(lines: &[ScriptLine], input: &Path, output: &Path) -> Result<Table, String> {
    let raw = read_sheet(input, None)?.table;
    let table = apply_ops(lines, raw)?;
    write_table(output, &table)?;
    Ok(table)
}

/// Pipe the table through a bash command as CSV.
fn run_shell(command: &str, table: &Table) -> Result<Table, String> {
    let input = table_to_csv(table)?;
    let mut child = Command::new("bash")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn bash: {}", e))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| "custom code stdin unavailable".to_string())?;
    // stdout must be drained while stdin is written or large tables deadlock.
    let writer = std::thread::spawn(move || stdin.write_all(&input));

    let output = child
        .wait_with_output()
        .map_err(|e| format!("wait error: {}", e))?;
    // A command may stop reading early; a broken pipe is not an error.
    let stdin_error = match writer.join() {
        Ok(Ok(())) => None,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => None,
        Ok(Err(e)) => Some(format!("writing the table to custom code failed: {}", e)),
        Err(_) => Some("custom code stdin writer panicked".to_string()),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut message = format!(
            "custom code exited with {}: {}",
            output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stderr.trim()
        );
        if let Some(e) = stdin_error {
            message.push_str(&format!(" ({})", e));
        }
        return Err(message);
    }
    if let Some(e) = stdin_error {
        return Err(e);
    }
    csv_to_table(&output.stdout).map_err(|e| format!("custom code produced invalid CSV: {}", e))
}
