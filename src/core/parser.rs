//! Plan parsing and schema validation.
//!
//! Parses transform_plan.yaml and compiles it into typed steps. Validation
//! collects every issue instead of stopping at the first:
//! - Step numbers must be 1-based and contiguous
//! - Actions must belong to the closed set
//! - Params must be present, well-typed, and known to the action
//! - With a profile: referenced columns must exist at that point in the plan

use super::predicate::{Arith, Pattern, RowPredicate, ValueExpr};
use super::profile::FileProfile;
use super::table::Cell;
use super::types::*;
use crate::steps::rows::header_names;
use indexmap::IndexMap;
use serde_json::Value;
use std::path::Path;

/// One schema issue, tied to a step when it has one.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub step: Option<u32>,
    pub action: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(step: Option<u32>, action: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            step,
            action: action.map(str::to_string),
            message: message.into(),
        }
    }

    fn plan(message: impl Into<String>) -> Self {
        Self::new(None, None, message)
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.step, &self.action) {
            (Some(n), Some(a)) => write!(f, "step {} ({}): {}", n, a, self.message),
            (Some(n), None) => write!(f, "step {}: {}", n, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

/// Parse a plan file from disk.
pub fn parse_plan_file(path: &Path) -> Result<TransformPlan, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_plan(&content)
}

/// Parse a plan from YAML (JSON is valid YAML).
pub fn parse_plan(yaml: &str) -> Result<TransformPlan, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Serialize a plan for transform_plan.yaml.
pub fn plan_to_yaml(plan: &TransformPlan) -> Result<String, String> {
    serde_yaml_ng::to_string(plan).map_err(|e| format!("YAML serialize error: {}", e))
}

/// JSON schema of the plan document.
pub fn plan_schema() -> String {
    let schema = schemars::schema_for!(TransformPlan);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// Parameter contract per action, for humans and the collaborator.
pub const ACTION_PARAMS: &[(&str, &str)] = &[
    ("skip_rows", "count (int): drop the first `count` rows"),
    ("set_header_row", "row_index (int): promote that row to column names"),
    (
        "detect_group_headers",
        "detection_rule (row rule), extract_field (str), strip_prefix (str, optional)",
    ),
    ("forward_fill_group", "field (str): fill group key down, drop header rows"),
    ("drop_non_data_rows", "rules (list of row rules): drop rows matching any"),
    ("rename_columns", "mapping ({old: new})"),
    (
        "split_column",
        "source (str), delimiter (str), into (list of str), missing (fail|null, optional)",
    ),
    (
        "unpivot",
        "id_vars (list), var_name (str), value_name (str), value_vars (list, optional), value_vars_pattern (regex, optional)",
    ),
    ("cast_types", "columns ({column: string|int|float|bool|date}), on_error (fail|null, optional)"),
    ("filter", "condition (row rule, or {column, op, value})"),
    (
        "add_column",
        "name (str) plus one of: value, template (\"{col} text\"), expression (\"{a} * {b}\"), source + map (+ default)",
    ),
    ("custom", "logic (str): free-text description; implemented by generated code"),
];

/// Validate a plan without a profile.
pub fn validate_plan(plan: &TransformPlan) -> Vec<ValidationError> {
    match compile_plan(plan, None) {
        Ok(_) => Vec::new(),
        Err(errors) => errors,
    }
}

/// Validate and compile a plan. With a profile, column references are
/// checked against the columns each step would see.
pub fn compile_plan(
    plan: &TransformPlan,
    profile: Option<&FileProfile>,
) -> Result<CompiledPlan, Vec<ValidationError>> {
    let mut errors = Vec::new();
    if plan.steps.is_empty() {
        errors.push(ValidationError::plan("plan must contain at least one step"));
    }

    let mut tracker = profile.map(ColumnTracker::new);
    let mut compiled = Vec::with_capacity(plan.steps.len());
    let mut tagged: Vec<String> = Vec::new();

    for (i, step) in plan.steps.iter().enumerate() {
        let expected = i as u32 + 1;
        let action = step.action.as_str();
        if step.step != expected {
            errors.push(ValidationError::new(
                Some(step.step),
                Some(action),
                format!(
                    "step numbers must be contiguous from 1: expected {}, got {}",
                    expected, step.step
                ),
            ));
        }

        let mut issues = Vec::new();
        let mut kind = compile_step(step, &mut issues);
        match kind.as_mut() {
            Some(StepKind::DetectGroupHeaders { field, .. }) => tagged.push(field.clone()),
            Some(StepKind::ForwardFillGroup {
                field,
                drop_headers,
            }) => *drop_headers = tagged.contains(field),
            _ => {}
        }
        if let Some(t) = tracker.as_mut() {
            match &kind {
                Some(kind) => t.apply(kind, &mut issues),
                None => t.columns = None,
            }
        }
        for message in issues {
            errors.push(ValidationError::new(Some(step.step), Some(action), message));
        }
        if let Some(kind) = kind {
            compiled.push(CompiledStep {
                step: step.step,
                description: step.description.clone(),
                kind,
            });
        }
    }

    if errors.is_empty() {
        Ok(CompiledPlan {
            plan: plan.clone(),
            steps: compiled,
        })
    } else {
        Err(errors)
    }
}

// ============================================================================
// Param extraction
// ============================================================================

struct Params<'a> {
    map: &'a IndexMap<String, Value>,
    allowed: &'static [&'static str],
    issues: &'a mut Vec<String>,
}

impl<'a> Params<'a> {
    fn get(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter().find_map(|k| self.map.get(*k))
    }

    fn required(&mut self, keys: &[&str]) -> Option<&'a Value> {
        let v = self.get(keys);
        if v.is_none() {
            self.issues
                .push(format!("missing required param '{}'", keys[0]));
        }
        v
    }

    fn string(&mut self, keys: &[&str]) -> Option<String> {
        let v = self.required(keys)?;
        self.as_string(keys[0], v)
    }

    fn opt_string(&mut self, keys: &[&str]) -> Option<String> {
        let v = self.get(keys)?;
        if v.is_null() {
            return None;
        }
        self.as_string(keys[0], v)
    }

    fn as_string(&mut self, key: &str, v: &Value) -> Option<String> {
        match v.as_str() {
            Some(s) if !s.is_empty() => Some(s.to_string()),
            _ => {
                self.issues
                    .push(format!("param '{}' must be a non-empty string", key));
                None
            }
        }
    }

    fn count(&mut self, keys: &[&str]) -> Option<usize> {
        let v = self.required(keys)?;
        match v.as_u64() {
            Some(n) => Some(n as usize),
            None => {
                self.issues.push(format!(
                    "param '{}' must be a non-negative integer, got {}",
                    keys[0], v
                ));
                None
            }
        }
    }

    fn string_list(&mut self, key: &str, v: &Value) -> Option<Vec<String>> {
        let items = match v {
            Value::Array(items) => items,
            Value::String(s) => return Some(vec![s.clone()]),
            _ => {
                self.issues
                    .push(format!("param '{}' must be a list of strings", key));
                return None;
            }
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item.as_str() {
                Some(s) => out.push(s.to_string()),
                None => {
                    self.issues
                        .push(format!("param '{}' must be a list of strings", key));
                    return None;
                }
            }
        }
        Some(out)
    }

    fn predicate(&mut self, key: &str, v: &Value) -> Option<RowPredicate> {
        RowPredicate::parse(v)
            .map_err(|e| self.issues.push(format!("param '{}': {}", key, e)))
            .ok()
    }

    fn on_error(&mut self, keys: &[&str]) -> OnError {
        match self.opt_string(keys) {
            None => OnError::Fail,
            Some(s) => OnError::parse(&s).unwrap_or_else(|| {
                self.issues
                    .push(format!("param '{}' must be 'fail' or 'null', got '{}'", keys[0], s));
                OnError::Fail
            }),
        }
    }

    fn check_unknown(&mut self) {
        for key in self.map.keys() {
            if !self.allowed.contains(&key.as_str()) {
                self.issues.push(format!(
                    "unknown param '{}' (expected: {})",
                    key,
                    self.allowed.join(", ")
                ));
            }
        }
    }
}

fn allowed_params(action: &str) -> &'static [&'static str] {
    match action {
        "skip_rows" => &["count", "n"],
        "set_header_row" => &["row_index", "row"],
        "detect_group_headers" => &["detection_rule", "extract_field", "strip_prefix"],
        "forward_fill_group" => &["field"],
        "drop_non_data_rows" => &["rules"],
        "rename_columns" => &["mapping"],
        "split_column" => &["source", "column", "delimiter", "into", "missing"],
        "unpivot" => &[
            "id_vars",
            "var_name",
            "value_name",
            "value_vars",
            "value_vars_pattern",
        ],
        "filter" => &["condition"],
        "add_column" => &["name", "value", "template", "expression", "source", "map", "default"],
        "custom" => &["logic"],
        _ => &[],
    }
}

fn compile_step(step: &PlanStep, issues: &mut Vec<String>) -> Option<StepKind> {
    let action = step.action.as_str();
    if !ACTIONS.contains(&action) {
        issues.push(format!(
            "unknown action '{}' (expected one of: {})",
            action,
            ACTIONS.join(", ")
        ));
        return None;
    }
    let before = issues.len();
    let mut p = Params {
        map: &step.params,
        allowed: allowed_params(action),
        issues: &mut *issues,
    };
    if action != "cast_types" {
        p.check_unknown();
    }

    let kind = match action {
        "skip_rows" => p.count(&["count", "n"]).map(|count| StepKind::SkipRows { count }),
        "set_header_row" => p
            .count(&["row_index", "row"])
            .map(|row_index| StepKind::SetHeaderRow { row_index }),
        "detect_group_headers" => {
            let rule = p
                .required(&["detection_rule"])
                .and_then(|v| p.predicate("detection_rule", v));
            let field = p.string(&["extract_field"]);
            let strip_prefix = p.opt_string(&["strip_prefix"]);
            match (rule, field) {
                (Some(rule), Some(field)) => Some(StepKind::DetectGroupHeaders {
                    rule,
                    field,
                    strip_prefix,
                }),
                _ => None,
            }
        }
        "forward_fill_group" => p
            .string(&["field"])
            .map(|field| StepKind::ForwardFillGroup {
                field,
                drop_headers: false,
            }),
        "drop_non_data_rows" => compile_rules(&mut p),
        "rename_columns" => compile_rename(&mut p),
        "split_column" => compile_split(&mut p),
        "unpivot" => compile_unpivot(&mut p),
        "cast_types" => compile_cast(&mut p),
        "filter" => p.required(&["condition"]).and_then(|v| {
            RowPredicate::parse_condition(v)
                .map(|condition| StepKind::Filter { condition })
                .map_err(|e| p.issues.push(format!("param 'condition': {}", e)))
                .ok()
        }),
        "add_column" => compile_add_column(&mut p),
        "custom" => p.string(&["logic"]).map(|logic| StepKind::Custom { logic }),
        _ => None,
    };

    if issues.len() > before {
        None
    } else {
        kind
    }
}

fn compile_rules(p: &mut Params<'_>) -> Option<StepKind> {
    let v = p.required(&["rules"])?;
    let items: Vec<&Value> = match v {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };
    if items.is_empty() {
        p.issues.push("param 'rules' must not be empty".to_string());
        return None;
    }
    let rules: Vec<RowPredicate> = items
        .into_iter()
        .filter_map(|r| p.predicate("rules", r))
        .collect();
    Some(StepKind::DropNonDataRows { rules })
}

fn compile_rename(p: &mut Params<'_>) -> Option<StepKind> {
    let v = p.required(&["mapping"])?;
    let Some(obj) = v.as_object() else {
        p.issues
            .push("param 'mapping' must be a mapping of old → new names".to_string());
        return None;
    };
    let mut mapping = IndexMap::new();
    for (from, to) in obj {
        match to.as_str() {
            Some(t) if !t.is_empty() => {
                mapping.insert(from.clone(), t.to_string());
            }
            _ => p
                .issues
                .push(format!("mapping for '{}' must be a non-empty string", from)),
        }
    }
    Some(StepKind::RenameColumns { mapping })
}

fn compile_split(p: &mut Params<'_>) -> Option<StepKind> {
    let source = p.string(&["source", "column"]);
    let delimiter = match p.required(&["delimiter"]) {
        Some(Value::String(d)) if !d.is_empty() => Some(d.clone()),
        Some(_) => {
            p.issues
                .push("param 'delimiter' must be a non-empty string".to_string());
            None
        }
        None => None,
    };
    let into = p
        .required(&["into"])
        .and_then(|v| p.string_list("into", v));
    if let Some(into) = &into {
        if into.len() < 2 {
            p.issues
                .push("param 'into' must name at least two columns".to_string());
        }
    }
    let missing = p.on_error(&["missing"]);
    Some(StepKind::SplitColumn(SplitSpec {
        source: source?,
        delimiter: delimiter?,
        into: into?,
        missing,
    }))
}

fn compile_unpivot(p: &mut Params<'_>) -> Option<StepKind> {
    let id_vars = p
        .required(&["id_vars"])
        .and_then(|v| p.string_list("id_vars", v));
    let var_name = p.string(&["var_name"]);
    let value_name = p.string(&["value_name"]);
    let value_vars = match p.get(&["value_vars"]) {
        Some(Value::Null) | None => None,
        Some(v) => p.string_list("value_vars", v),
    };
    let pattern = p.opt_string(&["value_vars_pattern"]).and_then(|s| {
        Pattern::new(&s)
            .map_err(|e| p.issues.push(format!("param 'value_vars_pattern': {}", e)))
            .ok()
    });
    Some(StepKind::Unpivot(UnpivotSpec {
        id_vars: id_vars?,
        var_name: var_name?,
        value_name: value_name?,
        value_vars,
        pattern,
    }))
}

fn compile_cast(p: &mut Params<'_>) -> Option<StepKind> {
    let on_error = p.on_error(&["on_error"]);
    let entries: Vec<(String, Value)> = match p.get(&["columns"]) {
        Some(Value::Object(obj)) => obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Some(_) => {
            p.issues
                .push("param 'columns' must be a mapping of column → type".to_string());
            return None;
        }
        None => p
            .map
            .iter()
            .filter(|(k, _)| k.as_str() != "on_error")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    if entries.is_empty() {
        p.issues.push("no columns to cast".to_string());
        return None;
    }
    let mut columns = IndexMap::new();
    for (column, ty) in entries {
        match ty.as_str().and_then(CastType::parse) {
            Some(t) => {
                columns.insert(column, t);
            }
            None => p.issues.push(format!(
                "unknown type {} for column '{}' (expected string, int, float, bool, date)",
                ty, column
            )),
        }
    }
    Some(StepKind::CastTypes { columns, on_error })
}

fn compile_add_column(p: &mut Params<'_>) -> Option<StepKind> {
    let name = p.string(&["name"]);
    let forms = ["value", "template", "expression", "source"]
        .iter()
        .filter(|k| p.map.contains_key(**k))
        .count();
    if forms != 1 {
        p.issues.push(
            "exactly one of 'value', 'template', 'expression' or 'source' is required".to_string(),
        );
        return None;
    }
    let value = if let Some(v) = p.get(&["value"]) {
        ValueExpr::Constant { value: v.clone() }
    } else if p.map.contains_key("template") {
        ValueExpr::Template {
            template: p.string(&["template"])?,
        }
    } else if p.map.contains_key("expression") {
        let src = p.string(&["expression"])?;
        match Arith::parse(&src) {
            Ok(expression) => ValueExpr::Arithmetic { expression },
            Err(e) => {
                p.issues.push(format!("param 'expression': {}", e));
                return None;
            }
        }
    } else {
        let source = p.string(&["source"])?;
        let map = match p.get(&["map"]) {
            Some(Value::Object(obj)) => obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => {
                p.issues
                    .push("param 'map' must be a mapping when 'source' is given".to_string());
                return None;
            }
        };
        let default = p.get(&["default"]).cloned().unwrap_or(Value::Null);
        ValueExpr::Lookup {
            source,
            map,
            default,
        }
    };
    Some(StepKind::AddColumn { name: name?, value })
}

// ============================================================================
// Column tracking against a profile
// ============================================================================

/// Follows the column set through the plan. `None` means unknown from here on.
struct ColumnTracker<'a> {
    profile: &'a FileProfile,
    columns: Option<Vec<String>>,
    /// Rows removed from the top while only `skip_rows` has run.
    row_offset: Option<usize>,
}

impl<'a> ColumnTracker<'a> {
    fn new(profile: &'a FileProfile) -> Self {
        Self {
            profile,
            columns: Some(profile.column_names.clone()),
            row_offset: Some(0),
        }
    }

    fn apply(&mut self, kind: &StepKind, issues: &mut Vec<String>) {
        let offset = self.row_offset.take();
        if let StepKind::SkipRows { count } = kind {
            self.row_offset = offset.map(|o| o + count);
            return;
        }
        if let StepKind::SetHeaderRow { row_index } = kind {
            let header = match (offset, self.columns.as_deref()) {
                (Some(o), Some(current)) => self.profile.raw_rows.get(o + row_index).map(|raw| {
                    let cells: Vec<Cell> = raw.iter().map(|s| Cell::text(s)).collect();
                    header_names(&cells, current)
                }),
                _ => None,
            };
            self.columns = header;
            return;
        }
        let Some(columns) = self.columns.as_mut() else {
            return;
        };
        let require = |name: &str, columns: &[String], issues: &mut Vec<String>| {
            if !columns.iter().any(|c| c == name) {
                issues.push(format!(
                    "column '{}' not found (available: {})",
                    name,
                    columns.join(", ")
                ));
            }
        };

        match kind {
            StepKind::SkipRows { .. } | StepKind::SetHeaderRow { .. } => {}
            StepKind::DetectGroupHeaders { rule, field, .. } => {
                rule.columns().iter().for_each(|c| require(c, columns, issues));
                if columns.iter().any(|c| c == field) {
                    issues.push(format!("column '{}' already exists", field));
                } else {
                    columns.push(field.clone());
                }
            }
            StepKind::ForwardFillGroup { field, .. } => require(field, columns, issues),
            StepKind::DropNonDataRows { rules } => rules
                .iter()
                .flat_map(RowPredicate::columns)
                .for_each(|c| require(&c, columns, issues)),
            StepKind::Filter { condition } => condition
                .columns()
                .iter()
                .for_each(|c| require(c, columns, issues)),
            StepKind::RenameColumns { mapping } => {
                for from in mapping.keys() {
                    require(from, columns, issues);
                }
                for c in columns.iter_mut() {
                    if let Some(to) = mapping.get(c.as_str()) {
                        *c = to.clone();
                    }
                }
                if let Some(dup) = first_duplicate(columns) {
                    issues.push(format!("rename produces duplicate column '{}'", dup));
                }
            }
            StepKind::SplitColumn(spec) => {
                require(&spec.source, columns, issues);
                for name in &spec.into {
                    if name != &spec.source && columns.iter().any(|c| c == name) {
                        issues.push(format!("column '{}' already exists", name));
                    }
                }
                if let Some(pos) = columns.iter().position(|c| c == &spec.source) {
                    columns.splice(pos..=pos, spec.into.iter().cloned());
                }
            }
            StepKind::Unpivot(spec) => {
                spec.id_vars.iter().for_each(|c| require(c, columns, issues));
                let melted: Vec<&String> = match (&spec.value_vars, &spec.pattern) {
                    (Some(vars), _) => {
                        vars.iter().for_each(|c| require(c, columns, issues));
                        vars.iter().collect()
                    }
                    (None, Some(p)) => columns
                        .iter()
                        .filter(|c| !spec.id_vars.contains(*c) && p.is_match(c))
                        .collect(),
                    (None, None) => columns
                        .iter()
                        .filter(|c| !spec.id_vars.contains(*c))
                        .collect(),
                };
                if melted.is_empty() {
                    issues.push("no columns to unpivot".to_string());
                }
                let mut next = spec.id_vars.clone();
                next.push(spec.var_name.clone());
                next.push(spec.value_name.clone());
                *columns = next;
            }
            StepKind::CastTypes { columns: casts, .. } => {
                casts.keys().for_each(|c| require(c, columns, issues));
            }
            StepKind::AddColumn { name, value } => {
                value.columns().iter().for_each(|c| require(c, columns, issues));
                if !columns.iter().any(|c| c == name) {
                    columns.push(name.clone());
                }
            }
            StepKind::Custom { .. } => self.columns = None,
        }
    }
}

fn first_duplicate(columns: &[String]) -> Option<&String> {
    let mut seen = std::collections::HashSet::new();
    columns.iter().find(|c| !seen.insert(c.as_str()))
}
