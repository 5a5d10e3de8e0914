//! Script synthesis: lower a compiled plan into column operations.
//!
//! Declarative steps lower one-to-one (drop rules and casts expand to one op
//! each) and never consult the collaborator, so synthesis of a declarative
//! plan is deterministic. `custom` steps become `shell` ops whose command the
//! collaborator writes.

use super::interpreter::interpret;
use super::script::{ColumnOp, Script, ScriptLine};
use super::table::Table;
use super::types::{CompiledPlan, StepKind};
use crate::collaborator::{
    extract_code, Collaborator, CodeRequest, CollaboratorError, CODE_CONTRACT,
};
use crate::error::{RegridError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Rows of the step input shown to the collaborator.
const CODE_SAMPLE_ROWS: usize = 10;

/// Lower one declarative step. `None` for `custom`.
pub fn lower_step(kind: &StepKind) -> Option<Vec<ColumnOp>> {
    let ops = match kind {
        StepKind::SkipRows { count } => vec![ColumnOp::DropHead { count: *count }],
        StepKind::SetHeaderRow { row_index } => vec![ColumnOp::PromoteHeader {
            row_index: *row_index,
        }],
        StepKind::DetectGroupHeaders {
            rule,
            field,
            strip_prefix,
        } => vec![ColumnOp::TagGroups {
            rule: rule.clone(),
            field: field.clone(),
            strip_prefix: strip_prefix.clone(),
        }],
        StepKind::ForwardFillGroup {
            field,
            drop_headers,
        } => vec![ColumnOp::FillGroups {
            field: field.clone(),
            drop_headers: *drop_headers,
        }],
        StepKind::DropNonDataRows { rules } => rules
            .iter()
            .map(|rule| ColumnOp::Retain {
                predicate: rule.clone(),
                keep: false,
            })
            .collect(),
        StepKind::RenameColumns { mapping } => vec![ColumnOp::Rename {
            mapping: mapping.clone(),
        }],
        StepKind::SplitColumn(spec) => vec![ColumnOp::SplitFirst(spec.clone())],
        StepKind::Unpivot(spec) => vec![ColumnOp::Melt(spec.clone())],
        StepKind::CastTypes { columns, on_error } => columns
            .iter()
            .map(|(column, to)| ColumnOp::Cast {
                column: column.clone(),
                to: *to,
                on_error: *on_error,
            })
            .collect(),
        StepKind::Filter { condition } => vec![ColumnOp::Retain {
            predicate: condition.clone(),
            keep: true,
        }],
        StepKind::AddColumn { name, value } => vec![ColumnOp::Derive {
            name: name.clone(),
            value: value.clone(),
        }],
        StepKind::Custom { .. } => return None,
    };
    Some(ops)
}

fn plan_label(plan: &CompiledPlan) -> &str {
    if plan.plan.source_description.trim().is_empty() {
        &plan.plan.target_description
    } else {
        &plan.plan.source_description
    }
}

/// Synthesize a script for a plan without `custom` steps.
pub fn synthesize_declarative(plan: &CompiledPlan) -> std::result::Result<Script, String> {
    let mut lines = Vec::new();
    for step in &plan.steps {
        let ops = lower_step(&step.kind)
            .ok_or_else(|| format!("step {} is custom and needs generated code", step.step))?;
        lines.extend(ops.into_iter().map(|op| ScriptLine { step: step.step, op }));
    }
    Script::render(plan_label(plan), lines)
}

/// Inputs available to a synthesis attempt.
#[derive(Debug, Clone, Default)]
pub struct SynthesisContext<'a> {
    /// The raw input the script will run on.
    pub input: Option<&'a Table>,
    /// Failure details of earlier attempts, oldest first.
    pub feedback: &'a [String],
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, plan: &CompiledPlan, ctx: &SynthesisContext<'_>) -> Result<Script>;
}

/// Default synthesizer: lowering for declarative steps, the collaborator for
/// `custom` ones.
#[derive(Clone, Default)]
pub struct PlanSynthesizer {
    collaborator: Option<Arc<dyn Collaborator>>,
}

impl PlanSynthesizer {
    pub fn new(collaborator: Option<Arc<dyn Collaborator>>) -> Self {
        Self { collaborator }
    }

    fn code_request(
        plan: &CompiledPlan,
        step: u32,
        logic: &str,
        ctx: &SynthesisContext<'_>,
    ) -> CodeRequest {
        // Input of the first custom step is the interpreter's partial result.
        let prefix = ctx
            .input
            .and_then(|t| interpret(plan, t.clone()).ok())
            .filter(|r| r.halted_at == Some(step))
            .map(|r| r.table);
        CodeRequest {
            step,
            logic: logic.to_string(),
            plan_description: plan_label(plan).to_string(),
            input_columns: prefix.as_ref().map(|t| t.columns.clone()).unwrap_or_default(),
            sample_rows: prefix
                .as_ref()
                .map(|t| t.preview(CODE_SAMPLE_ROWS))
                .unwrap_or_default(),
            feedback: ctx.feedback.to_vec(),
            contract: CODE_CONTRACT.to_string(),
        }
    }
}

#[async_trait]
impl Synthesizer for PlanSynthesizer {
    async fn synthesize(&self, plan: &CompiledPlan, ctx: &SynthesisContext<'_>) -> Result<Script> {
        let mut lines = Vec::new();
        for step in &plan.steps {
            if let Some(ops) = lower_step(&step.kind) {
                lines.extend(ops.into_iter().map(|op| ScriptLine { step: step.step, op }));
                continue;
            }
            let StepKind::Custom { logic } = &step.kind else {
                continue;
            };
            let collaborator = self.collaborator.as_ref().ok_or_else(|| {
                CollaboratorError::Unavailable(format!(
                    "step {} is custom and no collaborator is configured",
                    step.step
                ))
            })?;
            let request = Self::code_request(plan, step.step, logic, ctx);
            let response = collaborator.author_step_code(&request).await?;
            let command = extract_code(&response)?;
            tracing::info!(step = step.step, "custom step code received");
            lines.push(ScriptLine {
                step: step.step,
                op: ColumnOp::Shell { command },
            });
        }
        let script = Script::render(plan_label(plan), lines).map_err(|cause| {
            RegridError::Store(format!("cannot render script: {}", cause))
        })?;
        tracing::debug!(identity = %script.identity, ops = script.lines.len(), "script synthesized");
        Ok(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::PlanRequest;
    use crate::core::parser::{compile_plan, parse_plan};
    use crate::core::script::apply_ops;
    use crate::core::table::Cell;
    use proptest::prelude::*;
    use std::sync::Mutex;

    fn compiled(yaml: &str) -> CompiledPlan {
        compile_plan(&parse_plan(yaml).unwrap(), None).unwrap()
    }

    const PLAN: &str = r#"
source_description: regional sales sheet
steps:
  - {step: 1, action: skip_rows, params: {count: 1}}
  - {step: 2, action: set_header_row, params: {row_index: 0}}
  - {step: 3, action: drop_non_data_rows, params: {rules: [empty, {first_cell_matches: "^Total"}]}}
  - {step: 4, action: cast_types, params: {columns: {Q1: int, Q2: int}}}
  - {step: 5, action: unpivot, params: {id_vars: [Region], var_name: quarter, value_name: units}}
  - {step: 6, action: filter, params: {condition: {column: units, op: ge, value: 5}}}
"#;

    fn sheet() -> Table {
        Table::from_raw(
            [
                vec!["Sales 2024", "", ""],
                vec!["Region", "Q1", "Q2"],
                vec!["North", "4", "12"],
                vec!["", "", ""],
                vec!["South", "7", "3"],
                vec!["Total", "11", "15"],
            ]
            .iter()
            .map(|r| r.iter().map(|v| Cell::text(v)).collect())
            .collect(),
        )
    }

    #[test]
    fn test_lowering_expands_rules_and_casts() {
        let plan = compiled(PLAN);
        let script = synthesize_declarative(&plan).unwrap();
        let names: Vec<&str> = script.lines.iter().map(|l| l.op.name()).collect();
        assert_eq!(
            names,
            vec!["drop_head", "promote_header", "retain", "retain", "cast", "cast", "melt", "retain"]
        );
        assert_eq!(script.lines[3].step, 3);
        assert!(script.text.contains("# plan: regional sales sheet"));
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let plan = compiled(PLAN);
        let a = synthesize_declarative(&plan).unwrap();
        let b = synthesize_declarative(&plan).unwrap();
        assert_eq!(a.identity, b.identity);
        assert_eq!(Script::parse(&a.text).unwrap().lines, a.lines);
    }

    #[test]
    fn test_script_ops_match_interpreter() {
        let plan = compiled(PLAN);
        let script = synthesize_declarative(&plan).unwrap();
        let reference = interpret(&plan, sheet()).unwrap().table;
        let actual = apply_ops(&script.lines, sheet()).unwrap();
        assert_eq!(reference, actual);
        assert_eq!(actual.len(), 2);
    }

    #[test]
    fn test_declarative_rejects_custom() {
        let plan = compiled("steps:\n  - {step: 1, action: custom, params: {logic: dedupe}}\n");
        assert!(synthesize_declarative(&plan).unwrap_err().contains("step 1"));
    }

    struct FixedCode {
        code: String,
        seen: Mutex<Vec<CodeRequest>>,
    }

    #[async_trait]
    impl Collaborator for FixedCode {
        async fn author_plan(&self, _: &PlanRequest) -> std::result::Result<String, CollaboratorError> {
            Err(CollaboratorError::Unavailable("plans not supported".into()))
        }

        async fn author_step_code(
            &self,
            request: &CodeRequest,
        ) -> std::result::Result<String, CollaboratorError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(format!("```bash\n{}\n```", self.code))
        }
    }

    #[tokio::test]
    async fn test_custom_step_uses_collaborator() {
        let collab = Arc::new(FixedCode {
            code: "sort".into(),
            seen: Mutex::new(Vec::new()),
        });
        let synth = PlanSynthesizer::new(Some(collab.clone()));
        let plan = compiled(
            "steps:\n  - {step: 1, action: set_header_row, params: {row_index: 0}}\n  - {step: 2, action: custom, params: {logic: sort rows}}\n",
        );
        let input = Table::from_raw(vec![
            vec![Cell::text("name")],
            vec![Cell::text("b")],
            vec![Cell::text("a")],
        ]);
        let feedback = vec!["attempt 1 timed out".to_string()];
        let ctx = SynthesisContext {
            input: Some(&input),
            feedback: &feedback,
        };
        let script = synth.synthesize(&plan, &ctx).await.unwrap();
        assert_eq!(script.shell_steps(), vec![2]);
        assert_eq!(
            script.lines[1].op,
            ColumnOp::Shell {
                command: "sort".into()
            }
        );
        let seen = collab.seen.lock().unwrap();
        assert_eq!(seen[0].input_columns, vec!["name"]);
        assert_eq!(seen[0].sample_rows.len(), 2);
        assert_eq!(seen[0].feedback, feedback);
    }

    #[tokio::test]
    async fn test_custom_step_without_collaborator() {
        let plan = compiled("steps:\n  - {step: 1, action: custom, params: {logic: dedupe}}\n");
        let err = PlanSynthesizer::default()
            .synthesize(&plan, &SynthesisContext::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegridError::Collaborator(CollaboratorError::Unavailable(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_script_equals_interpreter(
            cells in proptest::collection::vec(
                proptest::collection::vec("[a-c]{0,2}|[0-9]{1,2}|Total", 3),
                2..20,
            )
        ) {
            let rows: Vec<Vec<Cell>> = cells
                .iter()
                .map(|r| r.iter().map(|v| Cell::text(v)).collect())
                .collect();
            let plan = compiled(
                r#"
steps:
  - {step: 1, action: drop_non_data_rows, params: {rules: [empty, {first_cell_matches: "^Total"}]}}
  - {step: 2, action: detect_group_headers, params: {detection_rule: only_first_populated, extract_field: grp}}
  - {step: 3, action: forward_fill_group, params: {field: grp}}
  - {step: 4, action: add_column, params: {name: label, template: "{grp}/{A}"}}
"#,
            );
            let script = synthesize_declarative(&plan).unwrap();
            let reference = interpret(&plan, Table::from_raw(rows.clone()));
            let actual = apply_ops(&script.lines, Table::from_raw(rows));
            match (reference, actual) {
                (Ok(r), Ok(a)) => prop_assert_eq!(r.table, a),
                (Err(_), Err(_)) => {}
                (r, a) => prop_assert!(false, "diverged: {:?} vs {:?}", r.map(|i| i.table), a),
            }
        }
    }
}
