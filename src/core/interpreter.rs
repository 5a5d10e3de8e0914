//! Step interpreter: `(plan, table) → table`, in-process.
//!
//! The interpreter is the reference semantics of a plan. Its output is what
//! the preview shows and what synthesized scripts are compared against.

use super::table::Table;
use super::types::{CompiledPlan, StepKind};
use crate::error::{RegridError, Result};
use crate::steps::{columns, groups, reshape, rows};

/// Shape of the table after one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepTrace {
    pub step: u32,
    pub action: &'static str,
    pub rows: usize,
    pub columns: usize,
}

/// Result of interpreting a plan.
#[derive(Debug, Clone)]
pub struct Interpretation {
    pub table: Table,
    /// Set when a `custom` step stopped interpretation; the table reflects
    /// only the steps before it.
    pub halted_at: Option<u32>,
    pub trace: Vec<StepTrace>,
}

impl Interpretation {
    pub fn is_partial(&self) -> bool {
        self.halted_at.is_some()
    }
}

/// Apply one typed step.
pub fn apply_step(kind: &StepKind, table: Table) -> std::result::Result<Table, String> {
    match kind {
        StepKind::SkipRows { count } => rows::drop_head(table, *count),
        StepKind::SetHeaderRow { row_index } => rows::promote_header(table, *row_index),
        StepKind::DetectGroupHeaders {
            rule,
            field,
            strip_prefix,
        } => groups::tag_groups(table, rule, field, strip_prefix.as_deref()),
        StepKind::ForwardFillGroup {
            field,
            drop_headers,
        } => groups::fill_groups(table, field, *drop_headers),
        StepKind::DropNonDataRows { rules } => {
            let mut table = table;
            for rule in rules {
                table = rows::retain(table, rule, false)?;
            }
            Ok(table)
        }
        StepKind::RenameColumns { mapping } => columns::rename(table, mapping),
        StepKind::SplitColumn(spec) => columns::split_first(table, spec),
        StepKind::Unpivot(spec) => reshape::melt(table, spec),
        StepKind::CastTypes {
            columns: casts,
            on_error,
        } => {
            let mut table = table;
            for (column, to) in casts {
                table = columns::cast(table, column, *to, *on_error)?;
            }
            Ok(table)
        }
        StepKind::Filter { condition } => rows::retain(table, condition, true),
        StepKind::AddColumn { name, value } => columns::derive(table, name, value),
        StepKind::Custom { .. } => Err("custom steps cannot be interpreted".to_string()),
    }
}

/// Run every step in order. A `custom` step halts with a partial result.
pub fn interpret(plan: &CompiledPlan, table: Table) -> Result<Interpretation> {
    let mut table = table;
    let mut trace = Vec::with_capacity(plan.steps.len());
    for step in &plan.steps {
        if step.kind.is_custom() {
            tracing::info!(step = step.step, "custom step, interpretation halted");
            return Ok(Interpretation {
                table,
                halted_at: Some(step.step),
                trace,
            });
        }
        table = apply_step(&step.kind, table).map_err(|cause| RegridError::StepExecution {
            step: step.step,
            action: step.kind.action().to_string(),
            cause,
        })?;
        tracing::debug!(
            step = step.step,
            action = step.kind.action(),
            rows = table.len(),
            columns = table.width(),
            "step applied"
        );
        trace.push(StepTrace {
            step: step.step,
            action: step.kind.action(),
            rows: table.len(),
            columns: table.width(),
        });
    }
    Ok(Interpretation {
        table,
        halted_at: None,
        trace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::{compile_plan, parse_plan};
    use crate::core::table::Cell;
    use proptest::prelude::*;

    fn compiled(yaml: &str) -> CompiledPlan {
        compile_plan(&parse_plan(yaml).unwrap(), None).unwrap()
    }

    fn raw(rows: &[&[&str]]) -> Table {
        Table::from_raw(
            rows.iter()
                .map(|r| r.iter().map(|v| Cell::text(v)).collect())
                .collect(),
        )
    }

    const GROUPED_PLAN: &str = r#"
source_description: beverage price list with brand group headers
target_description: one row per product with brand and pack size
steps:
  - step: 1
    action: skip_rows
    params: {count: 2}
  - step: 2
    action: set_header_row
    params: {row_index: 0}
  - step: 3
    action: drop_non_data_rows
    params:
      rules: [empty, {first_cell_matches: "^Total"}]
  - step: 4
    action: detect_group_headers
    params: {detection_rule: only_first_populated, extract_field: brand, strip_prefix: "Brand:"}
  - step: 5
    action: forward_fill_group
    params: {field: brand}
  - step: 6
    action: split_column
    params: {source: Product, delimiter: " x ", into: [description, pack_size]}
  - step: 7
    action: cast_types
    params: {columns: {pack_size: int, Price: float}}
  - step: 8
    action: add_column
    params: {name: unit_price, expression: "{Price} / {pack_size}"}
"#;

    fn grouped_sheet() -> Table {
        raw(&[
            &["Price list 2024", "", ""],
            &["", "", ""],
            &["Product", "Price", ""],
            &["Brand: Coca-Cola", "", ""],
            &["Coca-Cola PET 50cl x 24", "24", ""],
            &["Coke Zero CAN 33cl x 12", "6", ""],
            &["", "", ""],
            &["Brand: Fanta", "", ""],
            &["Fanta Orange 1L x 6", "9", ""],
            &["Total", "39", ""],
        ])
    }

    #[test]
    fn test_grouped_price_list() {
        let result = interpret(&compiled(GROUPED_PLAN), grouped_sheet()).unwrap();
        assert!(!result.is_partial());
        let t = result.table;
        assert_eq!(
            t.columns,
            vec!["description", "pack_size", "Price", "C", "brand", "unit_price"]
        );
        assert_eq!(t.len(), 3);
        assert_eq!(t.rows[0][0].canonical(), "Coca-Cola PET 50cl");
        assert_eq!(t.rows[0][1], Cell::Int(24));
        assert_eq!(t.rows[0][4].canonical(), "Coca-Cola");
        assert_eq!(t.rows[0][5].canonical(), "1");
        assert_eq!(t.rows[2][4].canonical(), "Fanta");
        assert_eq!(t.rows[2][5].canonical(), "1.5");
        assert_eq!(result.trace.len(), 8);
    }

    #[test]
    fn test_step_error_carries_step_and_action() {
        let plan = compiled(
            r#"
steps:
  - {step: 1, action: set_header_row, params: {row_index: 0}}
  - {step: 2, action: cast_types, params: {qty: int}}
"#,
        );
        let table = raw(&[&["name", "qty"], &["Cola", "many"]]);
        match interpret(&plan, table).unwrap_err() {
            RegridError::StepExecution { step, action, cause } => {
                assert_eq!(step, 2);
                assert_eq!(action, "cast_types");
                assert!(cause.contains("many"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_custom_step_halts() {
        let plan = compiled(
            r#"
steps:
  - {step: 1, action: skip_rows, params: {count: 1}}
  - {step: 2, action: custom, params: {logic: "merge continuation rows"}}
  - {step: 3, action: skip_rows, params: {count: 1}}
"#,
        );
        let result = interpret(&plan, raw(&[&["a"], &["b"], &["c"]])).unwrap();
        assert_eq!(result.halted_at, Some(2));
        assert_eq!(result.table.len(), 2);
        assert_eq!(result.trace.len(), 1);
    }

    #[test]
    fn test_forward_fill_merged_column_keeps_rows() {
        let plan = compiled(
            r#"
steps:
  - {step: 1, action: set_header_row, params: {row_index: 0}}
  - {step: 2, action: forward_fill_group, params: {field: region}}
"#,
        );
        assert!(matches!(
            plan.steps[1].kind,
            StepKind::ForwardFillGroup { drop_headers: false, .. }
        ));
        let table = raw(&[
            &["region", "product", "qty"],
            &["North", "Cola", "3"],
            &["", "Fanta", "2"],
            &["South", "Cola", "5"],
            &["", "Sprite", "1"],
        ]);
        let t = interpret(&plan, table).unwrap().table;
        assert_eq!(t.len(), 4);
        assert_eq!(t.column_text("region").unwrap(), vec!["North", "North", "South", "South"]);

        let grouped = compiled(GROUPED_PLAN);
        assert!(matches!(
            grouped.steps[4].kind,
            StepKind::ForwardFillGroup { drop_headers: true, .. }
        ));
    }

    #[test]
    fn test_unpivot_months() {
        let plan = compiled(
            r#"
steps:
  - {step: 1, action: set_header_row, params: {row_index: 0}}
  - {step: 2, action: unpivot, params: {id_vars: [Product], var_name: month, value_name: qty}}
  - {step: 3, action: filter, params: {condition: {column: qty, op: gt, value: 0}}}
"#,
        );
        let table = raw(&[&["Product", "Jan", "Feb"], &["Cola", "3", "0"], &["Fanta", "", "2"]]);
        let t = interpret(&plan, table).unwrap().table;
        assert_eq!(t.preview(5), vec![vec!["Cola", "Jan", "3"], vec!["Fanta", "Feb", "2"]]);
    }

    proptest! {
        #[test]
        fn prop_interpretation_is_deterministic(
            cells in proptest::collection::vec(
                proptest::collection::vec("[a-c ]{0,3}|[0-9]{1,2}|Total", 3),
                1..30,
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
  - {step: 2, action: detect_group_headers, params: {detection_rule: {max_populated: 1}, extract_field: grp}}
  - {step: 3, action: forward_fill_group, params: {field: grp}}
  - {step: 4, action: unpivot, params: {id_vars: [grp], var_name: col, value_name: val}}
"#,
            );
            let a = interpret(&plan, Table::from_raw(rows.clone()));
            let b = interpret(&plan, Table::from_raw(rows));
            match (a, b) {
                (Ok(a), Ok(b)) => prop_assert_eq!(a.table, b.table),
                (Err(a), Err(b)) => prop_assert_eq!(a.to_string(), b.to_string()),
                _ => prop_assert!(false, "runs diverged"),
            }
        }
    }
}
