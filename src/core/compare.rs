//! Script output validation against the interpreter's reference.
//!
//! Compared: row count, column set, and sampled values (first N rows plus
//! the last row) as canonical text. When the plan has `custom` steps there
//! is no full reference; only a successful run with a non-empty column set is
//! checked, and the unverified steps are reported.
//!
//! An operator-supplied example of the desired output is compared too, more
//! loosely: column names match case-insensitively, row counts are reported
//! but not required to agree, and only the first few rows are sampled.

use super::table::Table;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Coverage {
    Full,
    Partial { unverified_steps: Vec<u32> },
}

/// One differing cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellMismatch {
    pub row: usize,
    pub column: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub coverage: Coverage,
    pub expected_rows: Option<usize>,
    pub actual_rows: usize,
    pub missing_columns: Vec<String>,
    pub extra_columns: Vec<String>,
    pub mismatches: Vec<CellMismatch>,
    pub checked_rows: Vec<usize>,
    /// Output with no columns at all.
    pub empty_output: bool,
    /// Agreement with the operator's example output, when one was given.
    pub example: Option<ExampleComparison>,
}

/// Output compared with an operator-supplied example of the desired result.
#[derive(Debug, Clone, PartialEq)]
pub struct ExampleComparison {
    pub matched_columns: Vec<String>,
    pub missing_columns: Vec<String>,
    pub extra_columns: Vec<String>,
    pub example_rows: usize,
    pub actual_rows: usize,
    pub mismatches: Vec<CellMismatch>,
    pub checked_rows: usize,
}

/// Rows of an example output compared value by value.
pub const EXAMPLE_SAMPLE_ROWS: usize = 5;

impl ExampleComparison {
    /// Every example column is present and the sampled values agree.
    pub fn agrees(&self) -> bool {
        self.missing_columns.is_empty() && self.checked_rows > 0 && self.mismatches.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing_columns.is_empty() {
            parts.push(format!(
                "example columns missing: {}",
                self.missing_columns.join(", ")
            ));
        }
        if !self.extra_columns.is_empty() {
            parts.push(format!(
                "columns not in example: {}",
                self.extra_columns.join(", ")
            ));
        }
        if self.example_rows != self.actual_rows {
            parts.push(format!(
                "{} rows (example has {})",
                self.actual_rows, self.example_rows
            ));
        }
        if self.checked_rows == 0 {
            parts.push("no example values to compare".to_string());
        }
        for m in self.mismatches.iter().take(SUMMARY_MISMATCHES) {
            parts.push(format!(
                "example row {} column '{}': got '{}', example has '{}'",
                m.row, m.column, m.actual, m.expected
            ));
        }
        if self.mismatches.len() > SUMMARY_MISMATCHES {
            parts.push(format!(
                "{} more example mismatches",
                self.mismatches.len() - SUMMARY_MISMATCHES
            ));
        }
        if parts.is_empty() {
            parts.push(format!("first {} rows agree with example", self.checked_rows));
        }
        parts.join("; ")
    }
}

/// Mismatches listed in a summary before it is cut short.
const SUMMARY_MISMATCHES: usize = 5;

impl ValidationReport {
    /// With full coverage the interpreter's reference decides and the
    /// example is advisory. Without it, the example must agree.
    pub fn is_match(&self) -> bool {
        !self.empty_output
            && self.expected_rows.is_none_or(|n| n == self.actual_rows)
            && self.missing_columns.is_empty()
            && self.extra_columns.is_empty()
            && self.mismatches.is_empty()
            && (!self.is_partial() || self.example.as_ref().is_none_or(ExampleComparison::agrees))
    }

    pub fn is_partial(&self) -> bool {
        matches!(self.coverage, Coverage::Partial { .. })
    }

    /// One-paragraph description used in errors and retry feedback.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.empty_output {
            parts.push("output has no columns".to_string());
        }
        if let Some(expected) = self.expected_rows {
            if expected != self.actual_rows {
                parts.push(format!(
                    "row count {} (expected {})",
                    self.actual_rows, expected
                ));
            }
        }
        if !self.missing_columns.is_empty() {
            parts.push(format!("missing columns: {}", self.missing_columns.join(", ")));
        }
        if !self.extra_columns.is_empty() {
            parts.push(format!("unexpected columns: {}", self.extra_columns.join(", ")));
        }
        for m in self.mismatches.iter().take(SUMMARY_MISMATCHES) {
            parts.push(format!(
                "row {} column '{}': got '{}', expected '{}'",
                m.row, m.column, m.actual, m.expected
            ));
        }
        if self.mismatches.len() > SUMMARY_MISMATCHES {
            parts.push(format!(
                "{} more cell mismatches",
                self.mismatches.len() - SUMMARY_MISMATCHES
            ));
        }
        if parts.is_empty() {
            parts.push(format!("{} rows match", self.actual_rows));
        }
        if let Some(example) = &self.example {
            parts.push(example.summary());
        }
        if let Coverage::Partial { unverified_steps } = &self.coverage {
            parts.push(format!(
                "values unverified for custom step(s) {}",
                unverified_steps
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        parts.join("; ")
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = match (self.is_match(), self.is_partial()) {
            (true, false) => "MATCH",
            (true, true) => "MATCH (partial)",
            (false, _) => "MISMATCH",
        };
        write!(f, "{}: {}", verdict, self.summary())
    }
}

fn cell_text(table: &Table, row: usize, col: usize) -> String {
    table.rows[row][col].canonical().trim().to_string()
}

/// Rows sampled for value comparison.
fn sample_rows(rows: usize, sample: usize) -> Vec<usize> {
    let mut picked: Vec<usize> = (0..rows.min(sample)).collect();
    if rows > 0 && !picked.contains(&(rows - 1)) {
        picked.push(rows - 1);
    }
    picked
}

/// Compare script output with the reference. `reference` is `None` when
/// the plan has `custom` steps.
pub fn compare(
    reference: Option<&Table>,
    actual: &Table,
    sample: usize,
    custom_steps: &[u32],
) -> ValidationReport {
    let mut report = ValidationReport {
        coverage: Coverage::Full,
        expected_rows: None,
        actual_rows: actual.len(),
        missing_columns: Vec::new(),
        extra_columns: Vec::new(),
        mismatches: Vec::new(),
        checked_rows: Vec::new(),
        empty_output: actual.columns.is_empty(),
        example: None,
    };

    let reference = match reference {
        Some(r) if custom_steps.is_empty() => r,
        _ => {
            report.coverage = Coverage::Partial {
                unverified_steps: custom_steps.to_vec(),
            };
            return report;
        }
    };

    report.expected_rows = Some(reference.len());
    let expected: BTreeSet<&str> = reference.columns.iter().map(String::as_str).collect();
    let got: BTreeSet<&str> = actual.columns.iter().map(String::as_str).collect();
    report.missing_columns = reference
        .columns
        .iter()
        .filter(|c| !got.contains(c.as_str()))
        .cloned()
        .collect();
    report.extra_columns = actual
        .columns
        .iter()
        .filter(|c| !expected.contains(c.as_str()))
        .cloned()
        .collect();

    let shared_rows = reference.len().min(actual.len());
    report.checked_rows = sample_rows(shared_rows, sample);
    for &row in &report.checked_rows {
        for (ref_col, name) in reference.columns.iter().enumerate() {
            let Some(act_col) = actual.column_index(name) else {
                continue;
            };
            let want = cell_text(reference, row, ref_col);
            let have = cell_text(actual, row, act_col);
            if want != have {
                report.mismatches.push(CellMismatch {
                    row,
                    column: name.clone(),
                    expected: want,
                    actual: have,
                });
            }
        }
    }
    report
}

fn column_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Compare output with an example of the desired result. Columns pair up by
/// trimmed, lowercased name; the first `sample` shared rows are compared.
pub fn compare_example(example: &Table, actual: &Table, sample: usize) -> ExampleComparison {
    let actual_keys: Vec<String> = actual.columns.iter().map(|c| column_key(c)).collect();
    let example_keys: BTreeSet<String> = example.columns.iter().map(|c| column_key(c)).collect();

    let mut pairs = Vec::new();
    let mut missing_columns = Vec::new();
    for (ex_col, name) in example.columns.iter().enumerate() {
        let key = column_key(name);
        match actual_keys.iter().position(|k| *k == key) {
            Some(act_col) => pairs.push((ex_col, act_col, name.clone())),
            None => missing_columns.push(name.clone()),
        }
    }
    let extra_columns = actual
        .columns
        .iter()
        .zip(&actual_keys)
        .filter(|(_, key)| !example_keys.contains(*key))
        .map(|(name, _)| name.clone())
        .collect();

    let checked_rows = if pairs.is_empty() {
        0
    } else {
        sample.min(example.len()).min(actual.len())
    };
    let mut mismatches = Vec::new();
    for row in 0..checked_rows {
        for (ex_col, act_col, name) in &pairs {
            let want = cell_text(example, row, *ex_col);
            let have = cell_text(actual, row, *act_col);
            if want != have {
                mismatches.push(CellMismatch {
                    row,
                    column: name.clone(),
                    expected: want,
                    actual: have,
                });
            }
        }
    }

    ExampleComparison {
        matched_columns: pairs.into_iter().map(|(_, _, name)| name).collect(),
        missing_columns,
        extra_columns,
        example_rows: example.len(),
        actual_rows: actual.len(),
        mismatches,
        checked_rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::table::Cell;

    fn table(columns: &[&str], rows: &[&[&str]]) -> Table {
        Table::from_strings(columns, rows)
    }

    #[test]
    fn test_identical_tables_match() {
        let t = table(&["a", "b"], &[&["1", "x"], &["2", "y"]]);
        let report = compare(Some(&t), &t, 20, &[]);
        assert!(report.is_match());
        assert_eq!(report.checked_rows, vec![0, 1]);
        assert_eq!(report.to_string(), "MATCH: 2 rows match");
    }

    #[test]
    fn test_int_and_float_compare_equal() {
        let reference = Table::from_rows(vec!["n".into()], vec![vec![Cell::Int(24)]]);
        let actual = Table::from_rows(vec!["n".into()], vec![vec![Cell::Float(24.0)]]);
        assert!(compare(Some(&reference), &actual, 5, &[]).is_match());
    }

    #[test]
    fn test_column_order_is_ignored_but_set_is_not() {
        let reference = table(&["a", "b"], &[&["1", "2"]]);
        let reordered = table(&["b", "a"], &[&["2", "1"]]);
        assert!(compare(Some(&reference), &reordered, 5, &[]).is_match());

        let renamed = table(&["a", "c"], &[&["1", "2"]]);
        let report = compare(Some(&reference), &renamed, 5, &[]);
        assert!(!report.is_match());
        assert_eq!(report.missing_columns, vec!["b"]);
        assert_eq!(report.extra_columns, vec!["c"]);
    }

    #[test]
    fn test_row_count_and_last_row_sampled() {
        let rows: Vec<Vec<String>> = (0..50).map(|i| vec![i.to_string()]).collect();
        let row_refs: Vec<Vec<&str>> = rows.iter().map(|r| r.iter().map(String::as_str).collect()).collect();
        let slices: Vec<&[&str]> = row_refs.iter().map(Vec::as_slice).collect();
        let reference = table(&["n"], &slices);
        let mut actual = reference.clone();
        actual.rows[49][0] = Cell::text("wrong");
        actual.rows[30][0] = Cell::text("unsampled");
        let report = compare(Some(&reference), &actual, 10, &[]);
        assert_eq!(report.checked_rows.len(), 11);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].row, 49);
        assert!(report.summary().contains("row 49 column 'n'"));

        actual.rows.pop();
        let report = compare(Some(&reference), &actual, 10, &[]);
        assert!(report.summary().contains("row count 49 (expected 50)"));
    }

    #[test]
    fn test_partial_coverage() {
        let actual = table(&["a"], &[&["1"]]);
        let report = compare(None, &actual, 10, &[3]);
        assert!(report.is_match());
        assert!(report.is_partial());
        assert!(report.summary().contains("custom step(s) 3"));

        let report = compare(None, &Table::default(), 10, &[3]);
        assert!(!report.is_match());
    }

    #[test]
    fn test_whitespace_trimmed() {
        let reference = table(&["a"], &[&["Cola"]]);
        let actual = table(&["a"], &[&["Cola "]]);
        assert!(compare(Some(&reference), &actual, 5, &[]).is_match());
    }

    #[test]
    fn test_example_columns_match_case_insensitively() {
        let example = table(&["Name", " QTY "], &[&["Cola", "3"]]);
        let actual = table(&["name", "qty", "note"], &[&["Cola", "3"], &["Fanta", "2"]]);
        let cmp = compare_example(&example, &actual, EXAMPLE_SAMPLE_ROWS);
        assert_eq!(cmp.matched_columns, vec!["Name", " QTY "]);
        assert!(cmp.missing_columns.is_empty());
        assert_eq!(cmp.extra_columns, vec!["note"]);
        assert_eq!(cmp.checked_rows, 1);
        assert!(cmp.agrees());
        assert!(cmp.summary().contains("2 rows (example has 1)"));
    }

    #[test]
    fn test_example_disagreement() {
        let example = table(&["name", "price"], &[&["Cola", "1.5"], &["Fanta", "2"]]);
        let actual = table(&["name"], &[&["Cola"], &["Sprite"]]);
        let cmp = compare_example(&example, &actual, EXAMPLE_SAMPLE_ROWS);
        assert_eq!(cmp.missing_columns, vec!["price"]);
        assert_eq!(cmp.mismatches.len(), 1);
        assert_eq!(cmp.mismatches[0].row, 1);
        assert!(!cmp.agrees());
        let summary = cmp.summary();
        assert!(summary.contains("example columns missing: price"), "{summary}");
        assert!(summary.contains("got 'Sprite', example has 'Fanta'"), "{summary}");

        let unrelated = table(&["x"], &[&["1"]]);
        assert!(!compare_example(&example, &unrelated, 5).agrees());
    }

    #[test]
    fn test_example_gates_only_partial_reports() {
        let actual = table(&["name"], &[&["Cola"]]);
        let example = table(&["name"], &[&["Fanta"]]);
        let cmp = compare_example(&example, &actual, EXAMPLE_SAMPLE_ROWS);

        let mut full = compare(Some(&actual), &actual, 20, &[]);
        full.example = Some(cmp.clone());
        assert!(full.is_match());
        assert!(full.to_string().contains("example has 'Fanta'"));

        let mut partial = compare(None, &actual, 20, &[2]);
        partial.example = Some(cmp);
        assert!(!partial.is_match());
        assert!(partial.to_string().starts_with("MISMATCH"));

        partial.example = Some(compare_example(&actual, &actual, EXAMPLE_SAMPLE_ROWS));
        assert!(partial.is_match());
    }
}
