//! Row-level kernels: head removal, header promotion, row retention.

use crate::core::predicate::RowPredicate;
use crate::core::table::{Cell, Table};
use std::collections::HashSet;

/// Drop the first `count` rows.
pub fn drop_head(mut table: Table, count: usize) -> Result<Table, String> {
    if count > table.len() {
        return Err(format!(
            "cannot skip {} rows: table has only {}",
            count,
            table.len()
        ));
    }
    table.rows.drain(..count);
    Ok(table)
}

/// Promote the row at `row_index` to column names, discarding it and every
/// row above it.
pub fn promote_header(mut table: Table, row_index: usize) -> Result<Table, String> {
    if row_index >= table.len() {
        return Err(format!(
            "header row {} out of range: table has {} rows",
            row_index,
            table.len()
        ));
    }
    let columns = header_names(&table.rows[row_index], &table.columns);
    table.rows.drain(..=row_index);
    table.columns = columns;
    Ok(table)
}

/// Column names from a header row. Blank cells keep the current name;
/// repeated names get `.1`, `.2`, … suffixes.
pub fn header_names(row: &[Cell], current: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut names = Vec::with_capacity(current.len());
    for (i, fallback) in current.iter().enumerate() {
        let base = match row.get(i) {
            Some(cell) if !cell.is_blank() => cell.canonical().trim().to_string(),
            _ => fallback.clone(),
        };
        let mut name = base.clone();
        let mut n = 0;
        while seen.contains(&name) {
            n += 1;
            name = format!("{}.{}", base, n);
        }
        seen.insert(name.clone());
        names.push(name);
    }
    names
}

/// Keep rows where the predicate evaluates to `keep`.
pub fn retain(mut table: Table, predicate: &RowPredicate, keep: bool) -> Result<Table, String> {
    let mut kept = Vec::with_capacity(table.len());
    for (i, row) in table.rows.into_iter().enumerate() {
        let hit = predicate
            .eval(&row, &table.columns)
            .map_err(|e| format!("row {}: {}", i, e))?;
        if hit == keep {
            kept.push(row);
        }
    }
    table.rows = kept;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(rows: &[&[&str]]) -> Table {
        Table::from_raw(
            rows.iter()
                .map(|r| r.iter().map(|v| Cell::text(v)).collect())
                .collect(),
        )
    }

    #[test]
    fn test_drop_head() {
        let t = raw(&[&["title"], &[""], &["a"], &["b"]]);
        let t = drop_head(t, 2).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.rows[0][0].canonical(), "a");
    }

    #[test]
    fn test_drop_head_too_many() {
        let t = raw(&[&["a"]]);
        let err = drop_head(t, 3).unwrap_err();
        assert!(err.contains("only 1"));
    }

    #[test]
    fn test_drop_head_exact_length() {
        let t = raw(&[&["a"], &["b"]]);
        assert!(drop_head(t, 2).unwrap().is_empty());
    }

    #[test]
    fn test_promote_header() {
        let t = raw(&[&["Report", "", ""], &["Name", "", "Name"], &["Cola", "x", "y"]]);
        let t = promote_header(t, 1).unwrap();
        assert_eq!(t.columns, vec!["Name", "B", "Name.1"]);
        assert_eq!(t.len(), 1);
        assert_eq!(t.rows[0][0].canonical(), "Cola");
    }

    #[test]
    fn test_promote_header_numeric_cells() {
        let t = Table::from_raw(vec![vec![Cell::text("Product"), Cell::Float(2024.0)]]);
        let t = promote_header(t, 0).unwrap();
        assert_eq!(t.columns, vec!["Product", "2024"]);
        assert!(t.is_empty());
    }

    #[test]
    fn test_promote_header_out_of_range() {
        let t = raw(&[&["a"]]);
        assert!(promote_header(t, 1).is_err());
    }

    #[test]
    fn test_header_names_triple_duplicate() {
        let row = vec![Cell::text("x"), Cell::text("x"), Cell::text("x")];
        let names = header_names(&row, &["A".into(), "B".into(), "C".into()]);
        assert_eq!(names, vec!["x", "x.1", "x.2"]);
    }

    #[test]
    fn test_retain_drops_matching() {
        let t = Table::from_strings(&["a", "b"], &[&["1", "2"], &["", ""], &["Total", ""]]);
        let empty = RowPredicate::parse(&json!("empty")).unwrap();
        let t = retain(t, &empty, false).unwrap();
        assert_eq!(t.len(), 2);
        let total = RowPredicate::parse(&json!({"first_cell_matches": "^Total"})).unwrap();
        let t = retain(t, &total, false).unwrap();
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_retain_reports_row() {
        let t = Table::from_strings(&["a"], &[&["1"]]);
        let p = RowPredicate::parse(&json!({"not_null": "zz"})).unwrap();
        let err = retain(t, &p, true).unwrap_err();
        assert!(err.starts_with("row 0"));
    }
}
