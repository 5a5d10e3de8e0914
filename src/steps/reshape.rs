//! Wide-to-long reshaping.

use crate::core::table::{Cell, Table};
use crate::core::types::UnpivotSpec;

/// Columns melted by an unpivot: explicit list, else pattern matches, else
/// every non-id column.
pub fn melted_columns(table: &Table, spec: &UnpivotSpec) -> Result<Vec<String>, String> {
    let vars: Vec<String> = match (&spec.value_vars, &spec.pattern) {
        (Some(vars), _) => {
            for v in vars {
                table.require_column(v)?;
            }
            vars.clone()
        }
        (None, Some(pattern)) => table
            .columns
            .iter()
            .filter(|c| !spec.id_vars.contains(*c) && pattern.is_match(c))
            .cloned()
            .collect(),
        (None, None) => table
            .columns
            .iter()
            .filter(|c| !spec.id_vars.contains(*c))
            .cloned()
            .collect(),
    };
    if vars.is_empty() {
        return Err("no columns to unpivot".to_string());
    }
    Ok(vars)
}

/// One output row per input row and melted column, row-major.
pub fn melt(table: Table, spec: &UnpivotSpec) -> Result<Table, String> {
    let id_idx: Vec<usize> = spec
        .id_vars
        .iter()
        .map(|c| table.require_column(c))
        .collect::<Result<_, _>>()?;
    let vars = melted_columns(&table, spec)?;
    let var_idx: Vec<usize> = vars
        .iter()
        .map(|c| table.require_column(c))
        .collect::<Result<_, _>>()?;

    let mut columns = spec.id_vars.clone();
    columns.push(spec.var_name.clone());
    columns.push(spec.value_name.clone());

    let mut rows = Vec::with_capacity(table.len() * vars.len());
    for row in &table.rows {
        for (name, &vi) in vars.iter().zip(&var_idx) {
            let mut out: Vec<Cell> = id_idx.iter().map(|&i| row[i].clone()).collect();
            out.push(Cell::Str(name.clone()));
            out.push(row[vi].clone());
            rows.push(out);
        }
    }
    Ok(Table::from_rows(columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::predicate::Pattern;

    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    fn spec(value_vars: Option<Vec<String>>, pattern: Option<&str>) -> UnpivotSpec {
        UnpivotSpec {
            id_vars: vec!["product".into()],
            var_name: "month".into(),
            value_name: "qty".into(),
            value_vars,
            pattern: pattern.map(|p| Pattern::new(p).unwrap()),
        }
    }

    fn wide(products: usize) -> Table {
        let mut columns = vec!["product".to_string()];
        columns.extend(MONTHS.iter().map(|m| m.to_string()));
        let rows = (0..products)
            .map(|p| {
                let mut r = vec![Cell::Str(format!("P{}", p))];
                r.extend((0..12).map(|m| Cell::Int((p * 12 + m) as i64)));
                r
            })
            .collect();
        Table::from_rows(columns, rows)
    }

    #[test]
    fn test_melt_15_by_12() {
        let t = melt(wide(15), &spec(None, None)).unwrap();
        assert_eq!(t.len(), 180);
        assert_eq!(t.columns, vec!["product", "month", "qty"]);
        assert_eq!(t.rows[0][1].canonical(), "Jan");
        assert_eq!(t.rows[11][1].canonical(), "Dec");
        assert_eq!(t.rows[12][0].canonical(), "P1");
        assert_eq!(t.rows[179][2], Cell::Int(179));
    }

    #[test]
    fn test_melt_explicit_vars() {
        let vars = Some(vec!["Mar".to_string(), "Jan".to_string()]);
        let t = melt(wide(2), &spec(vars, None)).unwrap();
        assert_eq!(t.len(), 4);
        assert_eq!(t.rows[0][1].canonical(), "Mar");
        assert_eq!(t.rows[0][2], Cell::Int(2));
    }

    #[test]
    fn test_melt_pattern() {
        let t = melt(wide(1), &spec(None, Some("^J"))).unwrap();
        assert_eq!(t.column_text("month").unwrap(), vec!["Jan", "Jun", "Jul"]);
    }

    #[test]
    fn test_melt_nothing_to_melt() {
        let err = melt(wide(1), &spec(None, Some("^Q"))).unwrap_err();
        assert!(err.contains("no columns"));
    }

    #[test]
    fn test_melt_missing_id() {
        let mut s = spec(None, None);
        s.id_vars = vec!["sku".into()];
        assert!(melt(wide(1), &s).unwrap_err().contains("'sku'"));
    }
}
