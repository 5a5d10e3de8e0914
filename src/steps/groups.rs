//! Group-header kernels.
//!
//! Grouped sheets interleave a header row (brand, region, …) with the data
//! rows it applies to. `tag_groups` marks the header rows by writing the group
//! key into a new column; `fill_groups` carries that key down and removes the
//! tagged header rows. On an ordinary column (merged cells exported as one
//! value followed by blanks) `fill_groups` only fills the blanks.

use crate::core::predicate::RowPredicate;
use crate::core::table::{Cell, Table};

/// Add column `field`: the group key on rows matching `rule`, null elsewhere.
pub fn tag_groups(
    mut table: Table,
    rule: &RowPredicate,
    field: &str,
    strip_prefix: Option<&str>,
) -> Result<Table, String> {
    if table.column_index(field).is_some() {
        return Err(format!("column '{}' already exists", field));
    }
    for (i, row) in table.rows.iter_mut().enumerate() {
        let is_header = rule
            .eval(row, &table.columns)
            .map_err(|e| format!("row {}: {}", i, e))?;
        let key = if is_header {
            row.iter()
                .find(|c| !c.is_blank())
                .map(|c| group_key(&c.canonical(), strip_prefix))
                .unwrap_or(Cell::Null)
        } else {
            Cell::Null
        };
        row.push(key);
    }
    table.columns.push(field.to_string());
    Ok(table)
}

fn group_key(text: &str, strip_prefix: Option<&str>) -> Cell {
    let text = text.trim();
    let text = match strip_prefix {
        Some(prefix) => text.strip_prefix(prefix).unwrap_or(text),
        None => text,
    };
    Cell::text(text.trim())
}

/// A non-null `field` becomes the current key; blank cells receive it (null
/// before the first key). With `drop_headers` the rows carrying a key are the
/// header rows written by `tag_groups` and are removed; otherwise every row
/// is kept.
pub fn fill_groups(mut table: Table, field: &str, drop_headers: bool) -> Result<Table, String> {
    let idx = table.require_column(field)?;
    let mut current = Cell::Null;
    let mut rows = Vec::with_capacity(table.len());
    for mut row in table.rows.into_iter() {
        if row[idx].is_blank() {
            row[idx] = current.clone();
            rows.push(row);
        } else {
            current = row[idx].clone();
            if !drop_headers {
                rows.push(row);
            }
        }
    }
    table.rows = rows;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grouped() -> Table {
        Table::from_strings(
            &["product", "price"],
            &[
                &["Brand: Cola Co", ""],
                &["Cola 50cl", "1.2"],
                &["Cola 1L", "2.0"],
                &["Brand: Fanta", ""],
                &["Fanta 50cl", "1.1"],
            ],
        )
    }

    #[test]
    fn test_tag_groups_with_prefix() {
        let rule = RowPredicate::parse(&json!("only_first_populated")).unwrap();
        let t = tag_groups(grouped(), &rule, "brand", Some("Brand:")).unwrap();
        assert_eq!(t.columns, vec!["product", "price", "brand"]);
        assert_eq!(t.rows[0][2].canonical(), "Cola Co");
        assert!(t.rows[1][2].is_null());
        assert_eq!(t.rows[3][2].canonical(), "Fanta");
    }

    #[test]
    fn test_tag_then_fill() {
        let rule = RowPredicate::parse(&json!("only_first_populated")).unwrap();
        let t = tag_groups(grouped(), &rule, "brand", Some("Brand:")).unwrap();
        let t = fill_groups(t, "brand", true).unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t.column_text("brand").unwrap(), vec!["Cola Co", "Cola Co", "Fanta"]);
        assert_eq!(t.column_text("product").unwrap(), vec!["Cola 50cl", "Cola 1L", "Fanta 50cl"]);
    }

    #[test]
    fn test_fill_before_first_header_is_null() {
        let t = Table::from_strings(&["g", "v"], &[&["", "1"], &["G1", ""], &["", "2"]]);
        let t = fill_groups(t, "g", true).unwrap();
        assert_eq!(t.len(), 2);
        assert!(t.rows[0][0].is_null());
        assert_eq!(t.rows[1][0].canonical(), "G1");
    }

    #[test]
    fn test_tag_existing_field_fails() {
        let rule = RowPredicate::parse(&json!("empty")).unwrap();
        let err = tag_groups(grouped(), &rule, "price", None).unwrap_err();
        assert!(err.contains("already exists"));
    }

    #[test]
    fn test_fill_missing_field() {
        assert!(fill_groups(grouped(), "brand", false).is_err());
    }

    #[test]
    fn test_fill_merged_cells_keeps_every_row() {
        let t = Table::from_strings(
            &["region", "product", "qty"],
            &[
                &["North", "Cola", "3"],
                &["", "Fanta", "2"],
                &["South", "Cola", "5"],
                &["", "Sprite", "1"],
            ],
        );
        let t = fill_groups(t, "region", false).unwrap();
        assert_eq!(t.len(), 4);
        assert_eq!(t.column_text("region").unwrap(), vec!["North", "North", "South", "South"]);
        assert_eq!(t.column_text("product").unwrap(), vec!["Cola", "Fanta", "Cola", "Sprite"]);
    }
}
