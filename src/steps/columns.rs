//! Column kernels: rename, split, cast, derive.

use crate::core::predicate::ValueExpr;
use crate::core::table::{Cell, Table};
use crate::core::types::{CastType, OnError, SplitSpec};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use std::collections::HashSet;

/// Rename columns; every mapped source must exist and the result must stay unique.
pub fn rename(mut table: Table, mapping: &IndexMap<String, String>) -> Result<Table, String> {
    for from in mapping.keys() {
        table.require_column(from)?;
    }
    for name in table.columns.iter_mut() {
        if let Some(to) = mapping.get(name.as_str()) {
            *name = to.clone();
        }
    }
    let mut seen = HashSet::new();
    if let Some(dup) = table.columns.iter().find(|c| !seen.insert(c.as_str())) {
        return Err(format!("rename produces duplicate column '{}'", dup));
    }
    Ok(table)
}

/// Split `source` on the first occurrence of the delimiter. With more than
/// two target columns the remainder is split again; the last column gets the
/// rest.
pub fn split_first(mut table: Table, spec: &SplitSpec) -> Result<Table, String> {
    let idx = table.require_column(&spec.source)?;
    for name in &spec.into {
        if name != &spec.source && table.column_index(name).is_some() {
            return Err(format!("column '{}' already exists", name));
        }
    }
    let n = spec.into.len();
    for (i, row) in table.rows.iter_mut().enumerate() {
        let cell = row.remove(idx);
        let parts = if cell.is_null() {
            vec![Cell::Null; n]
        } else {
            split_text(&cell.canonical(), &spec.delimiter, n, spec.missing)
                .map_err(|e| format!("row {}: {}", i, e))?
        };
        row.splice(idx..idx, parts);
    }
    table.columns.splice(idx..=idx, spec.into.iter().cloned());
    Ok(table)
}

fn split_text(text: &str, delimiter: &str, n: usize, missing: OnError) -> Result<Vec<Cell>, String> {
    let mut parts = Vec::with_capacity(n);
    let mut rest = Some(text);
    for _ in 0..n.saturating_sub(1) {
        match rest {
            Some(r) => match r.split_once(delimiter) {
                Some((head, tail)) => {
                    parts.push(Cell::text(head.trim()));
                    rest = Some(tail);
                }
                None if missing == OnError::Fail => {
                    return Err(format!("delimiter '{}' not found in '{}'", delimiter, text));
                }
                None => {
                    parts.push(Cell::text(r.trim()));
                    rest = None;
                }
            },
            None => parts.push(Cell::Null),
        }
    }
    parts.push(rest.map(|r| Cell::text(r.trim())).unwrap_or(Cell::Null));
    Ok(parts)
}

/// Convert every cell of `column`. Null stays null.
pub fn cast(mut table: Table, column: &str, to: CastType, on_error: OnError) -> Result<Table, String> {
    let idx = table.require_column(column)?;
    for (i, row) in table.rows.iter_mut().enumerate() {
        let cell = std::mem::replace(&mut row[idx], Cell::Null);
        row[idx] = match cast_cell(&cell, to) {
            Ok(c) => c,
            Err(e) if on_error == OnError::Null => {
                tracing::debug!(row = i, column, error = %e, "cast failure coerced to null");
                Cell::Null
            }
            Err(e) => return Err(format!("row {}, column '{}': {}", i, column, e)),
        };
    }
    Ok(table)
}

/// Convert one cell to the target type.
pub fn cast_cell(cell: &Cell, to: CastType) -> Result<Cell, String> {
    if cell.is_null() {
        return Ok(Cell::Null);
    }
    if to != CastType::String && cell.is_blank() {
        return Ok(Cell::Null);
    }
    let fail = || format!("cannot convert '{}' to {}", cell.canonical(), to);
    match to {
        CastType::String => Ok(Cell::Str(cell.canonical())),
        CastType::Int => match cell {
            Cell::Int(i) => Ok(Cell::Int(*i)),
            Cell::Bool(b) => Ok(Cell::Int(i64::from(*b))),
            Cell::Float(f) => integral(*f).ok_or_else(fail),
            Cell::Str(s) => {
                let s = s.trim();
                match s.parse::<i64>() {
                    Ok(i) => Ok(Cell::Int(i)),
                    Err(_) => s.parse::<f64>().ok().and_then(integral).ok_or_else(fail),
                }
            }
            _ => Err(fail()),
        },
        CastType::Float => match cell {
            Cell::Int(i) => Ok(Cell::Float(*i as f64)),
            Cell::Float(f) => Ok(Cell::Float(*f)),
            Cell::Bool(b) => Ok(Cell::Float(if *b { 1.0 } else { 0.0 })),
            Cell::Str(s) => s.trim().parse::<f64>().map(Cell::Float).map_err(|_| fail()),
            _ => Err(fail()),
        },
        CastType::Bool => match cell {
            Cell::Bool(b) => Ok(Cell::Bool(*b)),
            Cell::Int(0) => Ok(Cell::Bool(false)),
            Cell::Int(1) => Ok(Cell::Bool(true)),
            Cell::Float(f) if *f == 0.0 || *f == 1.0 => Ok(Cell::Bool(*f == 1.0)),
            Cell::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Ok(Cell::Bool(true)),
                "false" | "no" | "n" | "0" => Ok(Cell::Bool(false)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        CastType::Date => match cell {
            Cell::Date(d) => Ok(Cell::Date(*d)),
            Cell::Int(i) => excel_serial(*i as f64).ok_or_else(fail),
            Cell::Float(f) => excel_serial(*f).ok_or_else(fail),
            Cell::Str(s) => parse_date(s.trim()).map(Cell::Date).ok_or_else(fail),
            _ => Err(fail()),
        },
    }
}

fn integral(f: f64) -> Option<Cell> {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
        Some(Cell::Int(f as i64))
    } else {
        None
    }
}

/// Excel serial day number (1900 date system).
fn excel_serial(serial: f64) -> Option<Cell> {
    if !serial.is_finite() || !(1.0..2_958_466.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch
        .checked_add_signed(Duration::days(serial.trunc() as i64))
        .map(Cell::Date)
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d.%m.%Y", "%d-%m-%Y"];

fn parse_date(s: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.date())
        })
}

/// Compute `name` for every row; replaces an existing column in place.
pub fn derive(mut table: Table, name: &str, expr: &ValueExpr) -> Result<Table, String> {
    let mut values = Vec::with_capacity(table.len());
    for (i, row) in table.rows.iter().enumerate() {
        values.push(
            expr.eval(row, &table.columns)
                .map_err(|e| format!("row {}: {}", i, e))?,
        );
    }
    match table.column_index(name) {
        Some(idx) => {
            for (row, v) in table.rows.iter_mut().zip(values) {
                row[idx] = v;
            }
        }
        None => {
            for (row, v) in table.rows.iter_mut().zip(values) {
                row.push(v);
            }
            table.columns.push(name.to_string());
        }
    }
    Ok(table)
}
