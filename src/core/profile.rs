//! Structural profile of a raw spreadsheet.
//!
//! The profile is what the collaborator sees instead of the file, and what
//! plan validation uses to check column references before anything runs.

use super::sheet_io::read_sheet;
use super::table::{Cell, Table};
use crate::error::{RegridError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Sampling bounds.
#[derive(Debug, Clone, Copy)]
pub struct ProfileLimits {
    pub max_sample_rows: usize,
    pub max_profile_columns: usize,
}

impl Default for ProfileLimits {
    fn default() -> Self {
        Self {
            max_sample_rows: 15,
            max_profile_columns: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnProfile {
    /// Positional name (`A`, `B`, …)
    pub name: String,
    /// Text of the detected header cell, if any
    pub header: Option<String>,
    pub non_null: usize,
    pub inferred_type: String,
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileProfile {
    pub file_path: String,
    pub sheet_name: String,
    pub sheet_names: Vec<String>,
    pub total_rows: usize,
    pub total_columns: usize,
    /// Positional names the raw table starts with
    pub column_names: Vec<String>,
    /// First rows as canonical text
    pub raw_rows: Vec<Vec<String>>,
    /// First and last populated column index
    pub column_bounds: Option<(usize, usize)>,
    pub header_row: Option<usize>,
    pub columns: Vec<ColumnProfile>,
    pub notes: Vec<String>,
}

/// Profile the first sheet (or `sheet`) of a file.
pub fn profile_file(path: &Path, sheet: Option<&str>, limits: &ProfileLimits) -> Result<FileProfile> {
    let data = read_sheet(path, sheet).map_err(RegridError::Profile)?;
    if data.table.is_empty() {
        return Err(RegridError::Profile(format!(
            "sheet '{}' of {} contains no data",
            data.sheet_name,
            path.display()
        )));
    }
    let profile = profile_table(
        &path.display().to_string(),
        &data.sheet_name,
        &data.sheet_names,
        &data.table,
        limits,
    );
    tracing::info!(
        file = %path.display(),
        rows = profile.total_rows,
        columns = profile.total_columns,
        header_row = ?profile.header_row,
        "profiled"
    );
    Ok(profile)
}

/// Profile an already-loaded raw table.
pub fn profile_table(
    file_path: &str,
    sheet_name: &str,
    sheet_names: &[String],
    table: &Table,
    limits: &ProfileLimits,
) -> FileProfile {
    let column_bounds = column_bounds(table);
    let header_row = detect_header_row(table, column_bounds);
    let data_start = header_row.map(|h| h + 1).unwrap_or(0);

    let columns = table
        .columns
        .iter()
        .enumerate()
        .take(limits.max_profile_columns)
        .map(|(i, name)| {
            let header = header_row
                .map(|h| table.rows[h][i].canonical())
                .filter(|s| !s.trim().is_empty());
            profile_column(name, header, table.rows[data_start..].iter().map(|r| &r[i]))
        })
        .collect();

    let mut profile = FileProfile {
        file_path: file_path.to_string(),
        sheet_name: sheet_name.to_string(),
        sheet_names: sheet_names.to_vec(),
        total_rows: table.len(),
        total_columns: table.width(),
        column_names: table.columns.clone(),
        raw_rows: table.preview(limits.max_sample_rows),
        column_bounds,
        header_row,
        columns,
        notes: Vec::new(),
    };
    profile.notes = observe(table, &profile, limits);
    profile
}

fn populated(row: &[Cell]) -> usize {
    row.iter().filter(|c| !c.is_blank()).count()
}

fn column_bounds(table: &Table) -> Option<(usize, usize)> {
    let mut bounds: Option<(usize, usize)> = None;
    for row in &table.rows {
        for (i, c) in row.iter().enumerate() {
            if !c.is_blank() {
                bounds = Some(match bounds {
                    Some((lo, hi)) => (lo.min(i), hi.max(i)),
                    None => (i, i),
                });
            }
        }
    }
    bounds
}

/// First row with at least two populated text cells covering half the
/// populated width, followed by at least one populated row.
fn detect_header_row(table: &Table, bounds: Option<(usize, usize)>) -> Option<usize> {
    let (lo, hi) = bounds?;
    let span = hi - lo + 1;
    let limit = table.len().min(50);
    (0..limit).find(|&r| {
        let row = &table.rows[r];
        let count = populated(row);
        count >= 2
            && count * 2 >= span
            && row
                .iter()
                .filter(|c| !c.is_blank())
                .all(|c| matches!(c, Cell::Str(s) if s.trim().parse::<f64>().is_err()))
            && table.rows[r + 1..].iter().any(|next| populated(next) > 0)
    })
}

fn profile_column<'a>(
    name: &str,
    header: Option<String>,
    cells: impl Iterator<Item = &'a Cell>,
) -> ColumnProfile {
    let mut non_null = 0;
    let mut kinds: HashMap<&'static str, usize> = HashMap::new();
    let mut samples: Vec<String> = Vec::new();
    for cell in cells.filter(|c| !c.is_blank()) {
        non_null += 1;
        *kinds.entry(cell_kind(cell)).or_default() += 1;
        let text = cell.canonical();
        if samples.len() < 5 && !samples.contains(&text) {
            samples.push(text);
        }
    }
    let inferred_type = match kinds.len() {
        0 => "empty",
        1 => kinds.keys().next().copied().unwrap_or("string"),
        _ if kinds.keys().all(|k| *k == "int" || *k == "float") => "float",
        _ => "mixed",
    };
    ColumnProfile {
        name: name.to_string(),
        header,
        non_null,
        inferred_type: inferred_type.to_string(),
        samples,
    }
}

fn cell_kind(cell: &Cell) -> &'static str {
    match cell {
        Cell::Int(_) => "int",
        Cell::Float(f) if f.fract() == 0.0 => "int",
        Cell::Float(_) => "float",
        Cell::Bool(_) => "bool",
        Cell::Date(_) => "date",
        Cell::Str(s) => match s.trim().parse::<f64>() {
            Ok(f) if f.fract() == 0.0 => "int",
            Ok(_) => "float",
            Err(_) => "string",
        },
        Cell::Null => "empty",
    }
}

fn observe(table: &Table, profile: &FileProfile, limits: &ProfileLimits) -> Vec<String> {
    let mut notes = Vec::new();
    if profile.sheet_names.len() > 1 {
        notes.push(format!(
            "workbook has {} sheets ({}); profiled '{}'",
            profile.sheet_names.len(),
            profile.sheet_names.join(", "),
            profile.sheet_name
        ));
    }
    if let Some(first) = table.rows.iter().position(|r| populated(r) > 0) {
        if first > 0 {
            notes.push(format!("{} leading blank row(s)", first));
        }
    }
    match profile.header_row {
        Some(h) => notes.push(format!("header row detected at index {}", h)),
        None => notes.push("no header row detected".to_string()),
    }
    if table.width() > limits.max_profile_columns {
        notes.push(format!(
            "only the first {} of {} columns are profiled",
            limits.max_profile_columns,
            table.width()
        ));
    }

    let data_start = profile.header_row.map(|h| h + 1).unwrap_or(0);
    let data = &table.rows[data_start..];
    let wide_rows = data.iter().filter(|r| populated(r) >= 2).count();
    let single: Vec<usize> = data
        .iter()
        .enumerate()
        .filter(|(_, r)| populated(r) == 1)
        .map(|(i, _)| i + data_start)
        .collect();
    if !single.is_empty() && wide_rows > single.len() {
        let shown: Vec<String> = single.iter().take(5).map(|i| i.to_string()).collect();
        notes.push(format!(
            "{} row(s) with a single populated cell, possibly group headers (rows {}{})",
            single.len(),
            shown.join(", "),
            if single.len() > 5 { ", …" } else { "" }
        ));
    }

    if let Some((lo, _)) = profile.column_bounds {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for r in data.iter().filter(|r| populated(r) >= 2) {
            let v = r[lo].canonical();
            if !v.trim().is_empty() {
                *counts.entry(v).or_default() += 1;
            }
        }
        let mut repeated: Vec<(String, usize)> = counts.into_iter().filter(|(_, n)| *n > 1).collect();
        repeated.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        if !repeated.is_empty() {
            let shown: Vec<String> = repeated
                .iter()
                .take(3)
                .map(|(v, n)| format!("'{}' ×{}", v, n))
                .collect();
            notes.push(format!("first column repeats values: {}", shown.join(", ")));
        }
    }

    if let Ok(total) = Regex::new(r"(?i)^\s*(grand\s+)?(sub)?totals?\b") {
        let hits: Vec<String> = data
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.iter()
                    .find(|c| !c.is_blank())
                    .is_some_and(|c| total.is_match(&c.canonical()))
            })
            .map(|(i, _)| (i + data_start).to_string())
            .collect();
        if !hits.is_empty() {
            notes.push(format!("total/summary rows at {}", hits.join(", ")));
        }
    }
    notes
}

impl FileProfile {
    /// Plain-text rendering for terminals and collaborator prompts.
    pub fn summary(&self) -> String {
        let mut out = Vec::new();
        out.push(format!("File: {}", self.file_path));
        out.push(format!(
            "Sheet: {} ({} rows × {} columns)",
            self.sheet_name, self.total_rows, self.total_columns
        ));
        if let Some((lo, hi)) = self.column_bounds {
            out.push(format!(
                "Populated columns: {}..{}",
                self.column_names[lo], self.column_names[hi]
            ));
        }
        out.push(match self.header_row {
            Some(h) => format!("Header row: {}", h),
            None => "Header row: none detected".to_string(),
        });
        out.push(String::new());
        out.push("Columns:".to_string());
        for c in &self.columns {
            out.push(format!(
                "  {:<4} {:<24} {:<7} non-null={:<5} samples: {}",
                c.name,
                c.header.as_deref().unwrap_or("-"),
                c.inferred_type,
                c.non_null,
                c.samples.join(" | ")
            ));
        }
        out.push(String::new());
        out.push(format!("First {} rows:", self.raw_rows.len()));
        for (i, row) in self.raw_rows.iter().enumerate() {
            out.push(format!("  {:>3}: {}", i, row.join(" | ")));
        }
        if !self.notes.is_empty() {
            out.push(String::new());
            out.push("Notes:".to_string());
            for n in &self.notes {
                out.push(format!("  - {}", n));
            }
        }
        out.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[&[&str]]) -> Table {
        Table::from_raw(
            rows.iter()
                .map(|r| r.iter().map(|v| Cell::text(v)).collect())
                .collect(),
        )
    }

    fn grouped_price_list() -> Table {
        table(&[
            &["", "", ""],
            &["Price list 2024", "", ""],
            &["Product", "Size", "Price"],
            &["Cola Co", "", ""],
            &["Cola", "50cl", "1.20"],
            &["Cola", "1L", "2.00"],
            &["Fanta Ltd", "", ""],
            &["Fanta", "50cl", "1.10"],
            &["Total", "", "4.30"],
        ])
    }

    #[test]
    fn test_header_detection() {
        let p = profile_table("f.xlsx", "S", &["S".into()], &grouped_price_list(), &ProfileLimits::default());
        assert_eq!(p.header_row, Some(2));
        assert_eq!(p.column_bounds, Some((0, 2)));
        assert_eq!(p.columns[0].header.as_deref(), Some("Product"));
        assert_eq!(p.columns[2].inferred_type, "float");
        assert_eq!(p.columns[1].inferred_type, "string");
    }

    #[test]
    fn test_notes() {
        let p = profile_table(
            "f.xlsx",
            "S",
            &["S".into(), "Other".into()],
            &grouped_price_list(),
            &ProfileLimits::default(),
        );
        let notes = p.notes.join("\n");
        assert!(notes.contains("2 sheets"));
        assert!(notes.contains("1 leading blank row"));
        assert!(notes.contains("possibly group headers (rows 3, 6)"));
        assert!(notes.contains("'Cola' ×2"));
        assert!(notes.contains("total/summary rows at 8"));
    }

    #[test]
    fn test_sampling_limits() {
        let rows: Vec<Vec<Cell>> = (0..40)
            .map(|i| (0..60).map(|c| Cell::Int(i * 100 + c)).collect())
            .collect();
        let limits = ProfileLimits {
            max_sample_rows: 10,
            max_profile_columns: 20,
        };
        let p = profile_table("f.csv", "f", &["f".into()], &Table::from_raw(rows), &limits);
        assert_eq!(p.raw_rows.len(), 10);
        assert_eq!(p.columns.len(), 20);
        assert_eq!(p.total_columns, 60);
        assert_eq!(p.header_row, None);
        assert!(p.notes.iter().any(|n| n.contains("first 20 of 60")));
    }

    #[test]
    fn test_profile_file_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        std::fs::write(&path, "Name,Qty\nCola,3\nFanta,4\n").unwrap();
        let p = profile_file(&path, None, &ProfileLimits::default()).unwrap();
        assert_eq!(p.header_row, Some(0));
        assert_eq!(p.columns[1].inferred_type, "int");
        assert!(p.summary().contains("Header row: 0"));
    }

    #[test]
    fn test_profile_unreadable() {
        let err = profile_file(Path::new("/nonexistent.xlsx"), None, &ProfileLimits::default()).unwrap_err();
        assert!(matches!(err, RegridError::Profile(_)));
    }

    #[test]
    fn test_profile_empty_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        std::fs::write(&path, "").unwrap();
        assert!(profile_file(&path, None, &ProfileLimits::default()).is_err());
    }
}
