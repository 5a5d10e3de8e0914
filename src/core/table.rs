//! In-memory tabular dataset threaded through every step.
//!
//! A raw sheet starts with positional column names (`A`, `B`, …). Cells keep
//! the type the reader produced; comparison always goes through
//! [`Cell::canonical`] so that an integer written to xlsx and read back as a
//! float still compares equal.

use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    Str(String),
}

impl Cell {
    /// Null or whitespace-only text.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Str(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Canonical text used for comparison, CSV output and header promotion.
    pub fn canonical(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => format_float(*f),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::Str(s) => s.clone(),
        }
    }

    /// Numeric view of the cell, parsing text when needed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Str(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Build a cell from a plan literal (YAML/JSON scalar).
    pub fn from_json(value: &serde_json::Value) -> Cell {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            serde_json::Value::String(s) => Self::Str(s.clone()),
            other => Self::Str(other.to_string()),
        }
    }

    /// Text cell, or null when the text is empty.
    pub fn text(s: &str) -> Cell {
        if s.is_empty() {
            Self::Null
        } else {
            Self::Str(s.to_string())
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Integral floats render without a fraction (`24.0` → `24`).
pub fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

/// Spreadsheet column letter for a 0-based index (`0` → `A`, `26` → `AA`).
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

/// Ordered column names plus rows of cells. Every row has exactly
/// `columns.len()` cells.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table, padding or truncating rows to the column count.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut r| {
                r.resize(width, Cell::Null);
                r
            })
            .collect();
        Self { columns, rows }
    }

    /// Raw sheet rows with positional letter names; width is the longest row.
    pub fn from_raw(rows: Vec<Vec<Cell>>) -> Self {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        let columns = (0..width).map(column_letter).collect();
        Self::from_rows(columns, rows)
    }

    /// Convenience constructor from string literals; empty strings become null.
    pub fn from_strings(columns: &[&str], rows: &[&[&str]]) -> Self {
        let columns = columns.iter().map(|c| c.to_string()).collect();
        let rows = rows
            .iter()
            .map(|r| r.iter().map(|v| Cell::text(v)).collect())
            .collect();
        Self::from_rows(columns, rows)
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Index of a column, or an error naming the available columns.
    pub fn require_column(&self, name: &str) -> Result<usize, String> {
        self.column_index(name).ok_or_else(|| {
            format!(
                "column '{}' not found (available: {})",
                name,
                self.columns.join(", ")
            )
        })
    }

    /// Cell by row index and column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// All values of a column as canonical text.
    pub fn column_text(&self, column: &str) -> Option<Vec<String>> {
        let idx = self.column_index(column)?;
        Some(self.rows.iter().map(|r| r[idx].canonical()).collect())
    }

    /// First `n` rows as canonical text.
    pub fn preview(&self, n: usize) -> Vec<Vec<String>> {
        self.rows
            .iter()
            .take(n)
            .map(|r| r.iter().map(Cell::canonical).collect())
            .collect()
    }

    /// Plain-text rendering of the first `n` rows for terminal output.
    pub fn render(&self, n: usize) -> String {
        let preview = self.preview(n);
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &preview {
            for (i, v) in row.iter().enumerate() {
                widths[i] = widths[i].max(v.chars().count()).min(40);
            }
        }
        let line = |cells: &[String]| -> String {
            cells
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let v: String = v.chars().take(40).collect();
                    format!("{:<w$}", v, w = widths[i])
                })
                .collect::<Vec<_>>()
                .join(" | ")
        };
        let mut out = vec![line(&self.columns)];
        out.push(
            widths
                .iter()
                .map(|w| "-".repeat(*w))
                .collect::<Vec<_>>()
                .join("-+-"),
        );
        for row in &preview {
            out.push(line(row));
        }
        if self.len() > n {
            out.push(format!("... ({} rows total)", self.len()));
        }
        out.join("\n")
    }
}
