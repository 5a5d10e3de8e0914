//! Spreadsheet reading and writing.
//!
//! Workbooks (`xlsx`, `xlsm`, `xls`, `ods`) go through calamine, CSV through
//! the csv crate. Output is xlsx (rust_xlsxwriter) unless the path ends in
//! `.csv`. Writes are atomic: temp file in the same directory, then rename.

use super::table::{format_float, Cell, Table};
use calamine::{open_workbook_auto, Data, Reader};
use std::path::Path;

/// A sheet read without header inference.
#[derive(Debug, Clone)]
pub struct SheetData {
    pub sheet_name: String,
    pub sheet_names: Vec<String>,
    pub table: Table,
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
}

/// Read a sheet as raw rows with positional column names. Leading blank rows
/// and columns are preserved so positions match the spreadsheet.
pub fn read_sheet(path: &Path, sheet: Option<&str>) -> Result<SheetData, String> {
    if is_csv(path) {
        let rows = read_csv_rows(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "csv".to_string());
        return Ok(SheetData {
            sheet_name: name.clone(),
            sheet_names: vec![name],
            table: Table::from_raw(rows),
        });
    }

    let mut workbook = open_workbook_auto(path)
        .map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
    let sheet_name = match sheet {
        Some(s) => {
            if !sheet_names.iter().any(|n| n == s) {
                return Err(format!(
                    "sheet '{}' not found in {} (sheets: {})",
                    s,
                    path.display(),
                    sheet_names.join(", ")
                ));
            }
            s.to_string()
        }
        None => sheet_names
            .first()
            .cloned()
            .ok_or_else(|| format!("{} has no sheets", path.display()))?,
    };
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| format!("cannot read sheet '{}' of {}: {}", sheet_name, path.display(), e))?;

    let (row_offset, col_offset) = range
        .start()
        .map(|(r, c)| (r as usize, c as usize))
        .unwrap_or((0, 0));
    let mut rows: Vec<Vec<Cell>> = vec![Vec::new(); row_offset];
    for raw in range.rows() {
        let mut row = vec![Cell::Null; col_offset];
        row.extend(raw.iter().map(data_to_cell));
        rows.push(row);
    }
    trim_trailing_blank_rows(&mut rows);

    Ok(SheetData {
        sheet_name,
        sheet_names,
        table: Table::from_raw(rows),
    })
}

/// Read a written output back: first row is the header.
pub fn read_table(path: &Path) -> Result<Table, String> {
    Ok(header_from_first_row(read_sheet(path, None)?.table))
}

/// Turn a raw sheet into a table whose columns are named by its first row.
/// Trailing unnamed columns are dropped.
pub fn header_from_first_row(mut raw: Table) -> Table {
    if raw.rows.is_empty() {
        return Table::default();
    }
    let header = raw.rows.remove(0);
    let columns: Vec<String> = header.iter().map(Cell::canonical).collect();
    let width = columns
        .iter()
        .rposition(|c| !c.is_empty())
        .map(|i| i + 1)
        .unwrap_or(0);
    let columns = columns.into_iter().take(width).collect();
    let rows = raw
        .rows
        .into_iter()
        .map(|mut r| {
            r.truncate(width);
            r
        })
        .collect();
    Table::from_rows(columns, rows)
}

/// Write a table with a header row. Parent directories are created.
pub fn write_table(path: &Path, table: &Table) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
        }
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| format!("invalid output path {}", path.display()))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name));

    let written = if is_csv(path) {
        write_csv(&tmp_path, table)
    } else {
        write_xlsx(&tmp_path, table)
    };
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }
    std::fs::rename(&tmp_path, path).map_err(|e| {
        format!(
            "cannot rename {} → {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })
}

fn data_to_cell(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Null,
        Data::String(s) => Cell::text(s),
        Data::Int(i) => Cell::Int(*i),
        Data::Float(f) => Cell::Float(*f),
        Data::Bool(b) => Cell::Bool(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ndt) if ndt.time() == chrono::NaiveTime::MIN => Cell::Date(ndt.date()),
            Some(ndt) => Cell::Str(ndt.format("%Y-%m-%d %H:%M:%S").to_string()),
            None => Cell::Float(dt.as_f64()),
        },
        Data::DateTimeIso(s) => match chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            Ok(d) => Cell::Date(d),
            Err(_) => Cell::Str(s.clone()),
        },
        other => Cell::Str(other.to_string()),
    }
}

fn trim_trailing_blank_rows(rows: &mut Vec<Vec<Cell>>) {
    while rows
        .last()
        .is_some_and(|r| r.iter().all(Cell::is_blank))
    {
        rows.pop();
    }
}

fn read_csv_rows(path: &Path) -> Result<Vec<Vec<Cell>>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| format!("CSV error in {}: {}", path.display(), e))?;
        rows.push(record.iter().map(Cell::text).collect());
    }
    trim_trailing_blank_rows(&mut rows);
    Ok(rows)
}

/// Serialize a table as CSV with a header row.
pub fn table_to_csv(table: &Table) -> Result<Vec<u8>, String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&table.columns)
        .map_err(|e| format!("CSV write error: {}", e))?;
    for row in &table.rows {
        writer
            .write_record(row.iter().map(Cell::canonical))
            .map_err(|e| format!("CSV write error: {}", e))?;
    }
    writer
        .into_inner()
        .map_err(|e| format!("CSV flush error: {}", e))
}

/// Parse CSV text with a header row into a table of text cells.
pub fn csv_to_table(data: &[u8]) -> Result<Table, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(data);
    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| format!("CSV header error: {}", e))?
        .iter()
        .map(|h| h.to_string())
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| format!("CSV error: {}", e))?;
        rows.push(record.iter().map(Cell::text).collect());
    }
    Ok(Table::from_rows(columns, rows))
}

fn write_csv(path: &Path, table: &Table) -> Result<(), String> {
    let bytes = table_to_csv(table)?;
    std::fs::write(path, bytes).map_err(|e| format!("cannot write {}: {}", path.display(), e))
}

fn write_xlsx(path: &Path, table: &Table) -> Result<(), String> {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let worksheet = workbook.add_worksheet();
    let xerr = |e: rust_xlsxwriter::XlsxError| format!("xlsx write error: {}", e);

    for (c, name) in table.columns.iter().enumerate() {
        let col = u16::try_from(c).map_err(|_| format!("too many columns ({})", table.width()))?;
        worksheet.write_string(0, col, name).map_err(xerr)?;
    }
    for (r, row) in table.rows.iter().enumerate() {
        let row_idx = u32::try_from(r + 1).map_err(|_| format!("too many rows ({})", table.len()))?;
        for (c, cell) in row.iter().enumerate() {
            let col = u16::try_from(c).map_err(|_| format!("too many columns ({})", table.width()))?;
            match cell {
                Cell::Null => {}
                Cell::Str(s) => {
                    worksheet.write_string(row_idx, col, s).map_err(xerr)?;
                }
                Cell::Int(i) => {
                    worksheet.write_number(row_idx, col, *i as f64).map_err(xerr)?;
                }
                Cell::Float(f) if f.is_finite() => {
                    worksheet.write_number(row_idx, col, *f).map_err(xerr)?;
                }
                Cell::Float(f) => {
                    worksheet.write_string(row_idx, col, format_float(*f)).map_err(xerr)?;
                }
                Cell::Bool(b) => {
                    worksheet.write_boolean(row_idx, col, *b).map_err(xerr)?;
                }
                Cell::Date(_) => {
                    worksheet.write_string(row_idx, col, cell.canonical()).map_err(xerr)?;
                }
            }
        }
    }
    workbook
        .save(path)
        .map_err(|e| format!("cannot save {}: {}", path.display(), e))
}
