use crate::core::inference::SampleWindow;
use crate::core::traits::chunk_records;
use crate::core::{BatchIter, ConvertError, FormatParser, Record, Result, Schema, Value};
use calamine::{open_workbook, open_workbook_auto_from_rs, Data, Range, Reader, Xls, Xlsx};
use chrono::{Duration, NaiveDate};
use std::fmt::Display;
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Which binary workbook layout the file extension promises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkbookKind {
    Modern,
    Legacy,
}

/// Parser for the first (or a named) worksheet of a workbook.
///
/// Cell values are read as stored, with formulas already evaluated by the
/// authoring application. The sheet is loaded into memory on first use.
pub struct SpreadsheetParser {
    file_path: PathBuf,
    kind: WorkbookKind,
    sheet: Option<String>,
    table: Option<SheetTable>,
    schema: Option<Schema>,
}

struct SheetTable {
    headers: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl SpreadsheetParser {
    pub fn new<P: AsRef<Path>>(file_path: P, kind: WorkbookKind) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            kind,
            sheet: None,
            table: None,
            schema: None,
        }
    }

    pub fn with_sheet(mut self, sheet: impl Into<String>) -> Self {
        self.sheet = Some(sheet.into());
        self
    }

    fn load(&mut self) -> Result<&SheetTable> {
        if self.table.is_none() {
            let range = self.open_range()?;
            let table = SheetTable::from_range(&range);
            debug!(
                path = %self.file_path.display(),
                rows = table.rows.len(),
                columns = table.headers.len(),
                "Loaded worksheet"
            );
            self.table = Some(table);
        }
        self.table
            .as_ref()
            .ok_or_else(|| ConvertError::malformed("worksheet not loaded"))
    }

    /// Opens with the reader matching the extension, then falls back to
    /// content sniffing for mislabelled files.
    fn open_range(&self) -> Result<Range<Data>> {
        let sheet = self.sheet.as_deref();
        let primary = match self.kind {
            WorkbookKind::Modern => open_workbook::<Xlsx<_>, _>(&self.file_path)
                .map_err(|e| e.to_string())
                .and_then(|wb| read_sheet(wb, sheet)),
            WorkbookKind::Legacy => open_workbook::<Xls<_>, _>(&self.file_path)
                .map_err(|e| e.to_string())
                .and_then(|wb| read_sheet(wb, sheet)),
        };

        match primary {
            Ok(range) => Ok(range),
            Err(primary_err) => {
                warn!(
                    path = %self.file_path.display(),
                    "Primary workbook reader failed ({primary_err}); sniffing file contents"
                );
                let bytes = std::fs::read(&self.file_path)?;
                open_workbook_auto_from_rs(Cursor::new(bytes))
                    .map_err(|e| e.to_string())
                    .and_then(|wb| read_sheet(wb, sheet))
                    .map_err(|e| {
                        ConvertError::malformed(format!(
                            "cannot read workbook {}: {e}",
                            self.file_path.display()
                        ))
                    })
            }
        }
    }
}

fn read_sheet<RS, R>(mut workbook: R, sheet: Option<&str>) -> std::result::Result<Range<Data>, String>
where
    RS: Read + Seek,
    R: Reader<RS>,
    R::Error: Display,
{
    match sheet {
        Some(name) => workbook.worksheet_range(name).map_err(|e| e.to_string()),
        None => workbook
            .worksheet_range_at(0)
            .ok_or_else(|| "workbook has no worksheets".to_string())?
            .map_err(|e| e.to_string()),
    }
}

impl SheetTable {
    fn from_range(range: &Range<Data>) -> Self {
        let mut rows = range.rows();
        let headers = rows
            .next()
            .map(|header| {
                header
                    .iter()
                    .enumerate()
                    .map(|(index, cell)| match cell {
                        Data::Empty => format!("Column_{index}"),
                        other => {
                            let text = cell_value(other).to_string();
                            if text.trim().is_empty() {
                                format!("Column_{index}")
                            } else {
                                text
                            }
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        let rows = rows.map(|row| row.iter().map(cell_value).collect()).collect();
        Self { headers, rows }
    }
}

/// Converts a cell, turning whole-number floats into integers and dates into
/// ISO-8601 text.
fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty | Data::Error(_) => Value::Null,
        Data::Int(i) => Value::Integer(*i),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
                Value::Integer(*f as i64)
            } else {
                Value::Float(*f)
            }
        }
        Data::Bool(b) => Value::Boolean(*b),
        Data::String(s) => Value::Text(s.clone()),
        Data::DateTime(dt) => excel_serial_to_text(dt.as_f64())
            .map(Value::Text)
            .unwrap_or(Value::Float(dt.as_f64())),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::Text(s.clone()),
    }
}

/// Excel serial day numbers count from 1899-12-30.
fn excel_serial_to_text(serial: f64) -> Option<String> {
    // 2_958_465 is 9999-12-31.
    if !serial.is_finite() || !(0.0..2_958_466.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    let stamp = epoch.checked_add_signed(Duration::milliseconds(millis))?;
    if serial.fract() == 0.0 {
        Some(stamp.format("%Y-%m-%d").to_string())
    } else {
        Some(stamp.format("%Y-%m-%d %H:%M:%S").to_string())
    }
}

impl FormatParser for SpreadsheetParser {
    fn format_name(&self) -> &'static str {
        match self.kind {
            WorkbookKind::Modern => "xlsx",
            WorkbookKind::Legacy => "xls",
        }
    }

    fn discover_schema(&mut self) -> Result<Schema> {
        if let Some(schema) = &self.schema {
            return Ok(schema.clone());
        }

        let table = self.load()?;
        let mut window = SampleWindow::new(table.headers.clone());
        for row in &table.rows {
            if window.is_full() {
                break;
            }
            window.observe(|i| row.get(i).cloned());
        }

        let schema = Schema::new(window.into_columns())?;
        self.schema = Some(schema.clone());
        Ok(schema)
    }

    fn estimate_row_count(&mut self) -> u64 {
        match self.load() {
            Ok(table) => table.rows.len() as u64,
            Err(e) => {
                warn!(path = %self.file_path.display(), "Could not count rows: {e}");
                0
            }
        }
    }

    fn batches(&mut self, batch_size: usize) -> Result<BatchIter<'_>> {
        let schema = self.discover_schema()?;
        let names: Vec<String> = schema.iter().map(|c| c.name.clone()).collect();
        let table = self.load()?;

        let records = table.rows.iter().map(move |row| {
            let mut record = Record::with_capacity(names.len());
            for (index, name) in names.iter().enumerate() {
                record.set_field(name.clone(), row.get(index).cloned().unwrap_or(Value::Null));
            }
            Ok(record)
        });
        Ok(chunk_records(records, batch_size))
    }

    fn release(&mut self) {
        self.table = None;
    }
}
