use crate::core::{Capability, ConvertError, FormatParser, Result};
use crate::source::csv::CsvParser;
use crate::source::json::JsonParser;
use crate::source::synthetic::SyntheticParser;
use encoding_rs::{Encoding, UTF_8};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

const GIB: u64 = 1 << 30;

/// Record count the synthetic fallback produces unless told otherwise.
pub const DEFAULT_SYNTHETIC_RECORDS: u64 = 50_000;

/// Source formats the converter accepts, keyed by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    Yxdb,
    Csv,
    Xlsx,
    Xls,
    Json,
}

impl SourceFormat {
    pub const ALL: [SourceFormat; 5] = [
        SourceFormat::Yxdb,
        SourceFormat::Csv,
        SourceFormat::Xlsx,
        SourceFormat::Xls,
        SourceFormat::Json,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            SourceFormat::Yxdb => "yxdb",
            SourceFormat::Csv => "csv",
            SourceFormat::Xlsx => "xlsx",
            SourceFormat::Xls => "xls",
            SourceFormat::Json => "json",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SourceFormat::Yxdb => "Alteryx Database",
            SourceFormat::Csv => "Comma-Separated Values",
            SourceFormat::Xlsx => "Excel Workbook",
            SourceFormat::Xls => "Excel 97-2003",
            SourceFormat::Json => "JSON",
        }
    }

    /// Largest source file accepted for this format.
    pub fn max_file_size(&self) -> u64 {
        match self {
            SourceFormat::Yxdb | SourceFormat::Csv => 50 * GIB,
            _ => 20 * GIB,
        }
    }

    /// Matches the extension case-insensitively.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        Self::ALL
            .into_iter()
            .find(|format| format.extension() == extension)
            .ok_or_else(|| ConvertError::UnsupportedFormat {
                extension: if extension.is_empty() {
                    "(none)".to_string()
                } else {
                    format!(".{extension}")
                },
                supported: Self::supported_list(),
            })
    }

    pub fn supported_list() -> String {
        Self::ALL
            .iter()
            .map(|f| format!(".{} ({})", f.extension(), f.display_name()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Fails with `FileTooLarge` when the file exceeds `limit`, or this
    /// format's own limit when none is given. Returns the file size.
    pub fn check_file_size(&self, path: &Path, limit: Option<u64>) -> Result<u64> {
        let size = std::fs::metadata(path)?.len();
        let limit = limit.unwrap_or_else(|| self.max_file_size());
        if size > limit {
            return Err(ConvertError::FileTooLarge {
                path: path.display().to_string(),
                size,
                limit,
            });
        }
        Ok(size)
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Probe results for the optional parsing backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub yxdb: Capability,
    pub spreadsheet: Capability,
}

impl Capabilities {
    /// Reports which backends this build was compiled with.
    pub fn probe() -> Self {
        let yxdb = if cfg!(feature = "yxdb") {
            Capability::Available
        } else {
            Capability::unavailable("built without the `yxdb` feature")
        };
        let spreadsheet = if cfg!(feature = "excel") {
            Capability::Available
        } else {
            Capability::unavailable("built without the `excel` feature")
        };
        Self { yxdb, spreadsheet }
    }

    pub fn for_format(&self, format: SourceFormat) -> Capability {
        match format {
            SourceFormat::Yxdb => self.yxdb.clone(),
            SourceFormat::Xlsx | SourceFormat::Xls => self.spreadsheet.clone(),
            SourceFormat::Csv | SourceFormat::Json => Capability::Available,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::probe()
    }
}

fn component(format: SourceFormat) -> &'static str {
    match format {
        SourceFormat::Yxdb => "yxdb reader",
        SourceFormat::Xlsx | SourceFormat::Xls => "spreadsheet reader (calamine)",
        SourceFormat::Csv => "csv reader",
        SourceFormat::Json => "json reader",
    }
}

/// Builds the parser for a source file.
///
/// When a format's backend is unavailable the selector either falls back to
/// the synthetic generator (lenient) or fails with `MissingDependency`.
#[derive(Debug, Clone)]
pub struct ParserSelector {
    capabilities: Capabilities,
    lenient: bool,
    synthetic_records: u64,
    delimiter: u8,
    encoding: &'static Encoding,
    sheet: Option<String>,
}

impl Default for ParserSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl ParserSelector {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::probe(),
            lenient: false,
            synthetic_records: DEFAULT_SYNTHETIC_RECORDS,
            delimiter: b',',
            encoding: UTF_8,
            sheet: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    pub fn with_synthetic_records(mut self, records: u64) -> Self {
        self.synthetic_records = records;
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_encoding_label(mut self, label: &str) -> Result<Self> {
        self.encoding = Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| ConvertError::Config(format!("unknown text encoding '{label}'")))?;
        Ok(self)
    }

    pub fn with_sheet(mut self, sheet: Option<String>) -> Self {
        self.sheet = sheet;
        self
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn is_lenient(&self) -> bool {
        self.lenient
    }

    /// Resolves the format and applies the capability policy without
    /// constructing anything. `Ok(false)` means the synthetic fallback will
    /// stand in for the real parser.
    pub fn check(&self, path: &Path) -> Result<(SourceFormat, bool)> {
        let format = SourceFormat::from_path(path)?;
        match self.capabilities.for_format(format) {
            Capability::Available => Ok((format, true)),
            Capability::Unavailable { reason } if !self.lenient => {
                Err(ConvertError::MissingDependency {
                    component: component(format).to_string(),
                    reason,
                })
            }
            Capability::Unavailable { .. } => Ok((format, false)),
        }
    }

    pub fn select(&self, path: &Path) -> Result<Box<dyn FormatParser>> {
        let (format, available) = self.check(path)?;
        if !available {
            warn!(
                path = %path.display(),
                component = component(format),
                records = self.synthetic_records,
                "Parser backend unavailable; using synthetic data"
            );
            return Ok(self.synthetic(self.synthetic_records));
        }

        info!(path = %path.display(), %format, "Selected parser");
        match format {
            SourceFormat::Csv => Ok(Box::new(
                CsvParser::new(path)
                    .with_delimiter(self.delimiter)
                    .with_encoding(self.encoding),
            )),
            SourceFormat::Json => Ok(Box::new(JsonParser::new(path))),
            SourceFormat::Yxdb => self.yxdb(path),
            SourceFormat::Xlsx => self.spreadsheet(path, false),
            SourceFormat::Xls => self.spreadsheet(path, true),
        }
    }

    pub fn synthetic(&self, records: u64) -> Box<dyn FormatParser> {
        Box::new(SyntheticParser::new(records))
    }

    #[cfg(feature = "yxdb")]
    fn yxdb(&self, path: &Path) -> Result<Box<dyn FormatParser>> {
        Ok(Box::new(crate::source::yxdb::YxdbParser::new(path)))
    }

    #[cfg(not(feature = "yxdb"))]
    fn yxdb(&self, _path: &Path) -> Result<Box<dyn FormatParser>> {
        Err(ConvertError::MissingDependency {
            component: component(SourceFormat::Yxdb).to_string(),
            reason: "built without the `yxdb` feature".to_string(),
        })
    }

    #[cfg(feature = "excel")]
    fn spreadsheet(&self, path: &Path, legacy: bool) -> Result<Box<dyn FormatParser>> {
        use crate::source::spreadsheet::{SpreadsheetParser, WorkbookKind};

        let kind = if legacy {
            WorkbookKind::Legacy
        } else {
            WorkbookKind::Modern
        };
        let parser = SpreadsheetParser::new(path, kind);
        Ok(match &self.sheet {
            Some(sheet) => Box::new(parser.with_sheet(sheet.clone())),
            None => Box::new(parser),
        })
    }

    #[cfg(not(feature = "excel"))]
    fn spreadsheet(&self, _path: &Path, _legacy: bool) -> Result<Box<dyn FormatParser>> {
        Err(ConvertError::MissingDependency {
            component: component(SourceFormat::Xlsx).to_string(),
            reason: "built without the `excel` feature".to_string(),
        })
    }
}
