//! YAML configuration with defaults for every setting.

use crate::core::{ConvertError, Result};
use crate::pipeline::DEFAULT_BATCH_SIZE;
use crate::queue::DEFAULT_MAX_CONCURRENT;
use crate::source::selector::DEFAULT_SYNTHETIC_RECORDS;
use crate::source::ParserSelector;
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Records per insert transaction.
    pub batch_size: usize,
    /// Jobs allowed to process at once.
    pub max_concurrent: usize,
    /// Bound on waiting jobs; unbounded when unset.
    pub max_queued: Option<usize>,
    /// Use synthetic data when a format's backend is unavailable.
    pub lenient: bool,
    pub synthetic_records: u64,
    pub database_dir: PathBuf,
    pub table_name: String,
    pub csv: CsvConfig,
    pub spreadsheet: SpreadsheetConfig,
    /// Overrides the per-format source size limits.
    pub max_file_size_bytes: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_queued: None,
            lenient: false,
            synthetic_records: DEFAULT_SYNTHETIC_RECORDS,
            database_dir: PathBuf::from("databases"),
            table_name: "converted_data".to_string(),
            csv: CsvConfig::default(),
            spreadsheet: SpreadsheetConfig::default(),
            max_file_size_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CsvConfig {
    pub delimiter: String,
    /// WHATWG encoding label.
    pub encoding: String,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            delimiter: ",".to_string(),
            encoding: "utf-8".to_string(),
        }
    }
}

impl CsvConfig {
    /// The delimiter as a single byte. `\t` and `tab` both mean a tab.
    pub fn delimiter_byte(&self) -> Result<u8> {
        match self.delimiter.as_str() {
            "\\t" | "tab" => Ok(b'\t'),
            d if d.len() == 1 => Ok(d.as_bytes()[0]),
            d => Err(ConvertError::Config(format!(
                "csv delimiter must be a single byte, got '{d}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SpreadsheetConfig {
    /// Worksheet to read; the first one when unset.
    pub sheet: Option<String>,
}

impl Config {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConvertError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)
            .map_err(|e| ConvertError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ConvertError::Config("batch_size must be positive".into()));
        }
        if self.max_concurrent == 0 {
            return Err(ConvertError::Config("max_concurrent must be positive".into()));
        }
        self.csv.delimiter_byte()?;
        if Encoding::for_label(self.csv.encoding.trim().as_bytes()).is_none() {
            return Err(ConvertError::Config(format!(
                "unknown csv encoding '{}'",
                self.csv.encoding
            )));
        }
        Ok(())
    }

    /// Parser selector carrying this configuration's format options.
    pub fn selector(&self) -> Result<ParserSelector> {
        ParserSelector::new()
            .lenient(self.lenient)
            .with_synthetic_records(self.synthetic_records)
            .with_delimiter(self.csv.delimiter_byte()?)
            .with_sheet(self.spreadsheet.sheet.clone())
            .with_encoding_label(&self.csv.encoding)
    }
}
