use crate::core::inference::SampleWindow;
use crate::core::traits::chunk_records;
use crate::core::{BatchIter, ConvertError, FormatParser, Record, Result, Schema, Value};
use encoding_rs::{Encoding, UTF_8};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Delimited text parser.
///
/// Bytes are decoded with the configured encoding and invalid sequences are
/// replaced, never rejected. Short rows read their missing trailing fields
/// as null; extra fields are ignored.
pub struct CsvParser {
    file_path: PathBuf,
    delimiter: u8,
    encoding: &'static Encoding,
    schema: Option<Schema>,
    row_count: Option<u64>,
}

impl CsvParser {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            delimiter: b',',
            encoding: UTF_8,
            schema: None,
            row_count: None,
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Looks up an encoding by its WHATWG label, e.g. `utf-8` or `latin1`.
    pub fn with_encoding_label(self, label: &str) -> Result<Self> {
        let encoding = Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| ConvertError::Config(format!("unknown text encoding '{label}'")))?;
        Ok(self.with_encoding(encoding))
    }

    fn open_reader(&self) -> Result<csv::Reader<BufReader<File>>> {
        let file = File::open(&self.file_path)?;
        Ok(csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(BufReader::new(file)))
    }

    fn count_lines(&self) -> Result<u64> {
        let mut reader = BufReader::new(File::open(&self.file_path)?);
        let mut buf = [0u8; 64 * 1024];
        let mut lines = 0u64;
        let mut last = None;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            lines += buf[..n].iter().filter(|b| **b == b'\n').count() as u64;
            last = Some(buf[n - 1]);
        }
        if matches!(last, Some(b) if b != b'\n') {
            lines += 1;
        }
        Ok(lines)
    }
}

fn decode_field(encoding: &'static Encoding, bytes: &[u8]) -> String {
    let (text, _had_errors) = encoding.decode_without_bom_handling(bytes);
    text.into_owned()
}

fn decode_headers(encoding: &'static Encoding, headers: &csv::ByteRecord) -> Vec<String> {
    headers
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            let raw = if index == 0 {
                raw.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(raw)
            } else {
                raw
            };
            decode_field(encoding, raw).trim().to_string()
        })
        .collect()
}

impl FormatParser for CsvParser {
    fn format_name(&self) -> &'static str {
        "csv"
    }

    fn discover_schema(&mut self) -> Result<Schema> {
        if let Some(schema) = &self.schema {
            return Ok(schema.clone());
        }

        let mut reader = self.open_reader()?;
        let headers = decode_headers(self.encoding, reader.byte_headers()?);
        if headers.iter().all(|h| h.is_empty()) {
            return Err(ConvertError::malformed(format!(
                "{} has no header row",
                self.file_path.display()
            )));
        }

        let mut window = SampleWindow::new(headers);
        let mut row = csv::ByteRecord::new();
        while !window.is_full() && reader.read_byte_record(&mut row)? {
            window.observe(|i| row.get(i).map(|raw| Value::Text(decode_field(self.encoding, raw))));
        }

        let schema = Schema::new(window.into_columns())?;
        self.schema = Some(schema.clone());
        Ok(schema)
    }

    fn estimate_row_count(&mut self) -> u64 {
        if let Some(count) = self.row_count {
            return count;
        }
        match self.count_lines() {
            Ok(lines) => {
                let count = lines.saturating_sub(1);
                self.row_count = Some(count);
                count
            }
            Err(e) => {
                warn!(path = %self.file_path.display(), "Could not count rows: {e}");
                0
            }
        }
    }

    fn batches(&mut self, batch_size: usize) -> Result<BatchIter<'_>> {
        let schema = self.discover_schema()?;
        let names: Vec<String> = schema.iter().map(|c| c.name.clone()).collect();
        let encoding = self.encoding;
        let reader = self.open_reader()?;

        let records = reader.into_byte_records().map(move |row| -> Result<Record> {
            let row = row?;
            let mut record = Record::with_capacity(names.len());
            for (index, name) in names.iter().enumerate() {
                let value = row
                    .get(index)
                    .map(|raw| Value::Text(decode_field(encoding, raw)))
                    .unwrap_or(Value::Null);
                record.set_field(name.clone(), value);
            }
            Ok(record)
        });
        Ok(chunk_records(records, batch_size))
    }
}
