//! Native reader for the Alteryx `.yxdb` database format.
//!
//! A file is a 512-byte header, a UTF-16 XML field list, then a stream of
//! length-prefixed blocks that are either stored raw or LZF-compressed.
//! Records are packed back to back across block boundaries.

mod format;
mod lzf;

use self::format::{decode_field, decode_utf16le, FieldInfo, Header, HEADER_LEN};
use crate::core::inference::SAMPLE_ROWS;
use crate::core::traits::chunk_records;
use crate::core::{
    BatchIter, ColumnSchema, ConvertError, FormatParser, Record, Result, Schema, Value,
    MAX_SAMPLE_VALUES,
};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const UNCOMPRESSED_FLAG: u32 = 0x8000_0000;

pub struct YxdbParser {
    file_path: PathBuf,
    layout: Option<Layout>,
    schema: Option<Schema>,
}

#[derive(Debug, Clone)]
struct Layout {
    fields: Vec<FieldInfo>,
    record_count: u64,
    data_offset: u64,
    /// Start of each field within the fixed part of a record.
    offsets: Vec<usize>,
    fixed_size: usize,
    has_var: bool,
}

impl YxdbParser {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            layout: None,
            schema: None,
        }
    }

    fn layout(&mut self) -> Result<&Layout> {
        if self.layout.is_none() {
            let layout = read_layout(&self.file_path)?;
            debug!(
                path = %self.file_path.display(),
                fields = layout.fields.len(),
                records = layout.record_count,
                "Read yxdb header"
            );
            self.layout = Some(layout);
        }
        self.layout
            .as_ref()
            .ok_or_else(|| ConvertError::malformed("yxdb layout not loaded"))
    }

    fn records(&self, layout: &Layout, names: Vec<String>) -> Result<RecordIter> {
        let mut file = BufReader::new(File::open(&self.file_path)?);
        file.seek(SeekFrom::Start(layout.data_offset))?;
        Ok(RecordIter {
            blocks: BlockReader::new(file),
            layout: layout.clone(),
            names,
            remaining: layout.record_count,
            buffer: Vec::new(),
        })
    }
}

fn read_layout(path: &Path) -> Result<Layout> {
    let mut file = File::open(path)?;
    let mut header_bytes = vec![0u8; HEADER_LEN];
    file.read_exact(&mut header_bytes).map_err(truncated)?;
    let header = Header::parse(&header_bytes)?;

    if header.data_offset() > file.metadata()?.len() {
        return Err(ConvertError::malformed(
            "yxdb metadata length runs past the end of the file",
        ));
    }
    let mut meta = vec![0u8; header.meta_chars * 2];
    file.read_exact(&mut meta).map_err(truncated)?;
    let fields = format::parse_metadata(&decode_utf16le(&meta))?;

    let mut offsets = Vec::with_capacity(fields.len());
    let mut fixed_size: usize = 0;
    for field in &fields {
        offsets.push(fixed_size);
        fixed_size = field
            .field_type
            .fixed_width(field.size)
            .and_then(|width| fixed_size.checked_add(width))
            .ok_or_else(|| {
                ConvertError::malformed(format!("field '{}' overflows the record layout", field.name))
            })?;
    }
    let has_var = fields.iter().any(|f| f.field_type.is_variable());

    Ok(Layout {
        fields,
        record_count: header.record_count,
        data_offset: header.data_offset(),
        offsets,
        fixed_size,
        has_var,
    })
}

fn truncated(e: std::io::Error) -> ConvertError {
    if e.kind() == ErrorKind::UnexpectedEof {
        ConvertError::malformed("yxdb file is truncated")
    } else {
        ConvertError::Io(e)
    }
}

/// Serves bytes from the block stream, expanding one block at a time.
struct BlockReader<R> {
    inner: R,
    block: Vec<u8>,
    pos: usize,
}

impl<R: Read> BlockReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            block: Vec::new(),
            pos: 0,
        }
    }

    fn next_block(&mut self) -> Result<()> {
        let mut len_bytes = [0u8; 4];
        self.inner.read_exact(&mut len_bytes).map_err(truncated)?;
        let len = u32::from_le_bytes(len_bytes);

        self.block = if len & UNCOMPRESSED_FLAG != 0 {
            let mut raw = vec![0u8; (len & !UNCOMPRESSED_FLAG) as usize];
            self.inner.read_exact(&mut raw).map_err(truncated)?;
            raw
        } else {
            let mut packed = vec![0u8; len as usize];
            self.inner.read_exact(&mut packed).map_err(truncated)?;
            lzf::decompress(&packed, lzf::BLOCK_CAPACITY)?
        };
        self.pos = 0;
        Ok(())
    }

    /// Appends exactly `n` bytes to `out`.
    fn read_into(&mut self, out: &mut Vec<u8>, mut n: usize) -> Result<()> {
        while n > 0 {
            if self.pos >= self.block.len() {
                self.next_block()?;
                continue;
            }
            let take = n.min(self.block.len() - self.pos);
            out.extend_from_slice(&self.block[self.pos..self.pos + take]);
            self.pos += take;
            n -= take;
        }
        Ok(())
    }
}

struct RecordIter {
    blocks: BlockReader<BufReader<File>>,
    layout: Layout,
    names: Vec<String>,
    remaining: u64,
    buffer: Vec<u8>,
}

impl RecordIter {
    fn read_record(&mut self) -> Result<Record> {
        self.buffer.clear();
        self.blocks.read_into(&mut self.buffer, self.layout.fixed_size)?;
        if self.layout.has_var {
            self.blocks.read_into(&mut self.buffer, 4)?;
            let at = self.layout.fixed_size;
            let var_len = u32::from_le_bytes([
                self.buffer[at],
                self.buffer[at + 1],
                self.buffer[at + 2],
                self.buffer[at + 3],
            ]);
            self.blocks.read_into(&mut self.buffer, var_len as usize)?;
        }

        let mut record = Record::with_capacity(self.names.len());
        let fields = self.layout.fields.iter().zip(&self.layout.offsets);
        for ((field, &start), name) in fields.zip(&self.names) {
            let value = decode_field(field, &self.buffer, start).unwrap_or_else(|_| {
                debug!(field = %field.name, "Unreadable field value stored as null");
                Value::Null
            });
            record.set_field(name.clone(), value);
        }
        Ok(record)
    }
}

impl Iterator for RecordIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let record = self.read_record();
        if record.is_err() {
            // The stream position is lost after a bad block.
            self.remaining = 0;
        }
        Some(record)
    }
}

impl FormatParser for YxdbParser {
    fn format_name(&self) -> &'static str {
        "yxdb"
    }

    fn discover_schema(&mut self) -> Result<Schema> {
        if let Some(schema) = &self.schema {
            return Ok(schema.clone());
        }

        let layout = self.layout()?.clone();
        let columns = layout
            .fields
            .iter()
            .map(|f| {
                let size = u32::try_from(f.size).ok().filter(|s| *s > 0);
                ColumnSchema::new(
                    f.name.as_str(),
                    f.field_type.semantic_type(),
                    f.field_type.storage_type(),
                )
                .with_source_type(f.field_type.tag(), size)
            })
            .collect();
        let mut schema = Schema::new(columns)?;

        // Types come from the header; the sample window only supplies examples.
        let names = schema.column_names().into_iter().map(String::from).collect();
        let mut samples: Vec<Vec<Value>> = vec![Vec::new(); schema.len()];
        for record in self.records(&layout, names)?.take(SAMPLE_ROWS) {
            // A damaged stream is reported by the conversion pass itself.
            let Ok(record) = record else { break };
            for (column, kept) in schema.columns.iter().zip(samples.iter_mut()) {
                let value = record.value_or_null(&column.name);
                if kept.len() < MAX_SAMPLE_VALUES && !value.is_blank() {
                    kept.push(value.clone());
                }
            }
        }
        for (column, kept) in schema.columns.iter_mut().zip(samples) {
            column.sample_values = kept;
        }

        self.schema = Some(schema.clone());
        Ok(schema)
    }

    fn estimate_row_count(&mut self) -> u64 {
        match self.layout() {
            Ok(layout) => layout.record_count,
            Err(e) => {
                warn!(path = %self.file_path.display(), "Could not read record count: {e}");
                0
            }
        }
    }

    fn batches(&mut self, batch_size: usize) -> Result<BatchIter<'_>> {
        let schema = self.discover_schema()?;
        let names = schema.iter().map(|c| c.name.clone()).collect();
        let layout = self.layout()?.clone();
        let records = self.records(&layout, names)?;
        Ok(chunk_records(records, batch_size))
    }

    fn release(&mut self) {
        self.layout = None;
    }
}
