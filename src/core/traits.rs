use crate::core::{Batch, Record, Result, Schema};
use std::fmt;

/// Lazy, forward-only sequence of batches from one pass over a source.
///
/// A pass cannot be restarted; call [`FormatParser::batches`] again for a
/// fresh pass from the first data row.
pub type BatchIter<'a> = Box<dyn Iterator<Item = Result<Batch>> + Send + 'a>;

/// Uniform contract shared by every source format.
///
/// Passes borrow the parser mutably, so two passes over one parser can
/// never run at the same time.
pub trait FormatParser: Send {
    /// Short human name of the format, used in logs.
    fn format_name(&self) -> &'static str;

    /// Reads the header and the sample window. Cached after the first call.
    fn discover_schema(&mut self) -> Result<Schema>;

    /// Best-effort row count. `0` means unknown, not empty.
    fn estimate_row_count(&mut self) -> u64;

    /// Starts a fresh pass producing batches of at most `batch_size` records.
    fn batches(&mut self, batch_size: usize) -> Result<BatchIter<'_>>;

    /// Releases any open source handle. Safe to call more than once.
    fn release(&mut self) {}
}

/// Relational store a conversion loads into.
pub trait Destination: Send {
    /// Drops any table with this name and creates it from `schema`, plus the
    /// row-id and import-timestamp bookkeeping columns.
    fn recreate_table(&mut self, table: &str, schema: &Schema) -> Result<()>;

    /// Inserts `batch` in a single transaction and returns the rows written.
    fn write_batch(&mut self, table: &str, schema: &Schema, batch: &[Record]) -> Result<usize>;

    fn create_index(&mut self, table: &str, column: &str) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Outcome of probing an optional parsing backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Available,
    Unavailable { reason: String },
}

impl Capability {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Capability::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Available => write!(f, "available"),
            Capability::Unavailable { reason } => write!(f, "unavailable: {reason}"),
        }
    }
}

/// Splits a record iterator into batches, passing errors through.
pub(crate) fn chunk_records<'a, I>(records: I, batch_size: usize) -> BatchIter<'a>
where
    I: Iterator<Item = Result<Record>> + Send + 'a,
{
    let batch_size = batch_size.max(1);
    let mut records = records.fuse();
    Box::new(std::iter::from_fn(move || {
        let mut batch = Vec::with_capacity(batch_size.min(4096));
        for item in records.by_ref() {
            match item {
                Ok(record) => {
                    batch.push(record);
                    if batch.len() >= batch_size {
                        return Some(Ok(batch));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
        if batch.is_empty() { None } else { Some(Ok(batch)) }
    }))
}
