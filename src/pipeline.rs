use crate::core::{sanitize_table_name, Destination, FormatParser, Result, Schema};
use crate::progress::{ConversionProgress, ProgressObserver};
use tracing::{debug, error, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Columns that receive a secondary index after loading.
pub const MAX_INDEXED_COLUMNS: usize = 5;

/// Loads one parser's output into one destination table.
///
/// The pipeline is strictly sequential: schema discovery, table creation,
/// one transaction per batch, then indexing. A conversion cannot be resumed;
/// a failed run leaves every batch committed before the failure in place.
pub struct StreamingConverter<D: Destination> {
    destination: D,
    table_name: String,
    progress: ConversionProgress,
}

impl<D: Destination> StreamingConverter<D> {
    pub fn new(destination: D, table_name: &str) -> Self {
        Self {
            destination,
            table_name: sanitize_table_name(table_name),
            progress: ConversionProgress::pending(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Runs the conversion to a terminal state. Never returns an error: any
    /// failure is reported as an `error` progress.
    ///
    /// The observer sees one event per committed batch and a final terminal
    /// event. Both the destination and the parser are released on every path.
    pub fn convert(
        mut self,
        parser: &mut dyn FormatParser,
        batch_size: usize,
        observer: &mut dyn ProgressObserver,
        estimated_records: u64,
    ) -> ConversionProgress {
        self.progress.start(estimated_records);
        observer.on_started(&self.progress);
        info!(
            table = %self.table_name,
            format = parser.format_name(),
            estimated_records,
            "Starting conversion"
        );

        match self.run(parser, batch_size, observer) {
            Ok(()) => {
                self.progress.complete();
                info!(
                    table = %self.table_name,
                    records = self.progress.processed_records,
                    "Conversion completed"
                );
            }
            Err(e) => {
                error!(table = %self.table_name, error = ?e, "Conversion failed");
                self.progress.fail(e.to_string());
            }
        }

        parser.release();
        if let Err(e) = self.destination.close() {
            warn!(table = %self.table_name, "Failed to close destination: {e}");
        }

        observer.on_progress(&self.progress);
        self.progress
    }

    fn run(
        &mut self,
        parser: &mut dyn FormatParser,
        batch_size: usize,
        observer: &mut dyn ProgressObserver,
    ) -> Result<()> {
        let schema = parser.discover_schema()?;
        self.destination.recreate_table(&self.table_name, &schema)?;
        observer.on_schema(&schema);

        self.progress.message = "Inserting records...".to_string();
        for batch in parser.batches(batch_size.max(1))? {
            let batch = batch?;
            let inserted = self
                .destination
                .write_batch(&self.table_name, &schema, &batch)?;
            self.progress.advance(inserted as u64);
            debug!(
                table = %self.table_name,
                processed = self.progress.processed_records,
                "Committed batch of {inserted}"
            );
            observer.on_progress(&self.progress);
        }

        self.build_indexes(&schema);
        Ok(())
    }

    /// Indexes the first few indexable columns; individual failures are skipped.
    fn build_indexes(&mut self, schema: &Schema) {
        let candidates = schema
            .iter()
            .filter(|c| c.storage_type.is_indexable())
            .take(MAX_INDEXED_COLUMNS);
        for column in candidates {
            if let Err(e) = self.destination.create_index(&self.table_name, &column.name) {
                warn!(
                    table = %self.table_name,
                    column = %column.name,
                    "Skipping index: {e}"
                );
            }
        }
    }
}
