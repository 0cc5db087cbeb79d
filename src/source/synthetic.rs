use crate::core::traits::chunk_records;
use crate::core::{
    BatchIter, ColumnSchema, FormatParser, Record, Result, Schema, SemanticType, StorageType,
    Value,
};
use chrono::{Days, NaiveDate};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const NAMES: &[&str] = &[
    "Alice Johnson",
    "Bob Smith",
    "Carol Williams",
    "David Brown",
    "Eva Davis",
    "Frank Miller",
    "Grace Wilson",
    "Henry Moore",
    "Iris Taylor",
    "Jack Anderson",
];

const CATEGORIES: &[&str] = &["North", "South", "East", "West", "Central"];

/// Generates a fixed-shape demo dataset of any size.
///
/// Used for demo conversions and as the lenient-mode stand-in when a real
/// parser's backend is unavailable.
pub struct SyntheticParser {
    records: u64,
    seed: Option<u64>,
}

impl SyntheticParser {
    pub fn new(records: u64) -> Self {
        Self { records, seed: None }
    }

    /// Makes every pass produce the same values.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn schema() -> Result<Schema> {
        Schema::new(vec![
            ColumnSchema::new("id", SemanticType::Integer, StorageType::Integer),
            ColumnSchema::new("name", SemanticType::Text, StorageType::Text),
            ColumnSchema::new("email", SemanticType::Text, StorageType::Text),
            ColumnSchema::new("amount", SemanticType::Float, StorageType::Real),
            ColumnSchema::new("category", SemanticType::Text, StorageType::Text),
            ColumnSchema::new("date", SemanticType::Text, StorageType::Text),
            ColumnSchema::new("active", SemanticType::Boolean, StorageType::Integer),
        ])
    }
}

fn generate(rng: &mut StdRng, id: u64) -> Record {
    let base = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default();
    let date = base
        .checked_add_days(Days::new(rng.gen_range(0..=1000)))
        .unwrap_or(base);
    let amount = (rng.gen_range(100.0..50_000.0_f64) * 100.0).round() / 100.0;

    let mut record = Record::with_capacity(7);
    record.set_field("id", Value::Integer(id as i64));
    record.set_field(
        "name",
        Value::Text(NAMES.choose(rng).copied().unwrap_or_default().to_string()),
    );
    record.set_field("email", Value::Text(format!("user{id}@example.com")));
    record.set_field("amount", Value::Float(amount));
    record.set_field(
        "category",
        Value::Text(CATEGORIES.choose(rng).copied().unwrap_or_default().to_string()),
    );
    record.set_field("date", Value::Text(date.format("%Y-%m-%d").to_string()));
    record.set_field("active", Value::Boolean(rng.gen_bool(0.5)));
    record
}

impl FormatParser for SyntheticParser {
    fn format_name(&self) -> &'static str {
        "synthetic"
    }

    fn discover_schema(&mut self) -> Result<Schema> {
        Self::schema()
    }

    fn estimate_row_count(&mut self) -> u64 {
        self.records
    }

    fn batches(&mut self, batch_size: usize) -> Result<BatchIter<'_>> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let records = (1..=self.records).map(move |id| Ok(generate(&mut rng, id)));
        Ok(chunk_records(records, batch_size))
    }
}
