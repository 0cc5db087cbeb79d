//! Quick look at the first records of a source, with per-column statistics.

use crate::core::{FormatParser, Record, Result, Schema, StorageType, Value, MAX_SAMPLE_VALUES};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ColumnStats {
    pub name: String,
    pub storage_type: StorageType,
    pub null_count: usize,
    pub distinct_count: usize,
    pub sample_values: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub format: &'static str,
    pub schema: Schema,
    pub estimated_rows: u64,
    pub records: Vec<Record>,
    pub columns: Vec<ColumnStats>,
}

/// Reads at most `rows` records from a fresh pass over `parser`.
pub fn sample(parser: &mut dyn FormatParser, rows: usize) -> Result<Preview> {
    let schema = parser.discover_schema()?;
    let estimated_rows = parser.estimate_row_count();

    let mut records = Vec::with_capacity(rows.min(1024));
    if rows > 0 {
        for batch in parser.batches(rows)? {
            let batch = batch?;
            let room = rows - records.len();
            records.extend(batch.into_iter().take(room));
            if records.len() >= rows {
                break;
            }
        }
    }

    let columns = schema
        .iter()
        .map(|column| column_stats(&column.name, column.storage_type, &records))
        .collect();
    Ok(Preview {
        format: parser.format_name(),
        schema,
        estimated_rows,
        records,
        columns,
    })
}

fn column_stats(name: &str, storage_type: StorageType, records: &[Record]) -> ColumnStats {
    let mut null_count = 0;
    let mut distinct = HashSet::new();
    let mut sample_values = Vec::new();
    let mut numbers = Vec::new();

    for raw in records.iter().map(|r| r.value_or_null(name)) {
        let value = raw.coerce_for(storage_type);
        if value.is_null() {
            null_count += 1;
            continue;
        }
        if distinct.insert(value.to_string()) && sample_values.len() < MAX_SAMPLE_VALUES {
            sample_values.push(value.clone().into_owned());
        }
        if matches!(storage_type, StorageType::Integer | StorageType::Real) {
            if let Some(n) = value.as_f64() {
                numbers.push(n);
            }
        }
    }

    let (min, max, avg) = if numbers.is_empty() {
        (None, None, None)
    } else {
        let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
        let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = numbers.iter().sum::<f64>() / numbers.len() as f64;
        (Some(min), Some(max), Some(avg))
    };

    ColumnStats {
        name: name.to_string(),
        storage_type,
        null_count,
        distinct_count: distinct.len(),
        sample_values,
        min,
        max,
        avg,
    }
}
