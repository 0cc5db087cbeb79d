//! Column type inference over a bounded sample window.
//!
//! Only the first [`SAMPLE_ROWS`] rows of a source are ever inspected, and
//! inference runs once per file. Later rows that violate the inferred type
//! are coerced (or stored as-is) by the destination rather than failing the
//! import, so heterogeneous columns may end up with a narrower type than
//! their full contents would justify.

use crate::core::record::strip_separators;
use crate::core::{ColumnSchema, SemanticType, StorageType, Value};

/// Rows sampled per file for inference.
pub const SAMPLE_ROWS: usize = 100;

/// Decides the semantic and storage type for a column from its samples.
///
/// Rules, first match wins:
/// 1. no non-blank samples: text
/// 2. every sample is an integer (thousands separators ignored): integer
/// 3. every sample is a number: float
/// 4. any native boolean: boolean
/// 5. any compound (JSON) value: json
/// 6. otherwise text
pub fn infer(samples: &[Value]) -> (SemanticType, StorageType) {
    let present: Vec<&Value> = samples.iter().filter(|v| !v.is_blank()).collect();

    if present.is_empty() {
        return (SemanticType::Text, StorageType::Text);
    }
    if present.iter().all(|v| is_integer(v)) {
        return (SemanticType::Integer, StorageType::Integer);
    }
    if present.iter().all(|v| is_number(v)) {
        return (SemanticType::Float, StorageType::Real);
    }
    if present.iter().any(|v| matches!(v, Value::Boolean(_))) {
        return (SemanticType::Boolean, StorageType::Integer);
    }
    if present.iter().any(|v| matches!(v, Value::Json(_))) {
        return (SemanticType::Json, StorageType::Text);
    }
    (SemanticType::Text, StorageType::Text)
}

fn is_integer(value: &Value) -> bool {
    match value {
        Value::Integer(_) => true,
        Value::Text(s) => strip_separators(s).parse::<i64>().is_ok(),
        _ => false,
    }
}

fn is_number(value: &Value) -> bool {
    match value {
        Value::Integer(_) | Value::Float(_) => true,
        Value::Text(s) => strip_separators(s).parse::<f64>().is_ok(),
        _ => false,
    }
}

/// Collects per-column samples while a parser walks its sample window.
#[derive(Debug, Default)]
pub struct SampleWindow {
    names: Vec<String>,
    samples: Vec<Vec<Value>>,
    rows: usize,
}

impl SampleWindow {
    pub fn new(names: Vec<String>) -> Self {
        let samples = vec![Vec::new(); names.len()];
        Self {
            names,
            samples,
            rows: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.rows >= SAMPLE_ROWS
    }

    /// Records one row; `value_at(i)` yields the cell for column `i`.
    pub fn observe<F>(&mut self, mut value_at: F)
    where
        F: FnMut(usize) -> Option<Value>,
    {
        if self.is_full() {
            return;
        }
        for (index, samples) in self.samples.iter_mut().enumerate() {
            if let Some(value) = value_at(index) {
                if !value.is_blank() {
                    samples.push(value);
                }
            }
        }
        self.rows += 1;
    }

    /// Infers one column per name, in order.
    pub fn into_columns(self) -> Vec<ColumnSchema> {
        self.names
            .into_iter()
            .zip(self.samples)
            .map(|(name, samples)| {
                let (semantic, storage) = infer(&samples);
                ColumnSchema::new(name, semantic, storage).with_samples(samples)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(values: &[&str]) -> Vec<Value> {
        values.iter().map(|s| Value::Text(s.to_string())).collect()
    }

    #[test]
    fn infers_from_text_samples() {
        assert_eq!(
            infer(&texts(&["1", "2", "3"])),
            (SemanticType::Integer, StorageType::Integer)
        );
        assert_eq!(
            infer(&texts(&["1.5", "2"])),
            (SemanticType::Float, StorageType::Real)
        );
        assert_eq!(
            infer(&texts(&["1", "abc"])),
            (SemanticType::Text, StorageType::Text)
        );
        assert_eq!(infer(&[]), (SemanticType::Text, StorageType::Text));
    }

    #[test]
    fn thousands_separators_and_blanks_are_ignored() {
        assert_eq!(
            infer(&texts(&["1,000", "", "2,500,000"])),
            (SemanticType::Integer, StorageType::Integer)
        );
        assert_eq!(
            infer(&texts(&["", "  "])),
            (SemanticType::Text, StorageType::Text)
        );
    }

    #[test]
    fn infers_from_native_values() {
        assert_eq!(
            infer(&[Value::Boolean(true), Value::Boolean(false)]),
            (SemanticType::Boolean, StorageType::Integer)
        );
        assert_eq!(
            infer(&[Value::Integer(1), Value::Float(2.5)]),
            (SemanticType::Float, StorageType::Real)
        );
        assert_eq!(
            infer(&[Value::Json("{}".to_string()), Value::Text("x".to_string())]),
            (SemanticType::Json, StorageType::Text)
        );
    }

    #[test]
    fn window_stops_after_sample_rows() {
        let mut window = SampleWindow::new(vec!["n".to_string()]);
        for i in 0..SAMPLE_ROWS {
            window.observe(|_| Some(Value::Text(i.to_string())));
        }
        window.observe(|_| Some(Value::Text("not a number".to_string())));

        let columns = window.into_columns();
        assert_eq!(columns[0].storage_type, StorageType::Integer);
        assert_eq!(columns[0].sample_values.len(), 5);
    }
}
