use crate::core::inference::{SampleWindow, SAMPLE_ROWS};
use crate::core::traits::chunk_records;
use crate::core::{BatchIter, ConvertError, FormatParser, Record, Result, Schema, Value};
use serde_json::Map;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

type JsonObject = Map<String, serde_json::Value>;

/// Parser for a JSON array of objects or newline-delimited JSON objects.
///
/// The layout is chosen from the first non-whitespace character. The file
/// is held in memory once loaded, so row counts are exact. Top-level entries
/// that are not objects are dropped.
pub struct JsonParser {
    file_path: PathBuf,
    objects: Option<Vec<JsonObject>>,
    schema: Option<Schema>,
}

impl JsonParser {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            objects: None,
            schema: None,
        }
    }

    fn load(&mut self) -> Result<&[JsonObject]> {
        if self.objects.is_none() {
            let text = std::fs::read_to_string(&self.file_path)?;
            let objects = parse_objects(&text)?;
            debug!(
                path = %self.file_path.display(),
                objects = objects.len(),
                "Loaded JSON source"
            );
            self.objects = Some(objects);
        }
        Ok(self.objects.as_deref().unwrap_or_default())
    }
}

fn parse_objects(text: &str) -> Result<Vec<JsonObject>> {
    let entries: Vec<serde_json::Value> = if text.trim_start().starts_with('[') {
        serde_json::from_str(text)?
    } else {
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str(line).map_err(|e| {
                    ConvertError::malformed(format!("invalid JSON on line {}: {e}", index + 1))
                })
            })
            .collect::<Result<_>>()?
    };

    Ok(entries
        .into_iter()
        .filter_map(|entry| match entry {
            serde_json::Value::Object(object) => Some(object),
            _ => None,
        })
        .collect())
}

impl FormatParser for JsonParser {
    fn format_name(&self) -> &'static str {
        "json"
    }

    fn discover_schema(&mut self) -> Result<Schema> {
        if let Some(schema) = &self.schema {
            return Ok(schema.clone());
        }

        let objects = self.load()?;
        let window_rows = &objects[..objects.len().min(SAMPLE_ROWS)];
        let keys: Vec<String> = window_rows
            .iter()
            .flat_map(|object| object.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut window = SampleWindow::new(keys.clone());
        for object in window_rows {
            window.observe(|i| object.get(&keys[i]).cloned().map(Value::from_json));
        }

        let schema = Schema::new(window.into_columns())?;
        self.schema = Some(schema.clone());
        Ok(schema)
    }

    fn estimate_row_count(&mut self) -> u64 {
        self.load().map(|objects| objects.len() as u64).unwrap_or(0)
    }

    fn batches(&mut self, batch_size: usize) -> Result<BatchIter<'_>> {
        let schema = self.discover_schema()?;
        let columns: HashMap<String, String> = schema
            .iter()
            .map(|c| (c.source_name.clone(), c.name.clone()))
            .collect();
        let objects = self.load()?;

        let records = objects.iter().map(move |object| {
            let mut record = Record::with_capacity(columns.len());
            for (key, value) in object {
                if let Some(name) = columns.get(key) {
                    record.set_field(name.clone(), Value::from_json(value.clone()));
                }
            }
            Ok(record)
        });
        Ok(chunk_records(records, batch_size))
    }

    fn release(&mut self) {
        self.objects = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SemanticType, StorageType};
    use std::io::Write;

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn reads_array_and_drops_non_objects() {
        let file = write_file(
            r#"  [{"id": 1, "tags": ["a"], "ok": true}, 42, {"id": 2, "meta": {"k": 1}}]"#,
        );
        let mut parser = JsonParser::new(file.path());
        let schema = parser.discover_schema().unwrap();

        assert_eq!(schema.column_names(), vec!["id", "meta", "ok", "tags"]);
        assert_eq!(schema.columns[0].storage_type, StorageType::Integer);
        assert_eq!(schema.columns[1].semantic_type, SemanticType::Json);
        assert_eq!(schema.columns[2].semantic_type, SemanticType::Boolean);
        assert_eq!(parser.estimate_row_count(), 2);

        let batch = parser.batches(10).unwrap().next().unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].value_or_null("tags"), &Value::Json(r#"["a"]"#.to_string()));
        assert_eq!(batch[1].value_or_null("meta"), &Value::Json(r#"{"k":1}"#.to_string()));
        assert!(batch[1].value_or_null("ok").is_null());
    }

    #[test]
    fn reads_newline_delimited_objects() {
        let file = write_file("{\"x\": 1.5}\n\n{\"x\": 2}\n{\"x\": 3}\n");
        let mut parser = JsonParser::new(file.path());
        let schema = parser.discover_schema().unwrap();
        assert_eq!(schema.columns[0].storage_type, StorageType::Real);

        let sizes: Vec<usize> = parser.batches(2).unwrap().map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[test]
    fn bad_line_is_file_level_error() {
        let file = write_file("{\"x\": 1}\nnot json\n");
        let mut parser = JsonParser::new(file.path());
        assert!(matches!(
            parser.discover_schema(),
            Err(ConvertError::MalformedSource(_))
        ));
    }

    #[test]
    fn empty_source_has_no_schema() {
        let file = write_file("[]");
        assert!(JsonParser::new(file.path()).discover_schema().is_err());
    }
}
