use crate::core::{ConvertError, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Bookkeeping columns appended to every destination table.
pub const ROW_ID_COLUMN: &str = "_row_id";
pub const IMPORTED_AT_COLUMN: &str = "_imported_at";

/// Sample values kept on a column for display.
pub const MAX_SAMPLE_VALUES: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Integer,
    Float,
    Boolean,
    Text,
    Binary,
    Json,
}

/// SQL storage class of a destination column.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageType {
    Integer,
    Real,
    Text,
    Blob,
}

impl StorageType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            StorageType::Integer => "INTEGER",
            StorageType::Real => "REAL",
            StorageType::Text => "TEXT",
            StorageType::Blob => "BLOB",
        }
    }

    /// Storage classes that get a secondary lookup index after loading.
    pub fn is_indexable(&self) -> bool {
        !matches!(self, StorageType::Blob)
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ColumnSchema {
    /// Sanitized, schema-unique destination column name. Records are keyed by it.
    pub name: String,
    /// Name as it appears in the source file.
    pub source_name: String,
    pub semantic_type: SemanticType,
    pub storage_type: StorageType,
    /// Type tag declared by the source format, when it has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    pub sample_values: Vec<Value>,
}

impl ColumnSchema {
    pub fn new(
        source_name: impl Into<String>,
        semantic_type: SemanticType,
        storage_type: StorageType,
    ) -> Self {
        let source_name = source_name.into();
        Self {
            name: sanitize_identifier(&source_name),
            source_name,
            semantic_type,
            storage_type,
            source_type: None,
            size: None,
            sample_values: Vec::new(),
        }
    }

    pub fn with_source_type(mut self, source_type: impl Into<String>, size: Option<u32>) -> Self {
        self.source_type = Some(source_type.into());
        self.size = size;
        self
    }

    pub fn with_samples(mut self, mut samples: Vec<Value>) -> Self {
        samples.truncate(MAX_SAMPLE_VALUES);
        self.sample_values = samples;
        self
    }
}

/// Ordered column list discovered from one source file.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Schema {
    pub columns: Vec<ColumnSchema>,
}

impl Schema {
    /// Builds a schema, making every column name a unique SQL identifier.
    ///
    /// Names are compared case-insensitively and may not shadow the
    /// bookkeeping columns; clashes get a numeric suffix.
    pub fn new(mut columns: Vec<ColumnSchema>) -> Result<Self> {
        if columns.is_empty() {
            return Err(ConvertError::malformed("source has no columns"));
        }

        let mut seen: HashSet<String> = [ROW_ID_COLUMN, IMPORTED_AT_COLUMN]
            .iter()
            .map(|s| s.to_string())
            .collect();

        for (index, column) in columns.iter_mut().enumerate() {
            let mut base = sanitize_identifier(&column.source_name);
            if base.is_empty() {
                base = format!("column_{}", index + 1);
            }
            let mut candidate = base.clone();
            let mut suffix = 2;
            while !seen.insert(candidate.to_ascii_lowercase()) {
                candidate = format!("{base}_{suffix}");
                suffix += 1;
            }
            column.name = candidate;
        }

        Ok(Self { columns })
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.columns.iter()
    }
}

/// Replaces every character that is not a letter, digit or `_` with `_`, and
/// prefixes a single `_` when the result starts with a digit. Letters and
/// digits from any script are kept.
///
/// Applying it twice gives the same result as applying it once.
pub fn sanitize_identifier(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if sanitized.starts_with(|c: char| c.is_numeric()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

/// Sanitizes a table name, falling back to `data` when nothing survives.
pub fn sanitize_table_name(name: &str) -> String {
    let sanitized = sanitize_identifier(name);
    if sanitized.is_empty() {
        "data".to_string()
    } else {
        sanitized
    }
}

/// Quotes an identifier for use in SQL text.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_column(name: &str) -> ColumnSchema {
        ColumnSchema::new(name, SemanticType::Text, StorageType::Text)
    }

    #[test]
    fn sanitization_is_idempotent() {
        assert_eq!(sanitize_identifier("Order #"), "Order__");
        assert_eq!(sanitize_identifier("Order__"), "Order__");
        assert_eq!(sanitize_identifier("2024 sales"), "_2024_sales");
        assert_eq!(sanitize_identifier("_2024_sales"), "_2024_sales");
        assert_eq!(sanitize_table_name("%%"), "__");
        assert_eq!(sanitize_table_name(""), "data");
    }

    #[test]
    fn non_latin_names_survive() {
        let schema = Schema::new(vec![
            text_column("名前"),
            text_column("住所"),
            text_column("Straße"),
            text_column("Größe (cm)"),
            text_column("2024年 売上"),
        ])
        .unwrap();

        assert_eq!(
            schema.column_names(),
            vec!["名前", "住所", "Straße", "Größe__cm_", "_2024年_売上"]
        );
        assert_eq!(sanitize_identifier("Straße"), "Straße");
    }

    #[test]
    fn colliding_names_are_made_unique() {
        let schema = Schema::new(vec![
            text_column("a b"),
            text_column("a_b"),
            text_column("A-B"),
            text_column("_row_id"),
            text_column(""),
        ])
        .unwrap();

        assert_eq!(
            schema.column_names(),
            vec!["a_b", "a_b_2", "A_B_3", "_row_id_2", "column_5"]
        );
        assert_eq!(schema.columns[0].source_name, "a b");
    }

    #[test]
    fn empty_schema_is_rejected() {
        assert!(matches!(
            Schema::new(Vec::new()),
            Err(ConvertError::MalformedSource(_))
        ));
    }

    #[test]
    fn samples_are_truncated() {
        let column = text_column("x").with_samples((0..10).map(Value::Integer).collect());
        assert_eq!(column.sample_values.len(), MAX_SAMPLE_VALUES);
    }
}
