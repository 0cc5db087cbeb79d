use crate::core::{
    quote_identifier, ConvertError, Destination, Record, Result, Schema, Value,
    IMPORTED_AT_COLUMN, ROW_ID_COLUMN,
};
use chrono::Utc;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tracing::debug;

/// SQLite database file used as a conversion destination.
///
/// The connection is owned by one conversion and closed when it finishes.
pub struct SqliteDestination {
    path: PathBuf,
    conn: Option<Connection>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TableColumn {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TableInfo {
    pub table_name: String,
    pub columns: Vec<TableColumn>,
    pub row_count: u64,
    pub db_size_bytes: u64,
}

impl SqliteDestination {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute_batch(
            "PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=MEMORY;
             PRAGMA cache_size=-64000;",
        )?;
        debug!(path = %path.display(), "Opened destination database");
        Ok(Self {
            path,
            conn: Some(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connection(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| ConvertError::Conversion("destination is closed".to_string()))
    }

    fn connection_mut(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| ConvertError::Conversion("destination is closed".to_string()))
    }

    /// Describes a table: columns (bookkeeping included), rows and file size.
    pub fn table_info(&self, table: &str) -> Result<TableInfo> {
        let conn = self.connection()?;
        let quoted = quote_identifier(table);

        let mut stmt = conn.prepare(&format!("PRAGMA table_info({quoted})"))?;
        let columns = stmt
            .query_map([], |row| {
                Ok(TableColumn {
                    name: row.get(1)?,
                    sql_type: row.get(2)?,
                    nullable: row.get::<_, i64>(3)? == 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if columns.is_empty() {
            return Err(ConvertError::NotFound(format!("table {table}")));
        }

        let row_count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {quoted}"), [], |row| row.get(0))?;

        Ok(TableInfo {
            table_name: table.to_string(),
            columns,
            row_count: u64::try_from(row_count).unwrap_or_default(),
            db_size_bytes: database_size(&self.path),
        })
    }
}

impl Destination for SqliteDestination {
    fn recreate_table(&mut self, table: &str, schema: &Schema) -> Result<()> {
        let quoted = quote_identifier(table);
        let mut columns: Vec<String> = schema
            .iter()
            .map(|c| format!("{} {}", quote_identifier(&c.name), c.storage_type.as_sql()))
            .collect();
        columns.push(format!(
            "{} INTEGER PRIMARY KEY AUTOINCREMENT",
            quote_identifier(ROW_ID_COLUMN)
        ));
        columns.push(format!("{} TEXT", quote_identifier(IMPORTED_AT_COLUMN)));

        let sql = format!(
            "DROP TABLE IF EXISTS {quoted};\nCREATE TABLE {quoted} ({});",
            columns.join(", ")
        );
        debug!(table, "Recreating destination table");
        self.connection()?.execute_batch(&sql)?;
        Ok(())
    }

    fn write_batch(&mut self, table: &str, schema: &Schema, batch: &[Record]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut names: Vec<String> = schema.iter().map(|c| quote_identifier(&c.name)).collect();
        names.push(quote_identifier(IMPORTED_AT_COLUMN));
        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote_identifier(table),
            names.join(", ")
        );
        let imported_at = Value::Text(Utc::now().to_rfc3339());

        let conn = self.connection_mut()?;
        // Dropping the transaction without commit rolls the whole batch back.
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for record in batch {
                let values: Vec<Cow<'_, Value>> = schema
                    .iter()
                    .map(|c| record.value_or_null(&c.name).coerce_for(c.storage_type))
                    .collect();
                stmt.execute(params_from_iter(
                    values
                        .iter()
                        .map(|v| v.as_ref())
                        .chain(std::iter::once(&imported_at)),
                ))?;
            }
        }
        tx.commit()?;
        Ok(batch.len())
    }

    fn create_index(&mut self, table: &str, column: &str) -> Result<()> {
        let index = format!("idx_{table}_{column}");
        self.connection()?.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_identifier(&index),
                quote_identifier(table),
                quote_identifier(column)
            ),
            [],
        )?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| ConvertError::Store(e))?;
        }
        Ok(())
    }
}

/// Size of a database file plus its WAL sidecar, if any.
pub fn database_size(path: &Path) -> u64 {
    sidecar_paths(path)
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum()
}

/// Removes a database file and its WAL/SHM sidecars. Missing files are ignored.
pub fn remove_database(path: &Path) -> Result<()> {
    for file in sidecar_paths(path) {
        match std::fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn sidecar_paths(path: &Path) -> [PathBuf; 3] {
    let with_suffix = |suffix: &str| {
        let mut os = path.as_os_str().to_os_string();
        os.push(suffix);
        PathBuf::from(os)
    };
    [path.to_path_buf(), with_suffix("-wal"), with_suffix("-shm")]
}
