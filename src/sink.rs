pub mod sqlite;

pub use self::sqlite::{SqliteDestination, TableColumn, TableInfo};
