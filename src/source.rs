pub mod csv;
pub mod json;
pub mod selector;
#[cfg(feature = "excel")]
pub mod spreadsheet;
pub mod synthetic;
#[cfg(feature = "yxdb")]
pub mod yxdb;

pub use self::csv::CsvParser;
pub use self::json::JsonParser;
pub use self::selector::{Capabilities, ParserSelector, SourceFormat};
#[cfg(feature = "excel")]
pub use self::spreadsheet::{SpreadsheetParser, WorkbookKind};
pub use self::synthetic::SyntheticParser;
#[cfg(feature = "yxdb")]
pub use self::yxdb::YxdbParser;
