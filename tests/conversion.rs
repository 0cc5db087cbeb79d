use dconvert::source::selector::Capabilities;
use dconvert::source::{CsvParser, SyntheticParser};
use dconvert::{
    Capability, ConversionProgress, ConvertError, FormatParser, ParserSelector, ProgressStatus,
    SqliteDestination, StorageType, StreamingConverter,
};
use rusqlite::Connection;
use std::io::Write;
use std::path::Path;

fn run(
    parser: &mut dyn FormatParser,
    db: &Path,
    table: &str,
    batch_size: usize,
) -> (ConversionProgress, Vec<ConversionProgress>) {
    let mut events = Vec::new();
    let estimated = parser.estimate_row_count();
    let destination = SqliteDestination::open(db).unwrap();
    let mut observer = |p: &ConversionProgress| events.push(p.clone());
    let result =
        StreamingConverter::new(destination, table).convert(parser, batch_size, &mut observer, estimated);
    (result, events)
}

fn write_csv(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

#[test]
fn synthetic_source_reports_each_batch_then_completion() {
    let dir = tempfile::tempdir().unwrap();
    let mut parser = SyntheticParser::new(50_000);
    let (result, events) = run(&mut parser, &dir.path().join("demo.db"), "demo", 10_000);

    assert_eq!(events.len(), 6);
    let processed: Vec<u64> = events[..5].iter().map(|e| e.processed_records).collect();
    assert_eq!(processed, vec![10_000, 20_000, 30_000, 40_000, 50_000]);
    assert!(events[..5].iter().all(|e| e.status == ProgressStatus::Processing));
    assert!(events[..5].iter().all(|e| e.percentage <= 99.9));
    assert!(events.windows(2).all(|w| w[0].percentage <= w[1].percentage));

    let last = &events[5];
    assert_eq!(last.status, ProgressStatus::Completed);
    assert_eq!(last.percentage, 100.0);
    assert_eq!(last.total_records, 50_000);
    assert_eq!(result, *last);
}

#[test]
fn destination_table_has_bookkeeping_columns_and_indexes() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("demo.db");
    let mut parser = SyntheticParser::new(20).with_seed(1);
    let (result, _) = run(&mut parser, &db, "people", 7);
    assert_eq!(result.status, ProgressStatus::Completed);

    let info = SqliteDestination::open(&db).unwrap().table_info("people").unwrap();
    let names: Vec<&str> = info.columns.iter().map(|c| c.name.as_str()).collect();
    assert!(names.contains(&"_row_id"));
    assert!(names.contains(&"_imported_at"));
    assert_eq!(info.row_count, 20);

    let conn = Connection::open(&db).unwrap();
    let indexes: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_people_%'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(indexes, 5);
}

#[test]
fn late_type_violation_is_stored_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut contents = String::from("id,amount\n");
    for i in 0..150 {
        contents.push_str(&format!("{i},{}\n", i * 10));
    }
    contents.push_str("150,n/a\n");
    let path = write_csv(dir.path(), "sales.csv", &contents);

    let mut parser = CsvParser::new(&path);
    let schema = parser.discover_schema().unwrap();
    assert_eq!(schema.columns[1].storage_type, StorageType::Integer);

    let db = dir.path().join("sales.db");
    let (result, _) = run(&mut parser, &db, "sales", 40);
    assert_eq!(result.status, ProgressStatus::Completed);
    assert_eq!(result.processed_records, 151);

    let conn = Connection::open(&db).unwrap();
    let stored: String = conn
        .query_row("SELECT amount FROM sales WHERE id = 150", [], |row| row.get(0))
        .unwrap();
    assert_eq!(stored, "n/a");
    let total: i64 = conn
        .query_row("SELECT SUM(amount) FROM sales WHERE id < 150", [], |row| row.get(0))
        .unwrap();
    assert_eq!(total, (0..150).map(|i| i * 10).sum::<i64>());
}

#[test]
fn mixed_sample_infers_text() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(dir.path(), "codes.csv", "code\n1\nabc\n3\n");
    let schema = CsvParser::new(&path).discover_schema().unwrap();
    assert_eq!(schema.columns[0].storage_type, StorageType::Text);
}

#[test]
fn reconverting_replaces_previous_rows() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("out.db");
    let first = write_csv(dir.path(), "first.csv", "name\nalpha\nbeta\ngamma\n");
    let second = write_csv(dir.path(), "second.csv", "name\ndelta\n");

    run(&mut CsvParser::new(&first), &db, "names", 100);
    run(&mut CsvParser::new(&second), &db, "names", 100);

    let conn = Connection::open(&db).unwrap();
    let names: Vec<String> = conn
        .prepare("SELECT name FROM names ORDER BY _row_id")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(names, vec!["delta"]);
}

#[test]
fn unreadable_source_ends_in_error_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(dir.path(), "broken.json", "{\"a\": 1}\n{oops\n");
    let mut parser = ParserSelector::new().select(&path).unwrap();
    let (result, events) = run(parser.as_mut(), &dir.path().join("out.db"), "t", 10);

    assert_eq!(result.status, ProgressStatus::Error);
    assert!(result.error.as_deref().unwrap().contains("line 2"));
    assert_eq!(events.len(), 1);
}

#[test]
fn lenient_mode_substitutes_synthetic_data_for_missing_reader() {
    let dir = tempfile::tempdir().unwrap();
    let capabilities = Capabilities {
        spreadsheet: Capability::unavailable("spreadsheet reader not installed"),
        ..Capabilities::probe()
    };
    let selector = ParserSelector::new()
        .with_capabilities(capabilities.clone())
        .lenient(true)
        .with_synthetic_records(1_000);

    let mut parser = selector.select(Path::new("book.xlsx")).unwrap();
    let (result, _) = run(parser.as_mut(), &dir.path().join("book.db"), "book", 250);
    assert_eq!(result.status, ProgressStatus::Completed);
    assert_eq!(result.processed_records, 1_000);

    let strict = ParserSelector::new().with_capabilities(capabilities);
    match strict.select(Path::new("book.xlsx")) {
        Err(ConvertError::MissingDependency { component, .. }) => {
            assert!(component.contains("spreadsheet"));
        }
        other => panic!("expected MissingDependency, got {:?}", other.map(|p| p.format_name())),
    }
}

#[test]
fn pdf_is_rejected_with_supported_formats() {
    let err = ParserSelector::new()
        .select(Path::new("scan.pdf"))
        .err()
        .unwrap();
    let message = err.to_string();
    for ext in [".yxdb", ".csv", ".xlsx", ".xls", ".json"] {
        assert!(message.contains(ext), "{message}");
    }
    assert!(!err.is_retryable());
}

#[test]
fn empty_batches_still_complete() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(dir.path(), "header_only.csv", "a,b\n");
    let (result, events) = run(&mut CsvParser::new(&path), &dir.path().join("out.db"), "t", 10);
    assert_eq!(result.status, ProgressStatus::Completed);
    assert_eq!(result.processed_records, 0);
    assert_eq!(events.len(), 1);
}
