use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dconvert::progress::ConversionProgress;
use dconvert::sink::sqlite::database_size;
use dconvert::{
    Config, ConversionService, FormatParser, JobStatus, ProgressStatus, SourceFormat,
    SqliteDestination, StreamingConverter,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "dconvert", version, about = "Stream data files into SQLite")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert one file into a SQLite database
    Convert {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        batch: Option<usize>,
        /// Fall back to synthetic data when a format's reader is unavailable
        #[arg(long)]
        lenient: bool,
        #[arg(long)]
        delimiter: Option<String>,
        #[arg(long)]
        encoding: Option<String>,
        #[arg(long)]
        sheet: Option<String>,
    },
    /// Print the discovered schema
    Schema { input: PathBuf },
    /// Print the first rows and column statistics as JSON
    Preview {
        input: PathBuf,
        #[arg(long, default_value_t = 10)]
        rows: usize,
    },
    /// Convert generated demo data
    Demo {
        output: PathBuf,
        #[arg(long)]
        records: Option<u64>,
    },
    /// Convert several files through the job queue
    Batch {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        output_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dconvert::telemetry::init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Command::Convert {
            input,
            output,
            table,
            batch,
            lenient,
            delimiter,
            encoding,
            sheet,
        } => {
            if let Some(table) = table {
                config.table_name = table;
            }
            if let Some(batch) = batch {
                config.batch_size = batch;
            }
            config.lenient |= lenient;
            if let Some(delimiter) = delimiter {
                config.csv.delimiter = delimiter;
            }
            if let Some(encoding) = encoding {
                config.csv.encoding = encoding;
            }
            if sheet.is_some() {
                config.spreadsheet.sheet = sheet;
            }
            config.validate()?;

            let format = SourceFormat::from_path(&input)?;
            format
                .check_file_size(&input, config.max_file_size_bytes)
                .with_context(|| format!("checking {}", input.display()))?;
            let parser = config.selector()?.select(&input)?;
            convert(parser, output, config).await
        }
        Command::Schema { input } => {
            let mut parser = config.selector()?.select(&input)?;
            let schema = parser.discover_schema()?;
            println!("{} ({} columns)", input.display(), schema.len());
            for column in schema.iter() {
                let tag = column.source_type.as_deref().unwrap_or("inferred");
                println!("  {} ({tag} -> {})", column.name, column.storage_type);
            }
            Ok(())
        }
        Command::Preview { input, rows } => {
            let mut parser = config.selector()?.select(&input)?;
            let preview = dconvert::preview::sample(parser.as_mut(), rows)?;
            println!("{}", serde_json::to_string_pretty(&preview)?);
            Ok(())
        }
        Command::Demo { output, records } => {
            let records = records.unwrap_or(config.synthetic_records);
            let parser = config.selector()?.synthetic(records);
            convert(parser, output, config).await
        }
        Command::Batch { inputs, output_dir } => {
            config.database_dir = output_dir;
            run_batch(&inputs, &config).await
        }
    }
}

async fn convert(
    mut parser: Box<dyn FormatParser>,
    output: PathBuf,
    config: Config,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let destination = SqliteDestination::open(&output)
        .with_context(|| format!("opening {}", output.display()))?;

    let progress = tokio::task::spawn_blocking(move || {
        let estimated = parser.estimate_row_count();
        let mut bar = |p: &ConversionProgress| draw_progress(p);
        StreamingConverter::new(destination, &config.table_name).convert(
            parser.as_mut(),
            config.batch_size,
            &mut bar,
            estimated,
        )
    })
    .await
    .context("conversion worker failed")?;
    eprintln!();

    if progress.status != ProgressStatus::Completed {
        bail!(
            "conversion failed: {}",
            progress.error.as_deref().unwrap_or("unknown error")
        );
    }

    let elapsed = started.elapsed().as_secs_f64();
    let rate = if elapsed > 0.0 {
        progress.processed_records as f64 / elapsed
    } else {
        0.0
    };
    println!("Records:  {}", progress.processed_records);
    println!("Output:   {} ({})", output.display(), human_size(database_size(&output)));
    println!("Elapsed:  {elapsed:.2}s");
    println!("Rate:     {rate:.0} records/sec");
    Ok(())
}

fn draw_progress(progress: &ConversionProgress) {
    const WIDTH: usize = 30;
    let filled = ((progress.percentage / 100.0) * WIDTH as f64).round() as usize;
    let bar = format!("{}{}", "#".repeat(filled.min(WIDTH)), "-".repeat(WIDTH - filled.min(WIDTH)));
    let mut stderr = std::io::stderr().lock();
    let _ = write!(
        stderr,
        "\r[{bar}] {:5.1}% {}",
        progress.percentage, progress.message
    );
    let _ = stderr.flush();
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

async fn run_batch(inputs: &[PathBuf], config: &Config) -> anyhow::Result<()> {
    let service = ConversionService::new(config)?;
    for input in inputs {
        let table = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(config.table_name.as_str());
        match service.submit(input, Some(table)) {
            Ok(job_id) => eprintln!("queued {} as {job_id}", input.display()),
            Err(e) => eprintln!("skipped {}: {e}", input.display()),
        }
    }

    service.run_until_idle().await;

    let mut failed = 0;
    for job in service.list_jobs(None).into_iter().rev() {
        let source = match &job.source {
            dconvert::queue::JobSource::File { path } => path.display().to_string(),
            dconvert::queue::JobSource::Synthetic { records } => format!("{records} demo records"),
        };
        match job.status {
            JobStatus::Completed => println!(
                "{source} -> {} [{}] {} records",
                job.destination.display(),
                job.table_name,
                job.progress.processed_records
            ),
            _ => {
                failed += 1;
                println!(
                    "{source} failed: {}",
                    job.progress.error.as_deref().unwrap_or("not converted")
                );
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} conversions failed", inputs.len());
    }
    Ok(())
}
