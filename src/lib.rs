pub mod config;
pub mod core;
pub mod pipeline;
pub mod preview;
pub mod progress;
pub mod queue;
pub mod service;
pub mod sink;
pub mod source;
pub mod telemetry;

pub use crate::config::Config;
pub use crate::core::*;
pub use crate::pipeline::StreamingConverter;
pub use crate::progress::{ConversionProgress, ProgressObserver, ProgressStatus};
pub use crate::queue::{ConversionJob, JobQueue, JobStatus};
pub use crate::service::ConversionService;
pub use crate::sink::SqliteDestination;
pub use crate::source::{ParserSelector, SourceFormat};
