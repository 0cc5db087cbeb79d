//! Conversion workers running on top of the job queue.

use crate::config::Config;
use crate::core::{FormatParser, Result, Schema};
use crate::pipeline::StreamingConverter;
use crate::progress::{ConversionProgress, ProgressObserver};
use crate::queue::{ConversionJob, JobQueue, JobSource, QueueStatus};
use crate::sink::sqlite::{remove_database, SqliteDestination};
use crate::source::ParserSelector;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Executes one promoted job to a terminal progress.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: ConversionJob, queue: Arc<JobQueue>) -> ConversionProgress;
}

/// Writes converter progress and the discovered schema into the job registry.
pub struct JobProgressObserver {
    queue: Arc<JobQueue>,
    job_id: String,
}

impl JobProgressObserver {
    pub fn new(queue: Arc<JobQueue>, job_id: impl Into<String>) -> Self {
        Self {
            queue,
            job_id: job_id.into(),
        }
    }
}

impl ProgressObserver for JobProgressObserver {
    fn on_progress(&mut self, progress: &ConversionProgress) {
        self.queue.record_progress(&self.job_id, progress);
    }

    fn on_started(&mut self, progress: &ConversionProgress) {
        self.queue.record_progress(&self.job_id, progress);
    }

    fn on_schema(&mut self, schema: &Schema) {
        self.queue.record_schema(&self.job_id, schema);
    }
}

/// Runs the synchronous converter on Tokio's blocking pool.
pub struct BlockingRunner {
    selector: ParserSelector,
    batch_size: usize,
}

impl BlockingRunner {
    pub fn new(selector: ParserSelector, batch_size: usize) -> Self {
        Self {
            selector,
            batch_size,
        }
    }
}

fn open_parser(selector: &ParserSelector, source: &JobSource) -> Result<Box<dyn FormatParser>> {
    match source {
        JobSource::File { path } => selector.select(path),
        JobSource::Synthetic { records } => Ok(selector.synthetic(*records)),
    }
}

fn convert_job(
    selector: &ParserSelector,
    batch_size: usize,
    job: &ConversionJob,
    observer: &mut JobProgressObserver,
) -> ConversionProgress {
    let prepared = open_parser(selector, &job.source)
        .and_then(|parser| Ok((parser, SqliteDestination::open(&job.destination)?)));
    let (mut parser, destination) = match prepared {
        Ok(pair) => pair,
        Err(e) => {
            error!(job_id = %job.job_id, error = ?e, "Could not start conversion");
            let mut progress = ConversionProgress::pending();
            progress.fail(e.to_string());
            observer.on_progress(&progress);
            return progress;
        }
    };

    let mut counting = ConversionProgress::pending();
    counting.start(0);
    counting.message = "Counting records...".to_string();
    observer.on_started(&counting);

    let estimated = parser.estimate_row_count();
    StreamingConverter::new(destination, &job.table_name).convert(
        parser.as_mut(),
        batch_size,
        observer,
        estimated,
    )
}

#[async_trait]
impl JobRunner for BlockingRunner {
    async fn run(&self, job: ConversionJob, queue: Arc<JobQueue>) -> ConversionProgress {
        let selector = self.selector.clone();
        let batch_size = self.batch_size;
        let job_id = job.job_id.clone();

        let task = tokio::task::spawn_blocking(move || {
            let mut observer = JobProgressObserver::new(queue, job.job_id.clone());
            convert_job(&selector, batch_size, &job, &mut observer)
        });
        match task.await {
            Ok(progress) => progress,
            Err(e) => {
                error!(job_id = %job_id, "Conversion worker panicked: {e}");
                let mut progress = ConversionProgress::pending();
                progress.fail(format!("worker failed: {e}"));
                progress
            }
        }
    }
}

/// Entry point for callers that submit files and poll job status.
///
/// Owns the job registry; nothing is global, so each service (and each test)
/// is isolated.
pub struct ConversionService {
    queue: Arc<JobQueue>,
    selector: ParserSelector,
    runner: Arc<dyn JobRunner>,
    database_dir: PathBuf,
    table_name: String,
    max_file_size: Option<u64>,
    wakeup: Arc<Notify>,
}

impl ConversionService {
    pub fn new(config: &Config) -> Result<Self> {
        let selector = config.selector()?;
        let runner = Arc::new(BlockingRunner::new(selector.clone(), config.batch_size));
        Ok(Self {
            queue: Arc::new(
                JobQueue::new(config.max_concurrent).with_max_queued(config.max_queued),
            ),
            selector,
            runner,
            database_dir: config.database_dir.clone(),
            table_name: config.table_name.clone(),
            max_file_size: config.max_file_size_bytes,
            wakeup: Arc::new(Notify::new()),
        })
    }

    /// Replaces the selector used for validation and by the default runner.
    pub fn with_selector(mut self, selector: ParserSelector, batch_size: usize) -> Self {
        self.runner = Arc::new(BlockingRunner::new(selector.clone(), batch_size));
        self.selector = selector;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn JobRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Validates the source and enqueues a conversion of it.
    ///
    /// Format, backend availability, existence and size are all checked
    /// here, so a rejected file never becomes a job.
    pub fn submit(&self, path: &Path, table_name: Option<&str>) -> Result<String> {
        let (format, _) = self.selector.check(path)?;
        let size = format.check_file_size(path, self.max_file_size)?;

        let table = table_name.unwrap_or(&self.table_name);
        let job = ConversionJob::new(
            JobSource::File {
                path: path.to_path_buf(),
            },
            table,
            &self.database_dir,
        );
        let job_id = self.queue.add_job(job)?;
        info!(job_id = %job_id, path = %path.display(), %format, size, "Submitted conversion");
        self.wakeup.notify_one();
        Ok(job_id)
    }

    pub fn submit_demo(&self, records: u64) -> Result<String> {
        let job = ConversionJob::new(
            JobSource::Synthetic { records },
            self.table_name.as_str(),
            &self.database_dir,
        );
        let job_id = self.queue.add_job(job)?;
        info!(job_id = %job_id, records, "Submitted demo conversion");
        self.wakeup.notify_one();
        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Result<ConversionJob> {
        self.queue
            .get_job(job_id)
            .ok_or_else(|| crate::core::ConvertError::NotFound(job_id.to_string()))
    }

    pub fn list_jobs(&self, limit: Option<usize>) -> Vec<ConversionJob> {
        self.queue.list_jobs(limit)
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.queue_status()
    }

    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        self.queue.cancel_job(job_id)
    }

    /// Forgets a finished or waiting job and removes its database.
    pub fn delete(&self, job_id: &str) -> Result<()> {
        let job = self.queue.remove_job(job_id)?;
        remove_database(&job.destination)?;
        info!(job_id = %job_id, "Deleted job");
        Ok(())
    }

    /// Drains the queue with `max_concurrent` workers and returns once no
    /// queued job is left.
    pub async fn run_until_idle(&self) {
        let workers = (0..self.queue.max_concurrent())
            .map(|_| drain(Arc::clone(&self.queue), Arc::clone(&self.runner)));
        futures::future::join_all(workers).await;
    }

    /// Starts long-lived workers that pick up jobs as they are submitted.
    pub fn spawn_workers(&self) -> WorkerPool {
        let (shutdown, stop) = watch::channel(false);
        let handles = (0..self.queue.max_concurrent())
            .map(|worker| {
                let queue = Arc::clone(&self.queue);
                let runner = Arc::clone(&self.runner);
                let wakeup = Arc::clone(&self.wakeup);
                let mut stop = stop.clone();
                tokio::spawn(async move {
                    info!(worker, "Conversion worker started");
                    loop {
                        drain(Arc::clone(&queue), Arc::clone(&runner)).await;
                        tokio::select! {
                            _ = wakeup.notified() => {}
                            _ = stop.changed() => break,
                        }
                    }
                    info!(worker, "Conversion worker stopped");
                })
            })
            .collect();
        WorkerPool { shutdown, handles }
    }
}

async fn drain(queue: Arc<JobQueue>, runner: Arc<dyn JobRunner>) {
    while let Some(job) = queue.get_next_job() {
        let job_id = job.job_id.clone();
        let progress = runner.run(job, Arc::clone(&queue)).await;
        if let Err(e) = queue.complete_job(&job_id, progress) {
            warn!(job_id = %job_id, "Could not record job result: {e}");
        }
    }
}

/// Handle to workers started by [`ConversionService::spawn_workers`].
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Stops the workers after their current job and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in futures::future::join_all(self.handles).await {
            if let Err(e) = handle {
                warn!("Worker ended abnormally: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BatchIter, ConvertError};
    use crate::progress::ProgressStatus;
    use crate::queue::JobStatus;
    use crate::source::SyntheticParser;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(dir: &Path) -> Config {
        Config {
            database_dir: dir.to_path_buf(),
            batch_size: 100,
            ..Config::default()
        }
    }

    /// Records the highest number of jobs seen processing at once.
    struct SlowRunner {
        peak: AtomicUsize,
    }

    #[async_trait]
    impl JobRunner for SlowRunner {
        async fn run(&self, _job: ConversionJob, queue: Arc<JobQueue>) -> ConversionProgress {
            let processing = queue.queue_status().processing;
            self.peak.fetch_max(processing, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut progress = ConversionProgress::pending();
            progress.start(1);
            progress.advance(1);
            progress.complete();
            progress
        }
    }

    /// Captures the registry entry as a poller would see it during schema
    /// discovery.
    struct PolledParser {
        inner: SyntheticParser,
        queue: Arc<JobQueue>,
        job_id: String,
        seen: Option<ConversionProgress>,
    }

    impl FormatParser for PolledParser {
        fn format_name(&self) -> &'static str {
            self.inner.format_name()
        }

        fn discover_schema(&mut self) -> Result<Schema> {
            if self.seen.is_none() {
                self.seen = self.queue.get_job(&self.job_id).map(|job| job.progress);
            }
            self.inner.discover_schema()
        }

        fn estimate_row_count(&mut self) -> u64 {
            self.inner.estimate_row_count()
        }

        fn batches(&mut self, batch_size: usize) -> Result<BatchIter<'_>> {
            self.inner.batches(batch_size)
        }
    }

    #[test]
    fn registry_shows_processing_before_first_batch() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(JobQueue::new(1));
        let job = ConversionJob::new(JobSource::Synthetic { records: 5 }, "demo", dir.path());
        let job_id = queue.add_job(job).unwrap();
        queue.get_next_job().unwrap();

        let mut parser = PolledParser {
            inner: SyntheticParser::new(5).with_seed(1),
            queue: Arc::clone(&queue),
            job_id: job_id.clone(),
            seen: None,
        };
        let mut observer = JobProgressObserver::new(Arc::clone(&queue), job_id.clone());
        let destination = SqliteDestination::open(dir.path().join("demo.db")).unwrap();
        let result =
            StreamingConverter::new(destination, "demo").convert(&mut parser, 10, &mut observer, 5);

        let seen = parser.seen.unwrap();
        assert_eq!(seen.status, ProgressStatus::Processing);
        assert_eq!(seen.total_records, 5);
        assert_eq!(seen.message, "Creating table schema...");
        assert_eq!(result.status, ProgressStatus::Completed);
        assert_eq!(queue.get_job(&job_id).unwrap().progress, result);
    }

    #[tokio::test]
    async fn demo_job_converts_to_its_own_database() {
        let dir = tempfile::tempdir().unwrap();
        let service = ConversionService::new(&config(dir.path())).unwrap();
        let job_id = service.submit_demo(250).unwrap();
        assert_eq!(service.status(&job_id).unwrap().status, JobStatus::Queued);

        service.run_until_idle().await;

        let job = service.status(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress.processed_records, 250);
        assert_eq!(job.schema.unwrap().len(), 7);
        let info = SqliteDestination::open(&job.destination)
            .unwrap()
            .table_info("converted_data")
            .unwrap();
        assert_eq!(info.row_count, 250);

        service.delete(&job_id).unwrap();
        assert!(!job.destination.exists());
        assert!(matches!(service.status(&job_id), Err(ConvertError::NotFound(_))));
    }

    #[tokio::test]
    async fn rejected_files_never_become_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let service = ConversionService::new(&config(dir.path())).unwrap();

        let pdf = dir.path().join("report.pdf");
        std::fs::write(&pdf, b"%PDF").unwrap();
        assert!(matches!(
            service.submit(&pdf, None),
            Err(ConvertError::UnsupportedFormat { .. })
        ));
        assert!(service.submit(&dir.path().join("missing.csv"), None).is_err());
        assert!(service.list_jobs(None).is_empty());
    }

    #[tokio::test]
    async fn workers_respect_concurrency_limit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(SlowRunner {
            peak: AtomicUsize::new(0),
        });
        let service = ConversionService::new(&config(dir.path()))
            .unwrap()
            .with_runner(runner.clone());
        for _ in 0..5 {
            service.submit_demo(1).unwrap();
        }

        service.run_until_idle().await;

        assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
        assert_eq!(service.queue_status().completed, 5);
    }

    #[tokio::test]
    async fn spawned_workers_pick_up_new_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let service = ConversionService::new(&config(dir.path())).unwrap();
        let pool = service.spawn_workers();

        let job_id = service.submit_demo(10).unwrap();
        let mut finished = false;
        for _ in 0..200 {
            if service.status(&job_id).unwrap().progress.status == ProgressStatus::Completed
                && service.status(&job_id).unwrap().status == JobStatus::Completed
            {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;
        assert!(finished);
    }
}
