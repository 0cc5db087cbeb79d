//! Job registry with a fixed number of processing slots.

use crate::core::{ConvertError, Result, Schema};
use crate::progress::{ConversionProgress, ProgressStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_MAX_CONCURRENT: usize = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled
        )
    }
}

/// What a job reads from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobSource {
    File { path: PathBuf },
    Synthetic { records: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionJob {
    pub job_id: String,
    pub source: JobSource,
    pub table_name: String,
    /// Database file the job writes, `<database_dir>/<job_id>.db`.
    pub destination: PathBuf,
    pub status: JobStatus,
    pub progress: ConversionProgress,
    pub schema: Option<Schema>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ConversionJob {
    pub fn new(source: JobSource, table_name: impl Into<String>, database_dir: &Path) -> Self {
        let job_id = Uuid::new_v4().to_string();
        Self {
            destination: database_dir.join(format!("{job_id}.db")),
            job_id,
            source,
            table_name: table_name.into(),
            status: JobStatus::Queued,
            progress: ConversionProgress::pending(),
            schema: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Counts by status, for dashboards and the CLI.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueStatus {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_concurrent: usize,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, ConversionJob>,
    /// Submission order, oldest first.
    submitted: Vec<String>,
    waiting: VecDeque<String>,
    processing: usize,
}

/// FIFO job registry that lets at most `max_concurrent` jobs process at once.
///
/// Every mutation happens under one lock, so slot checks and promotions are
/// atomic with respect to each other. Reads return snapshots.
pub struct JobQueue {
    max_concurrent: usize,
    max_queued: Option<usize>,
    state: Mutex<QueueState>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

impl JobQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            max_queued: None,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Rejects submissions once this many jobs are waiting.
    pub fn with_max_queued(mut self, max_queued: Option<usize>) -> Self {
        self.max_queued = max_queued;
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    // A panicking holder never leaves the state half-written between statements.
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_job(&self, job: ConversionJob) -> Result<String> {
        let mut state = self.state();
        if let Some(capacity) = self.max_queued {
            if state.waiting.len() >= capacity {
                return Err(ConvertError::QueueFull { capacity });
            }
        }

        let job_id = job.job_id.clone();
        state.waiting.push_back(job_id.clone());
        state.submitted.push(job_id.clone());
        state.jobs.insert(job_id.clone(), job);
        debug!(job_id = %job_id, waiting = state.waiting.len(), "Job queued");
        Ok(job_id)
    }

    pub fn get_job(&self, job_id: &str) -> Option<ConversionJob> {
        self.state().jobs.get(job_id).cloned()
    }

    /// Promotes the oldest queued job to processing if a slot is free.
    pub fn get_next_job(&self) -> Option<ConversionJob> {
        let mut state = self.state();
        if state.processing >= self.max_concurrent {
            return None;
        }

        while let Some(job_id) = state.waiting.pop_front() {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.status != JobStatus::Queued {
                continue;
            }
            job.status = JobStatus::Processing;
            job.started_at = Some(Utc::now());
            let job = job.clone();
            state.processing += 1;
            info!(job_id = %job_id, processing = state.processing, "Job started");
            return Some(job);
        }
        None
    }

    /// Records the terminal progress of a processing job and frees its slot.
    pub fn complete_job(&self, job_id: &str, progress: ConversionProgress) -> Result<()> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ConvertError::NotFound(job_id.to_string()))?;
        if job.status != JobStatus::Processing {
            return Err(ConvertError::Conversion(format!(
                "job {job_id} is not processing"
            )));
        }

        job.status = match progress.status {
            ProgressStatus::Completed => JobStatus::Completed,
            _ => JobStatus::Error,
        };
        job.completed_at = progress.completed_at.or_else(|| Some(Utc::now()));
        job.progress = progress;
        let status = job.status;
        state.processing = state.processing.saturating_sub(1);
        info!(job_id = %job_id, ?status, "Job finished");
        Ok(())
    }

    /// Cancels a job that has not started. Returns false if it already has.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ConvertError::NotFound(job_id.to_string()))?;
        if job.status != JobStatus::Queued {
            return Ok(false);
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        state.waiting.retain(|id| id != job_id);
        info!(job_id = %job_id, "Job cancelled");
        Ok(true)
    }

    pub(crate) fn record_progress(&self, job_id: &str, progress: &ConversionProgress) {
        if let Some(job) = self.state().jobs.get_mut(job_id) {
            job.progress = progress.clone();
        }
    }

    pub(crate) fn record_schema(&self, job_id: &str, schema: &Schema) {
        if let Some(job) = self.state().jobs.get_mut(job_id) {
            job.schema = Some(schema.clone());
        }
    }

    /// Snapshots of known jobs, newest first.
    pub fn list_jobs(&self, limit: Option<usize>) -> Vec<ConversionJob> {
        let state = self.state();
        state
            .submitted
            .iter()
            .rev()
            .filter_map(|id| state.jobs.get(id).cloned())
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub fn queue_status(&self) -> QueueStatus {
        let state = self.state();
        let mut status = QueueStatus {
            max_concurrent: self.max_concurrent,
            ..QueueStatus::default()
        };
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => status.queued += 1,
                JobStatus::Processing => status.processing += 1,
                JobStatus::Completed => status.completed += 1,
                JobStatus::Error => status.failed += 1,
                JobStatus::Cancelled => status.cancelled += 1,
            }
        }
        status
    }

    /// Forgets a job that is not processing and returns its last snapshot.
    pub fn remove_job(&self, job_id: &str) -> Result<ConversionJob> {
        let mut state = self.state();
        match state.jobs.get(job_id).map(|job| job.status) {
            None => return Err(ConvertError::NotFound(job_id.to_string())),
            Some(JobStatus::Processing) => {
                return Err(ConvertError::JobInProgress(job_id.to_string()));
            }
            Some(_) => {}
        }
        state.waiting.retain(|id| id != job_id);
        state.submitted.retain(|id| id != job_id);
        state
            .jobs
            .remove(job_id)
            .ok_or_else(|| ConvertError::NotFound(job_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn job() -> ConversionJob {
        ConversionJob::new(
            JobSource::Synthetic { records: 10 },
            "data",
            Path::new("databases"),
        )
    }

    fn finished() -> ConversionProgress {
        let mut progress = ConversionProgress::pending();
        progress.start(10);
        progress.advance(10);
        progress.complete();
        progress
    }

    #[test]
    fn destination_is_named_after_job() {
        let job = job();
        assert_eq!(
            job.destination,
            Path::new("databases").join(format!("{}.db", job.job_id))
        );
    }

    #[test]
    fn third_job_waits_for_a_free_slot() {
        let queue = JobQueue::new(2);
        let ids: Vec<String> = (0..3).map(|_| queue.add_job(job()).unwrap()).collect();

        let first = queue.get_next_job().unwrap();
        let second = queue.get_next_job().unwrap();
        assert_eq!(first.job_id, ids[0]);
        assert_eq!(second.job_id, ids[1]);
        assert!(queue.get_next_job().is_none());
        assert_eq!(queue.get_job(&ids[2]).unwrap().status, JobStatus::Queued);
        assert_eq!(queue.queue_status().processing, 2);

        queue.complete_job(&ids[0], finished()).unwrap();
        let third = queue.get_next_job().unwrap();
        assert_eq!(third.job_id, ids[2]);
        assert_eq!(queue.get_job(&ids[0]).unwrap().status, JobStatus::Completed);
        assert_eq!(queue.get_job(&ids[0]).unwrap().progress.percentage, 100.0);
    }

    #[test]
    fn concurrent_promotion_never_exceeds_slots() {
        let queue = Arc::new(JobQueue::new(2));
        for _ in 0..20 {
            queue.add_job(job()).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.get_next_job().map(|j| j.job_id))
            })
            .collect();
        let promoted: Vec<String> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(promoted.len(), 2);
        assert_eq!(queue.queue_status().processing, 2);
        assert_eq!(queue.queue_status().queued, 18);
    }

    #[test]
    fn only_queued_jobs_can_be_cancelled() {
        let queue = JobQueue::new(1);
        let running = queue.add_job(job()).unwrap();
        let waiting = queue.add_job(job()).unwrap();
        queue.get_next_job().unwrap();

        assert!(!queue.cancel_job(&running).unwrap());
        assert!(queue.cancel_job(&waiting).unwrap());
        assert_eq!(queue.get_job(&waiting).unwrap().status, JobStatus::Cancelled);

        queue.complete_job(&running, finished()).unwrap();
        assert!(queue.get_next_job().is_none());
        assert!(matches!(
            queue.cancel_job("missing"),
            Err(ConvertError::NotFound(_))
        ));
    }

    #[test]
    fn processing_jobs_cannot_be_removed() {
        let queue = JobQueue::new(2);
        let id = queue.add_job(job()).unwrap();
        queue.get_next_job().unwrap();
        assert!(matches!(
            queue.remove_job(&id),
            Err(ConvertError::JobInProgress(_))
        ));

        let mut failed = ConversionProgress::pending();
        failed.fail("boom");
        queue.complete_job(&id, failed).unwrap();
        assert_eq!(queue.get_job(&id).unwrap().status, JobStatus::Error);
        assert_eq!(queue.remove_job(&id).unwrap().job_id, id);
        assert!(queue.get_job(&id).is_none());
    }

    #[test]
    fn listing_is_newest_first_and_bounded() {
        let queue = JobQueue::new(2).with_max_queued(Some(3));
        let ids: Vec<String> = (0..3).map(|_| queue.add_job(job()).unwrap()).collect();
        assert!(matches!(
            queue.add_job(job()),
            Err(ConvertError::QueueFull { capacity: 3 })
        ));

        let listed: Vec<String> = queue.list_jobs(Some(2)).into_iter().map(|j| j.job_id).collect();
        assert_eq!(listed, vec![ids[2].clone(), ids[1].clone()]);
        assert_eq!(queue.list_jobs(None).len(), 3);
    }
}
