//! Progress events emitted by the streaming converter.
//!
//! Observers are called inline on the converter's thread, once per batch and
//! once at the terminal state, so implementations must return quickly.

use crate::core::Schema;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Highest percentage reported before the terminal event.
pub const MAX_IN_FLIGHT_PERCENTAGE: f64 = 99.9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversionProgress {
    pub status: ProgressStatus,
    /// Estimate while processing; the true count once completed.
    pub total_records: u64,
    pub processed_records: u64,
    pub percentage: f64,
    pub message: String,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ConversionProgress {
    pub fn pending() -> Self {
        Self {
            status: ProgressStatus::Pending,
            total_records: 0,
            processed_records: 0,
            percentage: 0.0,
            message: "Waiting to start".to_string(),
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self, estimated_records: u64) {
        self.status = ProgressStatus::Processing;
        self.total_records = estimated_records;
        self.processed_records = 0;
        self.percentage = 0.0;
        self.message = "Creating table schema...".to_string();
        self.error = None;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
    }

    /// Accounts for one committed batch.
    pub fn advance(&mut self, inserted: u64) {
        self.processed_records += inserted;
        if self.total_records > 0 {
            let ratio = self.processed_records as f64 / self.total_records as f64 * 100.0;
            self.percentage = ratio.min(MAX_IN_FLIGHT_PERCENTAGE);
        }
        self.message = format!("Processed {} records...", self.processed_records);
    }

    pub fn complete(&mut self) {
        self.status = ProgressStatus::Completed;
        self.percentage = 100.0;
        self.total_records = self.processed_records;
        self.message = format!(
            "Successfully converted {} records",
            self.processed_records
        );
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.status = ProgressStatus::Error;
        self.message = format!("Error: {error}");
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Default for ConversionProgress {
    fn default() -> Self {
        Self::pending()
    }
}

/// Receives progress from a running conversion.
pub trait ProgressObserver: Send {
    fn on_progress(&mut self, progress: &ConversionProgress);

    /// State changes before the first batch. These are not counted as
    /// progress events; pollers use them to see that work has begun.
    fn on_started(&mut self, _progress: &ConversionProgress) {}

    /// Called once, after the schema has been discovered and the table created.
    fn on_schema(&mut self, _schema: &Schema) {}
}

impl<F> ProgressObserver for F
where
    F: FnMut(&ConversionProgress) + Send,
{
    fn on_progress(&mut self, progress: &ConversionProgress) {
        self(progress)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_progress(&mut self, _progress: &ConversionProgress) {}
}

/// Forwards events to an async consumer without blocking the converter.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ConversionProgress>,
}

impl ChannelObserver {
    /// Returns the observer and the stream of events it feeds. The stream
    /// ends once the observer is dropped.
    pub fn channel() -> (Self, UnboundedReceiverStream<ConversionProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, UnboundedReceiverStream::new(rx))
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&mut self, progress: &ConversionProgress) {
        // A consumer that went away just stops listening.
        let _ = self.tx.send(progress.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_is_capped_until_completion() {
        let mut progress = ConversionProgress::pending();
        progress.start(100);
        progress.advance(60);
        assert_eq!(progress.percentage, 60.0);
        progress.advance(60);
        assert_eq!(progress.percentage, MAX_IN_FLIGHT_PERCENTAGE);
        progress.complete();
        assert_eq!(progress.percentage, 100.0);
        assert_eq!(progress.total_records, 120);
    }

    #[test]
    fn unknown_estimate_leaves_percentage_at_zero() {
        let mut progress = ConversionProgress::pending();
        progress.start(0);
        progress.advance(10);
        assert_eq!(progress.percentage, 0.0);
        assert_eq!(progress.processed_records, 10);
    }

    #[test]
    fn failure_keeps_counts() {
        let mut progress = ConversionProgress::pending();
        progress.start(10);
        progress.advance(5);
        progress.fail("disk full");
        assert_eq!(progress.status, ProgressStatus::Error);
        assert_eq!(progress.error.as_deref(), Some("disk full"));
        assert_eq!(progress.processed_records, 5);
    }

    #[tokio::test]
    async fn channel_observer_streams_events() {
        use futures::StreamExt;

        let (mut observer, stream) = ChannelObserver::channel();
        let mut progress = ConversionProgress::pending();
        progress.start(2);
        progress.advance(1);
        observer.on_progress(&progress);
        progress.advance(1);
        observer.on_progress(&progress);
        drop(observer);

        let seen: Vec<u64> = stream.map(|p| p.processed_records).collect().await;
        assert_eq!(seen, vec![1, 2]);
    }
}
