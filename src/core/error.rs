use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Unsupported file format '{extension}'; supported: {supported}")]
    UnsupportedFormat { extension: String, supported: String },

    #[error("Missing dependency: {component} is unavailable ({reason})")]
    MissingDependency { component: String, reason: String },

    #[error("Malformed source: {0}")]
    MalformedSource(String),

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },

    #[error("Job {0} is still processing")]
    JobInProgress(String),

    #[error("File {path} is too large ({size} bytes, limit {limit} bytes)")]
    FileTooLarge { path: String, size: u64, limit: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConvertError {
    /// Whether re-running the same request could succeed without the caller
    /// changing anything.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConvertError::UnsupportedFormat { .. }
                | ConvertError::MissingDependency { .. }
                | ConvertError::MalformedSource(_)
                | ConvertError::Config(_)
                | ConvertError::FileTooLarge { .. }
        )
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        ConvertError::MalformedSource(message.into())
    }
}

impl From<csv::Error> for ConvertError {
    fn from(err: csv::Error) -> Self {
        if err.is_io_error() {
            if let csv::ErrorKind::Io(io) = err.into_kind() {
                return ConvertError::Io(io);
            }
            return ConvertError::malformed("CSV read failed");
        }
        ConvertError::MalformedSource(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = ConvertError::UnsupportedFormat {
            extension: ".pdf".to_string(),
            supported: ".csv".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(!ConvertError::malformed("bad header").is_retryable());
        assert!(ConvertError::NotFound("abc".to_string()).is_retryable());
    }
}
