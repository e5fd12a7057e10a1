use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A job or repetition policy was constructed with invalid parameters.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A job with the same name is already scheduled.
    #[error("Job already exists: {name}")]
    JobExists { name: String },

    /// No job with the given name exists.
    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    /// A persisted node could not be turned back into a job.
    #[error("Malformed job '{name}': {reason}")]
    MalformedJob { name: String, reason: String },

    /// Underlying filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document is not valid JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Background storage task died before reporting a result.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub(crate) fn malformed(name: &str, reason: impl Into<String>) -> Self {
        SchedulerError::MalformedJob {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
