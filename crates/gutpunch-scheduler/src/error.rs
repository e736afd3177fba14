use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A parameters payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The gateway connection was released by `close()`.
    #[error("Storage gateway is closed")]
    StorageClosed,

    /// A filter or assignment referenced a column the table doesn't have.
    #[error("Unknown column `{column}` on table `{table}`")]
    InvalidColumn { table: &'static str, column: String },

    /// The provided schedule resolves to an instant chrono cannot represent.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: i64 },

    /// No queue matched the given name or ID.
    #[error("Queue not found: {name}")]
    QueueNotFound { name: String },

    /// A queue with this name already exists.
    #[error("Queue already exists: {name}")]
    QueueExists { name: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
