use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// Nothing here escapes a scheduling cycle: the engine classifies each
/// failure into an [`Outcome`](crate::types::Outcome) and keeps running.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The persisted state file could not be read or written.
    #[error("State file I/O error: {0}")]
    StateIo(#[from] std::io::Error),

    /// The persisted state file could not be encoded.
    #[error("State file format error: {0}")]
    StateFormat(#[from] serde_json::Error),

    /// The alarm store rejected an update.
    #[error("Alarm store error: {0}")]
    Store(#[from] reveil_core::CoreError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
