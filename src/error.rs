use std::path::PathBuf;

use thiserror::Error;

// Causes are rendered into the message, not chained as `source`.

/// Failures that end the current invocation with a non-zero exit code.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("'{mode}' requires root privileges (try: sudo sys-health {mode})")]
    Privilege { mode: &'static str },

    #[error("log file {} is not writable: {cause}", path.display())]
    WriteAccess { path: PathBuf, cause: std::io::Error },

    #[error("test cycle failed: log file {} is missing or empty", path.display())]
    Verification { path: PathBuf },

    #[error("failed to install {}: {cause}", path.display())]
    Install { path: PathBuf, cause: std::io::Error },

    #[error("failed to write output: {0}")]
    Output(std::io::Error),

    #[error("I/O error on {}: {cause}", path.display())]
    Io { path: PathBuf, cause: std::io::Error },
}

impl HealthError {
    pub fn io(path: impl Into<PathBuf>, cause: std::io::Error) -> Self {
        HealthError::Io { path: path.into(), cause }
    }
}

impl From<std::io::Error> for HealthError {
    fn from(e: std::io::Error) -> Self {
        HealthError::Output(e)
    }
}

/// The external scheduler could not be read or updated. Never fatal.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),

    #[error("scheduler table {} could not be updated: {cause}", path.display())]
    Table { path: PathBuf, cause: std::io::Error },
}
