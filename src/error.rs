use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostWatchError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into HostWatchError automatically

    #[error("Configuration error: {0}")]
    ConfigError(#[from] Box<figment::Error>),

    #[error("Logger error: {0}")]
    LoggerError(#[from] flexi_logger::FlexiLoggerError),

    #[error("Another '{0}' run is already in progress")]
    AlreadyRunning(String),

    #[error("Mail error: {0}")]
    MailError(String),

    #[error("Webhook error: {0}")]
    WebhookError(#[from] reqwest::Error),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl From<figment::Error> for HostWatchError {
    fn from(err: figment::Error) -> Self {
        HostWatchError::ConfigError(Box::new(err))
    }
}

/// A failure that aborts a backup run. Each variant maps to a stable code
/// which is written to the run log and to the failure notification subject.
#[derive(Error, Debug)]
pub enum BackupFailure {
    #[error("only {available} bytes free on {}, {required} required", .volume.display())]
    InsufficientSpace {
        volume: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("source directory {} does not exist", .0.display())]
    MissingSource(PathBuf),

    #[error("could not create archive {}: {reason}", .path.display())]
    ArchiveCreateFailed { path: PathBuf, reason: String },

    #[error("archive {} failed verification and was removed: {reason}", .path.display())]
    ArchiveCorrupt { path: PathBuf, reason: String },

    #[error("archive {} was not committed: {reason}", .path.display())]
    VcsCommitFailed { path: PathBuf, reason: String },

    #[error("{0}")]
    AlreadyRunning(String),
}

impl BackupFailure {
    pub fn code(&self) -> &'static str {
        match self {
            BackupFailure::InsufficientSpace { .. } => "INSUFFICIENT_SPACE",
            BackupFailure::MissingSource(_) => "MISSING_SOURCE",
            BackupFailure::ArchiveCreateFailed { .. } => "ARCHIVE_CREATE_FAILED",
            BackupFailure::ArchiveCorrupt { .. } => "ARCHIVE_CORRUPT",
            BackupFailure::VcsCommitFailed { .. } => "VCS_COMMIT_FAILED",
            BackupFailure::AlreadyRunning(_) => "ALREADY_RUNNING",
        }
    }
}
