use std::path::PathBuf;

use thiserror::Error;

/// Defines all possible errors that can occur in the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Error reading or accessing the configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigRead(#[from] std::io::Error),

    /// Error spawning a child process.
    #[error("Failed to start '{label}': {source}")]
    LaunchError {
        /// The child label that failed to start.
        label: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A child declaration whose command tokenizes to nothing.
    #[error("Empty command for '{label}'")]
    EmptyCommand {
        /// The child label with the empty command.
        label: String,
    },

    /// The log directory could not be created or entered.
    #[error("Failed to prepare log directory {path}: {source}")]
    LogDir {
        /// The offending directory.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error for the supervisor's pid file.
    #[error("PID file error: {0}")]
    PidFile(#[from] PidFileError),
}

/// Errors around the supervisor's singleton pid file.
#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("Failed to access PID file: {0}")]
    Io(#[from] std::io::Error),

    #[error("metasys is already running with pid {0}")]
    AlreadyRunning(u32),
}

/// Errors raised while delivering a notification. Delivery is best-effort;
/// these are logged and never stop the control loop.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Failed to build mail message: {0}")]
    Message(#[from] lettre::error::Error),

    #[error("SMTP delivery failed: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}
