//! CLI error type.

use depotsync::config::ConfigError;
use depotsync::logging::LoggingError;
use depotsync::tracker::TrackerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    ConfigFile(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),
}
