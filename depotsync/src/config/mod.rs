//! INI configuration file.
//!
//! Every key has a default, so an empty or missing file yields a usable
//! configuration apart from `[app] app_id`, which must be set.
//!
//! ```ini
//! [app]
//! app_id = 232250
//! branch = public
//! depots = 232251, 232252
//!
//! [paths]
//! data_dir = /var/lib/depotsync
//!
//! [processor]
//! command = /usr/local/bin/decompile
//! args = --quiet
//!
//! [publisher]
//! enabled = true
//! remote = origin
//! branch = main
//! ```

mod file;

pub use file::{
    AppSection, ConfigFile, DownloadSection, GatewaySection, LoggingSection, PathsSection,
    PollSection, PoolSection, ProcessorSection, PublisherSection,
};

use std::path::PathBuf;

use thiserror::Error;

/// Result type for configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors while loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid value '{value}' for '{key}'")]
    InvalidValue { key: String, value: String },

    #[error("missing required value '{key}'")]
    MissingValue { key: String },

    #[error("no platform configuration directory available")]
    NoConfigDir,
}

/// Default config file location: `<config dir>/depotsync/config.ini`.
pub fn config_path() -> ConfigResult<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("depotsync").join("config.ini"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Default data directory: `<data dir>/depotsync`, or `./depotsync-data`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("depotsync"))
        .unwrap_or_else(|| PathBuf::from("depotsync-data"))
}
