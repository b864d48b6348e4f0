//! Common types and utilities shared across CLI commands.

use std::path::{Path, PathBuf};

use depotsync::config::{config_path, ConfigFile};
use depotsync::logging::{self, LoggingGuard};
use tokio::runtime::Runtime;
use tracing::info;

use crate::error::CliError;

/// Global arguments.
#[derive(Debug, Clone, Default)]
pub struct CommonArgs {
    pub config: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl CommonArgs {
    /// Config path: `--config`, else the platform default.
    pub fn config_path(&self) -> Result<PathBuf, CliError> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => Ok(config_path()?),
        }
    }

    /// Load the config file. An explicit `--config` must exist.
    pub fn load_config(&self) -> Result<ConfigFile, CliError> {
        let path = self.config_path()?;
        if self.config.is_some() && !path.exists() {
            return Err(CliError::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        Ok(ConfigFile::load_or_default(&path)?)
    }

    /// Install logging from the config, honoring `--log-level`.
    pub fn init_logging(&self, config: &ConfigFile) -> Result<LoggingGuard, CliError> {
        let level = self
            .log_level
            .as_deref()
            .unwrap_or(config.logging.level.as_str());
        let guard = logging::init(level, config.logging.file.as_deref())?;
        info!(version = depotsync::VERSION, "DepotSync starting");
        Ok(guard)
    }
}

/// Multi-threaded runtime for the async commands.
pub fn runtime() -> Result<Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)
}

/// Display helper for optional paths.
pub fn display_path(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_missing_config_is_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let args = CommonArgs {
            config: Some(temp.path().join("missing.ini")),
            log_level: None,
        };
        assert!(matches!(args.load_config(), Err(CliError::Config(_))));
    }

    #[test]
    fn test_explicit_config_is_loaded() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        std::fs::write(&path, "[app]\napp_id = 99\n").unwrap();
        let args = CommonArgs {
            config: Some(path.clone()),
            log_level: None,
        };

        assert_eq!(args.config_path().unwrap(), path);
        let config = args.load_config().unwrap();
        assert_eq!(config.require_app().unwrap().get(), 99);
    }
}
