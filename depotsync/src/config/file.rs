//! Config file sections and their conversion to component settings.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};

use super::{default_data_dir, ConfigError, ConfigResult};
use crate::delta::{DeltaConfig, DEFAULT_CHUNK_CONCURRENCY};
use crate::detect::{DetectorConfig, DEFAULT_POLL_INTERVAL};
use crate::fetch::{RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};
use crate::model::{AppId, DepotId};
use crate::pool::{
    PoolConfig, DEFAULT_MIN_ENDPOINTS, DEFAULT_REFILL_BACKOFF, DEFAULT_REFILL_TIMEOUT,
};
use crate::publish::GitConfig;
use crate::sync::SyncConfig;

/// `[app]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppSection {
    /// Watched app. `None` until configured.
    pub app_id: Option<AppId>,
    pub branch: String,
    /// Depot allow-list. Empty means all depots.
    pub depots: Vec<DepotId>,
}

/// `[paths]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathsSection {
    pub data_dir: PathBuf,
    pub content_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub repo_dir: Option<PathBuf>,
    pub repo_content_subdir: String,
    pub store_file: Option<PathBuf>,
}

impl PathsSection {
    pub fn content_dir(&self) -> PathBuf {
        self.content_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("content"))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("tmp"))
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.repo_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("repo"))
    }

    pub fn store_file(&self) -> PathBuf {
        self.store_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("store.json"))
    }
}

/// `[download]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadSection {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub chunk_concurrency: usize,
}

/// `[pool]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSection {
    pub min_endpoints: usize,
    pub refill_backoff: Duration,
    pub refill_timeout: Duration,
}

/// `[poll]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollSection {
    pub interval: Duration,
}

/// `[processor]`
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ProcessorSection {
    /// Executable to run. `None` mirrors the download unchanged.
    pub command: Option<PathBuf>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// `[publisher]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublisherSection {
    pub enabled: bool,
    pub git: GitConfig,
}

/// `[gateway]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewaySection {
    pub url: String,
    pub timeout: Duration,
}

/// `[logging]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingSection {
    pub level: String,
    pub file: Option<PathBuf>,
}

/// Complete configuration file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigFile {
    pub app: AppSection,
    pub paths: PathsSection,
    pub download: DownloadSection,
    pub pool: PoolSection,
    pub poll: PollSection,
    pub processor: ProcessorSection,
    pub publisher: PublisherSection,
    pub gateway: GatewaySection,
    pub logging: LoggingSection,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            app: AppSection {
                app_id: None,
                branch: "public".to_string(),
                depots: Vec::new(),
            },
            paths: PathsSection {
                data_dir: default_data_dir(),
                content_dir: None,
                temp_dir: None,
                repo_dir: None,
                repo_content_subdir: "Content".to_string(),
                store_file: None,
            },
            download: DownloadSection {
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                retry_delay: DEFAULT_RETRY_DELAY,
                chunk_concurrency: DEFAULT_CHUNK_CONCURRENCY,
            },
            pool: PoolSection {
                min_endpoints: DEFAULT_MIN_ENDPOINTS,
                refill_backoff: DEFAULT_REFILL_BACKOFF,
                refill_timeout: DEFAULT_REFILL_TIMEOUT,
            },
            poll: PollSection {
                interval: DEFAULT_POLL_INTERVAL,
            },
            processor: ProcessorSection::default(),
            publisher: PublisherSection {
                enabled: true,
                git: GitConfig::default(),
            },
            gateway: GatewaySection {
                url: "http://127.0.0.1:8080".to_string(),
                timeout: Duration::from_secs(30),
            },
            logging: LoggingSection {
                level: "info".to_string(),
                file: None,
            },
        }
    }
}

fn parse<T: FromStr>(props: &Properties, section: &str, key: &str) -> ConfigResult<Option<T>> {
    match props.get(key).map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: format!("{}.{}", section, key),
                value: raw.to_string(),
            }),
    }
}

fn text(props: &Properties, key: &str) -> Option<String> {
    props
        .get(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_bool(props: &Properties, section: &str, key: &str) -> ConfigResult<Option<bool>> {
    match text(props, key) {
        None => Ok(None),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(Some(true)),
            "false" | "no" | "off" | "0" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: format!("{}.{}", section, key),
                value: raw,
            }),
        },
    }
}

fn parse_list<T: FromStr>(props: &Properties, section: &str, key: &str) -> ConfigResult<Vec<T>> {
    let Some(raw) = text(props, key) else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<T>().map_err(|_| ConfigError::InvalidValue {
                key: format!("{}.{}", section, key),
                value: v.to_string(),
            })
        })
        .collect()
}

impl ConfigFile {
    /// Load from `path`.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_str(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Load from `path`, falling back to defaults when the file is missing.
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse INI text.
    pub fn parse_str(content: &str) -> ConfigResult<Self> {
        let ini = Ini::load_from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
        let mut config = Self::default();
        let empty = Properties::new();
        let section = |name: &'static str| ini.section(Some(name)).unwrap_or(&empty);

        let app = section("app");
        config.app.app_id = parse(app, "app", "app_id")?;
        if let Some(branch) = text(app, "branch") {
            config.app.branch = branch;
        }
        config.app.depots = parse_list(app, "app", "depots")?;

        let paths = section("paths");
        if let Some(dir) = text(paths, "data_dir") {
            config.paths.data_dir = PathBuf::from(dir);
        }
        config.paths.content_dir = text(paths, "content_dir").map(PathBuf::from);
        config.paths.temp_dir = text(paths, "temp_dir").map(PathBuf::from);
        config.paths.repo_dir = text(paths, "repo_dir").map(PathBuf::from);
        config.paths.store_file = text(paths, "store_file").map(PathBuf::from);
        if let Some(subdir) = text(paths, "repo_content_subdir") {
            config.paths.repo_content_subdir = subdir;
        }

        let download = section("download");
        if let Some(v) = parse(download, "download", "max_attempts")? {
            config.download.max_attempts = v;
        }
        if let Some(ms) = parse::<u64>(download, "download", "retry_delay_ms")? {
            config.download.retry_delay = Duration::from_millis(ms);
        }
        if let Some(v) = parse(download, "download", "chunk_concurrency")? {
            config.download.chunk_concurrency = v;
        }

        let pool = section("pool");
        if let Some(v) = parse(pool, "pool", "min_endpoints")? {
            config.pool.min_endpoints = v;
        }
        if let Some(ms) = parse::<u64>(pool, "pool", "refill_backoff_ms")? {
            config.pool.refill_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(pool, "pool", "refill_timeout_secs")? {
            config.pool.refill_timeout = Duration::from_secs(secs);
        }

        if let Some(ms) = parse::<u64>(section("poll"), "poll", "interval_ms")? {
            config.poll.interval = Duration::from_millis(ms);
        }

        let processor = section("processor");
        config.processor.command = text(processor, "command").map(PathBuf::from);
        config.processor.args = text(processor, "args")
            .map(|a| a.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        config.processor.working_dir = text(processor, "working_dir").map(PathBuf::from);

        let publisher = section("publisher");
        if let Some(enabled) = parse_bool(publisher, "publisher", "enabled")? {
            config.publisher.enabled = enabled;
        }
        if let Some(remote) = text(publisher, "remote") {
            config.publisher.git.remote = remote;
        }
        if let Some(branch) = text(publisher, "branch") {
            config.publisher.git.branch = branch;
        }
        config.publisher.git.author_name = text(publisher, "author_name");
        config.publisher.git.author_email = text(publisher, "author_email");

        let gateway = section("gateway");
        if let Some(url) = text(gateway, "url") {
            config.gateway.url = url;
        }
        if let Some(secs) = parse::<u64>(gateway, "gateway", "timeout_secs")? {
            config.gateway.timeout = Duration::from_secs(secs);
        }

        let logging = section("logging");
        if let Some(level) = text(logging, "level") {
            config.logging.level = level;
        }
        config.logging.file = text(logging, "file").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        let positive = [
            ("download.max_attempts", self.download.max_attempts as usize),
            ("download.chunk_concurrency", self.download.chunk_concurrency),
            ("pool.min_endpoints", self.pool.min_endpoints),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: "0".to_string(),
                });
            }
        }
        if self.pool.refill_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "pool.refill_timeout_secs".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Render as INI.
    pub fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        let display = |p: &Path| p.display().to_string();

        let mut app = ini.with_section(Some("app"));
        if let Some(id) = self.app.app_id {
            app.set("app_id", id.to_string());
        }
        app.set("branch", self.app.branch.as_str());
        if !self.app.depots.is_empty() {
            let depots: Vec<String> = self.app.depots.iter().map(|d| d.to_string()).collect();
            app.set("depots", depots.join(", "));
        }

        let mut paths = ini.with_section(Some("paths"));
        paths.set("data_dir", display(&self.paths.data_dir));
        paths.set("repo_content_subdir", self.paths.repo_content_subdir.as_str());
        for (key, value) in [
            ("content_dir", &self.paths.content_dir),
            ("temp_dir", &self.paths.temp_dir),
            ("repo_dir", &self.paths.repo_dir),
            ("store_file", &self.paths.store_file),
        ] {
            if let Some(path) = value {
                paths.set(key, display(path));
            }
        }

        ini.with_section(Some("download"))
            .set("max_attempts", self.download.max_attempts.to_string())
            .set(
                "retry_delay_ms",
                self.download.retry_delay.as_millis().to_string(),
            )
            .set(
                "chunk_concurrency",
                self.download.chunk_concurrency.to_string(),
            );

        ini.with_section(Some("pool"))
            .set("min_endpoints", self.pool.min_endpoints.to_string())
            .set(
                "refill_backoff_ms",
                self.pool.refill_backoff.as_millis().to_string(),
            )
            .set(
                "refill_timeout_secs",
                self.pool.refill_timeout.as_secs().to_string(),
            );

        ini.with_section(Some("poll"))
            .set("interval_ms", self.poll.interval.as_millis().to_string());

        let mut processor = ini.with_section(Some("processor"));
        if let Some(command) = &self.processor.command {
            processor.set("command", display(command));
        }
        if !self.processor.args.is_empty() {
            processor.set("args", self.processor.args.join(" "));
        }
        if let Some(dir) = &self.processor.working_dir {
            processor.set("working_dir", display(dir));
        }

        let mut publisher = ini.with_section(Some("publisher"));
        publisher
            .set("enabled", self.publisher.enabled.to_string())
            .set("remote", self.publisher.git.remote.as_str())
            .set("branch", self.publisher.git.branch.as_str());
        if let Some(name) = &self.publisher.git.author_name {
            publisher.set("author_name", name.as_str());
        }
        if let Some(email) = &self.publisher.git.author_email {
            publisher.set("author_email", email.as_str());
        }

        ini.with_section(Some("gateway"))
            .set("url", self.gateway.url.as_str())
            .set("timeout_secs", self.gateway.timeout.as_secs().to_string());

        let mut logging = ini.with_section(Some("logging"));
        logging.set("level", self.logging.level.as_str());
        if let Some(file) = &self.logging.file {
            logging.set("file", display(file));
        }

        ini
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        self.to_ini().write_to_file(path).map_err(io_err)
    }

    /// The watched app, required for running.
    pub fn require_app(&self) -> ConfigResult<AppId> {
        self.app.app_id.ok_or_else(|| ConfigError::MissingValue {
            key: "app.app_id".to_string(),
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_endpoints: self.pool.min_endpoints,
            refill_backoff: self.pool.refill_backoff,
            refill_timeout: self.pool.refill_timeout,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.download.max_attempts, self.download.retry_delay)
    }

    pub fn delta_config(&self) -> DeltaConfig {
        DeltaConfig {
            chunk_concurrency: self.download.chunk_concurrency,
        }
    }

    pub fn detector_config(&self) -> ConfigResult<DetectorConfig> {
        let mut config = DetectorConfig::new(self.require_app()?, self.app.branch.clone());
        config.poll_interval = self.poll.interval;
        Ok(config)
    }

    pub fn sync_config(&self) -> ConfigResult<SyncConfig> {
        Ok(SyncConfig {
            app: self.require_app()?,
            branch: self.app.branch.clone(),
            depots: self.app.depots.clone(),
            temp_dir: self.paths.temp_dir(),
            content_dir: self.paths.content_dir(),
            repo_dir: self.paths.repo_dir(),
            repo_content_subdir: self.paths.repo_content_subdir.clone(),
        })
    }
}
