use serde::{Deserialize, Serialize};
use url::Url;

use std::future::Future;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Settings for the background outbox drain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Seconds between scheduled drain attempts.
    pub tick_secs: u64,
    /// Maximum ops replayed per cycle.
    pub batch_limit: usize,
    /// Attempts before an op is dead-lettered.
    pub max_attempts: u32,
    /// Try the batched `/sync-plan` replay before per-op replay.
    pub batch_replay: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            tick_secs: 10,
            batch_limit: 50,
            max_attempts: 8,
            batch_replay: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the notes API; endpoint names are joined onto it.
    pub endpoint: String,
    /// Directory holding the local vault, outbox and auth material.
    pub data_dir: PathBuf,
    pub worker: WorkerSettings,
    /// Seconds between live checks of the open note.
    pub live_poll_secs: u64,
    /// Seconds between background pulls of the full note set.
    pub pull_interval_secs: u64,
    /// Page size requested from `/download`.
    pub download_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/api/v1/notes/".to_owned(),
            data_dir: PathBuf::from("./data"),
            worker: WorkerSettings::default(),
            live_poll_secs: 10,
            pull_interval_secs: 30,
            download_limit: 1000,
        }
    }
}

impl Config {
    /// Loads the configuration from the provided loader.
    pub async fn load(loader: &impl Loader) -> Result<Self, ConfigError> {
        loader.load().await.map_err(|e| ConfigError::Load {
            path: loader.location(),
            message: e.to_string(),
        })
    }

    /// Saves the configuration using the provided saver.
    pub async fn save(&self, saver: &impl Saver) -> Result<(), ConfigError> {
        saver.save(self).await.map_err(|e| ConfigError::Save {
            path: saver.location(),
            message: e.to_string(),
        })
    }

    /// Apply environment overrides on top of this configuration.
    ///
    /// Optional env vars:
    /// - `INKWELL_ENDPOINT`: notes API base URL
    /// - `INKWELL_DATA_DIR`: data directory
    /// - `INKWELL_SYNC_TICK_SECS`: outbox drain interval
    /// - `INKWELL_MAX_ATTEMPTS`: retry budget before dead-lettering
    /// - `INKWELL_LIVE_POLL_SECS`: live check interval for the open note
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(endpoint) = std::env::var("INKWELL_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Ok(dir) = std::env::var("INKWELL_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse_env("INKWELL_SYNC_TICK_SECS", "worker.tick_secs")? {
            self.worker.tick_secs = secs;
        }
        if let Some(attempts) = parse_env("INKWELL_MAX_ATTEMPTS", "worker.max_attempts")? {
            self.worker.max_attempts = attempts;
        }
        if let Some(secs) = parse_env("INKWELL_LIVE_POLL_SECS", "live_poll_secs")? {
            self.live_poll_secs = secs;
        }
        self.validate()?;
        Ok(self)
    }

    /// Load defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    /// Check the values the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint_url()?;
        if self.worker.tick_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "worker.tick_secs",
                message: "must be at least 1 second".into(),
            });
        }
        if self.worker.batch_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "worker.batch_limit",
                message: "must be at least 1".into(),
            });
        }
        if self.live_poll_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "live_poll_secs",
                message: "must be at least 1 second".into(),
            });
        }
        if self.pull_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "pull_interval_secs",
                message: "must be at least 1 second".into(),
            });
        }
        Ok(())
    }

    /// Parsed API base URL, normalized to end in `/` so endpoints join under it.
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        let mut raw = self.endpoint.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        Url::parse(&raw).map_err(|e| ConfigError::UrlParse {
            url: self.endpoint.clone(),
            message: e.to_string(),
        })
    }
}

fn parse_env<T: std::str::FromStr>(
    var: &'static str,
    field: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                field,
                message: format!("{var}={raw}: {e}"),
            }),
        Err(_) => Ok(None),
    }
}

/// The trait for loading configuration data.
pub trait Loader {
    /// Where the configuration is loaded from, for error reporting.
    fn location(&self) -> PathBuf;

    /// Loads the configuration data.
    fn load(
        &self,
    ) -> impl Future<
        Output = core::result::Result<Config, Box<dyn std::error::Error + Send + Sync + 'static>>,
    > + Send;
}

/// The trait for saving configuration data.
pub trait Saver {
    /// Where the configuration is saved to, for error reporting.
    fn location(&self) -> PathBuf;

    /// Saves the configuration data.
    fn save(
        &self,
        config: &Config,
    ) -> impl Future<
        Output = core::result::Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>,
    > + Send;
}

/// An implementation of [`Loader`] and [`Saver`] that reads and writes a JSON configuration file.
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    /// Create a new [`ConfigFile`] with the given path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl Loader for ConfigFile {
    fn location(&self) -> PathBuf {
        self.path.clone()
    }

    async fn load(
        &self,
    ) -> core::result::Result<Config, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl Saver for ConfigFile {
    fn location(&self) -> PathBuf {
        self.path.clone()
    }

    async fn save(
        &self,
        config: &Config,
    ) -> core::result::Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_string_pretty(config)?).await?;
        Ok(())
    }
}
