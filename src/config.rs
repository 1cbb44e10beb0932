use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Lock path used when neither the config file nor the CLI names one.
pub const DEFAULT_LOCK_PATH: &str = "/locks/lockfile.lock";

/// Top-level configuration loaded from watcher.toml.
#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct WatcherConfig {
    pub lock: LockConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Default tracing filter, e.g. "info" or "watcher=debug".
    pub level: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_LOCK_PATH),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Errors that can occur while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl WatcherConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Apply CLI overrides on top of the file values.
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(path) = &overrides.lock_file {
            self.lock.path = path.clone();
        }
        if let Some(level) = &overrides.log_level {
            self.log.level = level.clone();
        }
    }
}

/// Values supplied on the command line that take precedence over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub lock_file: Option<PathBuf>,
    pub log_level: Option<String>,
}
