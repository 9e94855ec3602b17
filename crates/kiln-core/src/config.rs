//! kiln.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File looked up in the working directory when no config path is given.
pub const DEFAULT_CONFIG_FILE: &str = "kiln.toml";

pub const DEFAULT_STATE_DIR: &str = ".kiln";
pub const DEFAULT_DOCKER_BIN: &str = "docker";
pub const DEFAULT_IMAGE_NAMESPACE: &str = "kiln";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid duration {0:?} (expected e.g. 500ms, 30s, 5m)")]
    Duration(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    pub state: Option<StateConfig>,
    pub runtime: Option<RuntimeConfig>,
    pub build: Option<BuildConfig>,
    pub execution: Option<ExecutionConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub docker_bin: Option<String>,
    pub image_namespace: Option<String>,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    pub on_contention: Option<ContentionPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub read_only_mounts: Option<bool>,
}

/// What a build does when another build of the same component is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// Wait for the in-flight build to finish.
    #[default]
    Queue,
    /// Fail immediately with a conflict.
    FailFast,
}

impl KilnConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load an explicit config file, or `./kiln.toml` if present, or defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let implicit = Path::new(DEFAULT_CONFIG_FILE);
                if implicit.is_file() {
                    Self::from_file(implicit)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state
            .as_ref()
            .and_then(|s| s.dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
    }

    pub fn docker_bin(&self) -> &str {
        self.runtime
            .as_ref()
            .and_then(|r| r.docker_bin.as_deref())
            .unwrap_or(DEFAULT_DOCKER_BIN)
    }

    pub fn image_namespace(&self) -> &str {
        self.runtime
            .as_ref()
            .and_then(|r| r.image_namespace.as_deref())
            .unwrap_or(DEFAULT_IMAGE_NAMESPACE)
    }

    /// Per-operation timeout for runtime-touching commands.
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        match self.runtime.as_ref().and_then(|r| r.timeout.as_deref()) {
            Some(s) => parse_duration(s).ok_or_else(|| ConfigError::Duration(s.to_string())),
            None => Ok(DEFAULT_TIMEOUT),
        }
    }

    pub fn contention_policy(&self) -> ContentionPolicy {
        self.build
            .as_ref()
            .and_then(|b| b.on_contention)
            .unwrap_or_default()
    }

    pub fn read_only_mounts(&self) -> bool {
        self.execution
            .as_ref()
            .and_then(|e| e.read_only_mounts)
            .unwrap_or(false)
    }
}

/// Parse `500ms`, `30s`, `5m`, or a bare number of seconds. Values that
/// overflow are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
