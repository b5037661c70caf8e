use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

pub const APP_NAME: &str = "brew-updater";

/// Tick interval of the recurring check in seconds (fixed)
pub const DEFAULT_TICK_INTERVAL_SEC: u32 = 60;

/// Default per-package check interval in minutes
pub const DEFAULT_INTERVAL_MIN: u32 = 5;
pub const MIN_INTERVAL_MIN: u32 = 1;
pub const MAX_INTERVAL_MIN: u32 = 1440;

pub const DEFAULT_NOTIFY_METHOD: &str = "terminal-notifier";

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const STATE_FILE_NAME: &str = "state.json";
pub const LOCK_FILE_NAME: &str = "lock";
pub const LOG_FILE_NAME: &str = "brew-updater.log";

/// Timeout for a single metadata request in seconds
pub const FETCH_TIMEOUT_SECS: u64 = 10;

/// Number of concurrent metadata fetch workers
pub const FETCH_WORKERS: usize = 4;

/// A lock file older than this is considered abandoned (10 minutes)
pub const LOCK_STALE_TIMEOUT_SECS: u64 = 10 * 60;

/// Number of error messages kept in the state file
pub const MAX_RECORDED_ERRORS: usize = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed file {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid interval for {name}: must be 1-1440, got {value}")]
    InvalidInterval { name: String, value: u32 },

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid type: {0}")]
    InvalidKind(String),

    #[error("could not determine the configuration directory")]
    NoConfigDir,
}

/// Package category, with distinct install/upgrade semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageKind {
    Formula,
    Cask,
}

impl PackageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageKind::Formula => "formula",
            PackageKind::Cask => "cask",
        }
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "formula" => Ok(PackageKind::Formula),
            "cask" => Ok(PackageKind::Cask),
            other => Err(ConfigError::InvalidKind(other.to_string())),
        }
    }
}

/// Upgrade policy for an outdated package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Upgrade silently
    Auto,
    /// Only tell the user an upgrade is available
    Notify,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Auto => "auto",
            Policy::Notify => "notify",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Policy::Auto),
            "notify" => Ok(Policy::Notify),
            other => Err(ConfigError::InvalidPolicy(other.to_string())),
        }
    }
}

/// One watched package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchItem {
    pub name: String,
    /// `None` for entries written before the kind was tracked
    #[serde(
        rename = "type",
        default,
        serialize_with = "serialize_kind",
        deserialize_with = "deserialize_kind"
    )]
    pub kind: Option<PackageKind>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_policy"
    )]
    pub policy: Option<Policy>,
    #[serde(default)]
    pub interval_min: u32,
    #[serde(default)]
    pub added_at: Option<DateTime<Utc>>,
}

impl WatchItem {
    pub fn new(name: impl Into<String>, kind: PackageKind, added_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            kind: Some(kind),
            policy: None,
            interval_min: DEFAULT_INTERVAL_MIN,
            added_at: Some(added_at),
        }
    }

    /// Identity key: `kind:name`, or the bare name when the kind is unknown
    pub fn key(&self) -> String {
        watch_key(&self.name, self.kind)
    }

    /// Policy of this item, falling back to the global default
    pub fn effective_policy(&self, default: Policy) -> Policy {
        self.policy.unwrap_or(default)
    }
}

pub fn watch_key(name: &str, kind: Option<PackageKind>) -> String {
    match kind {
        Some(kind) => format!("{}:{}", kind.as_str(), name),
        None => name.to_string(),
    }
}

fn serialize_kind<S: Serializer>(kind: &Option<PackageKind>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(kind.map(|k| k.as_str()).unwrap_or(""))
}

fn deserialize_kind<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PackageKind>, D::Error> {
    let raw = Option::<String>::deserialize(d)?.unwrap_or_default();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(serde::de::Error::custom)
}

fn deserialize_policy<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Policy>, D::Error> {
    let raw = Option::<String>::deserialize(d)?.unwrap_or_default();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse().map(Some).map_err(serde::de::Error::custom)
}

fn deserialize_default_policy<'de, D: Deserializer<'de>>(d: D) -> Result<Policy, D::Error> {
    deserialize_policy(d).map(|policy| policy.unwrap_or(Policy::Auto))
}

/// Process-wide persisted configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: u32,
    pub tick_interval_sec: u32,
    #[serde(deserialize_with = "deserialize_default_policy")]
    pub default_policy: Policy,
    pub notify_method: String,
    /// Pass `--greedy` to cask operations (auto-updating casks are upgraded too)
    pub include_auto_update_cask: bool,
    pub watchlist: Vec<WatchItem>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            tick_interval_sec: DEFAULT_TICK_INTERVAL_SEC,
            default_policy: Policy::Auto,
            notify_method: DEFAULT_NOTIFY_METHOD.to_string(),
            include_auto_update_cask: true,
            watchlist: Vec::new(),
        }
    }
}

impl Config {
    /// Loads the configuration, returning defaults when the file is missing or empty.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        if data.is_empty() {
            return Ok(Self::default());
        }
        let cfg: Config = serde_json::from_slice(&data).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.normalize(Utc::now())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        write_json(path, self)
    }

    /// Fills defaults, validates intervals, and deduplicates the watchlist by key,
    /// keeping the earliest `added_at`.
    pub fn normalize(mut self, now: DateTime<Utc>) -> Result<Self, ConfigError> {
        self.tick_interval_sec = DEFAULT_TICK_INTERVAL_SEC;
        if self.notify_method.is_empty() {
            self.notify_method = DEFAULT_NOTIFY_METHOD.to_string();
        }

        let mut deduped: Vec<WatchItem> = Vec::with_capacity(self.watchlist.len());
        let mut seen: HashMap<String, usize> = HashMap::new();
        for mut item in std::mem::take(&mut self.watchlist) {
            if item.interval_min == 0 {
                item.interval_min = DEFAULT_INTERVAL_MIN;
            }
            validate_interval(&item.name, item.interval_min)?;
            let added_at = *item.added_at.get_or_insert(now);

            let key = item.key();
            if let Some(&idx) = seen.get(&key) {
                if let Some(earlier) = deduped[idx].added_at.filter(|t| *t < added_at) {
                    item.added_at = Some(earlier);
                }
                debug!(key = %key, "Dropping duplicate watch entry");
                deduped[idx] = item;
                continue;
            }
            seen.insert(key, deduped.len());
            deduped.push(item);
        }
        self.watchlist = deduped;
        Ok(self)
    }
}

pub fn validate_interval(name: &str, value: u32) -> Result<(), ConfigError> {
    if !(MIN_INTERVAL_MIN..=MAX_INTERVAL_MIN).contains(&value) {
        return Err(ConfigError::InvalidInterval {
            name: name.to_string(),
            value,
        });
    }
    Ok(())
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(io_err)?;
    }
    let data = serde_json::to_vec_pretty(value).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, data).map_err(io_err)
}

/// Returns the directory holding config, state, lock, and log files.
/// Uses the platform config directory (`~/Library/Application Support` on macOS),
/// falling back to `~/.config`.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    config_dir_with_env(dirs::config_dir(), dirs::home_dir())
}

/// Resolves `--config`, defaulting to `<config_dir>/config.json`.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(config_dir()?.join(CONFIG_FILE_NAME)),
    }
}

pub fn state_path(config_path: &Path) -> PathBuf {
    sibling(config_path, STATE_FILE_NAME)
}

pub fn lock_path(config_path: &Path) -> PathBuf {
    sibling(config_path, LOCK_FILE_NAME)
}

pub fn log_path(config_path: &Path) -> PathBuf {
    sibling(config_path, LOG_FILE_NAME)
}

fn sibling(config_path: &Path, file_name: &str) -> PathBuf {
    config_path
        .parent()
        .map(|dir| dir.join(file_name))
        .unwrap_or_else(|| PathBuf::from(file_name))
}

fn config_dir_with_env(
    platform_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
) -> Result<PathBuf, ConfigError> {
    platform_dir
        .or_else(|| home_dir.map(|home| home.join(".config")))
        .map(|dir| dir.join(APP_NAME))
        .ok_or(ConfigError::NoConfigDir)
}
