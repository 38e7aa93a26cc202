use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not determine config directory")]
    NoConfigDir,
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub governor: Option<GovernorSection>,
    pub cache: Option<CacheSection>,
    pub storage: Option<StorageSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GovernorSection {
    pub min_interval_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    /// Fraction of the computed backoff added as random jitter (0.0-1.0).
    pub jitter: Option<f64>,
    /// Per-attempt timeout; 0 or absent disables it.
    pub task_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSection {
    pub default_ttl_secs: Option<u64>,
    pub durable_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSection {
    pub path: Option<String>,
    /// Run memory-only, even if a path is configured.
    pub disabled: Option<bool>,
}

/// Platform config directory path: `<config_dir>/revlens/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("revlens").join("config.toml"))
}

/// Default durable store location: `<data_dir>/revlens/cache.db`.
pub fn default_store_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("revlens").join("cache.db"))
}

/// Load config by cascading CWD `.revlens.toml` over platform config.
/// CWD values override platform values. Unreadable or malformed files are
/// logged and skipped.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_logged(&p));
    let cwd = load_logged(Path::new(".revlens.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

fn load_logged(path: &Path) -> Option<ConfigFile> {
    match load_from_path(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring config file");
            None
        }
    }
}

/// Load a config from a specific path. Returns `Ok(None)` if the file does
/// not exist.
pub fn load_from_path(path: &Path) -> Result<Option<ConfigFile>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&content)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    ConfigFile {
        governor: merge_governor(base.governor, overlay.governor),
        cache: merge_cache(base.cache, overlay.cache),
        storage: merge_storage(base.storage, overlay.storage),
    }
}

fn merge_governor(
    base: Option<GovernorSection>,
    overlay: Option<GovernorSection>,
) -> Option<GovernorSection> {
    match (base, overlay) {
        (Some(b), Some(o)) => Some(GovernorSection {
            min_interval_ms: o.min_interval_ms.or(b.min_interval_ms),
            max_retries: o.max_retries.or(b.max_retries),
            backoff_base_ms: o.backoff_base_ms.or(b.backoff_base_ms),
            max_backoff_secs: o.max_backoff_secs.or(b.max_backoff_secs),
            jitter: o.jitter.or(b.jitter),
            task_timeout_secs: o.task_timeout_secs.or(b.task_timeout_secs),
        }),
        (b, o) => o.or(b),
    }
}

fn merge_cache(base: Option<CacheSection>, overlay: Option<CacheSection>) -> Option<CacheSection> {
    match (base, overlay) {
        (Some(b), Some(o)) => Some(CacheSection {
            default_ttl_secs: o.default_ttl_secs.or(b.default_ttl_secs),
            durable_ttl_secs: o.durable_ttl_secs.or(b.durable_ttl_secs),
        }),
        (b, o) => o.or(b),
    }
}

fn merge_storage(
    base: Option<StorageSection>,
    overlay: Option<StorageSection>,
) -> Option<StorageSection> {
    match (base, overlay) {
        (Some(b), Some(o)) => Some(StorageSection {
            path: o.path.or(b.path),
            disabled: o.disabled.or(b.disabled),
        }),
        (b, o) => o.or(b),
    }
}

/// Save the config to the platform config directory.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf, ConfigError> {
    let path = config_path().ok_or(ConfigError::NoConfigDir)?;
    save_to_path(config, &path)?;
    Ok(path)
}

/// Save the config to `path`, creating parent directories as needed.
pub fn save_to_path(config: &ConfigFile, path: &Path) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(io_err)
}
