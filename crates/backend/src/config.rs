use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

const DEFAULT_CONCURRENT_PROBES: usize = 4;
const DEFAULT_SEARCH_RESULT_COUNT: usize = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub version: u32,
    pub music_root: String,
    pub catalog_path: String,
    pub cache_path: String,
    pub import_formats: Vec<String>,
    pub concurrent_probes: usize,
    pub follow_symlinks: bool,
    pub rescan_at_start: bool,
    pub search_result_count: usize,
    pub watch_music: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            music_root: "".to_string(),
            catalog_path: "catalog.redb".to_string(),
            cache_path: "song-cache".to_string(),
            import_formats: default_import_formats(),
            concurrent_probes: DEFAULT_CONCURRENT_PROBES,
            follow_symlinks: true,
            rescan_at_start: false,
            search_result_count: DEFAULT_SEARCH_RESULT_COUNT,
            watch_music: true,
        }
    }
}

fn default_import_formats() -> Vec<String> {
    ["mp3", "flac", "ogg", "opus"]
        .into_iter()
        .map(|value| value.to_string())
        .collect()
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("FILE_BACKEND_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => PathBuf::from("file-backend.yaml"),
    }
}

/// Loads the config, writing a default file on first run so operators have
/// something to edit.
pub fn load_or_create_config(path: &Path) -> Result<(BackendConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: BackendConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.catalog_path.trim().is_empty() {
            config.catalog_path = "catalog.redb".to_string();
        }
        if config.cache_path.trim().is_empty() {
            config.cache_path = "song-cache".to_string();
        }
        if config.import_formats.is_empty() {
            config.import_formats = default_import_formats();
        }
        if config.concurrent_probes == 0 {
            config.concurrent_probes = DEFAULT_CONCURRENT_PROBES;
        }
        if config.search_result_count == 0 {
            config.search_result_count = DEFAULT_SEARCH_RESULT_COUNT;
        }
        return Ok((config, false));
    }

    let config = BackendConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &BackendConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

pub fn resolve_music_root(config_path: &Path, value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(resolve_path(config_path, trimmed))
    }
}
