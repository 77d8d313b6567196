use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const APP_DIR_NAME: &str = "roster";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to encode toml config: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("failed to parse json5 config: {0}")]
    Json5(#[from] json5::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Program plus arguments used to hand an identifier to the OS uninstall flow.
/// Every `{id}` in `args` is replaced with the package identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UninstallCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip)]
    pub config_path: PathBuf,
    pub pin_store_path: PathBuf,
    pub preference_space: String,
    pub self_identifier: String,
    pub application_dirs: Vec<PathBuf>,
    pub scan_depth: usize,
    pub coalesce_window_ms: u64,
    pub settle_window_ms: u64,
    pub uninstall_grace_ms: u64,
    pub resume_refresh_delay_ms: u64,
    pub source_timeout_ms: u64,
    pub reload_retry_limit: u32,
    pub reload_retry_backoff_ms: u64,
    pub watch_interval_ms: u64,
    pub log_level: String,
    pub uninstall_command: Option<UninstallCommand>,
}

impl Default for Config {
    fn default() -> Self {
        let base = stable_app_data_dir();
        Self {
            config_path: base.join(CONFIG_FILE_NAME),
            pin_store_path: base.join("pins.sqlite3"),
            preference_space: "RosterLauncherPrefs".to_string(),
            self_identifier: "roster-core".to_string(),
            application_dirs: default_application_dirs(),
            scan_depth: 3,
            coalesce_window_ms: 500,
            settle_window_ms: 1000,
            uninstall_grace_ms: 2000,
            resume_refresh_delay_ms: 100,
            source_timeout_ms: 10_000,
            reload_retry_limit: 3,
            reload_retry_backoff_ms: 500,
            watch_interval_ms: 2000,
            log_level: "info".to_string(),
            uninstall_command: None,
        }
    }
}

impl Config {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn uninstall_grace(&self) -> Duration {
        Duration::from_millis(self.uninstall_grace_ms)
    }

    pub fn resume_refresh_delay(&self) -> Duration {
        Duration::from_millis(self.resume_refresh_delay_ms)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn reload_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.reload_retry_backoff_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        parse_level(&self.log_level).unwrap_or(log::LevelFilter::Info)
    }
}

pub fn stable_app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

pub fn default_config_path() -> PathBuf {
    stable_app_data_dir().join(CONFIG_FILE_NAME)
}

fn default_application_dirs() -> Vec<PathBuf> {
    let mut dirs_out = Vec::new();
    if let Some(data) = dirs::data_dir() {
        dirs_out.push(data.join("applications"));
    }
    dirs_out.push(PathBuf::from("/usr/local/share/applications"));
    dirs_out.push(PathBuf::from("/usr/share/applications"));
    dirs_out
}

/// Loads the config at `path` (or the default location). A missing file
/// yields defaults so first runs work without setup.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        return Ok(Config {
            config_path,
            ..Config::default()
        });
    }

    let raw = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    let mut cfg = parse(&raw, &config_path)?;
    cfg.config_path = config_path;
    validate(&cfg).map_err(ConfigError::Invalid)?;
    Ok(cfg)
}

pub fn parse(raw: &str, path: &Path) -> Result<Config, ConfigError> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json") || ext.eq_ignore_ascii_case("json5"))
        .unwrap_or(false);

    if is_json {
        Ok(json5::from_str::<Config>(raw)?)
    } else {
        Ok(toml::from_str::<Config>(raw)?)
    }
}

pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    validate(cfg).map_err(ConfigError::Invalid)?;
    let encoded = toml::to_string_pretty(cfg)?;
    if let Some(parent) = cfg.config_path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(&cfg.config_path, encoded).map_err(|source| ConfigError::Write {
        path: cfg.config_path.clone(),
        source,
    })
}

pub fn validate(cfg: &Config) -> Result<(), String> {
    if !(10..=10_000).contains(&cfg.coalesce_window_ms) {
        return Err("coalesce_window_ms out of range".into());
    }

    if cfg.settle_window_ms <= cfg.coalesce_window_ms {
        return Err("settle_window_ms must exceed coalesce_window_ms".into());
    }

    if cfg.uninstall_grace_ms < 100 {
        return Err("uninstall_grace_ms must be at least 100".into());
    }

    if cfg.source_timeout_ms < 100 {
        return Err("source_timeout_ms must be at least 100".into());
    }

    if cfg.reload_retry_limit > 10 {
        return Err("reload_retry_limit out of range".into());
    }

    if cfg.pin_store_path.as_os_str().is_empty() {
        return Err("pin_store_path is required".into());
    }

    if cfg.preference_space.trim().is_empty() {
        return Err("preference_space is required".into());
    }

    if parse_level(&cfg.log_level).is_none() {
        return Err(format!("unknown log_level '{}'", cfg.log_level));
    }

    Ok(())
}

fn parse_level(raw: &str) -> Option<log::LevelFilter> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "error" => Some(log::LevelFilter::Error),
        "warn" => Some(log::LevelFilter::Warn),
        "info" => Some(log::LevelFilter::Info),
        "debug" => Some(log::LevelFilter::Debug),
        "trace" => Some(log::LevelFilter::Trace),
        _ => None,
    }
}
