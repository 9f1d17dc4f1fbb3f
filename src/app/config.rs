use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdbSettings {
    pub command_path: String,
    pub host: String,
    pub serial: String,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            command_path: String::new(),
            host: "localhost".to_string(),
            serial: String::new(),
            connect_timeout_secs: 30,
            command_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    pub read_buffer_size: usize,
    pub batch_delay_ms: u64,
    pub batch_max_len: usize,
    pub settle_quiet_ms: u64,
    pub settle_max_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            read_buffer_size: 4096,
            batch_delay_ms: 50,
            batch_max_len: 16_384,
            settle_quiet_ms: 150,
            settle_max_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputSettings {
    pub max_retained_bytes: usize,
    pub file_path: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            max_retained_bytes: 512 * 1024,
            file_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PairingSettings {
    pub pair_timeout_secs: u64,
    pub retry_delay_ms: u64,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            pair_timeout_secs: 10,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandSettings {
    pub max_history_size: usize,
    pub auto_save_history: bool,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            max_history_size: 200,
            auto_save_history: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
        }
    }
}

/// Values written back by the app itself rather than by the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    #[serde(default)]
    pub paired_before: bool,
    #[serde(default)]
    pub command_history: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub adb: AdbSettings,
    pub session: SessionSettings,
    pub output: OutputSettings,
    pub pairing: PairingSettings,
    pub command: CommandSettings,
    pub logging: LoggingSettings,
    pub state: PersistedState,
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adb: AdbSettings::default(),
            session: SessionSettings::default(),
            output: OutputSettings::default(),
            pairing: PairingSettings::default(),
            command: CommandSettings::default(),
            logging: LoggingSettings::default(),
            state: PersistedState::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("LADB_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ladb")
        .join("config.json")
}

pub fn backup_config_path(path: &Path) -> PathBuf {
    path.with_extension("backup.json")
}

/// Where the session output is mirrored when the config leaves it unset.
pub fn output_file_path(config: &AppConfig) -> PathBuf {
    let configured = config.output.file_path.trim();
    if !configured.is_empty() {
        return PathBuf::from(configured);
    }
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ladb")
        .join("output.txt")
}

pub fn load_config_from_path(path: &Path) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), ""))?;
    Ok(validate_config(config))
}

pub fn save_config_to_path(config: &AppConfig, path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_config_path(path));
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    let defaults = AppConfig::default();
    if config.adb.host.trim().is_empty() {
        config.adb.host = defaults.adb.host;
    }
    if config.adb.connect_timeout_secs == 0 {
        config.adb.connect_timeout_secs = defaults.adb.connect_timeout_secs;
    }
    if config.adb.command_timeout_secs == 0 {
        config.adb.command_timeout_secs = defaults.adb.command_timeout_secs;
    }
    if config.session.read_buffer_size < 256 {
        config.session.read_buffer_size = defaults.session.read_buffer_size;
    }
    if config.session.batch_max_len < 1024 {
        config.session.batch_max_len = defaults.session.batch_max_len;
    }
    if config.session.settle_max_ms < config.session.settle_quiet_ms {
        config.session.settle_max_ms = config.session.settle_quiet_ms;
    }
    if config.output.max_retained_bytes < 4096 {
        config.output.max_retained_bytes = defaults.output.max_retained_bytes;
    }
    if config.pairing.pair_timeout_secs == 0 {
        config.pairing.pair_timeout_secs = defaults.pairing.pair_timeout_secs;
    }
    if config.command.max_history_size == 0 {
        config.command.max_history_size = defaults.command.max_history_size;
    }
    let cap = config.command.max_history_size;
    let history = &mut config.state.command_history;
    if history.len() > cap {
        let start = history.len() - cap;
        history.drain(..start);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let value = serde_json::json!({
            "adb": {
                "command_path": "/opt/platform-tools/adb",
                "host": "127.0.0.1",
                "serial": "",
                "connect_timeout_secs": 5,
                "command_timeout_secs": 3
            },
            "state": { "paired_before": true }
        });
        let config: AppConfig = serde_json::from_value(value).expect("parse");
        assert_eq!(config.adb.host, "127.0.0.1");
        assert!(config.state.paired_before);
        assert!(config.state.command_history.is_empty());
        assert_eq!(config.session, SessionSettings::default());
        assert_eq!(config.pairing, PairingSettings::default());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "session": { "settle_quiet_ms": 80 } }"#).expect("parse");
        assert_eq!(config.session.settle_quiet_ms, 80);
        assert_eq!(config.session.read_buffer_size, 4096);
        assert_eq!(config.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = AppConfig::default();
        config.adb.host = "  ".to_string();
        config.adb.connect_timeout_secs = 0;
        config.session.read_buffer_size = 1;
        config.session.settle_quiet_ms = 400;
        config.session.settle_max_ms = 100;
        config.output.max_retained_bytes = 10;
        config.command.max_history_size = 2;
        config.state.command_history = vec!["a".into(), "b".into(), "c".into()];

        let validated = validate_config(config);
        assert_eq!(validated.adb.host, "localhost");
        assert_eq!(validated.adb.connect_timeout_secs, 30);
        assert_eq!(validated.session.read_buffer_size, 4096);
        assert_eq!(validated.session.settle_max_ms, 400);
        assert_eq!(validated.output.max_retained_bytes, 512 * 1024);
        assert_eq!(validated.state.command_history, vec!["b", "c"]);
    }

    #[test]
    fn save_then_load_keeps_a_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig::default();
        save_config_to_path(&config, &path).expect("first save");
        config.state.paired_before = true;
        save_config_to_path(&config, &path).expect("second save");

        let loaded = load_config_from_path(&path).expect("load");
        assert!(loaded.state.paired_before);

        let backup = load_config_from_path(&backup_config_path(&path)).expect("load backup");
        assert!(!backup.state.paired_before);
    }

    #[test]
    fn corrupt_config_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").expect("write");
        let err = load_config_from_path(&path).expect_err("expected parse error");
        assert_eq!(err.code, "ERR_SYSTEM");
    }

    #[test]
    fn configured_output_path_wins() {
        let mut config = AppConfig::default();
        config.output.file_path = "/tmp/ladb-out.txt".to_string();
        assert_eq!(output_file_path(&config), PathBuf::from("/tmp/ladb-out.txt"));
    }
}
