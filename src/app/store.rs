use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::warn;

use crate::app::config::{load_config_from_path, save_config_to_path};
use crate::app::error::AppError;
use crate::app::observable::lock;

/// State that survives process restarts.
pub trait StateStore: Send + Sync {
    fn paired_before(&self) -> bool;
    fn set_paired_before(&self, paired: bool) -> Result<(), AppError>;
    fn load_history(&self) -> Vec<String>;
    fn save_history(&self, history: &[String]) -> Result<(), AppError>;
}

/// Keeps the state inside the JSON config file, next to the user settings.
pub struct ConfigStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file.
    guard: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }
}

impl StateStore for ConfigStore {
    fn paired_before(&self) -> bool {
        let _guard = lock(&self.guard);
        match load_config_from_path(&self.path) {
            Ok(config) => config.state.paired_before,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read pairing flag");
                false
            }
        }
    }

    fn set_paired_before(&self, paired: bool) -> Result<(), AppError> {
        let _guard = lock(&self.guard);
        let mut config = load_config_from_path(&self.path)?;
        if config.state.paired_before == paired {
            return Ok(());
        }
        config.state.paired_before = paired;
        save_config_to_path(&config, &self.path)
    }

    fn load_history(&self) -> Vec<String> {
        let _guard = lock(&self.guard);
        load_config_from_path(&self.path)
            .map(|config| config.state.command_history)
            .unwrap_or_default()
    }

    fn save_history(&self, history: &[String]) -> Result<(), AppError> {
        let _guard = lock(&self.guard);
        let mut config = load_config_from_path(&self.path)?;
        config.state.command_history = history.to_vec();
        save_config_to_path(&config, &self.path)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    paired: AtomicBool,
    history: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new(paired_before: bool) -> Self {
        Self {
            paired: AtomicBool::new(paired_before),
            history: Mutex::new(Vec::new()),
        }
    }
}

impl StateStore for MemoryStore {
    fn paired_before(&self) -> bool {
        self.paired.load(Ordering::SeqCst)
    }

    fn set_paired_before(&self, paired: bool) -> Result<(), AppError> {
        self.paired.store(paired, Ordering::SeqCst);
        Ok(())
    }

    fn load_history(&self) -> Vec<String> {
        lock(&self.history).clone()
    }

    fn save_history(&self, history: &[String]) -> Result<(), AppError> {
        *lock(&self.history) = history.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::AppConfig;

    #[test]
    fn config_store_round_trips_flag_and_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(&path);

        assert!(!store.paired_before());
        store.set_paired_before(true).expect("set flag");
        store
            .save_history(&["ls".to_string(), "pwd".to_string()])
            .expect("save history");

        let reopened = ConfigStore::new(&path);
        assert!(reopened.paired_before());
        assert_eq!(reopened.load_history(), vec!["ls", "pwd"]);
    }

    #[test]
    fn config_store_keeps_user_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.adb.host = "10.0.0.7".to_string();
        save_config_to_path(&config, &path).expect("seed");

        let store = ConfigStore::new(&path);
        store.set_paired_before(true).expect("set flag");

        let loaded = load_config_from_path(&path).expect("load");
        assert_eq!(loaded.adb.host, "10.0.0.7");
        assert!(loaded.state.paired_before);
    }

    #[test]
    fn memory_store_starts_from_given_flag() {
        assert!(MemoryStore::new(true).paired_before());
        assert!(!MemoryStore::default().paired_before());
    }
}
