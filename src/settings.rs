use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    time::Duration,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertSoundSettings {
    pub enabled: bool,
    /// 0.0..=1.0
    pub volume: f32,
}

impl Default for AlertSoundSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            volume: 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared database file, visible to every station that opens it.
    #[default]
    Sqlite,
    /// Nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct StationSettings {
    pub station_name: String,
    pub alert_sound: AlertSoundSettings,
    pub store: StoreBackend,
    /// Defaults to `exams.sqlite3` in the data directory. Point several
    /// stations at the same file to share exams.
    pub database_path: Option<PathBuf>,
    pub tick_interval_ms: u64,
    pub store_poll_interval_ms: u64,
}

impl Default for StationSettings {
    fn default() -> Self {
        Self {
            station_name: "station".into(),
            alert_sound: AlertSoundSettings::default(),
            store: StoreBackend::default(),
            database_path: None,
            tick_interval_ms: 1_000,
            store_poll_interval_ms: 1_000,
        }
    }
}

impl StationSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(50))
    }

    pub fn store_poll_interval(&self) -> Duration {
        Duration::from_millis(self.store_poll_interval_ms.max(50))
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: StationSettings,
}

impl SettingsStore {
    /// Load `path`, writing the defaults there on first run so operators have
    /// a file to edit.
    pub fn new(path: PathBuf) -> Result<Self> {
        let exists = path.exists();
        let data = if exists {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Ignoring unreadable settings in {}: {err}", path.display());
                StationSettings::default()
            })
        } else {
            StationSettings::default()
        };

        let store = Self { path, data };
        if !exists {
            store.persist(&store.data)?;
        }
        Ok(store)
    }

    pub fn settings(&self) -> StationSettings {
        self.data.clone()
    }

    fn persist(&self, data: &StationSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("piotrack-settings-{}", uuid::Uuid::new_v4()))
            .join("settings.json")
    }

    #[test]
    fn first_run_writes_defaults() {
        let path = temp_settings_path();
        let store = SettingsStore::new(path.clone()).unwrap();
        assert!(path.exists());
        assert_eq!(store.settings(), StationSettings::default());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let path = temp_settings_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"stationName": "sala 2", "store": "memory"}"#).unwrap();

        let settings = SettingsStore::new(path.clone()).unwrap().settings();
        assert_eq!(settings.station_name, "sala 2");
        assert_eq!(settings.store, StoreBackend::Memory);
        assert_eq!(settings.tick_interval(), Duration::from_secs(1));
        assert!(settings.alert_sound.enabled);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
