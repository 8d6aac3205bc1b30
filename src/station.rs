//! Wiring of one station: settings, store, repository, alerts and controller.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};

use crate::{
    alert::{self, AlertController},
    clock::MonotonicClock,
    events::EventBus,
    exam::ExamController,
    repository::{ExamRepository, OwnershipLedger},
    settings::{SettingsStore, StationSettings, StoreBackend},
    store::{ExamStore, MemoryExamStore, SqliteExamStore},
};

const SETTINGS_FILE: &str = "settings.json";
const LEDGER_FILE: &str = "owned_exams.json";
const DATABASE_FILE: &str = "exams.sqlite3";

#[derive(Debug, Clone)]
pub struct StationOptions {
    pub data_dir: PathBuf,
    /// Force the in-memory store whatever the settings say.
    pub memory: bool,
    pub mute: bool,
}

pub struct Station {
    pub settings: StationSettings,
    pub controller: ExamController,
    pub repository: ExamRepository,
}

impl Station {
    /// Open the station and load its exams. Store failures at startup are
    /// reported and the station carries on with what it has.
    pub async fn open(options: &StationOptions, events: EventBus) -> Result<Self> {
        std::fs::create_dir_all(&options.data_dir).with_context(|| {
            format!("failed to create data directory {}", options.data_dir.display())
        })?;

        let settings = SettingsStore::new(options.data_dir.join(SETTINGS_FILE))?.settings();
        let backend = if options.memory {
            StoreBackend::Memory
        } else {
            settings.store
        };

        let (store, ledger): (Arc<dyn ExamStore>, OwnershipLedger) = match backend {
            StoreBackend::Sqlite => {
                let path = settings
                    .database_path
                    .clone()
                    .unwrap_or_else(|| options.data_dir.join(DATABASE_FILE));
                let store = SqliteExamStore::open(path, settings.store_poll_interval())?;
                let ledger = OwnershipLedger::open(options.data_dir.join(LEDGER_FILE))?;
                (Arc::new(store), ledger)
            }
            StoreBackend::Memory => {
                info!("Using the in-memory store; exams end with this process");
                (Arc::new(MemoryExamStore::new()), OwnershipLedger::in_memory())
            }
        };

        let repository = ExamRepository::new(store, ledger, events.clone());
        if let Err(err) = repository.load_all(Utc::now()).await {
            warn!("Could not load exams: {err:#}");
            events.notice("Exam history could not be loaded; new exams will still be saved");
        }
        if let Err(err) = repository.subscribe_ongoing().await {
            warn!("Could not follow other stations: {err:#}");
        }

        let sound = alert::alert_sound(
            settings.alert_sound.enabled && !options.mute,
            settings.alert_sound.volume,
        );
        let alerts = AlertController::new(sound, events.clone());

        let controller = ExamController::new(
            repository.clone(),
            alerts,
            events,
            MonotonicClock::new().shared(),
            settings.tick_interval(),
        );
        controller.restore_local().await;

        info!("Station '{}' ready", settings.station_name);
        Ok(Self {
            settings,
            controller,
            repository,
        })
    }

    /// Stop tickers and wait for queued saves to reach the store.
    pub async fn close(&self) {
        self.controller.shutdown();
        self.repository.flush().await;
        info!("Station '{}' closed", self.settings.station_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exam::{ExamType, NewExam};

    fn temp_data_dir() -> PathBuf {
        std::env::temp_dir().join(format!("piotrack-station-{}", uuid::Uuid::new_v4()))
    }

    fn intake() -> NewExam {
        NewExam {
            name: "Carlos Pereira".into(),
            dob: "1949-12-01".into(),
            operator: "Dra. Nunes".into(),
            exam_type: ExamType::Tsh,
            observation: String::new(),
        }
    }

    #[tokio::test]
    async fn reopened_station_keeps_its_exams() {
        let data_dir = temp_data_dir();
        let options = StationOptions {
            data_dir: data_dir.clone(),
            memory: false,
            mute: true,
        };

        let (events, _rx) = EventBus::channel();
        let station = Station::open(&options, events).await.unwrap();
        let exam = station.controller.create(intake()).await.unwrap();
        station.controller.start_first(&exam.id).await.unwrap();
        station.close().await;
        drop(station);

        let (events, _rx) = EventBus::channel();
        let reopened = Station::open(&options, events).await.unwrap();
        let snapshot = reopened.controller.snapshot().await;
        assert_eq!(snapshot.local.len(), 1);
        assert_eq!(snapshot.local[0].exam.id, exam.id);
        assert_eq!(snapshot.local[0].exam.measures.len(), 1);
        assert!(snapshot.remote.is_empty());
        reopened.close().await;
        drop(reopened);

        let _ = std::fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn memory_flag_skips_the_database() {
        let data_dir = temp_data_dir();
        let options = StationOptions {
            data_dir: data_dir.clone(),
            memory: true,
            mute: true,
        };

        let (events, _rx) = EventBus::channel();
        let station = Station::open(&options, events).await.unwrap();
        station.controller.create(intake()).await.unwrap();
        station.close().await;

        assert!(!data_dir.join(DATABASE_FILE).exists());
        assert!(data_dir.join(SETTINGS_FILE).exists());
        let _ = std::fs::remove_dir_all(&data_dir);
    }
}
