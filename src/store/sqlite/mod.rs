//! SQLite-backed store that several stations can share as one file.
//!
//! Other processes' commits are noticed by polling `PRAGMA data_version`;
//! this process' own writes publish a snapshot directly.

mod connection;
mod exams;
mod migrations;

use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub use connection::Database;

use super::{exam_to_value, ExamStore, OngoingSnapshot, SNAPSHOT_CHANNEL_CAPACITY};
use crate::exam::Exam;

// The watcher polls every second or so; keep it quiet unless debugging.
const ENABLE_LOGS: bool = false;

#[allow(unused_imports)]
use crate::{log_debug, log_info, log_warn};

pub struct SqliteExamStore {
    db: Database,
    notify: broadcast::Sender<OngoingSnapshot>,
    shutdown: CancellationToken,
}

impl SqliteExamStore {
    /// Open (creating if needed) the database and start watching it for
    /// changes made by other stations. Must be called inside a tokio runtime.
    pub fn open(path: PathBuf, poll_interval: Duration) -> Result<Self> {
        let db = Database::new(path)?;
        let (notify, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let store = Self {
            db,
            notify,
            shutdown: CancellationToken::new(),
        };
        store.spawn_watcher(poll_interval);
        Ok(store)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn spawn_watcher(&self, poll_interval: Duration) {
        let db = self.db.clone();
        let notify = self.notify.clone();
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = crate::clock::ticker(poll_interval);
            let mut last_version: Option<i64> = None;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if notify.receiver_count() == 0 {
                    continue;
                }

                match db.data_version().await {
                    Ok(version) if last_version == Some(version) => continue,
                    Ok(_) => {}
                    Err(err) => {
                        log_warn!("store watcher could not read data_version: {err:#}");
                        continue;
                    }
                }

                match db.ongoing_snapshot().await {
                    Ok((version, snapshot)) => {
                        log_debug!(
                            "store changed (data_version {version}), {} ongoing exams",
                            snapshot.records.len()
                        );
                        last_version = Some(version);
                        let _ = notify.send(snapshot);
                    }
                    Err(err) => log_warn!("store watcher snapshot failed: {err:#}"),
                }
            }

            log_info!("store watcher stopped");
        });
    }

    async fn publish_own_change(&self) {
        if self.notify.receiver_count() == 0 {
            return;
        }
        match self.db.ongoing_snapshot().await {
            Ok((_, snapshot)) => {
                let _ = self.notify.send(snapshot);
            }
            Err(err) => log_warn!("could not publish store snapshot: {err:#}"),
        }
    }
}

impl Drop for SqliteExamStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl ExamStore for SqliteExamStore {
    async fn upsert(&self, exam: &Exam) -> Result<()> {
        let record = exam_to_value(exam)?;
        self.db.upsert_exam_body(exam.id.clone(), record).await?;
        self.publish_own_change().await;
        Ok(())
    }

    async fn fetch_all(&self) -> Result<Vec<Value>> {
        self.db.list_exam_bodies().await
    }

    async fn delete(&self, exam_id: &str) -> Result<()> {
        self.db.delete_exam(exam_id.to_string()).await?;
        self.publish_own_change().await;
        Ok(())
    }

    async fn ongoing_snapshot(&self) -> Result<OngoingSnapshot> {
        Ok(self.db.ongoing_snapshot().await?.1)
    }

    fn subscribe_ongoing(&self) -> broadcast::Receiver<OngoingSnapshot> {
        self.notify.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::exam::{ExamType, NewExam};

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("piotrack-test-{}", uuid::Uuid::new_v4()))
            .join("exams.sqlite3")
    }

    fn exam(id: &str) -> Exam {
        Exam::from_intake(
            id.into(),
            NewExam {
                name: "Ana Souza".into(),
                dob: "1961-02-03".into(),
                operator: "Dr. Lima".into(),
                exam_type: ExamType::Tsh,
                observation: String::new(),
            },
            Utc::now(),
        )
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<OngoingSnapshot>,
        check: impl Fn(&OngoingSnapshot) -> bool,
    ) -> OngoingSnapshot {
        timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(snapshot) if check(&snapshot) => return snapshot,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(err) => panic!("snapshot channel closed: {err}"),
                }
            }
        })
        .await
        .expect("no matching snapshot")
    }

    #[tokio::test]
    async fn upsert_fetch_and_delete() {
        let path = temp_db_path();
        let store = SqliteExamStore::open(path.clone(), Duration::from_millis(50)).unwrap();

        let mut record = exam("a");
        store.upsert(&record).await.unwrap();
        record.set_paquimetria("545", "").unwrap();
        store.upsert(&record).await.unwrap();

        let all = store.fetch_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["paquimetria"]["od"], "545");

        store.delete("a").await.unwrap();
        assert!(store.fetch_all().await.unwrap().is_empty());

        drop(store);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn completed_exams_leave_ongoing_snapshot() {
        let path = temp_db_path();
        let store = SqliteExamStore::open(path.clone(), Duration::from_millis(50)).unwrap();

        let mut record = exam("a");
        store.upsert(&record).await.unwrap();
        assert_eq!(store.ongoing_snapshot().await.unwrap().records.len(), 1);

        record.complete(Utc::now());
        store.upsert(&record).await.unwrap();
        let snapshot = store.ongoing_snapshot().await.unwrap();
        assert!(snapshot.records.is_empty());

        drop(store);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn upsert_keeps_fields_it_does_not_know() {
        let path = temp_db_path();
        let store = SqliteExamStore::open(path.clone(), Duration::from_millis(50)).unwrap();

        let legacy = json!({"id": "a", "printedBy": "recepção"});
        store
            .database()
            .upsert_exam_body("a".into(), legacy)
            .await
            .unwrap();
        store.upsert(&exam("a")).await.unwrap();

        let all = store.fetch_all().await.unwrap();
        assert_eq!(all[0]["printedBy"], "recepção");
        assert_eq!(all[0]["type"], "tsh");

        drop(store);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn another_station_sees_changes() {
        let path = temp_db_path();
        let station_a = SqliteExamStore::open(path.clone(), Duration::from_millis(20)).unwrap();
        let station_b = SqliteExamStore::open(path.clone(), Duration::from_millis(20)).unwrap();
        let mut rx = station_b.subscribe_ongoing();

        station_a.upsert(&exam("shared")).await.unwrap();

        let snapshot = wait_for(&mut rx, |snapshot| {
            snapshot.records.iter().any(|record| record["id"] == "shared")
        })
        .await;
        assert_eq!(snapshot.records.len(), 1);

        station_a.delete("shared").await.unwrap();
        wait_for(&mut rx, |snapshot| snapshot.records.is_empty()).await;

        drop(station_a);
        drop(station_b);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn unreadable_bodies_are_skipped_and_overwritten() {
        let path = temp_db_path();
        let store = SqliteExamStore::open(path.clone(), Duration::from_millis(50)).unwrap();
        store.upsert(&exam("good")).await.unwrap();
        store
            .database()
            .insert_raw_body("bad", "ongoing", "{not json")
            .await
            .unwrap();

        let all = store.fetch_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["id"], "good");
        assert_eq!(store.ongoing_snapshot().await.unwrap().records.len(), 1);

        store.upsert(&exam("bad")).await.unwrap();
        let all = store.fetch_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|record| record["id"] == "bad" && record["type"] == "tsh"));

        drop(store);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
