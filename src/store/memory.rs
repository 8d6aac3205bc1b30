use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{
    exam_to_value, is_ongoing_record, merge_record, ExamStore, OngoingSnapshot,
    SNAPSHOT_CHANNEL_CAPACITY,
};
use crate::exam::Exam;

/// Process-local store. Stations sharing one instance see each other's
/// exams, which is how the offline mode and the tests use it.
pub struct MemoryExamStore {
    records: Mutex<BTreeMap<String, Value>>,
    revision: AtomicU64,
    notify: broadcast::Sender<OngoingSnapshot>,
}

impl MemoryExamStore {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self {
            records: Mutex::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
            notify,
        }
    }

    /// Store a record exactly as given, bypassing the exam model.
    pub fn insert_raw(&self, id: &str, record: Value) {
        self.lock_records().insert(id.to_string(), record);
        self.publish();
    }

    fn lock_records(&self) -> MutexGuard<'_, BTreeMap<String, Value>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Snapshot taken under the records lock so revision order matches
    /// content order.
    fn snapshot(&self) -> OngoingSnapshot {
        let records = self.lock_records();
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        OngoingSnapshot {
            revision,
            records: records
                .values()
                .filter(|record| is_ongoing_record(record))
                .cloned()
                .collect(),
        }
    }

    fn publish(&self) {
        if self.notify.receiver_count() == 0 {
            return;
        }
        let _ = self.notify.send(self.snapshot());
    }
}

impl Default for MemoryExamStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExamStore for MemoryExamStore {
    async fn upsert(&self, exam: &Exam) -> Result<()> {
        let incoming = exam_to_value(exam)?;
        {
            let mut records = self.lock_records();
            let existing = records.remove(&exam.id);
            records.insert(exam.id.clone(), merge_record(existing, incoming));
        }
        self.publish();
        Ok(())
    }

    async fn fetch_all(&self) -> Result<Vec<Value>> {
        Ok(self.lock_records().values().cloned().collect())
    }

    async fn delete(&self, exam_id: &str) -> Result<()> {
        let removed = self.lock_records().remove(exam_id).is_some();
        if removed {
            self.publish();
        }
        Ok(())
    }

    async fn ongoing_snapshot(&self) -> Result<OngoingSnapshot> {
        Ok(self.snapshot())
    }

    fn subscribe_ongoing(&self) -> broadcast::Receiver<OngoingSnapshot> {
        self.notify.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::exam::{ExamType, NewExam};

    fn exam(id: &str) -> Exam {
        Exam::from_intake(
            id.into(),
            NewExam {
                name: "Ana".into(),
                dob: "1970-01-01".into(),
                operator: "Dr. Lima".into(),
                exam_type: ExamType::Curva,
                observation: String::new(),
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn upsert_merges_into_existing_record() {
        let store = MemoryExamStore::new();
        store.insert_raw("a", json!({"id": "a", "legacyNote": "kept"}));

        store.upsert(&exam("a")).await.unwrap();
        let all = store.fetch_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["legacyNote"], "kept");
        assert_eq!(all[0]["type"], "curva");
    }

    #[tokio::test]
    async fn publishes_ongoing_snapshots_with_rising_revisions() {
        let store = MemoryExamStore::new();
        let mut rx = store.subscribe_ongoing();

        store.upsert(&exam("a")).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.records.len(), 1);

        let mut done = exam("a");
        done.complete(Utc::now());
        store.upsert(&done).await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.revision > first.revision);
        assert!(second.records.is_empty());
    }

    #[tokio::test]
    async fn delete_of_unknown_id_is_quiet() {
        let store = MemoryExamStore::new();
        let mut rx = store.subscribe_ongoing();
        store.delete("missing").await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
