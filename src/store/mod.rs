//! Exam persistence shared between stations.
//!
//! Stores deal in raw JSON records so that legacy shapes reach
//! [`record::repair`] untouched; the repository turns them into [`Exam`]s.

pub mod memory;
pub mod record;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::exam::{Exam, ExamStatus};

pub use memory::MemoryExamStore;
pub use sqlite::SqliteExamStore;

/// Capacity of the ongoing-snapshot broadcast. Slow subscribers skip to
/// the newest snapshot, which is all they need.
pub(crate) const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

/// Every ongoing record in the store at one point in time.
///
/// Revisions increase with every snapshot a store produces, so a consumer
/// can drop one that arrives after a newer one.
#[derive(Debug, Clone, PartialEq)]
pub struct OngoingSnapshot {
    pub revision: u64,
    pub records: Vec<Value>,
}

#[async_trait]
pub trait ExamStore: Send + Sync {
    /// Insert or merge `exam` into the record with the same id.
    async fn upsert(&self, exam: &Exam) -> Result<()>;

    async fn fetch_all(&self) -> Result<Vec<Value>>;

    async fn delete(&self, exam_id: &str) -> Result<()>;

    /// Snapshot of the ongoing records right now.
    async fn ongoing_snapshot(&self) -> Result<OngoingSnapshot>;

    /// Snapshots published whenever the ongoing set may have changed,
    /// including changes made by other processes.
    fn subscribe_ongoing(&self) -> broadcast::Receiver<OngoingSnapshot>;
}

pub(crate) fn exam_to_value(exam: &Exam) -> Result<Value> {
    Ok(serde_json::to_value(exam)?)
}

/// Merge `incoming` into `existing` field by field. Nested objects merge
/// recursively; every other value is replaced.
pub(crate) fn merge_record(existing: Option<Value>, incoming: Value) -> Value {
    match (existing, incoming) {
        (Some(Value::Object(mut base)), Value::Object(update)) => {
            merge_objects(&mut base, update);
            Value::Object(base)
        }
        (_, incoming) => incoming,
    }
}

fn merge_objects(base: &mut Map<String, Value>, update: Map<String, Value>) {
    for (key, value) in update {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(nested)), Value::Object(patch)) => merge_objects(nested, patch),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

pub(crate) fn is_ongoing_record(record: &Value) -> bool {
    record.get("status").and_then(Value::as_str) != Some(ExamStatus::Completed.as_str())
}
