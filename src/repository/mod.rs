//! Station-side view of the exam store.
//!
//! The repository keeps the exams this station works with in memory, feeds
//! saves to the store through one ordered writer task, and mirrors the
//! ongoing exams of other stations from store snapshots.

pub mod ownership;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};

pub use ownership::OwnershipLedger;

use crate::{
    errors::{ExamError, ExamResult},
    events::{EventBus, StationEvent},
    exam::{model, Exam},
    store::{record, ExamStore, OngoingSnapshot},
};

/// Where a cached exam came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Created on this station.
    Local,
    /// Created elsewhere; only its completed record is kept here.
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedExam {
    pub exam: Exam,
    pub origin: Origin,
}

/// Which completed exams `clear_history` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryScope {
    /// Dated today.
    Day,
    /// Dated before today.
    Old,
    All,
}

impl std::str::FromStr for HistoryScope {
    type Err = ExamError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "day" | "today" => Ok(HistoryScope::Day),
            "old" => Ok(HistoryScope::Old),
            "all" => Ok(HistoryScope::All),
            other => Err(ExamError::InvalidIntake(format!(
                "unknown history scope '{other}' (expected day, old or all)"
            ))),
        }
    }
}

/// Completed exams split the way the history list shows them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    pub today: Vec<Exam>,
    pub older: Vec<Exam>,
}

enum WriteCommand {
    Upsert(Exam),
    Delete {
        exam_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct RepositoryState {
    /// Local exams of any status and every completed exam.
    exams: HashMap<String, CachedExam>,
    /// Ongoing exams owned by other stations.
    remote_ongoing: HashMap<String, Exam>,
    last_revision: Option<u64>,
}

struct RepositoryInner {
    store: Arc<dyn ExamStore>,
    ledger: OwnershipLedger,
    events: EventBus,
    state: Mutex<RepositoryState>,
    writes: mpsc::UnboundedSender<WriteCommand>,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RepositoryInner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.subscription).take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct ExamRepository {
    inner: Arc<RepositoryInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ExamRepository {
    /// Must be called inside a tokio runtime; spawns the writer task.
    pub fn new(store: Arc<dyn ExamStore>, ledger: OwnershipLedger, events: EventBus) -> Self {
        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(store.clone(), events.clone(), rx));

        Self {
            inner: Arc::new(RepositoryInner {
                store,
                ledger,
                events,
                state: Mutex::new(RepositoryState::default()),
                writes,
                subscription: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RepositoryState> {
        lock(&self.inner.state)
    }

    /// Replace the cache with everything in the store. Returns how many
    /// exams were loaded.
    pub async fn load_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let records = self.inner.store.fetch_all().await?;
        let exams = record::repair_all(records, now);
        let loaded = exams.len();

        let mut local = 0usize;
        let mut state = self.state();
        state.exams.clear();
        state.remote_ongoing.clear();
        for exam in exams {
            if self.inner.ledger.owns(&exam.id) {
                local += 1;
                state.exams.insert(
                    exam.id.clone(),
                    CachedExam {
                        exam,
                        origin: Origin::Local,
                    },
                );
            } else if exam.is_completed() {
                state.exams.insert(
                    exam.id.clone(),
                    CachedExam {
                        exam,
                        origin: Origin::Remote,
                    },
                );
            } else {
                state.remote_ongoing.insert(exam.id.clone(), exam);
            }
        }
        drop(state);

        info!("Loaded {loaded} exams ({local} owned by this station)");
        Ok(loaded)
    }

    /// Follow the store's ongoing snapshots until the repository is dropped.
    pub async fn subscribe_ongoing(&self) -> Result<()> {
        let mut rx = self.inner.store.subscribe_ongoing();
        let initial = self.inner.store.ongoing_snapshot().await?;
        self.apply_remote_snapshot(initial, Utc::now());

        let repository = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let snapshot = match rx.recv().await {
                    Ok(snapshot) => snapshot,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("skipped {skipped} store snapshots");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = repository.upgrade() else {
                    break;
                };
                ExamRepository { inner }.apply_remote_snapshot(snapshot, Utc::now());
            }
        });

        if let Some(previous) = lock(&self.inner.subscription).replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Replace the remote mirror set with `snapshot` unless a newer one was
    /// already applied. Exams owned here are never mirrored.
    pub fn apply_remote_snapshot(&self, snapshot: OngoingSnapshot, now: DateTime<Utc>) -> bool {
        let exams = record::repair_all(snapshot.records, now);
        let mirrors: HashMap<String, Exam> = exams
            .into_iter()
            .filter(|exam| !exam.is_completed() && !self.inner.ledger.owns(&exam.id))
            .map(|exam| (exam.id.clone(), exam))
            .collect();

        let mut state = self.state();
        if state
            .last_revision
            .is_some_and(|last| snapshot.revision <= last)
        {
            debug!(
                "dropping stale snapshot {} (last applied {:?})",
                snapshot.revision, state.last_revision
            );
            return false;
        }
        state.last_revision = Some(snapshot.revision);
        state.remote_ongoing = mirrors;

        let mut remote: Vec<Exam> = state.remote_ongoing.values().cloned().collect();
        drop(state);
        remote.sort_by_key(|exam| exam.start);

        self.inner
            .events
            .emit(StationEvent::RemoteOngoingChanged { exams: remote });
        true
    }

    /// Start tracking an exam created on this station and persist it.
    pub fn register_local(&self, exam: Exam) {
        if let Err(err) = self.inner.ledger.claim(&exam.id) {
            warn!("exam {} will not stay owned across restarts: {err:#}", exam.id);
        }
        self.state().exams.insert(
            exam.id.clone(),
            CachedExam {
                exam: exam.clone(),
                origin: Origin::Local,
            },
        );
        self.enqueue(WriteCommand::Upsert(exam));
    }

    /// Update the cache and queue a full-record upsert. The outcome arrives
    /// later as `ExamSaved` or `ExamSaveFailed`.
    pub fn save(&self, exam: Exam) -> ExamResult<()> {
        {
            let mut state = self.state();
            if state.remote_ongoing.contains_key(&exam.id) {
                return Err(ExamError::ReadOnly(exam.id));
            }
            let origin = state
                .exams
                .get(&exam.id)
                .map(|cached| cached.origin)
                .unwrap_or(Origin::Local);
            state.exams.insert(
                exam.id.clone(),
                CachedExam {
                    exam: exam.clone(),
                    origin,
                },
            );
        }
        self.enqueue(WriteCommand::Upsert(exam));
        Ok(())
    }

    fn enqueue(&self, command: WriteCommand) {
        if self.inner.writes.send(command).is_err() {
            error!("exam writer task is gone; change kept in memory only");
        }
    }

    /// Resolves once every write queued before it has been applied.
    pub async fn flush(&self) {
        let (reply, done) = oneshot::channel();
        self.enqueue(WriteCommand::Flush(reply));
        let _ = done.await;
    }

    /// Delete through the write queue, then forget the exam locally.
    pub async fn delete(&self, exam_id: &str) -> Result<()> {
        if self.is_remote_ongoing(exam_id) {
            return Err(ExamError::ReadOnly(exam_id.to_string()).into());
        }
        if self.get(exam_id).is_none() {
            return Err(ExamError::NotFound(exam_id.to_string()).into());
        }

        let (reply, result) = oneshot::channel();
        self.enqueue(WriteCommand::Delete {
            exam_id: exam_id.to_string(),
            reply,
        });
        result
            .await
            .map_err(|_| anyhow!("exam writer task stopped before deleting {exam_id}"))??;

        self.state().exams.remove(exam_id);
        if let Err(err) = self.inner.ledger.release(exam_id) {
            warn!("could not release ownership of exam {exam_id}: {err:#}");
        }
        self.inner.events.emit(StationEvent::ExamDeleted {
            exam_id: exam_id.to_string(),
        });
        Ok(())
    }

    /// Delete the completed exams in `scope`. Returns how many were removed.
    pub async fn clear_history(&self, scope: HistoryScope, now: DateTime<Utc>) -> Result<usize> {
        let today = model::date_iso(now);
        let targets: Vec<String> = self
            .state()
            .exams
            .values()
            .filter(|cached| cached.exam.is_completed())
            .filter(|cached| match scope {
                HistoryScope::Day => cached.exam.date_iso == today,
                HistoryScope::Old => cached.exam.date_iso < today,
                HistoryScope::All => true,
            })
            .map(|cached| cached.exam.id.clone())
            .collect();

        let mut cleared = 0;
        for exam_id in &targets {
            self.delete(exam_id).await?;
            cleared += 1;
        }
        info!("Cleared {cleared} exams from history ({scope:?})");
        Ok(cleared)
    }

    pub fn get(&self, exam_id: &str) -> Option<CachedExam> {
        self.state().exams.get(exam_id).cloned()
    }

    pub fn owns(&self, exam_id: &str) -> bool {
        self.inner.ledger.owns(exam_id)
    }

    pub fn is_remote_ongoing(&self, exam_id: &str) -> bool {
        self.state().remote_ongoing.contains_key(exam_id)
    }

    /// Ongoing exams owned here, oldest first.
    pub fn local_ongoing(&self) -> Vec<Exam> {
        let mut exams: Vec<Exam> = self
            .state()
            .exams
            .values()
            .filter(|cached| cached.origin == Origin::Local && !cached.exam.is_completed())
            .map(|cached| cached.exam.clone())
            .collect();
        exams.sort_by_key(|exam| exam.start);
        exams
    }

    pub fn remote_ongoing(&self) -> Vec<Exam> {
        let mut exams: Vec<Exam> = self.state().remote_ongoing.values().cloned().collect();
        exams.sort_by_key(|exam| exam.start);
        exams
    }

    /// Completed exams, newest first.
    pub fn history(&self, now: DateTime<Utc>) -> History {
        let today_iso = model::date_iso(now);
        let mut completed: Vec<Exam> = self
            .state()
            .exams
            .values()
            .filter(|cached| cached.exam.is_completed())
            .map(|cached| cached.exam.clone())
            .collect();
        completed.sort_by(|a, b| b.start.cmp(&a.start));

        let (today, older): (Vec<Exam>, Vec<Exam>) = completed
            .into_iter()
            .partition(|exam| exam.date_iso == today_iso);
        History { today, older }
    }

    /// Every exam id this station knows about, for prefix lookups.
    pub fn known_ids(&self) -> Vec<String> {
        let state = self.state();
        state
            .exams
            .keys()
            .chain(state.remote_ongoing.keys())
            .cloned()
            .collect()
    }
}

async fn write_loop(
    store: Arc<dyn ExamStore>,
    events: EventBus,
    mut rx: mpsc::UnboundedReceiver<WriteCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Upsert(exam) => match store.upsert(&exam).await {
                Ok(()) => {
                    debug!("saved exam {}", exam.id);
                    events.emit(StationEvent::ExamSaved { exam_id: exam.id });
                }
                Err(err) => {
                    error!("failed to save exam {}: {err:#}", exam.id);
                    events.emit(StationEvent::ExamSaveFailed {
                        exam_id: exam.id,
                        reason: format!("{err:#}"),
                    });
                }
            },
            WriteCommand::Delete { exam_id, reply } => {
                let result = store.delete(&exam_id).await;
                if let Err(err) = &result {
                    error!("failed to delete exam {exam_id}: {err:#}");
                }
                let _ = reply.send(result);
            }
            WriteCommand::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }
    debug!("exam writer task stopped");
}
