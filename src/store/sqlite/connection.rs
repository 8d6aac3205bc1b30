use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{error, info};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::{exams, migrations::run_migrations};
use crate::store::OngoingSnapshot;

/// Other stations may hold the write lock briefly while saving.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum WorkerMessage {
    Run(Job),
    Stop,
}

struct Worker {
    jobs: mpsc::Sender<WorkerMessage>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        let mut guard = match self.thread.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(handle) = guard.take() else {
            return;
        };
        if self.jobs.send(WorkerMessage::Stop).is_err() {
            error!("Exam database thread already gone at shutdown");
        }
        if let Err(err) = handle.join() {
            error!("Exam database thread panicked: {err:?}");
        }
    }
}

/// Shared-file settings, then migrations. Runs on the worker thread.
fn open_connection(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open exam database {}", path.display()))?;
    // WAL lets one station read while another commits.
    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        error!("Failed to enable WAL mode on {}: {err}", path.display());
    }
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("failed to set busy timeout")?;
    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

/// One SQLite connection owned by a worker thread. Jobs run in the order
/// they are submitted.
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
    /// Snapshot revisions handed out by this process, in read order.
    revision: Arc<AtomicU64>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (jobs_tx, jobs_rx) = mpsc::channel::<WorkerMessage>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let thread_path = db_path.clone();

        let thread = thread::Builder::new()
            .name("piotrack-db".into())
            .spawn(move || {
                let mut conn = match open_connection(&thread_path) {
                    Ok(conn) => {
                        let _ = ready_tx.send(Ok(()));
                        conn
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                while let Ok(WorkerMessage::Run(job)) = jobs_rx.recv() {
                    job(&mut conn);
                }
                info!("Exam database thread stopped");
            })
            .context("failed to spawn exam database thread")?;

        ready_rx
            .recv()
            .context("exam database thread exited during startup")??;
        info!("Exam database ready at {}", db_path.display());

        Ok(Self {
            worker: Arc::new(Worker {
                jobs: jobs_tx,
                thread: Mutex::new(Some(thread)),
            }),
            revision: Arc::new(AtomicU64::new(0)),
        })
    }

    pub async fn execute<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let message = WorkerMessage::Run(Box::new(move |conn| {
            if reply_tx.send(job(conn)).is_err() {
                error!("Exam database caller went away before the reply");
            }
        }));

        self.worker
            .jobs
            .send(message)
            .map_err(|_| anyhow!("exam database thread is not running"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("exam database thread dropped the job"))?
    }

    /// Read the ongoing exams and the file's `data_version` together, and
    /// stamp the result with the next revision. The revision is taken on
    /// the worker thread, so revisions follow read order.
    pub async fn ongoing_snapshot(&self) -> Result<(i64, OngoingSnapshot)> {
        let revision = self.revision.clone();
        self.execute(move |conn| {
            let (version, records) = exams::query_ongoing(conn)?;
            let revision = revision.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((version, OngoingSnapshot { revision, records }))
        })
        .await
    }
}
