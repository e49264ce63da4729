use std::{
    env,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use log::{error, info};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::migrations::run_migrations;

const DEFAULT_DB_FILE: &str = "phonelunk.sqlite3";
const WORKER_NAME: &str = "phonelunk-db";

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// Owns the job queue and the worker thread. The worker exits once the
/// last clone of [`Database`] drops and the queue closes.
struct Worker {
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn spawn(mut conn: Connection) -> Result<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();
        let thread = thread::Builder::new()
            .name(WORKER_NAME.into())
            .spawn(move || {
                for job in jobs_rx {
                    job(&mut conn);
                }
                info!("Stats database closed");
            })
            .context("failed to spawn database worker thread")?;

        Ok(Self {
            jobs: Mutex::new(Some(jobs_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn submit(&self, job: Job) -> Result<()> {
        let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        jobs.as_ref()
            .context("database is closed")?
            .send(job)
            .map_err(|_| anyhow!("database worker is gone"))
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).take();
        let thread = self.thread.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("Database worker panicked");
            }
        }
    }
}

/// Opens the file, applies pragmas and brings the schema up to date.
fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("failed to create database directory {}", parent.display())
        })?;
    }

    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open stats database {}", path.display()))?;

    // WAL is best effort; some filesystems refuse it
    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        error!("Failed to enable WAL mode: {err}");
    }
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign keys")?;

    run_migrations(&mut conn).context("failed to run database migrations")?;
    Ok(conn)
}

/// Stats store. All SQLite access happens on one worker thread; callers
/// hand it closures through [`Database::execute`].
#[derive(Clone)]
pub struct Database {
    worker: Arc<Worker>,
    path: Arc<PathBuf>,
}

impl Database {
    /// `PHONELUNK_DB` if set, otherwise `phonelunk.sqlite3` in the working directory.
    pub fn default_path() -> PathBuf {
        env::var_os("PHONELUNK_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILE))
    }

    pub fn new(path: PathBuf) -> Result<Self> {
        let conn = open_connection(&path)?;
        let worker = Worker::spawn(conn)?;

        info!("Stats database ready at {}", path.display());

        Ok(Self {
            worker: Arc::new(worker),
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Runs `task` on the worker thread and waits for its result.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.worker.submit(Box::new(move |conn| {
            // the caller may have given up waiting
            let _ = reply_tx.send(task(conn));
        }))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database worker dropped the request"))?
    }
}
