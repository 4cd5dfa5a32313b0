//! Persistent key/value store.
//!
//! One sqlite table, one worker thread. Every read and write is a
//! [`Request`] queued to the worker, which executes them strictly in
//! enqueue order. The worker is spawned on the first request and retires
//! after `idle_timeout` without work; the next request spawns a new one.
//!
//! The connection is owned by whichever worker is alive and handed back to
//! the store when it retires, so an in-memory database survives restarts
//! of the worker.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

/// Bump to discard every stored value on next open.
pub const SCHEMA_VERSION: i32 = 1;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("failed to spawn store worker: {0}")]
    Spawn(std::io::Error),
    #[error("store worker dropped the request")]
    WorkerGone,
    #[error("value for {key} is not valid JSON: {source}")]
    Encode {
        key: String,
        source: serde_json::Error,
    },
}

// ── Table ─────────────────────────────────────────────────────────────────────

/// The worker's view of the backing table, valid for one request.
pub struct Table<'c> {
    conn: &'c Connection,
}

impl<'c> Table<'c> {
    fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kv_pairs WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv_pairs (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM kv_pairs WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    /// All rows whose key matches the SQL `LIKE` pattern, ordered by key.
    pub fn query(&self, pattern: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM kv_pairs WHERE key LIKE ?1 ORDER BY key")?;
        let mut rows = stmt.query(params![pattern])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((row.get(0)?, row.get(1)?));
        }
        Ok(out)
    }

    /// Undecodable values are logged and read as absent.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        Ok(self.get(key)?.and_then(|raw| decode_logged(key, &raw)))
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.put(key, &raw)
    }
}

pub(crate) fn decode_logged<T: DeserializeOwned>(key: &str, raw: &[u8]) -> Option<T> {
    match serde_json::from_slice(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, error = %e, "dropping undecodable stored value");
            None
        }
    }
}

// ── Requests ──────────────────────────────────────────────────────────────────

type Job = Box<dyn FnOnce(&Connection) + Send>;

enum Request {
    Get {
        key: String,
        reply: oneshot::Sender<Result<Option<Vec<u8>>, StoreError>>,
    },
    Put {
        key: String,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Query {
        pattern: String,
        reply: oneshot::Sender<Result<Vec<(String, Vec<u8>)>, StoreError>>,
    },
    Delete {
        key: String,
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
    /// Opens its own transaction and replies on its own.
    Transact(Job),
}

// ── Store handle ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Memory,
}

#[derive(Default)]
struct WorkerSlot {
    /// Present while a worker is alive.
    tx: Option<mpsc::Sender<Request>>,
    /// Present while no worker is alive.
    conn: Option<Connection>,
}

struct Inner {
    source: Source,
    idle_timeout: Duration,
    slot: Mutex<WorkerSlot>,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, WorkerSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheap, cloneable handle to the store.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<Inner>,
}

impl KvStore {
    /// Open (creating if needed) the sqlite file at `path`.
    pub fn open(path: &Path, idle_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::CreateDir(parent.to_path_buf(), e))?;
            }
        }
        Self::with_source(Source::File(path.to_path_buf()), idle_timeout)
    }

    /// A private in-memory database, for tests and ephemeral use.
    pub fn in_memory(idle_timeout: Duration) -> Result<Self, StoreError> {
        Self::with_source(Source::Memory, idle_timeout)
    }

    fn with_source(source: Source, idle_timeout: Duration) -> Result<Self, StoreError> {
        let conn = open_connection(&source, SCHEMA_VERSION)?;
        Ok(Self {
            inner: Arc::new(Inner {
                source,
                idle_timeout,
                slot: Mutex::new(WorkerSlot {
                    tx: None,
                    conn: Some(conn),
                }),
            }),
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Request::Get {
            key: key.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    pub async fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Request::Put {
            key: key.to_string(),
            value: value.into(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// `LIKE` pattern scan, e.g. `UsageRecord:%:%`.
    pub async fn query(&self, pattern: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Request::Query {
            pattern: pattern.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Request::Delete {
            key: key.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// Run `f` on the worker inside a single transaction and return its
    /// result once the transaction has committed. Nothing else touches the
    /// table while `f` runs. An error from `f` rolls everything back.
    pub async fn transact<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&Table<'_>) -> Result<R, StoreError> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.enqueue(Request::Transact(Box::new(move |conn: &Connection| {
            let _ = reply.send(in_transaction(conn, f));
        })))?;
        rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// Fire-and-forget variant of [`transact`](Self::transact). Errors are
    /// logged on the worker.
    pub fn submit<F>(&self, what: &'static str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&Table<'_>) -> Result<(), StoreError> + Send + 'static,
    {
        self.enqueue(Request::Transact(Box::new(move |conn: &Connection| {
            if let Err(e) = in_transaction(conn, f) {
                tracing::warn!(job = what, error = %e, "store job failed");
            }
        })))
    }

    /// Read a JSON value. Store errors and undecodable values are logged
    /// and read as absent.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.get(key).await {
            Ok(Some(raw)) => decode_logged(key, &raw),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "store read failed");
                None
            }
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.put(key, raw).await
    }

    /// Whether a worker thread is currently alive.
    pub fn worker_running(&self) -> bool {
        self.inner.slot().tx.is_some()
    }

    fn enqueue(&self, request: Request) -> Result<(), StoreError> {
        let mut slot = self.inner.slot();

        let mut request = request;
        if let Some(tx) = slot.tx.take() {
            match tx.send(request) {
                Ok(()) => {
                    slot.tx = Some(tx);
                    return Ok(());
                }
                // Worker died without handing the connection back.
                Err(mpsc::SendError(returned)) => request = returned,
            }
        }

        let conn = match slot.conn.take() {
            Some(conn) => conn,
            None => {
                tracing::warn!(source = ?self.inner.source, "store connection lost, reopening");
                open_connection(&self.inner.source, SCHEMA_VERSION)?
            }
        };

        let (tx, rx) = mpsc::channel();
        tx.send(request).map_err(|_| StoreError::WorkerGone)?;

        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("nbsp-store".to_string())
            .spawn(move || run_worker(conn, rx, inner))
            .map_err(StoreError::Spawn)?;

        tracing::trace!("store worker started");
        slot.tx = Some(tx);
        Ok(())
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

fn run_worker(conn: Connection, rx: mpsc::Receiver<Request>, inner: Arc<Inner>) {
    loop {
        match rx.recv_timeout(inner.idle_timeout) {
            Ok(request) => serve(&conn, request),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                let mut slot = inner.slot();
                // A request may have been queued between the timeout and
                // taking the lock.
                if let Ok(request) = rx.try_recv() {
                    drop(slot);
                    serve(&conn, request);
                    continue;
                }
                slot.tx = None;
                slot.conn = Some(conn);
                tracing::trace!("store worker idle, retiring");
                return;
            }
        }
    }
}

fn serve(conn: &Connection, request: Request) {
    match request {
        Request::Get { key, reply } => {
            let _ = reply.send(Table::new(conn).get(&key));
        }
        Request::Put { key, value, reply } => {
            let _ = reply.send(Table::new(conn).put(&key, &value));
        }
        Request::Query { pattern, reply } => {
            let _ = reply.send(Table::new(conn).query(&pattern));
        }
        Request::Delete { key, reply } => {
            let _ = reply.send(Table::new(conn).delete(&key));
        }
        Request::Transact(job) => job(conn),
    }
}

/// Dropping the transaction on an early return rolls it back.
fn in_transaction<R, F>(conn: &Connection, f: F) -> Result<R, StoreError>
where
    F: FnOnce(&Table<'_>) -> Result<R, StoreError>,
{
    let tx = conn.unchecked_transaction()?;
    let value = f(&Table::new(&tx))?;
    tx.commit()?;
    Ok(value)
}

// ── Schema ────────────────────────────────────────────────────────────────────

fn open_connection(source: &Source, schema_version: i32) -> Result<Connection, StoreError> {
    let conn = match source {
        Source::File(path) => Connection::open(path)?,
        Source::Memory => Connection::open_in_memory()?,
    };
    init_schema(&conn, schema_version)?;
    Ok(conn)
}

/// A version mismatch drops every stored value.
fn init_schema(conn: &Connection, schema_version: i32) -> Result<(), StoreError> {
    let found: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if found != schema_version {
        if found != 0 {
            tracing::info!(found, expected = schema_version, "store schema changed, dropping data");
        }
        conn.execute_batch("DROP TABLE IF EXISTS kv_pairs;")?;
        conn.pragma_update(None, "user_version", schema_version)?;
    }
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv_pairs (
            key   TEXT PRIMARY KEY,
            value BLOB NOT NULL
        );",
    )?;
    Ok(())
}
