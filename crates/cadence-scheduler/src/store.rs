//! Job persistence.
//!
//! The scheduler hands every store the complete job set as node trees and
//! expects the same set back on the next start. Each backend makes a write
//! observable either entirely or not at all.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cadence_core::config::{StoreConfig, StoreMode};
use cadence_core::Node;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

/// Storage for the serialized job set.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Every persisted job node. An empty or never-written store yields `[]`.
    async fn read_all(&self) -> Result<Vec<Node>>;

    /// Replace the persisted set with `jobs`.
    async fn write_all(&self, jobs: &[Node]) -> Result<()>;
}

/// Build the backend selected by `config`.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn JobStore>> {
    let store: Arc<dyn JobStore> = match config.mode {
        StoreMode::File => Arc::new(FileJobStore::new(&config.path)),
        StoreMode::Directory => Arc::new(DirectoryJobStore::new(&config.path)),
        StoreMode::Sqlite => Arc::new(SqliteJobStore::open(&config.path)?),
    };
    Ok(store)
}

// ============================================================================
// Single-document store
// ============================================================================

/// All jobs in one JSON document (an array of job nodes).
pub struct FileJobStore {
    path: PathBuf,
}

impl FileJobStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn read_all(&self) -> Result<Vec<Node>> {
        if !fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn write_all(&self, jobs: &[Node]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(jobs)?;
        write_atomic(&self.path, json.as_bytes()).await?;
        debug!(path = %self.path.display(), jobs = jobs.len(), "job file written");
        Ok(())
    }
}

// ============================================================================
// One-document-per-job store
// ============================================================================

/// One `<name>.json` document per job inside a directory.
///
/// Each document is replaced atomically. Documents for jobs that are no
/// longer in the set are removed only after every current job is written,
/// so an interrupted write can leave a stale job behind but never loses one.
pub struct DirectoryJobStore {
    dir: PathBuf,
}

impl DirectoryJobStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn job_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem_for(name)))
    }
}

#[async_trait]
impl JobStore for DirectoryJobStore {
    async fn read_all(&self) -> Result<Vec<Node>> {
        if !fs::try_exists(&self.dir).await? {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut jobs = Vec::with_capacity(paths.len());
        for path in paths {
            let content = fs::read_to_string(&path).await?;
            jobs.push(serde_json::from_str(&content)?);
        }
        Ok(jobs)
    }

    async fn write_all(&self, jobs: &[Node]) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let mut keep = Vec::with_capacity(jobs.len());
        for job in jobs {
            let path = self.job_path(&job.name);
            let json = serde_json::to_string_pretty(job)?;
            write_atomic(&path, json.as_bytes()).await?;
            keep.push(path);
        }

        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") && !keep.contains(&path) {
                fs::remove_file(&path).await?;
                debug!(path = %path.display(), "stale job document removed");
            }
        }
        Ok(())
    }
}

/// Longest file stem written by [`DirectoryJobStore`], well under the
/// 255-byte name limit of common filesystems once `.json` is appended.
const MAX_STEM_LEN: usize = 200;
/// Bytes of the encoded name kept in front of the hash for long names.
const HASHED_PREFIX_LEN: usize = 150;

/// File stem for a job name: ASCII alphanumerics, `-` and `_` pass through,
/// every other byte is percent-encoded. Distinct names never share a file
/// and no name can escape the directory.
///
/// Encoding can triple a name's length, so a stem over [`MAX_STEM_LEN`]
/// becomes a truncated prefix plus `~` and a SHA-256 of the full name. `~`
/// is itself always encoded, so hashed stems cannot collide with plain ones.
/// The real name lives inside the document.
fn file_stem_for(name: &str) -> String {
    let mut stem = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    if stem.len() <= MAX_STEM_LEN {
        return stem;
    }

    // the stem is pure ASCII; back off so no `%XX` escape is split
    let mut cut = HASHED_PREFIX_LEN;
    if let Some(pos) = stem[cut - 2..cut].find('%') {
        cut = cut - 2 + pos;
    }
    let digest = Sha256::digest(name.as_bytes());
    format!("{}~{}", &stem[..cut], hex::encode(&digest[..16]))
}

/// Write to a sibling temp file, fsync, then rename over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}

// ============================================================================
// SQLite store
// ============================================================================

/// Jobs as rows of a SQLite table; the whole set is swapped in one
/// transaction.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| SchedulerError::Internal("sqlite connection poisoned".into()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| SchedulerError::Internal(format!("sqlite task failed: {e}")))?
    }
}

/// Create the `jobs` table (idempotent).
fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            name        TEXT    NOT NULL PRIMARY KEY,
            node        TEXT    NOT NULL    -- JSON-encoded job node
        ) STRICT;
        ",
    )?;
    Ok(())
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn read_all(&self) -> Result<Vec<Node>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT node FROM jobs ORDER BY name")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.iter()
                .map(|json| serde_json::from_str(json).map_err(SchedulerError::from))
                .collect()
        })
        .await
    }

    async fn write_all(&self, jobs: &[Node]) -> Result<()> {
        let rows = jobs
            .iter()
            .map(|job| Ok((job.name.clone(), serde_json::to_string(job)?)))
            .collect::<Result<Vec<_>>>()?;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM jobs", [])?;
            {
                let mut stmt = tx.prepare("INSERT INTO jobs (name, node) VALUES (?1, ?2)")?;
                for (name, json) in &rows {
                    stmt.execute(rusqlite::params![name, json])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Volatile store for tests and embedders that do not need durability.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<Node>>,
    fail_writes: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `jobs`, as if written by an earlier run.
    pub fn with_jobs(jobs: Vec<Node>) -> Self {
        Self {
            jobs: Mutex::new(jobs),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `write_all` fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Copy of the currently persisted set.
    pub fn snapshot(&self) -> Vec<Node> {
        self.jobs.lock().map(|jobs| jobs.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn read_all(&self) -> Result<Vec<Node>> {
        self.jobs
            .lock()
            .map(|jobs| jobs.clone())
            .map_err(|_| SchedulerError::Internal("memory store poisoned".into()))
    }

    async fn write_all(&self, jobs: &[Node]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SchedulerError::Io(std::io::Error::other(
                "memory store is read-only",
            )));
        }
        let mut stored = self
            .jobs
            .lock()
            .map_err(|_| SchedulerError::Internal("memory store poisoned".into()))?;
        *stored = jobs.to_vec();
        Ok(())
    }
}
