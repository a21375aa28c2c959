mod commands;
mod hosts;
mod jobs;
mod keys;
mod links;
mod messages;
pub mod types;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::error::StoreError;

/// Shared SQLite store. The embedded ingest adapter, the standalone ingest
/// process and the main API all open the same file; every cross-process
/// invariant (doc_key uniqueness, job claim-once, terminal-state
/// monotonicity) lives in the schema and in conditional updates, never in
/// in-process locks.
pub struct FleetStore {
    db: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl FleetStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::InvalidInput(format!("create {parent:?}: {e}")))?;
            }
        }

        let db = Connection::open(&db_path)?;
        // Two processes may share this file; WAL keeps readers and the
        // writer from starving each other, busy_timeout absorbs write races.
        db.pragma_update(None, "journal_mode", "WAL")?;
        db.pragma_update(None, "busy_timeout", 5000)?;
        apply_schema(&db)?;

        info!("Fleet store opened at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path,
        })
    }

    pub(crate) fn db(&self) -> &Arc<Mutex<Connection>> {
        &self.db
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

fn apply_schema(db: &Connection) -> Result<(), StoreError> {
    db.execute(
        "CREATE TABLE IF NOT EXISTS agent_keys (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            prefix TEXT NOT NULL UNIQUE,
            salt TEXT NOT NULL,
            key_hash TEXT NOT NULL,
            default_principal TEXT,
            created_at TEXT NOT NULL,
            last_used_at TEXT,
            revoked_at TEXT
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS agent_hosts (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            last_seen_at TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // doc_key is nullable; SQLite UNIQUE admits any number of NULLs, so only
    // keyed messages participate in dedup.
    db.execute(
        "CREATE TABLE IF NOT EXISTS ingested_messages (
            id TEXT PRIMARY KEY,
            doc_key TEXT UNIQUE,
            agent_id TEXT,
            payload TEXT NOT NULL,
            key_id TEXT NOT NULL,
            received_at TEXT NOT NULL
        )",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_messages_received_at
         ON ingested_messages(received_at)",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            action_type TEXT NOT NULL DEFAULT 'command',
            status TEXT NOT NULL DEFAULT 'scheduled',
            run_at TEXT NOT NULL,
            recurrence TEXT NOT NULL DEFAULT 'once',
            target_hosts TEXT NOT NULL DEFAULT '[]',
            payload TEXT NOT NULL DEFAULT '{}',
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_status_run_at
         ON scheduled_jobs(status, run_at)",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS remote_commands (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            action_type TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending',
            detail TEXT,
            source_job_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_commands_agent_status
         ON remote_commands(agent_id, status)",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_commands_source_job
         ON remote_commands(source_job_id)",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS download_links (
            id TEXT PRIMARY KEY,
            token TEXT NOT NULL UNIQUE,
            visibility TEXT NOT NULL DEFAULT 'public',
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT,
            revoked_at TEXT
        )",
        [],
    )?;

    Ok(())
}

/// Open a throwaway store under a unique temp path. File-backed rather than
/// in-memory so tests can open a second handle against the same file, the
/// way the standalone ingest process does.
#[cfg(test)]
pub fn test_store() -> FleetStore {
    let dir = std::env::temp_dir().join(format!("fleetd-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp test dir");
    FleetStore::open(dir.join("fleetd.db")).expect("open test store")
}
