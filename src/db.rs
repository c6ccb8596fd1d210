use std::fs;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, params};

/// Embedded schema; tests and the service share it so the index never
/// depends on an on-disk schema file.
pub const SCHEMA_SQL: &str = include_str!("../migrations/0001_init.sql");

/// One row of the recordings index.
#[derive(Debug, Clone)]
pub struct RecordingRow {
    pub id: i64,
    pub camera_key: String,
    pub path: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub bytes: i64,
    pub truncated: bool,
}

/// Index of every recording the service has written: who recorded what,
/// when, how big, and whether finalization was clean. Survives restarts so
/// dangling rows from a crash can be marked truncated.
pub struct RecordingsDb {
    pub conn: Connection,
}

impl RecordingsDb {
    /// Open (creating directories as needed), apply the schema, and mark
    /// any rows a previous process left unfinished.
    pub fn setup<P: AsRef<Path>>(db_path: P) -> rusqlite::Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        let db = Self::open(db_path)?;
        db.run_schema()?;
        db.mark_dangling_truncated()?;
        Ok(db)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.busy_timeout(Duration::from_millis(100))?;
        Ok(Self { conn })
    }

    pub fn run_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(SCHEMA_SQL)
    }

    /// Rows with no finish time belong to a process that died mid-write.
    pub fn mark_dangling_truncated(&self) -> rusqlite::Result<usize> {
        self.conn.execute(
            "UPDATE recordings
             SET truncated = 1,
                 finished_at = started_at
             WHERE finished_at IS NULL;",
            [],
        )
    }

    pub fn insert_started(
        &self,
        camera_key: &str,
        path: &str,
        started_at: &str,
    ) -> rusqlite::Result<i64> {
        self.conn.execute(
            "INSERT INTO recordings (camera_key, path, started_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(path) DO UPDATE SET
                started_at  = excluded.started_at,
                finished_at = NULL,
                bytes       = 0,
                truncated   = 0;",
            params![camera_key, path, started_at],
        )?;
        self.conn.query_row(
            "SELECT id FROM recordings WHERE path = ?1;",
            params![path],
            |r| r.get(0),
        )
    }

    pub fn mark_finished(
        &self,
        path: &str,
        finished_at: &str,
        bytes: i64,
        truncated: bool,
    ) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE recordings
             SET finished_at = ?2, bytes = ?3, truncated = ?4
             WHERE path = ?1;",
            params![path, finished_at, bytes, truncated as i64],
        )?;
        Ok(())
    }

    pub fn recent_for_camera(
        &self,
        camera_key: &str,
        limit: i64,
    ) -> rusqlite::Result<Vec<RecordingRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, camera_key, path, started_at, finished_at, bytes, truncated
             FROM recordings
             WHERE camera_key = ?1
             ORDER BY started_at DESC
             LIMIT ?2;",
        )?;
        let rows = stmt.query_map(params![camera_key, limit], |r| {
            Ok(RecordingRow {
                id: r.get(0)?,
                camera_key: r.get(1)?,
                path: r.get(2)?,
                started_at: r.get(3)?,
                finished_at: r.get(4)?,
                bytes: r.get(5)?,
                truncated: r.get::<_, i64>(6)? != 0,
            })
        })?;
        rows.collect()
    }

    pub fn open_recording_count(&self) -> rusqlite::Result<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM recordings WHERE finished_at IS NULL;",
            [],
            |r| r.get(0),
        )
    }
}
