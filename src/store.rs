//! Local record storage for HAT Core.
//!
//! Buffers location samples and locally authored notes in SQLite until the
//! sync engine has delivered them. All timestamps are stored as Unix
//! milliseconds (INTEGER).
//!
//! The store is shared between the capture producer and the sync engine as
//! `Arc<Mutex<LocalStore>>`; callers must not hold the lock across an await.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::{HatError, HatResult};
use crate::models::{LocationSample, NoteKind, NoteRecord};

/// Default age after which samples are purged
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {}", ms).into(),
        )
    })
}

/// SQLite-backed local store
pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    /// Open (or create) a store at the given path
    pub fn open<P: AsRef<Path>>(db_path: P) -> HatResult<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            HatError::store(format!("cannot open {}: {}", path.display(), e))
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self { conn };
        store.init_schema()?;
        tracing::debug!(path = %path.display(), "Opened local store");
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn open_in_memory() -> HatResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> HatResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS location_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                horizontal_accuracy REAL NOT NULL CHECK (horizontal_accuracy >= 0),
                captured_at INTEGER NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_samples_captured_at
                ON location_samples (captured_at);
            CREATE INDEX IF NOT EXISTS idx_samples_synced
                ON location_samples (synced, id);

            CREATE TABLE IF NOT EXISTS notes (
                local_id INTEGER PRIMARY KEY AUTOINCREMENT,
                remote_id INTEGER,
                message TEXT NOT NULL,
                kind TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_local_update INTEGER NOT NULL,
                shared_on TEXT NOT NULL DEFAULT '',
                shared INTEGER NOT NULL DEFAULT 0,
                public_until INTEGER,
                synced INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(())
    }

    /// Get the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ========================================================================
    // Location samples
    // ========================================================================

    /// Append a sample. Returns its row id.
    pub fn insert_sample(&self, sample: &LocationSample) -> HatResult<i64> {
        if !sample.is_valid_measurement() {
            return Err(HatError::InvalidMeasurement(format!(
                "horizontal accuracy {} is negative",
                sample.horizontal_accuracy
            )));
        }

        self.conn.execute(
            r#"
            INSERT INTO location_samples
                (latitude, longitude, horizontal_accuracy, captured_at, synced)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![
                sample.latitude,
                sample.longitude,
                sample.horizontal_accuracy,
                to_millis(sample.captured_at),
                sample.synced,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recently inserted sample
    pub fn last_sample(&self) -> HatResult<Option<LocationSample>> {
        let sample = self
            .conn
            .query_row(
                r#"
                SELECT id, latitude, longitude, horizontal_accuracy, captured_at, synced
                FROM location_samples
                ORDER BY id DESC
                LIMIT 1
                "#,
                [],
                row_to_sample,
            )
            .optional()?;
        Ok(sample)
    }

    /// Delete every sample captured at or before `cutoff`, synced or not.
    ///
    /// Returns the number of samples removed.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> HatResult<usize> {
        let removed = self.conn.execute(
            "DELETE FROM location_samples WHERE captured_at <= ?",
            params![to_millis(cutoff)],
        )?;
        if removed > 0 {
            tracing::info!(removed, cutoff = %cutoff, "Purged aged location samples");
        }
        Ok(removed)
    }

    /// Up to `limit` unsynced samples, oldest insertion first
    pub fn pending_batch(&self, limit: usize) -> HatResult<Vec<LocationSample>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, latitude, longitude, horizontal_accuracy, captured_at, synced
            FROM location_samples
            WHERE synced = 0
            ORDER BY id ASC
            LIMIT ?
            "#,
        )?;

        let samples = stmt
            .query_map(params![limit as i64], row_to_sample)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(samples)
    }

    /// Mark samples as delivered. Unknown or already-synced ids are ignored.
    ///
    /// Returns the number of samples that changed state.
    pub fn mark_synced(&mut self, ids: &[i64]) -> HatResult<usize> {
        mark_rows_synced(&mut self.conn, "location_samples", "id", ids)
    }

    pub fn sample_count(&self) -> HatResult<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM location_samples", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn pending_sample_count(&self) -> HatResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM location_samples WHERE synced = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ========================================================================
    // Notes
    // ========================================================================

    /// Append a note. Returns its local row id.
    pub fn insert_note(&self, note: &NoteRecord) -> HatResult<i64> {
        self.conn.execute(
            r#"
            INSERT INTO notes (
                remote_id, message, kind, created_at, updated_at,
                last_local_update, shared_on, shared, public_until, synced
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                note.id,
                note.message,
                note.kind.as_str(),
                to_millis(note.created_at),
                to_millis(note.updated_at),
                to_millis(note.last_local_update),
                note.shared_on,
                note.shared,
                note.public_until.map(to_millis),
                note.id.is_some(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Notes not yet posted to the HAT, oldest first
    pub fn pending_notes(&self) -> HatResult<Vec<NoteRecord>> {
        self.query_notes("WHERE synced = 0 ORDER BY local_id ASC")
    }

    /// All locally known notes, oldest first
    pub fn all_notes(&self) -> HatResult<Vec<NoteRecord>> {
        self.query_notes("ORDER BY local_id ASC")
    }

    pub fn get_note(&self, local_id: i64) -> HatResult<Option<NoteRecord>> {
        let note = self
            .conn
            .query_row(
                &format!("{} WHERE local_id = ?", NOTE_SELECT),
                params![local_id],
                row_to_note,
            )
            .optional()?;
        Ok(note)
    }

    /// Mark notes as posted. Same idempotency rules as [`Self::mark_synced`].
    pub fn mark_notes_synced(&mut self, local_ids: &[i64]) -> HatResult<usize> {
        mark_rows_synced(&mut self.conn, "notes", "local_id", local_ids)
    }

    /// Remember the HAT record id a local note was posted as
    pub fn set_note_remote_id(&self, local_id: i64, remote_id: i64) -> HatResult<()> {
        self.conn.execute(
            "UPDATE notes SET remote_id = ? WHERE local_id = ?",
            params![remote_id, local_id],
        )?;
        Ok(())
    }

    /// Delete a local note. Returns false if it did not exist.
    pub fn delete_note(&self, local_id: i64) -> HatResult<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM notes WHERE local_id = ?", params![local_id])?;
        Ok(deleted > 0)
    }

    /// Remove every local record (used on log out)
    pub fn clear(&self) -> HatResult<()> {
        self.conn
            .execute_batch("DELETE FROM location_samples; DELETE FROM notes;")?;
        Ok(())
    }

    fn query_notes(&self, clause: &str) -> HatResult<Vec<NoteRecord>> {
        let mut stmt = self.conn.prepare(&format!("{} {}", NOTE_SELECT, clause))?;
        let notes = stmt
            .query_map([], row_to_note)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notes)
    }
}

const NOTE_SELECT: &str = r#"
    SELECT local_id, remote_id, message, kind, created_at, updated_at,
           last_local_update, shared_on, shared, public_until
    FROM notes
"#;

fn mark_rows_synced(
    conn: &mut Connection,
    table: &str,
    id_column: &str,
    ids: &[i64],
) -> HatResult<usize> {
    if ids.is_empty() {
        return Ok(0);
    }

    // One transaction so a batch is acknowledged all-or-nothing
    let tx = conn.transaction()?;
    let mut changed = 0;
    for chunk in ids.chunks(500) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "UPDATE {} SET synced = 1 WHERE synced = 0 AND {} IN ({})",
            table, id_column, placeholders
        );
        changed += tx.execute(&sql, params_from_iter(chunk.iter()))?;
    }
    tx.commit()?;
    Ok(changed)
}

fn row_to_sample(row: &Row) -> rusqlite::Result<LocationSample> {
    Ok(LocationSample {
        id: Some(row.get(0)?),
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        horizontal_accuracy: row.get(3)?,
        captured_at: from_millis(row.get(4)?)?,
        synced: row.get(5)?,
    })
}

fn row_to_note(row: &Row) -> rusqlite::Result<NoteRecord> {
    let kind: String = row.get(3)?;
    let kind = kind.parse::<NoteKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    let public_until: Option<i64> = row.get(9)?;

    Ok(NoteRecord {
        local_id: Some(row.get(0)?),
        id: row.get(1)?,
        message: row.get(2)?,
        kind,
        created_at: from_millis(row.get(4)?)?,
        updated_at: from_millis(row.get(5)?)?,
        last_local_update: from_millis(row.get(6)?)?,
        shared_on: row.get(7)?,
        shared: row.get(8)?,
        public_until: public_until.map(from_millis).transpose()?,
        attachments: Default::default(),
    })
}
