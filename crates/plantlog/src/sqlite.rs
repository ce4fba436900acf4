// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite reading store
//!
//! Durable storage for sequenced readings with an idempotent batch insert.

use crate::error::WriteError;
use crate::reading::{Reading, TagValue};
use crate::store::{CommitOutcome, ReadingStore, WriteBatch};
use parking_lot::Mutex;
use rusqlite::types::{FromSqlError, Type, Value};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::time::Duration;

/// SQLite reading store
///
/// Thread-safe via internal Mutex (SQLite Connection is not Sync).
///
/// # Schema
///
/// ```sql
/// CREATE TABLE readings (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     source TEXT NOT NULL,
///     tag TEXT NOT NULL,
///     value_kind TEXT NOT NULL,
///     value,
///     timestamp_ns INTEGER NOT NULL,
///     monotonic_ns INTEGER NOT NULL,
///     sequence INTEGER NOT NULL,
///     batch_id INTEGER NOT NULL,
///     UNIQUE (source, tag, sequence)
/// );
/// CREATE TABLE latest_values (... PRIMARY KEY (source, tag));
/// CREATE TABLE sequence_cursors (source TEXT PRIMARY KEY, next_sequence INTEGER);
/// ```
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const READING_COLUMNS: &str =
    "source, tag, value_kind, value, timestamp_ns, monotonic_ns, sequence";

impl SqliteStore {
    /// Open (or create) a file-backed store in WAL mode.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WriteError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            WriteError::Unavailable(format!("cannot open {}: {}", path.display(), e))
        })?;

        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "Opened SQLite store");

        Self::with_connection(conn)
    }

    /// Open an existing store for inspection only.
    ///
    /// Fails if the file does not exist; neither the schema nor the journal
    /// mode is touched.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, WriteError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| WriteError::Unavailable(format!("cannot open {}: {}", path.display(), e)))?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing)
    pub fn new_in_memory() -> Result<Self, WriteError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, WriteError> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), WriteError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                tag TEXT NOT NULL,
                value_kind TEXT NOT NULL,
                value,
                timestamp_ns INTEGER NOT NULL,
                monotonic_ns INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                batch_id INTEGER NOT NULL,
                UNIQUE (source, tag, sequence)
            );
            CREATE INDEX IF NOT EXISTS idx_readings_source_seq
                ON readings(source, sequence);
            CREATE INDEX IF NOT EXISTS idx_readings_timestamp
                ON readings(timestamp_ns);
            CREATE TABLE IF NOT EXISTS latest_values (
                source TEXT NOT NULL,
                tag TEXT NOT NULL,
                value_kind TEXT NOT NULL,
                value,
                timestamp_ns INTEGER NOT NULL,
                monotonic_ns INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                PRIMARY KEY (source, tag)
            );
            CREATE TABLE IF NOT EXISTS sequence_cursors (
                source TEXT PRIMARY KEY,
                next_sequence INTEGER NOT NULL
            );",
        )?;

        Ok(())
    }

    fn row_to_reading(row: &rusqlite::Row) -> rusqlite::Result<Reading> {
        let kind: String = row.get(2)?;
        let value = match kind.as_str() {
            "bool" => TagValue::Bool(row.get::<_, i64>(3)? != 0),
            "int" => TagValue::Int(row.get(3)?),
            // SQLite stores NaN as NULL
            "float" => TagValue::Float(row.get::<_, Option<f64>>(3)?.unwrap_or(f64::NAN)),
            "text" => TagValue::Text(row.get(3)?),
            _ => {
                return Err(rusqlite::Error::FromSqlConversionFailure(
                    2,
                    Type::Text,
                    Box::new(FromSqlError::InvalidType),
                ))
            }
        };

        Ok(Reading {
            source: row.get(0)?,
            tag: row.get(1)?,
            value,
            timestamp_ns: row.get::<_, i64>(4)? as u64,
            monotonic_ns: row.get::<_, i64>(5)? as u64,
            sequence: row.get::<_, i64>(6)? as u64,
        })
    }
}

fn sql_value(value: &TagValue) -> Value {
    match value {
        TagValue::Bool(b) => Value::Integer(i64::from(*b)),
        TagValue::Int(i) => Value::Integer(*i),
        TagValue::Float(f) => Value::Real(*f),
        TagValue::Text(s) => Value::Text(s.clone()),
    }
}

impl ReadingStore for SqliteStore {
    fn commit_batch(&self, batch: &WriteBatch) -> Result<CommitOutcome, WriteError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut inserted = 0usize;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO readings
                    (source, tag, value_kind, value, timestamp_ns, monotonic_ns, sequence, batch_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (source, tag, sequence) DO NOTHING",
            )?;
            let mut latest = tx.prepare_cached(
                "INSERT INTO latest_values
                    (source, tag, value_kind, value, timestamp_ns, monotonic_ns, sequence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (source, tag) DO UPDATE SET
                    value_kind = excluded.value_kind,
                    value = excluded.value,
                    timestamp_ns = excluded.timestamp_ns,
                    monotonic_ns = excluded.monotonic_ns,
                    sequence = excluded.sequence
                 WHERE excluded.sequence > latest_values.sequence",
            )?;

            for reading in &batch.readings {
                let value = sql_value(&reading.value);
                inserted += insert.execute(params![
                    reading.source,
                    reading.tag,
                    reading.value.kind(),
                    value,
                    reading.timestamp_ns as i64,
                    reading.monotonic_ns as i64,
                    reading.sequence as i64,
                    batch.id as i64,
                ])?;
                latest.execute(params![
                    reading.source,
                    reading.tag,
                    reading.value.kind(),
                    value,
                    reading.timestamp_ns as i64,
                    reading.monotonic_ns as i64,
                    reading.sequence as i64,
                ])?;
            }
        }

        tx.commit()?;

        Ok(CommitOutcome {
            inserted,
            duplicates: batch.len() - inserted,
        })
    }

    fn max_sequence(&self, source: &str) -> Result<Option<u64>, WriteError> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(sequence) FROM readings WHERE source = ?1",
            [source],
            |row| row.get(0),
        )?;

        Ok(max.map(|m| m as u64))
    }

    fn load(&self, source: &str) -> Result<Vec<Reading>, WriteError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM readings WHERE source = ?1 ORDER BY sequence ASC",
            READING_COLUMNS
        ))?;

        let readings = stmt
            .query_map([source], Self::row_to_reading)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(readings)
    }

    fn sources(&self) -> Result<Vec<(String, usize)>, WriteError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT source, COUNT(*) FROM readings GROUP BY source ORDER BY source ASC",
        )?;

        let sources = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sources)
    }

    fn count(&self) -> Result<usize, WriteError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?;

        Ok(count as usize)
    }

    fn latest_values(&self, source: &str) -> Result<Vec<Reading>, WriteError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM latest_values WHERE source = ?1 ORDER BY tag ASC",
            READING_COLUMNS
        ))?;

        let readings = stmt
            .query_map([source], Self::row_to_reading)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(readings)
    }

    fn sequence_cursor(&self, source: &str) -> Result<Option<u64>, WriteError> {
        let conn = self.conn.lock();
        let next: Option<i64> = conn
            .query_row(
                "SELECT next_sequence FROM sequence_cursors WHERE source = ?1",
                [source],
                |row| row.get(0),
            )
            .optional()?;

        Ok(next.map(|n| n as u64))
    }

    fn save_sequence_cursor(&self, source: &str, next_sequence: u64) -> Result<(), WriteError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sequence_cursors (source, next_sequence) VALUES (?1, ?2)
             ON CONFLICT (source) DO UPDATE SET
                next_sequence = MAX(next_sequence, excluded.next_sequence)",
            params![source, next_sequence as i64],
        )?;

        Ok(())
    }
}
