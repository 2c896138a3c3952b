//! SQLite storage for the bounded capture history

use crate::payload::{ExtractedBatch, UnitRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Number of history entries kept when no capacity is configured
pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid timestamp in history: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

/// One stored batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub entry_id: String,
    pub origin_id: String,
    pub origin_locator: String,
    pub captured_at: DateTime<Utc>,
    pub units: Vec<UnitRecord>,
}

/// Capacity-limited history with FIFO eviction
pub struct HistoryLog {
    conn: Connection,
    capacity: usize,
}

impl HistoryLog {
    /// Open or create the history database at the given path
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let log = Self { conn, capacity };
        log.init_schema()?;
        Ok(log)
    }

    /// Open an in-memory history (for testing)
    pub fn open_in_memory(capacity: usize) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let log = Self { conn, capacity };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS history_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_id TEXT NOT NULL UNIQUE,
                origin_id TEXT NOT NULL,
                origin_locator TEXT NOT NULL,
                captured_at TEXT NOT NULL,
                units TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Append a batch and drop the oldest entries beyond capacity.
    /// Returns the number of entries held afterwards.
    pub fn append(&mut self, batch: &ExtractedBatch) -> Result<usize, StorageError> {
        let units_json = serde_json::to_string(&batch.units)?;
        let entry_id = uuid::Uuid::new_v4().to_string();

        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO history_entries (entry_id, origin_id, origin_locator, captured_at, units)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry_id,
                batch.origin_id,
                batch.origin_locator,
                batch.captured_at.to_rfc3339(),
                units_json
            ],
        )?;

        tx.execute(
            "DELETE FROM history_entries WHERE id NOT IN (
                SELECT id FROM history_entries ORDER BY id DESC LIMIT ?1
             )",
            params![self.capacity as i64],
        )?;

        let total: i64 =
            tx.query_row("SELECT COUNT(*) FROM history_entries", [], |row| row.get(0))?;

        tx.commit()?;
        Ok(total as usize)
    }

    /// All entries, oldest first
    pub fn entries(&self) -> Result<Vec<HistoryEntry>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT entry_id, origin_id, origin_locator, captured_at, units
             FROM history_entries ORDER BY id ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (entry_id, origin_id, origin_locator, captured_at, units) = row?;
            entries.push(HistoryEntry {
                entry_id,
                origin_id,
                origin_locator,
                captured_at: DateTime::parse_from_rfc3339(&captured_at)?.with_timezone(&Utc),
                units: serde_json::from_str(&units)?,
            });
        }
        Ok(entries)
    }

    /// Number of stored entries
    pub fn len(&self) -> Result<usize, StorageError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM history_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_batch(origin_id: &str) -> ExtractedBatch {
        ExtractedBatch {
            origin_id: origin_id.to_string(),
            origin_locator: "https://www.perplexity.ai/search/abc".to_string(),
            captured_at: Utc::now(),
            units: vec![UnitRecord {
                text: "An answer long enough to be worth keeping around".to_string(),
                index: 0,
            }],
        }
    }

    #[test]
    fn test_fresh_history_is_empty() {
        let log = HistoryLog::open_in_memory(DEFAULT_CAPACITY).unwrap();
        assert!(log.is_empty().unwrap());
        assert!(log.entries().unwrap().is_empty());
    }

    #[test]
    fn test_append_and_read_back() {
        let mut log = HistoryLog::open_in_memory(DEFAULT_CAPACITY).unwrap();
        let batch = make_batch("tab-1");

        let total = log.append(&batch).unwrap();
        assert_eq!(total, 1);

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].origin_id, "tab-1");
        assert_eq!(entries[0].units, batch.units);
        assert_eq!(
            entries[0].captured_at.timestamp(),
            batch.captured_at.timestamp()
        );
    }

    #[test]
    fn test_fifo_eviction_at_capacity() {
        let mut log = HistoryLog::open_in_memory(DEFAULT_CAPACITY).unwrap();

        for i in 0..51 {
            log.append(&make_batch(&format!("tab-{}", i))).unwrap();
        }

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 50);
        assert!(entries.iter().all(|e| e.origin_id != "tab-0"));
        assert_eq!(entries.first().unwrap().origin_id, "tab-1");
        assert_eq!(entries.last().unwrap().origin_id, "tab-50");
    }

    #[test]
    fn test_small_capacity() {
        let mut log = HistoryLog::open_in_memory(2).unwrap();
        assert_eq!(log.append(&make_batch("a")).unwrap(), 1);
        assert_eq!(log.append(&make_batch("b")).unwrap(), 2);
        assert_eq!(log.append(&make_batch("c")).unwrap(), 2);

        let ids: Vec<_> = log.entries().unwrap().into_iter().map(|e| e.origin_id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");

        {
            let mut log = HistoryLog::open(&path, DEFAULT_CAPACITY).unwrap();
            log.append(&make_batch("tab-1")).unwrap();
        }

        let log = HistoryLog::open(&path, DEFAULT_CAPACITY).unwrap();
        assert_eq!(log.len().unwrap(), 1);
    }
}
