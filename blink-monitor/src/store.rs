//! Durable, append-only storage of blink count samples.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::{debug, info_span};

use crate::window::MetricSample;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid table name \"{0}\"")]
    InvalidTableName(String),
    /// For stores other than the built-in SQLite store.
    #[error("{0}")]
    Backend(String),
}

/// One row of the blink history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedRecord {
    /// Seconds since the unix epoch.
    pub timestamp: i64,
    pub blink_count: u64,
}

impl From<MetricSample> for PersistedRecord {
    fn from(sample: MetricSample) -> Self {
        Self {
            timestamp: sample.timestamp,
            blink_count: sample.value,
        }
    }
}

/// An open connection to an append-only store.
///
/// Owned by exactly one thread at a time.
pub trait SampleStore: Send {
    /// Append one row and commit it.
    fn append(&mut self, record: &PersistedRecord) -> Result<(), StoreError>;
    /// Close the connection. The store is gone even if this fails.
    fn close(self: Box<Self>) -> Result<(), StoreError>;
}

/// Opens [SampleStore] connections. Shared between runs of the pipeline.
pub trait StoreOpener: Send + Sync {
    /// Human readable location of the store, for log messages.
    fn describe(&self) -> String;
    /// Open the store, creating it if absent.
    fn open(&self) -> Result<Box<dyn SampleStore>, StoreError>;
}

/// Returns an error unless `name` is a plain SQL identifier.
fn validate_table_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(name.to_string()))
    }
}

pub struct SqliteStore {
    conn: Connection,
    table: String,
}

impl SqliteStore {
    /// Open or create the store at `path` with history table `table`.
    pub fn open(path: &Path, table: &str) -> Result<Self, StoreError> {
        let _span = info_span!("store_open", path = %path.display(), table).entered();
        validate_table_name(table)?;
        let conn = Connection::open(path)?;
        Self::with_connection(conn, table)
    }

    /// Open a store which lives only as long as the returned value.
    pub fn open_in_memory(table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self, StoreError> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             timestamp INTEGER NOT NULL, \
             blinkcount INTEGER NOT NULL)"
        ))?;
        debug!("store table \"{table}\" ready");
        Ok(Self {
            conn,
            table: table.to_string(),
        })
    }

    /// All rows in insertion order. With `last`, only the most recent `last`
    /// rows.
    pub fn records(&self, last: Option<usize>) -> Result<Vec<PersistedRecord>, StoreError> {
        let table = &self.table;
        let sql = match last {
            Some(n) => format!(
                "SELECT timestamp, blinkcount FROM \
                 (SELECT rowid, timestamp, blinkcount FROM {table} ORDER BY rowid DESC LIMIT {n}) \
                 ORDER BY rowid"
            ),
            None => format!("SELECT timestamp, blinkcount FROM {table} ORDER BY rowid"),
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(PersistedRecord {
                timestamp: row.get(0)?,
                blink_count: row.get::<_, i64>(1)? as u64,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn row_count(&self) -> Result<u64, StoreError> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

impl SampleStore for SqliteStore {
    fn append(&mut self, record: &PersistedRecord) -> Result<(), StoreError> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (timestamp, blinkcount) VALUES (?1, ?2)",
                self.table
            ),
            rusqlite::params![record.timestamp, record.blink_count as i64],
        )?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_conn, e)| StoreError::from(e))
    }
}

/// Opens a [SqliteStore] at a fixed path.
#[derive(Debug, Clone)]
pub struct SqliteStoreOpener {
    path: PathBuf,
    table: String,
}

impl SqliteStoreOpener {
    pub fn new(path: impl Into<PathBuf>, table: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            table: table.into(),
        }
    }

    pub fn open_sqlite(&self) -> Result<SqliteStore, StoreError> {
        SqliteStore::open(&self.path, &self.table)
    }
}

impl StoreOpener for SqliteStoreOpener {
    fn describe(&self) -> String {
        format!("{}:{}", self.path.display(), self.table)
    }

    fn open(&self) -> Result<Box<dyn SampleStore>, StoreError> {
        Ok(Box::new(self.open_sqlite()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(timestamp: i64, blink_count: u64) -> PersistedRecord {
        PersistedRecord {
            timestamp,
            blink_count,
        }
    }

    #[test]
    fn table_names_are_validated() {
        for good in ["user1", "_x", "Blinks_2"] {
            assert!(validate_table_name(good).is_ok(), "{good}");
        }
        for bad in ["", "1user", "user-1", "user1; DROP TABLE x", "ü"] {
            assert!(
                matches!(validate_table_name(bad), Err(StoreError::InvalidTableName(_))),
                "{bad}"
            );
        }
        assert!(SqliteStore::open_in_memory("no spaces").is_err());
    }

    #[test]
    fn rows_are_appended_in_order() {
        let mut store = SqliteStore::open_in_memory("user1").unwrap();
        assert_eq!(store.row_count().unwrap(), 0);
        for (i, r) in [rec(10, 0), rec(11, 2), rec(12, 2)].iter().enumerate() {
            store.append(r).unwrap();
            assert_eq!(store.row_count().unwrap(), i as u64 + 1);
        }
        assert_eq!(
            store.records(None).unwrap(),
            vec![rec(10, 0), rec(11, 2), rec(12, 2)]
        );
        assert_eq!(store.records(Some(2)).unwrap(), vec![rec(11, 2), rec(12, 2)]);
        assert!(store.records(Some(0)).unwrap().is_empty());
    }

    #[test]
    fn reopening_keeps_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let opener = SqliteStoreOpener::new(dir.path().join("wellness_at_work_db"), "user1");
        let mut first = opener.open().unwrap();
        first.append(&rec(1, 1)).unwrap();
        first.append(&rec(2, 3)).unwrap();
        first.close().unwrap();

        let mut second = opener.open().unwrap();
        second.append(&rec(3, 4)).unwrap();
        second.close().unwrap();

        let store = opener.open_sqlite().unwrap();
        assert_eq!(store.records(None).unwrap(), vec![rec(1, 1), rec(2, 3), rec(3, 4)]);
        assert!(opener.describe().ends_with("wellness_at_work_db:user1"));
    }

    #[test]
    fn sample_converts_to_record() {
        let sample = MetricSample {
            timestamp: 42,
            value: 7,
        };
        assert_eq!(PersistedRecord::from(sample), rec(42, 7));
    }
}
