// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite storage backend.
//!
//! One database file per monthly partition, named
//! `<prefix>_YYYYMM.<ext>` after the configured database path
//! (`syslog.sqlite3` -> `syslog_202507.sqlite3`). Each file carries the
//! `SystemEvents` table, an index on `ReceivedAt`, and the
//! `SystemEvents_FTS` full-text table kept in sync by an insert
//! trigger. The table and FTS names are stable; the web search
//! collaborator queries them directly.
//!
//! Batches are written in a single transaction through a prepared
//! statement, so a partition either gains the whole batch or none of
//! it. `ID` is `AUTOINCREMENT`, which makes ids strictly increasing in
//! insertion order within a partition.

use crate::parser::LogRecord;
use crate::store::{PartitionKey, StorageBackend};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::PathBuf;

/// Per-partition schema. `SystemEvents_FTS` is an external-content
/// table over `SystemEvents.Message`; the trigger keeps it in sync on
/// insert (records are never updated or deleted by the daemon).
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS SystemEvents (
    ID INTEGER PRIMARY KEY AUTOINCREMENT,
    Facility INTEGER,
    Priority INTEGER,
    FromHost TEXT,
    InfoUnitID INTEGER,
    ReceivedAt TIMESTAMP,
    DeviceReportedTime TIMESTAMP,
    SysLogTag TEXT,
    ProcessID TEXT,
    Message TEXT
);
CREATE INDEX IF NOT EXISTS idx_SystemEvents_ReceivedAt
    ON SystemEvents (ReceivedAt);
CREATE VIRTUAL TABLE IF NOT EXISTS SystemEvents_FTS
    USING fts5(Message, content='SystemEvents', content_rowid='ID');
CREATE TRIGGER IF NOT EXISTS SystemEvents_ai
    AFTER INSERT ON SystemEvents
BEGIN
    INSERT INTO SystemEvents_FTS (rowid, Message) VALUES (new.ID, new.Message);
END;
";

/// Write-throughput pragmas applied on every open.
const OPEN_PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -65536;
PRAGMA busy_timeout = 5000;
";

const INSERT_SQL: &str = "INSERT INTO SystemEvents \
    (Facility, Priority, FromHost, InfoUnitID, ReceivedAt, DeviceReportedTime, \
     SysLogTag, ProcessID, Message) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

/// rsyslog-compatible constant for UDP-received messages.
const INFO_UNIT_ID: i64 = 1;

/// Monthly-partitioned SQLite backend.
pub struct SqliteBackend {
    directory: PathBuf,
    prefix: String,
    extension: String,
    /// Live partition handles. Older partitions are closed when a newer
    /// one opens; a late straggler reopens its partition lazily.
    connections: HashMap<PartitionKey, Connection>,
}

impl SqliteBackend {
    /// Create a backend from the configured database path template.
    pub fn new(database: &std::path::Path) -> Result<Self> {
        let directory = database
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let prefix = database
            .file_stem()
            .and_then(|s| s.to_str())
            .context("sqlite database path has no file name")?
            .to_string();
        let extension = database
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("sqlite3")
            .to_string();

        Ok(Self {
            directory,
            prefix,
            extension,
            connections: HashMap::new(),
        })
    }

    /// File path for a partition: `<dir>/<prefix>_YYYYMM.<ext>`.
    #[must_use]
    pub fn partition_path(&self, key: PartitionKey) -> PathBuf {
        self.directory
            .join(format!("{}_{}.{}", self.prefix, key.label(), self.extension))
    }

    #[cfg(test)]
    pub(crate) fn open_partition_count(&self) -> usize {
        self.connections.len()
    }

    fn open_partition(&self, key: PartitionKey) -> Result<Connection> {
        let path = self.partition_path(key);
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open partition file {}", path.display()))?;
        conn.execute_batch(OPEN_PRAGMAS)
            .context("failed to apply connection pragmas")?;
        conn.execute_batch(SCHEMA_SQL)
            .with_context(|| format!("failed to ensure schema in {}", path.display()))?;
        tracing::info!("opened SQLite partition {}", path.display());
        Ok(conn)
    }

    /// Checkpoint and drop a partition handle.
    fn close_partition(&mut self, key: PartitionKey) {
        if let Some(conn) = self.connections.remove(&key) {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
            tracing::info!("closed SQLite partition {key}");
        }
    }

    fn insert_all(conn: &mut Connection, records: &[LogRecord]) -> rusqlite::Result<usize> {
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(INSERT_SQL)?;
            for record in records {
                stmt.execute(params![
                    record.facility,
                    record.priority,
                    record.hostname,
                    INFO_UNIT_ID,
                    format_timestamp(&record.received_at),
                    format_timestamp(&record.device_reported_time),
                    record.tag,
                    record.process_id.as_deref().unwrap_or("0"),
                    record.message,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn connect(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.directory).with_context(|| {
            format!(
                "failed to create database directory {}",
                self.directory.display()
            )
        })?;
        Ok(())
    }

    async fn ensure_partition(&mut self, key: PartitionKey) -> Result<()> {
        if self.connections.contains_key(&key) {
            return Ok(());
        }

        // Rollover: opening a newer month retires every older handle.
        let stale: Vec<PartitionKey> = self
            .connections
            .keys()
            .copied()
            .filter(|open| *open < key)
            .collect();
        for old in stale {
            self.close_partition(old);
        }

        let conn = self.open_partition(key)?;
        self.connections.insert(key, conn);
        Ok(())
    }

    async fn write_batch(&mut self, key: PartitionKey, records: &[LogRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        self.ensure_partition(key).await?;

        let conn = self
            .connections
            .get_mut(&key)
            .context("partition handle missing after ensure")?;
        match Self::insert_all(conn, records) {
            Ok(written) => Ok(written),
            Err(err) => {
                // One reopen-and-retry before the error propagates to
                // the batcher's retry policy.
                tracing::warn!("batch insert into {key} failed, reopening file: {err}");
                self.connections.remove(&key);
                let mut conn = self.open_partition(key)?;
                let written = Self::insert_all(&mut conn, records)
                    .with_context(|| format!("batch insert into partition {key} failed"))?;
                self.connections.insert(key, conn);
                Ok(written)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let open: Vec<PartitionKey> = self.connections.keys().copied().collect();
        for key in open {
            self.close_partition(key);
        }
        Ok(())
    }
}

/// SQLite-friendly timestamp text (`YYYY-MM-DD HH:MM:SS.ffffff`),
/// comparable with the built-in datetime functions.
fn format_timestamp(instant: &DateTime<Utc>) -> String {
    instant.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::record_at;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn backend_in(dir: &TempDir) -> SqliteBackend {
        SqliteBackend::new(&dir.path().join("test_syslog.sqlite3")).unwrap()
    }

    fn count_rows(path: &std::path::Path) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row("SELECT COUNT(*) FROM SystemEvents", [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_batch_single_month() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend_in(&dir);
        let instant = Utc.with_ymd_and_hms(2025, 7, 15, 10, 0, 0).unwrap();
        let key = PartitionKey::of(&instant);

        let batch = vec![
            record_at(instant, "normal log 1"),
            record_at(instant + chrono::Duration::seconds(1), "normal log 2"),
        ];
        let written = backend.write_batch(key, &batch).await.unwrap();
        assert_eq!(written, 2);
        backend.close().await.unwrap();

        let path = dir.path().join("test_syslog_202507.sqlite3");
        assert!(path.exists(), "partition file was not created");
        assert_eq!(count_rows(&path), 2);
    }

    #[tokio::test]
    async fn test_ids_increase_in_submission_order() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend_in(&dir);
        let instant = Utc.with_ymd_and_hms(2025, 7, 15, 10, 0, 0).unwrap();
        let key = PartitionKey::of(&instant);

        let batch: Vec<_> = (0..50)
            .map(|i| record_at(instant, &format!("msg-{i}")))
            .collect();
        backend.write_batch(key, &batch).await.unwrap();
        backend.close().await.unwrap();

        let conn = Connection::open(dir.path().join("test_syslog_202507.sqlite3")).unwrap();
        let mut stmt = conn
            .prepare("SELECT ID, Message FROM SystemEvents ORDER BY ID")
            .unwrap();
        let rows: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();

        assert_eq!(rows.len(), 50);
        for (i, (id, message)) in rows.iter().enumerate() {
            assert_eq!(*id, i as i64 + 1);
            assert_eq!(message, &format!("msg-{i}"));
        }
    }

    #[tokio::test]
    async fn test_separate_files_per_month() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend_in(&dir);

        let may = Utc.with_ymd_and_hms(2025, 5, 31, 23, 59, 59).unwrap();
        let june = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 1).unwrap();

        backend
            .write_batch(PartitionKey::of(&may), &[record_at(may, "log_may")])
            .await
            .unwrap();
        backend
            .write_batch(PartitionKey::of(&june), &[record_at(june, "log_june")])
            .await
            .unwrap();
        backend.close().await.unwrap();

        let may_path = dir.path().join("test_syslog_202505.sqlite3");
        let june_path = dir.path().join("test_syslog_202506.sqlite3");
        assert!(may_path.exists());
        assert!(june_path.exists());
        assert_eq!(count_rows(&may_path), 1);
        assert_eq!(count_rows(&june_path), 1);

        // Both partitions restart their id sequence.
        for path in [&may_path, &june_path] {
            let conn = Connection::open(path).unwrap();
            let id: i64 = conn
                .query_row("SELECT MIN(ID) FROM SystemEvents", [], |row| row.get(0))
                .unwrap();
            assert_eq!(id, 1);
        }
    }

    #[tokio::test]
    async fn test_rollover_closes_older_partitions() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend_in(&dir);

        let may = Utc.with_ymd_and_hms(2025, 5, 15, 0, 0, 0).unwrap();
        let june = Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap();

        backend.ensure_partition(PartitionKey::of(&may)).await.unwrap();
        assert_eq!(backend.open_partition_count(), 1);

        backend.ensure_partition(PartitionKey::of(&june)).await.unwrap();
        assert_eq!(backend.open_partition_count(), 1);
    }

    #[tokio::test]
    async fn test_fts_search() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend_in(&dir);
        let instant = Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap();
        let key = PartitionKey::of(&instant);

        let batch = vec![
            record_at(instant, "This is a success message"),
            record_at(instant, "This is a critical failure message"),
            record_at(instant, "Another success log"),
        ];
        backend.write_batch(key, &batch).await.unwrap();
        backend.close().await.unwrap();

        let conn = Connection::open(dir.path().join("test_syslog_202508.sqlite3")).unwrap();

        let failure: Vec<String> = conn
            .prepare("SELECT Message FROM SystemEvents_FTS WHERE Message MATCH 'failure'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(failure, ["This is a critical failure message"]);

        let prefixed: Vec<String> = conn
            .prepare("SELECT Message FROM SystemEvents_FTS WHERE Message MATCH 'succ*'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(prefixed.len(), 2);
    }

    #[tokio::test]
    async fn test_fts_rows_match_table_rows() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend_in(&dir);
        let instant = Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap();
        let key = PartitionKey::of(&instant);

        let batch: Vec<_> = (0..25)
            .map(|i| record_at(instant, &format!("entry {i}")))
            .collect();
        backend.write_batch(key, &batch).await.unwrap();
        backend.close().await.unwrap();

        let conn = Connection::open(dir.path().join("test_syslog_202508.sqlite3")).unwrap();
        let table: i64 = conn
            .query_row("SELECT COUNT(*) FROM SystemEvents", [], |row| row.get(0))
            .unwrap();
        let fts: i64 = conn
            .query_row("SELECT COUNT(*) FROM SystemEvents_FTS", [], |row| row.get(0))
            .unwrap();
        assert_eq!(table, 25);
        assert_eq!(fts, 25);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend_in(&dir);
        let instant = Utc.with_ymd_and_hms(2025, 7, 15, 10, 0, 0).unwrap();

        let written = backend
            .write_batch(PartitionKey::of(&instant), &[])
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert!(!dir.path().join("test_syslog_202507.sqlite3").exists());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend_in(&dir);
        let instant = Utc.with_ymd_and_hms(2025, 7, 15, 10, 0, 0).unwrap();
        backend
            .ensure_partition(PartitionKey::of(&instant))
            .await
            .unwrap();

        backend.close().await.unwrap();
        backend.close().await.unwrap();
        assert_eq!(backend.open_partition_count(), 0);
    }

    #[test]
    fn test_partition_path_shapes() {
        let backend = SqliteBackend::new(std::path::Path::new("/var/log/syslog.sqlite3")).unwrap();
        let key = PartitionKey { year: 2025, month: 7 };
        assert_eq!(
            backend.partition_path(key),
            PathBuf::from("/var/log/syslog_202507.sqlite3")
        );

        // A bare filename partitions into the current directory.
        let backend = SqliteBackend::new(std::path::Path::new("syslog.sqlite3")).unwrap();
        assert_eq!(
            backend.partition_path(key),
            PathBuf::from("./syslog_202507.sqlite3")
        );
    }

    #[tokio::test]
    async fn test_process_id_defaults_to_zero() {
        let dir = TempDir::new().unwrap();
        let mut backend = backend_in(&dir);
        let instant = Utc.with_ymd_and_hms(2025, 7, 15, 10, 0, 0).unwrap();
        let key = PartitionKey::of(&instant);

        let mut record = record_at(instant, "no pid");
        record.process_id = None;
        backend.write_batch(key, &[record]).await.unwrap();
        backend.close().await.unwrap();

        let conn = Connection::open(dir.path().join("test_syslog_202507.sqlite3")).unwrap();
        let pid: String = conn
            .query_row("SELECT ProcessID FROM SystemEvents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(pid, "0");
    }
}
