// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Storage backend abstraction.
//!
//! Backends accept batches of [`LogRecord`]s keyed by a monthly
//! [`PartitionKey`]. The batcher computes keys and splits batches; a
//! backend only ever sees records that belong to the partition it is
//! told to write.
//!
//! # Implementations
//!
//! - [`crate::sqlite::SqliteBackend`] -- one SQLite file per month with
//!   an FTS5 companion table
//! - [`crate::meilisearch::MeilisearchBackend`] -- one remote index per
//!   month
//! - [`MemoryBackend`] -- in-process sink for tests

use crate::parser::LogRecord;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};

/// Monthly partition key, derived from `received_at` in UTC.
///
/// The zone choice is fixed for the lifetime of the daemon: partition
/// boundaries fall on UTC month boundaries regardless of the host zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
}

impl PartitionKey {
    /// Key for the partition an instant falls into.
    #[must_use]
    pub fn of(instant: &DateTime<Utc>) -> Self {
        Self {
            year: instant.year(),
            month: instant.month(),
        }
    }

    /// `YYYYMM` label used in file and index names.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Storage backend contract.
///
/// The batcher consumer is the only caller, so implementations are
/// single-writer by construction and take `&mut self`.
#[async_trait]
pub trait StorageBackend: Send {
    /// Startup reachability check. A failure here is fatal to the
    /// daemon; later failures are retried per batch.
    async fn connect(&mut self) -> Result<()>;

    /// Create the partition's schema/index on first use. Idempotent.
    async fn ensure_partition(&mut self, key: PartitionKey) -> Result<()>;

    /// Write one batch into one partition. Atomic from the caller's
    /// perspective; returns the number of records accepted.
    async fn write_batch(&mut self, key: PartitionKey, records: &[LogRecord]) -> Result<usize>;

    /// Flush in-flight state and release resources. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Split a batch by partition key, preserving submission order within
/// each partition. Batches almost always carry a single key; a batch
/// straddling a month boundary yields one group per month.
#[must_use]
pub fn split_by_partition(records: Vec<LogRecord>) -> Vec<(PartitionKey, Vec<LogRecord>)> {
    let mut groups: Vec<(PartitionKey, Vec<LogRecord>)> = Vec::with_capacity(1);
    for record in records {
        let key = PartitionKey::of(&record.received_at);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(record),
            None => groups.push((key, vec![record])),
        }
    }
    groups
}

/// In-process backend for tests: captures every accepted batch.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    /// Accepted batches in arrival order.
    pub batches: Vec<(PartitionKey, Vec<LogRecord>)>,
    /// Partitions that have been ensured.
    pub partitions: Vec<PartitionKey>,
    /// Number of `write_batch` calls to fail before accepting.
    pub fail_next: usize,
    pub closed: bool,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total records across all accepted batches.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.batches.iter().map(|(_, b)| b.len()).sum()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn ensure_partition(&mut self, key: PartitionKey) -> Result<()> {
        if !self.partitions.contains(&key) {
            self.partitions.push(key);
        }
        Ok(())
    }

    async fn write_batch(&mut self, key: PartitionKey, records: &[LogRecord]) -> Result<usize> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            anyhow::bail!("injected write failure");
        }
        self.batches.push((key, records.to_vec()));
        Ok(records.len())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Test fixture: a well-formed record pinned to an instant.
#[cfg(test)]
pub(crate) fn record_at(instant: DateTime<Utc>, message: &str) -> LogRecord {
    LogRecord {
        facility: 4,
        severity: 2,
        priority: 34,
        hostname: "testhost".to_string(),
        tag: "test-app".to_string(),
        process_id: Some("123".to_string()),
        message: message.to_string(),
        device_reported_time: instant,
        received_at: instant,
        raw: message.as_bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_partition_key_label() {
        let instant = Utc.with_ymd_and_hms(2025, 7, 15, 10, 0, 0).unwrap();
        let key = PartitionKey::of(&instant);
        assert_eq!(key, PartitionKey { year: 2025, month: 7 });
        assert_eq!(key.label(), "202507");
    }

    #[test]
    fn test_split_single_month() {
        let instant = Utc.with_ymd_and_hms(2025, 7, 15, 10, 0, 0).unwrap();
        let groups = split_by_partition(vec![
            record_at(instant, "a"),
            record_at(instant, "b"),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), 2);
    }

    #[test]
    fn test_split_across_month_boundary() {
        let end_of_may = Utc.with_ymd_and_hms(2025, 5, 31, 23, 59, 58).unwrap();
        let records = vec![
            record_at(end_of_may, "log_may_1"),
            record_at(end_of_may + chrono::Duration::seconds(1), "log_may_2"),
            record_at(end_of_may + chrono::Duration::seconds(2), "log_june_1"),
            record_at(end_of_may + chrono::Duration::seconds(3), "log_june_2"),
            record_at(end_of_may + chrono::Duration::seconds(4), "log_june_3"),
        ];
        let groups = split_by_partition(records);
        assert_eq!(groups.len(), 2);

        let (may_key, may) = &groups[0];
        assert_eq!(may_key.label(), "202505");
        let may_messages: Vec<_> = may.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(may_messages, ["log_may_1", "log_may_2"]);

        let (june_key, june) = &groups[1];
        assert_eq!(june_key.label(), "202506");
        let june_messages: Vec<_> = june.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(june_messages, ["log_june_1", "log_june_2", "log_june_3"]);
    }

    #[tokio::test]
    async fn test_memory_backend_fault_injection() {
        let instant = Utc.with_ymd_and_hms(2025, 7, 15, 10, 0, 0).unwrap();
        let key = PartitionKey::of(&instant);
        let mut backend = MemoryBackend::new();
        backend.fail_next = 1;

        let batch = vec![record_at(instant, "x")];
        assert!(backend.write_batch(key, &batch).await.is_err());
        assert_eq!(backend.write_batch(key, &batch).await.unwrap(), 1);
        assert_eq!(backend.record_count(), 1);
    }
}
