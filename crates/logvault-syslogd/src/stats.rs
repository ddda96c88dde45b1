// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingest counters.
//!
//! Incremented from the receiver and the batcher consumer without any
//! locking on the hot path; read as a snapshot for the shutdown report
//! and by tests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared ingest counters. All increments are relaxed; each counter has
/// a single writer task.
#[derive(Debug, Default)]
pub struct IngestStats {
    /// Datagrams read off the socket.
    pub received: AtomicU64,
    /// Datagrams parsed into records.
    pub parsed: AtomicU64,
    /// Datagrams dropped by the parser.
    pub parse_errors: AtomicU64,
    /// Records dropped because the batcher queue was full.
    pub queue_dropped: AtomicU64,
    /// Batches handed to a backend successfully.
    pub batches_flushed: AtomicU64,
    /// Batches dropped after retry exhaustion.
    pub batch_errors: AtomicU64,
    /// Records durably accepted by a backend.
    pub records_written: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub parsed: u64,
    pub parse_errors: u64,
    pub queue_dropped: u64,
    pub batches_flushed: u64,
    pub batch_errors: u64,
    pub records_written: u64,
}

impl IngestStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            parsed: self.parsed.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batch_errors: self.batch_errors.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let stats = IngestStats::default();
        IngestStats::incr(&stats.received);
        IngestStats::incr(&stats.received);
        IngestStats::add(&stats.records_written, 42);

        let snap = stats.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.records_written, 42);
        assert_eq!(snap.parse_errors, 0);
    }
}
