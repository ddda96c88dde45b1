// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Batching writer.
//!
//! Records flow from the receiver into a bounded queue; a single
//! consumer task accumulates them and flushes to the storage backend
//! when either `batch_size` records are buffered or `batch_timeout`
//! has elapsed since the first buffered record. The timer only runs
//! while the buffer is non-empty and resets after every flush.
//!
//! # Backpressure
//!
//! [`BatchSender::submit`] never blocks: a full queue drops the record
//! and increments the dropped-queue counter. Losing records under
//! sustained overload is preferred over stalling the UDP read loop,
//! where the kernel would drop datagrams invisibly instead.
//!
//! # Shutdown
//!
//! Dropping the last [`BatchSender`] closes the queue; the consumer
//! drains it, performs a final flush, closes the backend and exits.
//! The supervisor bounds the whole drain with a wall-clock cap.

use crate::config::Config;
use crate::parser::LogRecord;
use crate::stats::IngestStats;
use crate::store::{split_by_partition, PartitionKey, StorageBackend};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

/// Attempts per batch before it is dropped.
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Backoff before the first retry; doubles per attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

enum Command {
    Record(LogRecord),
    Flush,
}

/// Producer handle into the batcher queue. Cheap to clone.
#[derive(Clone)]
pub struct BatchSender {
    tx: mpsc::Sender<Command>,
    stats: Arc<IngestStats>,
    debug: bool,
}

impl BatchSender {
    /// Enqueue a record without blocking. A full queue drops the record
    /// and counts it; no error reaches the caller.
    pub fn submit(&self, record: LogRecord) {
        match self.tx.try_send(Command::Record(record)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                IngestStats::incr(&self.stats.queue_dropped);
                if self.debug {
                    tracing::warn!("batcher queue full; dropping record");
                }
            }
            Err(TrySendError::Closed(_)) => {
                IngestStats::incr(&self.stats.queue_dropped);
                if self.debug {
                    tracing::warn!("batcher queue closed; dropping record");
                }
            }
        }
    }

    /// Ask the consumer to flush whatever is buffered right now.
    pub async fn flush_now(&self) {
        let _ = self.tx.send(Command::Flush).await;
    }
}

/// Consumer side: owns the buffer and the backend.
pub struct Batcher {
    rx: mpsc::Receiver<Command>,
    backend: Box<dyn StorageBackend>,
    batch_size: usize,
    batch_timeout: Duration,
    stats: Arc<IngestStats>,
}

impl Batcher {
    /// Build the batcher and its producer handle.
    pub fn new(
        config: &Config,
        backend: Box<dyn StorageBackend>,
        stats: Arc<IngestStats>,
    ) -> (Self, BatchSender) {
        let (tx, rx) = mpsc::channel(config.queue_capacity());
        let sender = BatchSender {
            tx,
            stats: Arc::clone(&stats),
            debug: config.debug,
        };
        let batcher = Self {
            rx,
            backend,
            batch_size: config.batch_size,
            batch_timeout: config.batch_timeout(),
            stats,
        };
        (batcher, sender)
    }

    /// Consume the queue until every sender is gone, then drain, flush
    /// and close the backend.
    pub async fn run(mut self) -> Result<()> {
        let mut buffer: Vec<LogRecord> = Vec::with_capacity(self.batch_size);
        let mut deadline: Option<Instant> = None;

        loop {
            // Far-future stand-in keeps the select arm well-formed when
            // no timer is armed; the guard stops it from firing.
            let timer = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Record(record)) => {
                        if buffer.is_empty() {
                            deadline = Some(Instant::now() + self.batch_timeout);
                        }
                        buffer.push(record);
                        if buffer.len() >= self.batch_size {
                            self.flush(&mut buffer).await;
                            deadline = None;
                        }
                    }
                    Some(Command::Flush) => {
                        self.flush(&mut buffer).await;
                        deadline = None;
                    }
                    None => {
                        self.flush(&mut buffer).await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(timer), if deadline.is_some() => {
                    self.flush(&mut buffer).await;
                    deadline = None;
                }
            }
        }

        self.backend.close().await?;
        tracing::info!("batcher drained and backend closed");
        Ok(())
    }

    /// Hand the buffer to the backend, split by partition. The buffer
    /// is taken up front so the queue keeps filling while the backend
    /// works.
    async fn flush(&mut self, buffer: &mut Vec<LogRecord>) {
        if buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(buffer);
        for (key, group) in split_by_partition(batch) {
            self.write_with_retry(key, group).await;
        }
    }

    async fn write_with_retry(&mut self, key: PartitionKey, records: Vec<LogRecord>) {
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let result = match self.backend.ensure_partition(key).await {
                Ok(()) => self.backend.write_batch(key, &records).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(written) => {
                    IngestStats::incr(&self.stats.batches_flushed);
                    IngestStats::add(&self.stats.records_written, written as u64);
                    tracing::debug!("flushed {written} records into partition {key}");
                    return;
                }
                Err(err) if attempt < MAX_WRITE_ATTEMPTS => {
                    tracing::warn!(
                        "write to partition {key} failed (attempt {attempt}/{MAX_WRITE_ATTEMPTS}), \
                         retrying in {backoff:?}: {err:#}"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(err) => {
                    IngestStats::incr(&self.stats.batch_errors);
                    tracing::error!(
                        "dropping batch of {} records for partition {key} after \
                         {MAX_WRITE_ATTEMPTS} attempts: {err:#}",
                        records.len()
                    );
                }
            }
        }
    }
}
