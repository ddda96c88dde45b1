// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Supervisor: wires receiver, batcher and backend together and owns
//! the daemon lifecycle.
//!
//! # Shutdown order
//!
//! 1. Stop the receiver (no new datagrams are accepted).
//! 2. Close the batcher queue; the consumer drains it, performs a
//!    final flush and closes the backend.
//! 3. Bound the drain with `shutdown_timeout`; on expiry the consumer
//!    is aborted and whatever it still buffered is logged and lost.
//!
//! Startup failures (invalid config, bind failure, unreachable
//! backend) propagate out of [`SyslogServer::start`] and terminate the
//! process with a non-zero exit code; nothing after startup does.

use crate::batcher::{BatchSender, Batcher};
use crate::config::{Config, Driver};
use crate::meilisearch::MeilisearchBackend;
use crate::receiver::UdpReceiver;
use crate::sqlite::SqliteBackend;
use crate::stats::IngestStats;
use crate::store::StorageBackend;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Running syslog ingestion daemon.
pub struct SyslogServer {
    config: Config,
    stats: Arc<IngestStats>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    sender: BatchSender,
    receiver_task: JoinHandle<()>,
    batcher_task: JoinHandle<Result<()>>,
}

impl SyslogServer {
    /// Validate the configuration, connect the backend, bind the
    /// socket and spawn the pipeline tasks.
    pub async fn start(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let mut backend = build_backend(&config)?;
        backend
            .connect()
            .await
            .context("storage backend is unreachable")?;

        let stats = Arc::new(IngestStats::default());
        let (batcher, sender) = Batcher::new(&config, backend, Arc::clone(&stats));
        let batcher_task = tokio::spawn(batcher.run());

        let receiver = UdpReceiver::bind(&config, sender.clone(), Arc::clone(&stats))?;
        let local_addr = receiver.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let receiver_task = tokio::spawn(receiver.run(shutdown_rx));

        tracing::info!("ingest pipeline running on {local_addr} (driver: {})", config.driver);

        Ok(Self {
            config,
            stats,
            local_addr,
            shutdown_tx,
            sender,
            receiver_task,
            batcher_task,
        })
    }

    /// Address the UDP socket bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared counter handle.
    #[must_use]
    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Flush whatever the batcher has buffered right now.
    pub async fn flush_now(&self) {
        self.sender.flush_now().await;
    }

    /// Block until SIGINT or SIGTERM, then shut down.
    pub async fn run_until_signal(self) -> Result<()> {
        wait_for_shutdown_signal().await?;
        tracing::info!("shutdown signal received");
        self.shutdown().await
    }

    /// Stop the receiver, drain the queue and close the backend.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.receiver_task.await {
            tracing::warn!("receiver task ended abnormally: {err}");
        }

        // Closing the queue is the drain sentinel for the consumer.
        drop(self.sender);

        let mut batcher_task = self.batcher_task;
        match tokio::time::timeout(self.config.shutdown_timeout(), &mut batcher_task).await {
            Ok(joined) => joined.context("batcher task panicked")??,
            Err(_) => {
                batcher_task.abort();
                tracing::error!(
                    "drain exceeded {}s; remaining buffered records discarded",
                    self.config.shutdown_timeout_secs
                );
            }
        }

        let snap = self.stats.snapshot();
        tracing::info!(
            "shutdown complete: received={} parsed={} parse_errors={} queue_dropped={} \
             batches={} batch_errors={} written={}",
            snap.received,
            snap.parsed,
            snap.parse_errors,
            snap.queue_dropped,
            snap.batches_flushed,
            snap.batch_errors,
            snap.records_written
        );
        Ok(())
    }
}

/// Instantiate the configured storage backend.
fn build_backend(config: &Config) -> Result<Box<dyn StorageBackend>> {
    match config.driver {
        Driver::Sqlite => Ok(Box::new(SqliteBackend::new(&config.sqlite.database)?)),
        Driver::Meilisearch => Ok(Box::new(MeilisearchBackend::new(&config.search)?)),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to wait for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for interrupt")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config {
            bind_ip: "127.0.0.1".parse().unwrap(),
            bind_port: 0,
            queue_capacity: 4096,
            sqlite: crate::config::SqliteConfig {
                database: dir.path().join("test_syslog.sqlite3"),
            },
            ..Default::default()
        }
    }

    /// Current-month partition file path for the test prefix.
    fn partition_path(dir: &TempDir) -> std::path::PathBuf {
        let label = crate::store::PartitionKey::of(&chrono::Utc::now()).label();
        dir.path().join(format!("test_syslog_{label}.sqlite3"))
    }

    async fn wait_until(stats: &IngestStats, target: u64) {
        for _ in 0..500 {
            if stats.snapshot().received >= target {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {target} datagrams (got {})",
            stats.snapshot().received
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_happy_path_sqlite() {
        let dir = TempDir::new().unwrap();
        let server = SyslogServer::start(test_config(&dir)).await.unwrap();
        let target = server.local_addr();
        let stats = server.stats();

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        for i in 0..1000 {
            let datagram = format!("<34>Oct 11 22:14:15 myhost myapp: msg-{i}");
            client.send_to(datagram.as_bytes(), target).unwrap();
        }

        wait_until(&stats, 1000).await;
        server.shutdown().await.unwrap();

        let path = partition_path(&dir);
        assert!(path.exists(), "partition file missing");

        let conn = Connection::open(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM SystemEvents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1000);

        // Ids follow submission order.
        let first: (i64, String) = conn
            .query_row(
                "SELECT ID, Message FROM SystemEvents ORDER BY ID LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(first, (1, "msg-0".to_string()));
        let last: (i64, String) = conn
            .query_row(
                "SELECT ID, Message FROM SystemEvents ORDER BY ID DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(last, (1000, "msg-999".to_string()));

        // Full-text lookup finds exactly the one matching body.
        let hits: Vec<String> = conn
            .prepare("SELECT Message FROM SystemEvents_FTS WHERE Message MATCH '\"msg-500\"'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(hits, ["msg-500"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_newer_format_is_stored_bridged() {
        let dir = TempDir::new().unwrap();
        let server = SyslogServer::start(test_config(&dir)).await.unwrap();
        let target = server.local_addr();
        let stats = server.stats();

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .send_to(
                b"<34>1 2024-03-15T12:00:00Z host1 app 1234 ID1 [meta x=\"y\"] hello world",
                target,
            )
            .unwrap();

        wait_until(&stats, 1).await;
        server.shutdown().await.unwrap();

        let conn = Connection::open(partition_path(&dir)).unwrap();
        let (facility, priority, host, tag, pid, message): (u8, u8, String, String, String, String) =
            conn.query_row(
                "SELECT Facility, Priority, FromHost, SysLogTag, ProcessID, Message \
                 FROM SystemEvents",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .unwrap();

        assert_eq!(facility, 4);
        assert_eq!(priority, 34);
        assert_eq!(host, "host1");
        assert_eq!(tag, "app");
        assert_eq!(pid, "1234");
        assert!(message.starts_with("hello world"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_clean_shutdown_persists_everything() {
        let dir = TempDir::new().unwrap();
        let server = SyslogServer::start(test_config(&dir)).await.unwrap();
        let target = server.local_addr();
        let stats = server.stats();

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        for i in 0..250 {
            let datagram = format!("<13>Oct 11 22:14:15 host app[7]: entry {i}");
            client.send_to(datagram.as_bytes(), target).unwrap();
        }

        wait_until(&stats, 250).await;
        // 250 records with batch_size 100: two full batches flushed,
        // the trailing 50 only by the shutdown drain.
        server.shutdown().await.unwrap();

        assert_eq!(stats.snapshot().records_written, 250);
        let conn = Connection::open(partition_path(&dir)).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM SystemEvents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 250);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = Config {
            batch_size: 0,
            ..Default::default()
        };
        assert!(SyslogServer::start(config).await.is_err());
    }

    #[tokio::test]
    async fn test_start_fails_on_unreachable_search_backend() {
        let config = Config {
            driver: Driver::Meilisearch,
            search: crate::config::SearchConfig {
                // Reserved port on loopback: connection refused fast.
                url: "http://127.0.0.1:1".to_string(),
                api_key: None,
                index_prefix: "SystemEvents".to_string(),
            },
            ..Default::default()
        };
        assert!(SyslogServer::start(config).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_now_makes_partial_batch_visible() {
        let dir = TempDir::new().unwrap();
        let server = SyslogServer::start(test_config(&dir)).await.unwrap();
        let target = server.local_addr();
        let stats = server.stats();

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .send_to(b"<34>Oct 11 22:14:15 host app: early", target)
            .unwrap();
        wait_until(&stats, 1).await;

        server.flush_now().await;
        for _ in 0..500 {
            if stats.snapshot().records_written >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.snapshot().records_written, 1);

        server.shutdown().await.unwrap();
    }
}
