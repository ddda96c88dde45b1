// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Meilisearch storage backend.
//!
//! One index per monthly partition, named `<prefix>_YYYYMM`. On first
//! use of a partition the index is created with primary key `id` and
//! its search settings are applied; both are cached so the round trips
//! happen once per partition per process.
//!
//! Document ids are `<partition>-<sequence>` with a zero-padded,
//! per-partition monotonic sequence, so ids stay collision-free across
//! daemon restarts (the sequence restarts from the stored maximum) and
//! lexicographic order equals insertion order. Document uploads are
//! task-queued by the engine; the queued acknowledgement counts as
//! accepted and durability is the engine's asynchronous job.

use crate::config::SearchConfig;
use crate::parser::LogRecord;
use crate::store::{PartitionKey, StorageBackend};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Zero-pad width of the sequence part of a document id.
const SEQUENCE_DIGITS: usize = 10;

/// Poll cadence and cap while waiting for an index-creation task.
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(50);
const TASK_POLL_ATTEMPTS: usize = 200;

/// Monthly-partitioned Meilisearch backend.
pub struct MeilisearchBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    index_prefix: String,
    /// Partitions whose index and settings are known to exist.
    ready: HashSet<PartitionKey>,
    /// Next sequence number per partition.
    sequences: HashMap<PartitionKey, u64>,
}

impl MeilisearchBackend {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            index_prefix: config.index_prefix.clone(),
            ready: HashSet::new(),
            sequences: HashMap::new(),
        })
    }

    fn index_name(&self, key: PartitionKey) -> String {
        format!("{}_{}", self.index_prefix, key.label())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    /// Poll a task until it leaves the queue. Index creation must finish
    /// before settings or documents can target the index.
    async fn wait_for_task(&self, task_uid: u64) -> Result<()> {
        for _ in 0..TASK_POLL_ATTEMPTS {
            let status: Value = self
                .request(reqwest::Method::GET, &format!("/tasks/{task_uid}"))
                .send()
                .await
                .context("task status request failed")?
                .error_for_status()?
                .json()
                .await
                .context("task status response was not JSON")?;

            match status["status"].as_str() {
                Some("succeeded") => return Ok(()),
                Some("failed") | Some("canceled") => {
                    bail!("search engine task {task_uid} failed: {}", status["error"])
                }
                _ => tokio::time::sleep(TASK_POLL_INTERVAL).await,
            }
        }
        bail!("search engine task {task_uid} did not complete in time")
    }

    async fn create_index(&self, uid: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/indexes")
            .json(&json!({ "uid": uid, "primaryKey": "id" }))
            .send()
            .await
            .with_context(|| format!("failed to create index {uid}"))?
            .error_for_status()?;

        let task: Value = response.json().await?;
        if let Some(task_uid) = task["taskUid"].as_u64() {
            self.wait_for_task(task_uid).await?;
        }
        Ok(())
    }

    async fn apply_settings(&self, uid: &str) -> Result<()> {
        self.request(reqwest::Method::PATCH, &format!("/indexes/{uid}/settings"))
            .json(&json!({
                "searchableAttributes": ["Message", "SysLogTag", "FromHost"],
                "filterableAttributes": ["Facility", "Severity", "FromHost", "DeviceReportedTime"],
                "sortableAttributes": ["DeviceReportedTime", "ReceivedAt", "id"],
            }))
            .send()
            .await
            .with_context(|| format!("failed to apply settings to index {uid}"))?
            .error_for_status()?;
        Ok(())
    }

    /// Recover the next sequence number from the highest stored id.
    /// Ids are zero-padded, so the lexicographically largest is the
    /// numerically largest.
    async fn current_sequence(&self, uid: &str) -> Result<u64> {
        let response: Value = self
            .request(reqwest::Method::POST, &format!("/indexes/{uid}/search"))
            .json(&json!({ "q": "", "sort": ["id:desc"], "limit": 1 }))
            .send()
            .await
            .with_context(|| format!("failed to query max id of index {uid}"))?
            .error_for_status()?
            .json()
            .await?;

        let max = response["hits"]
            .as_array()
            .and_then(|hits| hits.first())
            .and_then(|hit| hit["id"].as_str())
            .and_then(sequence_from_doc_id)
            .unwrap_or(0);
        Ok(max)
    }
}

#[async_trait]
impl StorageBackend for MeilisearchBackend {
    async fn connect(&mut self) -> Result<()> {
        let health: Value = self
            .request(reqwest::Method::GET, "/health")
            .send()
            .await
            .with_context(|| format!("search engine at {} is unreachable", self.base_url))?
            .error_for_status()?
            .json()
            .await
            .context("health response was not JSON")?;

        match health["status"].as_str() {
            Some("available") => {
                tracing::info!("connected to search engine at {}", self.base_url);
                Ok(())
            }
            other => bail!("search engine is not available: {other:?}"),
        }
    }

    async fn ensure_partition(&mut self, key: PartitionKey) -> Result<()> {
        if self.ready.contains(&key) {
            return Ok(());
        }
        let uid = self.index_name(key);

        let probe = self
            .request(reqwest::Method::GET, &format!("/indexes/{uid}"))
            .send()
            .await
            .with_context(|| format!("failed to probe index {uid}"))?;

        if probe.status() == reqwest::StatusCode::NOT_FOUND {
            self.create_index(&uid).await?;
            tracing::info!("created search index {uid}");
        } else {
            probe.error_for_status()?;
        }

        self.apply_settings(&uid).await?;

        let sequence = self.current_sequence(&uid).await?;
        self.sequences.insert(key, sequence);
        self.ready.insert(key);
        Ok(())
    }

    async fn write_batch(&mut self, key: PartitionKey, records: &[LogRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        self.ensure_partition(key).await?;
        let uid = self.index_name(key);

        let base = self.sequences.get(&key).copied().unwrap_or(0);
        let documents: Vec<Value> = records
            .iter()
            .enumerate()
            .map(|(offset, record)| document(record, &doc_id(&key.label(), base + 1 + offset as u64)))
            .collect();

        self.request(reqwest::Method::POST, &format!("/indexes/{uid}/documents"))
            .json(&documents)
            .send()
            .await
            .with_context(|| format!("failed to upload documents to index {uid}"))?
            .error_for_status()
            .with_context(|| format!("search engine rejected batch for index {uid}"))?;

        // Only a queued batch advances the sequence; a retried batch
        // reuses its ids and upserts.
        self.sequences.insert(key, base + records.len() as u64);
        Ok(records.len())
    }

    async fn close(&mut self) -> Result<()> {
        self.ready.clear();
        Ok(())
    }
}

/// Document id: `<partition>-<zero-padded sequence>`.
fn doc_id(label: &str, sequence: u64) -> String {
    format!("{label}-{sequence:0width$}", width = SEQUENCE_DIGITS)
}

/// Inverse of [`doc_id`].
fn sequence_from_doc_id(id: &str) -> Option<u64> {
    id.rsplit_once('-')?.1.parse().ok()
}

fn document(record: &LogRecord, id: &str) -> Value {
    json!({
        "id": id,
        "Facility": record.facility,
        "Severity": record.severity,
        "Priority": record.priority,
        "FromHost": record.hostname,
        "InfoUnitID": 1,
        "SysLogTag": record.tag,
        "ProcessID": record.process_id.as_deref().unwrap_or("0"),
        "Message": record.message,
        "DeviceReportedTime": record.device_reported_time.to_rfc3339(),
        "ReceivedAt": record.received_at.to_rfc3339(),
    })
}
