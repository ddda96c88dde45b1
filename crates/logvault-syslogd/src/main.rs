// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! LogVault syslog daemon CLI.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port with SQLite storage
//! logvault-syslogd --db /var/log/logvault/syslog.sqlite3
//!
//! # Ship into a Meilisearch instance instead
//! logvault-syslogd --driver meilisearch --search-url http://127.0.0.1:7700
//!
//! # Load a JSON config file, overriding the port
//! logvault-syslogd --config logvault.json --port 1514
//! ```

use anyhow::Result;
use clap::Parser;
use logvault_syslogd::{Config, Driver, SyslogServer};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// LogVault - high-throughput UDP syslog ingestion daemon
#[derive(Parser, Debug)]
#[command(name = "logvault-syslogd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// UDP bind port
    #[arg(short, long)]
    port: Option<u16>,

    /// Storage driver: sqlite or meilisearch
    #[arg(long)]
    driver: Option<Driver>,

    /// SQLite database path template (per-month files derive from it)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Search engine endpoint, e.g. http://127.0.0.1:7700
    #[arg(long)]
    search_url: Option<String>,

    /// Search engine API key
    #[arg(long)]
    search_api_key: Option<String>,

    /// Flush after this many buffered records
    #[arg(long)]
    batch_size: Option<usize>,

    /// Flush this many seconds after the first buffered record
    #[arg(long)]
    batch_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Verbose per-datagram diagnostics
    #[arg(long)]
    debug: bool,
}

impl Args {
    /// Resolve the effective configuration: defaults, then the config
    /// file, then explicit flags.
    fn resolve(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                info!("loading config from {}", path.display());
                Config::from_file(path)?
            }
            None => Config::default(),
        };

        if let Some(bind) = self.bind {
            config.bind_ip = bind;
        }
        if let Some(port) = self.port {
            config.bind_port = port;
        }
        if let Some(driver) = self.driver {
            config.driver = driver;
        }
        if let Some(db) = self.db {
            config.sqlite.database = db;
        }
        if let Some(url) = self.search_url {
            config.search.url = url;
        }
        if let Some(key) = self.search_api_key {
            config.search.api_key = Some(key);
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(batch_timeout) = self.batch_timeout {
            config.batch_timeout_secs = batch_timeout;
        }
        if self.debug {
            config.debug = true;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.resolve()?;

    info!("+----------------------------------------------------+");
    info!(
        "|       LogVault Syslog Daemon v{}               |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:    {:40} |", format!("{}:{}", config.bind_ip, config.bind_port));
    info!("|  Driver:  {:40} |", config.driver.to_string());
    info!(
        "|  Batch:   {:40} |",
        format!("{} records / {}s", config.batch_size, config.batch_timeout_secs)
    );
    if config.debug {
        info!("|  Debug:   {:40} |", "enabled");
    }
    info!("+----------------------------------------------------+");

    let server = SyslogServer::start(config).await?;
    server.run_until_signal().await?;

    info!("syslog daemon stopped");
    Ok(())
}
