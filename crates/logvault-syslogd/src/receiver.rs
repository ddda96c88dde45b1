// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP receive loop.
//!
//! One task reads datagrams off the socket, parses them and hands the
//! records to the batcher without ever awaiting it. The socket's
//! receive buffer is the main defence against burst loss: it is
//! requested large up front (the kernel clamps to its limit) so the
//! loop can fall behind briefly without the kernel dropping packets.

use crate::batcher::BatchSender;
use crate::config::Config;
use crate::parser::parse_datagram;
use crate::stats::IngestStats;
use anyhow::{Context, Result};
use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Largest possible UDP payload; one reusable buffer covers any datagram.
const MAX_DATAGRAM: usize = 65_535;

/// Single-socket datagram receiver.
pub struct UdpReceiver {
    socket: UdpSocket,
    sender: BatchSender,
    stats: Arc<IngestStats>,
    debug: bool,
}

impl UdpReceiver {
    /// Bind the UDP socket with a tuned receive buffer.
    ///
    /// A bind failure is fatal to the daemon; a rejected buffer size is
    /// only logged, since the kernel grants what its limits allow.
    pub fn bind(config: &Config, sender: BatchSender, stats: Arc<IngestStats>) -> Result<Self> {
        let addr = SocketAddr::new(config.bind_ip, config.bind_port);

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .context("failed to create UDP socket")?;
        socket.set_reuse_address(true)?;
        if let Err(err) = socket.set_recv_buffer_size(config.recv_buffer_bytes) {
            tracing::warn!(
                "could not request {} byte receive buffer: {err}",
                config.recv_buffer_bytes
            );
        }
        socket.set_nonblocking(true)?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("failed to bind UDP socket on {addr}"))?;

        let granted = socket.recv_buffer_size().unwrap_or(0);
        let socket = UdpSocket::from_std(socket.into())
            .context("failed to register UDP socket with the runtime")?;

        tracing::info!(
            "listening on UDP {} (receive buffer {granted} bytes)",
            socket.local_addr()?
        );

        Ok(Self {
            socket,
            sender,
            stats,
            debug: config.debug,
        })
    }

    /// Address the socket actually bound to (port 0 resolves here).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Read datagrams until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, peer)) => self.handle_datagram(&buf[..len], peer),
                    Err(err) => tracing::warn!("UDP receive error: {err}"),
                },
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("receiver stopped");
    }

    /// Parse one datagram and enqueue the record. Never fails: parse
    /// errors are counted and the datagram is dropped.
    fn handle_datagram(&self, payload: &[u8], peer: SocketAddr) {
        IngestStats::incr(&self.stats.received);

        match parse_datagram(payload, peer.ip(), Utc::now()) {
            Ok(record) => {
                IngestStats::incr(&self.stats.parsed);
                if self.debug {
                    tracing::trace!(
                        "datagram from {}: pri={} tag={}",
                        peer.ip(),
                        record.priority,
                        record.tag
                    );
                }
                self.sender.submit(record);
            }
            Err(err) => {
                IngestStats::incr(&self.stats.parse_errors);
                if self.debug {
                    tracing::debug!("dropping datagram from {}: {err}", peer.ip());
                }
            }
        }
    }
}
