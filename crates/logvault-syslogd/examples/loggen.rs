// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Syslog load generator.
//!
//! Sends pseudo-random RFC 3164 datagrams over UDP, for load-testing
//! the daemon (or any other syslog receiver).
//!
//! ```bash
//! cargo run --example loggen -- --num-messages 10000 --port 5140
//! ```

use chrono::Local;
use clap::Parser;
use rand::seq::SliceRandom;
use rand::Rng;
use std::net::UdpSocket;
use std::time::Instant;

const FACILITIES: [u8; 18] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 16, 17, 18, 19, 20, 21, 23];

const APP_NAMES: [&str; 8] = [
    "sshd",
    "kernel",
    "CRON",
    "systemd",
    "web-server",
    "db-backup",
    "firewall",
    "app-login",
];

const USERS: [&str; 6] = ["root", "admin", "testuser", "deploy", "guest", "service-acc"];

/// Syslog message generator for testing purposes
#[derive(Parser, Debug)]
#[command(name = "loggen")]
struct Args {
    /// Number of log messages to generate
    #[arg(short, long, default_value_t = 100)]
    num_messages: usize,

    /// Target host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Target UDP port
    #[arg(long, default_value_t = 5140)]
    port: u16,
}

fn generate_message(rng: &mut impl Rng) -> String {
    let facility = *FACILITIES.choose(rng).unwrap();
    let severity: u8 = rng.gen_range(0..=7);
    let priority = facility * 8 + severity;

    let timestamp = Local::now().format("%b %e %H:%M:%S");
    let app = APP_NAMES.choose(rng).unwrap();
    let pid: u16 = rng.gen_range(1000..10000);
    let user = USERS.choose(rng).unwrap();

    let body = match rng.gen_range(0..4) {
        0 => format!(
            "User '{user}' logged in from {}.{}.{}.{}",
            rng.gen_range(1..255),
            rng.gen_range(1..255),
            rng.gen_range(1..255),
            rng.gen_range(1..255)
        ),
        1 => format!(
            "Failed password for {user} from 10.0.{}.{} port {} ssh2",
            rng.gen_range(0..255),
            rng.gen_range(1..255),
            rng.gen_range(1024..65535)
        ),
        2 => format!("session opened for user {user} by (uid=0)"),
        _ => format!("session closed for user {user}"),
    };

    format!("<{priority}>{timestamp} loggen {app}[{pid}]: {body}")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let target = format!("{}:{}", args.host, args.port);

    println!(
        "Sending {} log messages to {target} via UDP...",
        args.num_messages
    );

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    let mut rng = rand::thread_rng();

    let start = Instant::now();
    for i in 0..args.num_messages {
        let message = generate_message(&mut rng);
        socket.send_to(message.as_bytes(), &target)?;
        if (i + 1) % 1000 == 0 {
            println!("Sent {}/{} messages...", i + 1, args.num_messages);
        }
    }
    let elapsed = start.elapsed();

    let rate = args.num_messages as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!("--- Summary ---");
    println!("Total messages sent: {}", args.num_messages);
    println!("Time taken: {:.2} seconds", elapsed.as_secs_f64());
    println!("Average rate: {rate:.2} messages/sec");

    Ok(())
}
