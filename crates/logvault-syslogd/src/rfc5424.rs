// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Newer-format (RFC 5424) detection and bridging.
//!
//! Incoming datagrams may use either syslog wire format. The parser
//! handles only the older RFC 3164 shape; messages in the newer shape
//! are rewritten into an equivalent RFC 3164 header first, so that a
//! single code path feeds the storage schema.
//!
//! The bridge keeps facility, severity, hostname and message bytes
//! intact. The PROCID field is folded into the tag as `TAG[PID]`, the
//! form the older format uses anyway; MSGID and structured-data blocks
//! carry no column in the storage schema and are dropped.

use chrono::{DateTime, Utc};

/// Returns true when the payload starts with `<PRI>1 `, the newer-format
/// version marker.
#[must_use]
pub fn is_rfc5424(payload: &str) -> bool {
    let Some(rest) = payload.strip_prefix('<') else {
        return false;
    };
    let Some(close) = rest.find('>') else {
        return false;
    };
    if close == 0 || close > 3 || !rest[..close].bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    rest[close + 1..].starts_with("1 ")
}

/// Rewrite a newer-format message into the older format:
/// `<PRI>Mmm dd HH:MM:SS HOST TAG[PID]: MSG`.
///
/// Returns `None` when the payload does not carry the version marker or
/// is truncated before the message head; the caller then falls back to
/// parsing the payload as older-format.
///
/// A nil (`-`) or unparseable timestamp is replaced by `received_at`.
/// Nil hostname and app-name become empty, which the older-format parser
/// later resolves to the sender address and an empty tag.
#[must_use]
pub fn bridge_to_rfc3164(payload: &str, received_at: DateTime<Utc>) -> Option<String> {
    if !is_rfc5424(payload) {
        return None;
    }

    let close = payload.find('>')?;
    let pri = &payload[1..close];
    // Skip the "1 " version marker.
    let mut rest = payload[close + 2..].trim_start_matches(' ');

    let timestamp = take_token(&mut rest)?;
    let hostname = take_token(&mut rest)?;
    let app_name = take_token(&mut rest)?;
    let proc_id = take_token(&mut rest)?;
    let _msg_id = take_token(&mut rest)?;

    let msg = skip_structured_data(rest);
    let msg = msg.strip_prefix('\u{feff}').unwrap_or(msg);

    let instant = match timestamp {
        "-" => received_at,
        ts => DateTime::parse_from_rfc3339(ts)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|err| {
                tracing::debug!("unparseable newer-format timestamp {ts:?}: {err}");
                received_at
            }),
    };
    // %e renders the day space-padded, the older format's convention.
    let stamp = instant.format("%b %e %H:%M:%S");

    let hostname = if hostname == "-" { "" } else { hostname };
    let tag = match (app_name, proc_id) {
        ("-", _) => String::new(),
        (app, "-") => app.to_string(),
        (app, pid) => format!("{app}[{pid}]"),
    };

    let bridged = if tag.is_empty() {
        format!("<{pri}>{stamp} {hostname} {msg}")
    } else {
        format!("<{pri}>{stamp} {hostname} {tag}: {msg}")
    };
    Some(bridged)
}

/// Pop the next space-delimited token, advancing `rest` past it.
fn take_token<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start_matches(' ');
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed.find(' ').unwrap_or(trimmed.len());
    let (token, tail) = trimmed.split_at(end);
    *rest = tail;
    Some(token)
}

/// Skip the STRUCTURED-DATA field: either the nilvalue `-` or one or
/// more `[..]` blocks (`\]` inside a block is an escaped bracket).
fn skip_structured_data(rest: &str) -> &str {
    let mut rest = rest.trim_start_matches(' ');
    if let Some(tail) = rest.strip_prefix('-') {
        return tail.strip_prefix(' ').unwrap_or(tail);
    }
    while rest.starts_with('[') {
        let mut escaped = false;
        let mut end = None;
        for (idx, byte) in rest.bytes().enumerate() {
            match byte {
                b'\\' if !escaped => escaped = true,
                b']' if !escaped => {
                    end = Some(idx);
                    break;
                }
                _ => escaped = false,
            }
        }
        match end {
            Some(idx) => rest = &rest[idx + 1..],
            // Unterminated block: treat the remainder as message text.
            None => return rest,
        }
    }
    rest.strip_prefix(' ').unwrap_or(rest)
}
