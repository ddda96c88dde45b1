// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram parser.
//!
//! Turns a raw syslog datagram plus its sender address and receive
//! instant into a [`LogRecord`]. Newer-format messages are first
//! rewritten into the older shape (see [`crate::rfc5424`]), so this
//! module only understands the `<PRI>Mmm dd HH:MM:SS HOST TAG: MSG`
//! layout.
//!
//! # Field resolution
//!
//! - Missing or unparseable timestamp: the receive instant is used.
//! - Missing hostname: the sender IP address is used.
//! - Missing tag (no colon in the body): empty tag, whole body is the
//!   message.
//! - A `TAG[PID]` prefix is split into tag and process id.

use crate::priority::{self, MAX_PRI};
use crate::rfc5424;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use std::borrow::Cow;
use std::net::IpAddr;
use thiserror::Error;

/// Parse failure for a single datagram.
///
/// These never escape the receive loop; they are counted and the
/// datagram is dropped.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty datagram")]
    Empty,

    #[error("datagram is not valid UTF-8")]
    Encoding,

    #[error("missing <PRI> header")]
    MissingPri,

    #[error("PRI value out of range: {0}")]
    PriOutOfRange(u16),
}

/// One parsed syslog message, the unit flowing from the receiver to the
/// storage backends.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Facility code, 0..=23.
    pub facility: u8,
    /// Severity code, 0..=7.
    pub severity: u8,
    /// Raw PRI value: `facility * 8 + severity`.
    pub priority: u8,
    /// Reporting host; sender address when the message carries none.
    pub hostname: String,
    /// Process/tag prefix before the body colon; may be empty.
    pub tag: String,
    /// Process id split out of a `tag[pid]` prefix.
    pub process_id: Option<String>,
    /// Message body after the tag, left-trimmed.
    pub message: String,
    /// Timestamp reported by the device; `received_at` when absent.
    pub device_reported_time: DateTime<Utc>,
    /// Server receive instant; selects the storage partition.
    pub received_at: DateTime<Utc>,
    /// Unmodified datagram payload.
    pub raw: Vec<u8>,
}

/// Parse one datagram.
pub fn parse_datagram(
    payload: &[u8],
    sender: IpAddr,
    received_at: DateTime<Utc>,
) -> Result<LogRecord, ParseError> {
    if payload.is_empty() {
        return Err(ParseError::Empty);
    }
    let text = std::str::from_utf8(payload).map_err(|_| ParseError::Encoding)?;

    // Funnel both wire formats through the older shape.
    let text: Cow<'_, str> = match rfc5424::bridge_to_rfc3164(text, received_at) {
        Some(bridged) => Cow::Owned(bridged),
        None => Cow::Borrowed(text),
    };

    let (pri, rest) = parse_pri(&text)?;
    let (facility, severity) = priority::decode(pri);

    let (device_reported_time, rest, saw_timestamp) =
        match parse_rfc3164_timestamp(rest, received_at) {
            // A shaped but invalid date (e.g. Feb 30) still consumes
            // its tokens; only the instant falls back.
            Some((instant, tail)) => (instant.unwrap_or(received_at), tail, true),
            None => (received_at, rest, false),
        };

    let rest = rest.trim_start_matches(' ');
    // Without a timestamp there is no hostname position to read; the
    // sender address stands in and the whole remainder is tag/message.
    let (hostname, rest) = if saw_timestamp {
        parse_hostname(rest, sender)
    } else {
        (sender.to_string(), rest)
    };
    let (tag, process_id, message) = parse_tag_and_message(rest);

    Ok(LogRecord {
        facility,
        severity,
        priority: pri,
        hostname,
        tag,
        process_id,
        message,
        device_reported_time,
        received_at,
        raw: payload.to_vec(),
    })
}

/// Extract the `<PRI>` header: 1..=3 digits, value <= 191.
fn parse_pri(text: &str) -> Result<(u8, &str), ParseError> {
    let rest = text.strip_prefix('<').ok_or(ParseError::MissingPri)?;
    let close = rest.find('>').ok_or(ParseError::MissingPri)?;
    if close == 0 || close > 3 {
        return Err(ParseError::MissingPri);
    }
    let digits = &rest[..close];
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::MissingPri);
    }
    let value: u16 = digits.parse().map_err(|_| ParseError::MissingPri)?;
    if value > MAX_PRI {
        return Err(ParseError::PriOutOfRange(value));
    }
    Ok((value as u8, &rest[close + 1..]))
}

/// Parse the older-format `Mmm dd HH:MM:SS` timestamp at the head of
/// `rest`.
///
/// Returns `None` when the head is not timestamp-shaped (nothing is
/// consumed). A shaped header always consumes its three tokens; the
/// inner option is `None` when the date they spell does not exist.
///
/// The wire format carries no year. The parsed month is matched against
/// the receive month: a month more than six ahead is assumed to belong
/// to the previous year (e.g. a "Dec 10" datagram received in January).
fn parse_rfc3164_timestamp(
    rest: &str,
    received_at: DateTime<Utc>,
) -> Option<(Option<DateTime<Utc>>, &str)> {
    let mut cursor = rest;
    let month_tok = next_token(&mut cursor)?;
    let day_tok = next_token(&mut cursor)?;
    let time_tok = next_token(&mut cursor)?;

    let month = match_month(month_tok)?;
    let day: u32 = day_tok.parse().ok()?;

    let mut time_parts = time_tok.split(':');
    let hour: u32 = time_parts.next()?.parse().ok()?;
    let minute: u32 = time_parts.next()?.parse().ok()?;
    let second: u32 = time_parts.next()?.parse().ok()?;
    if time_parts.next().is_some() {
        return None;
    }

    let mut year = received_at.year();
    let now_month = received_at.month();
    if month > now_month && month - now_month > 6 {
        year -= 1;
    }

    let instant = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .map(|naive| Utc.from_utc_datetime(&naive));
    Some((instant, cursor))
}

fn match_month(token: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    MONTHS
        .iter()
        .position(|m| token.eq_ignore_ascii_case(m))
        .map(|idx| idx as u32 + 1)
}

/// Pop the next space-delimited token, advancing `rest` past it.
fn next_token<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start_matches(' ');
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed.find(' ').unwrap_or(trimmed.len());
    let (token, tail) = trimmed.split_at(end);
    *rest = tail;
    Some(token)
}

/// Take the hostname token, or fall back to the sender address when the
/// next token is already the tag (it carries `:` or `[`).
fn parse_hostname(rest: &str, sender: IpAddr) -> (String, &str) {
    let mut cursor = rest;
    match next_token(&mut cursor) {
        Some(token) if !token.contains(':') && !token.contains('[') => {
            (token.to_string(), cursor)
        }
        _ => (sender.to_string(), rest),
    }
}

/// Split `TAG[PID]: MSG` into its parts. Without a colon the tag is
/// empty and the whole remainder is the message.
fn parse_tag_and_message(rest: &str) -> (String, Option<String>, String) {
    let rest = rest.trim_start_matches(' ');

    // First colon that follows a non-space character.
    let colon = rest.char_indices().find_map(|(idx, ch)| {
        if ch != ':' {
            return None;
        }
        match rest[..idx].chars().next_back() {
            Some(prev) if prev != ' ' => Some(idx),
            _ => None,
        }
    });

    let Some(colon) = colon else {
        return (String::new(), None, rest.to_string());
    };

    let raw_tag = rest[..colon].trim();
    let message = rest[colon + 1..].trim_start_matches(' ').to_string();

    match raw_tag.find('[') {
        Some(open) if raw_tag.ends_with(']') => {
            let tag = raw_tag[..open].to_string();
            let pid = raw_tag[open + 1..raw_tag.len() - 1].to_string();
            (tag, Some(pid), message)
        }
        _ => (raw_tag.to_string(), None, message),
    }
}
