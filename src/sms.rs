//! SMS records as reported by ModemManager
//!
//! Decodes the raw property bag of an SMS object into an [`IncomingSms`].

use crate::error::DecodeError;
use chrono::{DateTime, FixedOffset, Utc};
use tracing::warn;

/// ModemManager `MMSmsState`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsState {
    Unknown,
    Stored,
    Receiving,
    Received,
    Sending,
    Sent,
}

impl SmsState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => SmsState::Stored,
            2 => SmsState::Receiving,
            3 => SmsState::Received,
            4 => SmsState::Sending,
            5 => SmsState::Sent,
            _ => SmsState::Unknown,
        }
    }
}

/// D-Bus objects an SMS was read from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SmsOrigin {
    pub modem_path: String,
    pub sms_path: String,
}

/// Properties read off an SMS object, before validation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmsPayload {
    pub number: Option<String>,
    pub text: Option<String>,
    pub state: Option<u32>,
    pub timestamp: Option<String>,
    pub origin: Option<SmsOrigin>,
}

/// Identity of one SMS across bus replays and ModemManager restarts.
///
/// Object paths are numbered per ModemManager process and get reused after a restart,
/// so they are not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SmsKey {
    pub sender: String,
    pub timestamp: Option<String>,
    pub text: Option<String>,
}

impl SmsPayload {
    pub fn key(&self) -> SmsKey {
        SmsKey {
            sender: self.number.as_deref().unwrap_or_default().trim().to_string(),
            timestamp: self.timestamp.as_deref().map(|ts| ts.trim().to_string()),
            text: self.text.clone(),
        }
    }
}

/// A received SMS, ready for dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingSms {
    pub sender: String,      // Number as reported by the modem
    pub body: String,        // Concatenated text of all parts
    pub received_at: DateTime<FixedOffset>,
    pub origin: Option<SmsOrigin>,
}

impl IncomingSms {
    /// Short single-line form of the body for log records
    pub fn preview(&self, max_chars: usize) -> String {
        truncate(&self.body.replace(['\r', '\n'], " "), max_chars)
    }
}

/// Validate a payload. Missing sender or text rejects it; a bad timestamp does not.
pub fn decode(payload: SmsPayload) -> Result<IncomingSms, DecodeError> {
    if let Some(raw) = payload.state {
        match SmsState::from_raw(raw) {
            SmsState::Received => {}
            SmsState::Receiving => return Err(DecodeError::Incomplete),
            _ => return Err(DecodeError::NotReceived(raw)),
        }
    }

    let sender = payload
        .number
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or(DecodeError::MissingSender)?;

    let body = payload.text.ok_or(DecodeError::MissingBody)?;

    let received_at = match payload.timestamp.as_deref() {
        Some(raw) if !raw.trim().is_empty() => parse_timestamp(raw).unwrap_or_else(|| {
            warn!(sender = %sender, timestamp = raw, "Invalid SMS timestamp, using current time");
            Utc::now().into()
        }),
        _ => Utc::now().into(),
    };

    Ok(IncomingSms {
        sender,
        body,
        received_at,
        origin: payload.origin,
    })
}

/// Parse a ModemManager timestamp. Accepts RFC 3339 and the hour-only offsets
/// ("2024-01-15T10:00:00+01") ModemManager produces.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts);
    }

    let split = raw.len().checked_sub(3)?;
    if !raw.is_char_boundary(split) {
        return None;
    }
    let (head, offset) = raw.split_at(split);
    let hour_only = (offset.starts_with('+') || offset.starts_with('-'))
        && offset[1..].chars().all(|c| c.is_ascii_digit());
    if hour_only {
        DateTime::parse_from_rfc3339(&format!("{}{}:00", head, offset)).ok()
    } else {
        None
    }
}

/// Cut `text` to at most `max_chars` characters, marking the cut
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push('…');
    cut
}
