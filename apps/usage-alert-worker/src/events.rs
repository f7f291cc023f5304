use crate::error::MalformedRecord;
use chrono::{DateTime, NaiveDateTime, Utc};

/// Offset-less shapes written by the manual log form; read as UTC.
const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    On,
    Off,
}

impl DeviceState {
    /// Accepts `Turned ON` / `Turned OFF` as well as the bare `ON` / `OFF`
    /// written by the device card toggle.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let bare = match trimmed.get(..7) {
            Some(prefix) if prefix.eq_ignore_ascii_case("turned ") => trimmed[7..].trim_start(),
            _ => trimmed,
        };
        if bare.eq_ignore_ascii_case("on") {
            Some(Self::On)
        } else if bare.eq_ignore_ascii_case("off") {
            Some(Self::Off)
        } else {
            None
        }
    }
}

/// Event log row as stored. Every field is optional because the log is
/// written by several screens that disagree on shape.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct EventRecord {
    pub id: String,
    pub device_id: Option<String>,
    pub status_change: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub device_id: String,
    pub state: DeviceState,
    pub timestamp: DateTime<Utc>,
}

impl TryFrom<&EventRecord> for Event {
    type Error = MalformedRecord;

    fn try_from(record: &EventRecord) -> Result<Self, Self::Error> {
        let id = record.id.clone();
        let device_id = record
            .device_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| MalformedRecord::MissingDevice { id: id.clone() })?
            .to_string();
        let raw_state = record.status_change.as_deref().unwrap_or_default();
        let state = DeviceState::parse(raw_state).ok_or_else(|| MalformedRecord::BadState {
            id: id.clone(),
            raw: raw_state.to_string(),
        })?;
        let raw_ts = record
            .timestamp
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| MalformedRecord::MissingTimestamp { id: id.clone() })?;
        let timestamp = parse_timestamp(raw_ts).ok_or_else(|| MalformedRecord::BadTimestamp {
            id: id.clone(),
            raw: raw_ts.to_string(),
        })?;

        Ok(Self {
            id,
            device_id,
            state,
            timestamp,
        })
    }
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|naive| naive.and_utc())
}
