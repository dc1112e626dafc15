//! Canonical timeline record and its identity rules.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use shared::protocol::MessagePayload;
use thiserror::Error;
use uuid::Uuid;

const NAIVE_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Client-generated token linking an optimistic record to its confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_wire(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    Optimistic,
    Confirmed,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("message is missing a sender")]
    MissingSender,
    #[error("message is missing a target")]
    MissingTarget,
    #[error("message text is empty")]
    EmptyText,
    #[error("message is missing a timestamp")]
    MissingTimestamp,
    #[error("invalid message timestamp '{0}'")]
    InvalidTimestamp(String),
}

/// Locally authored message before the store assigns it a correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub sender: String,
    pub target: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub sender: String,
    /// Peer username for direct messages, room name for group messages.
    pub target: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub origin: MessageOrigin,
    pub correlation_id: Option<CorrelationId>,
    pub server_id: Option<String>,
    /// Set when the persist call for an optimistic record failed.
    pub persist_failed: bool,
}

impl MessageRecord {
    pub fn from_payload(
        payload: &MessagePayload,
        origin: MessageOrigin,
    ) -> Result<Self, RecordError> {
        let target = payload.target().ok_or(RecordError::MissingTarget)?;
        let raw_timestamp = payload
            .timestamp
            .as_deref()
            .ok_or(RecordError::MissingTimestamp)?;
        let record = Self {
            sender: payload.sender.clone(),
            target: target.to_string(),
            text: payload.text.clone(),
            timestamp: parse_timestamp(raw_timestamp)?,
            origin,
            correlation_id: payload
                .correlation_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .map(CorrelationId::from_wire),
            server_id: payload.message_id.clone(),
            persist_failed: false,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn from_draft(draft: MessageDraft, correlation_id: CorrelationId) -> Self {
        Self {
            sender: draft.sender,
            target: draft.target,
            text: draft.text,
            timestamp: draft.timestamp,
            origin: MessageOrigin::Optimistic,
            correlation_id: Some(correlation_id),
            server_id: None,
            persist_failed: false,
        }
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if self.sender.trim().is_empty() {
            return Err(RecordError::MissingSender);
        }
        if self.target.trim().is_empty() {
            return Err(RecordError::MissingTarget);
        }
        if self.text.trim().is_empty() {
            return Err(RecordError::EmptyText);
        }
        Ok(())
    }

    /// Identity rule shared by every insert path.
    ///
    /// Two records are the same logical message when they share a correlation
    /// id, share a server id, or carry the same sender, target and text with
    /// timestamps no more than `window` apart. Distinct ids of the same kind
    /// rule out a match before content is compared.
    pub fn is_duplicate_of(&self, other: &MessageRecord, window: Duration) -> bool {
        let correlation = match (&self.correlation_id, &other.correlation_id) {
            (Some(ours), Some(theirs)) => Some(ours == theirs),
            _ => None,
        };
        let server = match (&self.server_id, &other.server_id) {
            (Some(ours), Some(theirs)) => Some(ours == theirs),
            _ => None,
        };
        if correlation == Some(true) || server == Some(true) {
            return true;
        }
        if correlation == Some(false) || server == Some(false) {
            return false;
        }
        let gap = if self.timestamp >= other.timestamp {
            self.timestamp - other.timestamp
        } else {
            other.timestamp - self.timestamp
        };
        self.sender == other.sender
            && self.target == other.target
            && self.text == other.text
            && gap <= window
    }

    pub fn is_pending(&self) -> bool {
        self.origin == MessageOrigin::Optimistic && !self.persist_failed
    }
}

/// Parses a wire timestamp into an instant.
///
/// Offset-less timestamps are read as UTC, which is what the backend writes.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RecordError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RecordError::MissingTimestamp);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| RecordError::InvalidTimestamp(trimmed.to_string()))
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
#[path = "tests/message_tests.rs"]
mod tests;
