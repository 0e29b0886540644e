use chrono::{DateTime, Utc};
use thiserror::Error;

/// Everything the spine can reject. Per-event variants are recovered by the
/// caller (log and skip); none of them poison the session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpineError {
    #[error("schema error in event {event_id}: {reason}")]
    Schema { event_id: String, reason: String },

    #[error("schema error: report schema_version {found:?} is not supported (expected {expected})")]
    ReportSchema { found: String, expected: String },

    #[error("malformed input {input} at line {line}: {reason}")]
    MalformedInput {
        input: String,
        line: usize,
        reason: String,
    },

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error(
        "event {event_id} at {occurred_at} precedes the last accepted event ({last_seen}) in session {session_id}"
    )]
    OutOfOrder {
        event_id: String,
        session_id: String,
        occurred_at: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    },

    #[error("duplicate event id {event_id} in session {session_id}")]
    DuplicateEvent { event_id: String, session_id: String },

    #[error("event {event_id} has privacy layer {layer} but responds to a layer {required} event")]
    PrivacyViolation {
        event_id: String,
        layer: u8,
        required: u8,
    },
}

impl SpineError {
    /// Stable short label used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            SpineError::Schema { .. } | SpineError::ReportSchema { .. } => "schema",
            SpineError::MalformedInput { .. } => "malformed_input",
            SpineError::UnknownSession(_) => "unknown_session",
            SpineError::OutOfOrder { .. } => "out_of_order",
            SpineError::DuplicateEvent { .. } => "duplicate_event",
            SpineError::PrivacyViolation { .. } => "privacy_violation",
        }
    }

    pub(crate) fn schema(event_id: &str, reason: impl Into<String>) -> Self {
        SpineError::Schema {
            event_id: event_id.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SpineError>;
