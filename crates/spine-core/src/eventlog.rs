//! Event-log text formats: JSONL (one envelope per line) or a single JSON
//! array of envelopes. Parsing is strict; the first bad record fails the
//! whole input.

use crate::error::{Result, SpineError};
use crate::event::EventEnvelope;

/// Parse `text` read from `input` (a path or label used in errors).
pub fn parse_event_log(input: &str, text: &str) -> Result<Vec<EventEnvelope>> {
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str::<Vec<EventEnvelope>>(text).map_err(|e| {
            SpineError::MalformedInput {
                input: input.to_string(),
                line: e.line(),
                reason: e.to_string(),
            }
        });
    }

    let mut events = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let envelope = serde_json::from_str::<EventEnvelope>(line).map_err(|e| {
            SpineError::MalformedInput {
                input: input.to_string(),
                line: line_no + 1,
                reason: e.to_string(),
            }
        })?;
        events.push(envelope);
    }
    Ok(events)
}
