//! Event envelope: the wire record producers emit, and the validated,
//! typed `AgentEvent` the rest of the spine works with.
//!
//! The wire shape keeps `event_type` as an open string and `payload` as a
//! free-form object. Conversion to `EventKind` happens once, at ingestion;
//! unknown types survive as `EventKind::Unrecognized` so forward-compatible
//! producers are never dropped.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::constants::{
    CURRENT_SCHEMA_VERSION, DEFAULT_CAPABILITY, LONG_HOVER_MS, MAX_PRIVACY_LAYER,
    SUPPORTED_SCHEMA_MAJOR,
};
use crate::error::{Result, SpineError};
use crate::policy::OperatingMode;
use crate::uwsm::Dimension;

/// Producer identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub version: String,
}

/// One record of an event log, exactly as producers write it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_type: String,
    #[serde(default)]
    pub source: EventSource,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub privacy_layer: u8,
    pub occurred_at: DateTime<Utc>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(deserialize_with = "version_string")]
    pub schema_version: String,
}

/// Accept `"1.0"` as well as a bare `1`.
fn version_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "schema_version must be a string or number, got {other}"
        ))),
    }
}

/// Major component of a `MAJOR[.MINOR[.PATCH]]` version, with optional `v` prefix.
pub fn schema_major(version: &str) -> Option<u64> {
    let trimmed = version.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    trimmed.split('.').next()?.parse().ok()
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStarted {
    pub tool_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisCompleted {
    pub tool_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    /// Producer-scored result quality in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirectiveShown {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
}

/// What the user did in response to (or independently of) a directive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Accept,
    Apply,
    Modify,
    Undo,
    Dismiss,
    Hover,
    NoAction,
    #[serde(other)]
    Other,
}

impl ActionKind {
    pub fn is_accept(self) -> bool {
        matches!(self, ActionKind::Accept | ActionKind::Apply)
    }

    pub fn is_rejection(self) -> bool {
        matches!(self, ActionKind::Undo | ActionKind::Dismiss)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserAction {
    pub action: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hover_ms: Option<u64>,
}

impl UserAction {
    /// Undo, dismiss, an explicit no-action, or a long hover.
    pub fn is_hesitation(&self) -> bool {
        match self.action {
            ActionKind::Undo | ActionKind::Dismiss | ActionKind::NoAction => true,
            ActionKind::Hover => self.hover_ms.is_some_and(|ms| ms >= LONG_HOVER_MS),
            _ => false,
        }
    }
}

/// Explicit operator opt-in (or opt-out) for one capability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperatorModeSet {
    pub capability: String,
    pub mode: OperatingMode,
}

/// A preference the user stated directly, e.g. in settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreferenceStated {
    pub dimension: Dimension,
    pub value: f64,
}

/// Known event kinds with typed payloads.
#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    AnalysisStarted(AnalysisStarted),
    AnalysisCompleted(AnalysisCompleted),
    DirectiveShown(DirectiveShown),
    UserAction(UserAction),
    SessionStarted,
    SessionEnded,
    OperatorModeSet(OperatorModeSet),
    PreferenceStated(PreferenceStated),
    /// Preserved as-is for forward compatibility.
    Unrecognized {
        event_type: String,
        payload: Map<String, Value>,
    },
}

impl EventKind {
    /// Canonical wire name.
    pub fn event_type(&self) -> &str {
        match self {
            EventKind::AnalysisStarted(_) => "analysis_started",
            EventKind::AnalysisCompleted(_) => "analysis_completed",
            EventKind::DirectiveShown(_) => "attention_directive_shown",
            EventKind::UserAction(_) => "user_action",
            EventKind::SessionStarted => "session_started",
            EventKind::SessionEnded => "session_ended",
            EventKind::OperatorModeSet(_) => "operator_mode_set",
            EventKind::PreferenceStated(_) => "preference_stated",
            EventKind::Unrecognized { event_type, .. } => event_type,
        }
    }

    fn from_wire(event_id: &str, event_type: String, payload: Map<String, Value>) -> Result<Self> {
        let kind = match event_type.as_str() {
            "analysis_started" => EventKind::AnalysisStarted(typed(event_id, &event_type, payload)?),
            "analysis_completed" => {
                let completed: AnalysisCompleted = typed(event_id, &event_type, payload)?;
                if let Some(q) = completed.quality
                    && !(q.is_finite() && (0.0..=1.0).contains(&q))
                {
                    return Err(SpineError::schema(
                        event_id,
                        format!("quality {q} outside [0, 1]"),
                    ));
                }
                EventKind::AnalysisCompleted(completed)
            }
            "attention_directive_shown" | "directive_shown" => {
                EventKind::DirectiveShown(typed(event_id, &event_type, payload)?)
            }
            "user_action" => EventKind::UserAction(typed(event_id, &event_type, payload)?),
            "session_started" => EventKind::SessionStarted,
            "session_ended" => EventKind::SessionEnded,
            "operator_mode_set" => EventKind::OperatorModeSet(typed(event_id, &event_type, payload)?),
            "preference_stated" => {
                let stated: PreferenceStated = typed(event_id, &event_type, payload)?;
                if !(stated.value.is_finite() && (0.0..=1.0).contains(&stated.value)) {
                    return Err(SpineError::schema(
                        event_id,
                        format!("preference value {} outside [0, 1]", stated.value),
                    ));
                }
                EventKind::PreferenceStated(stated)
            }
            _ => EventKind::Unrecognized {
                event_type,
                payload,
            },
        };
        Ok(kind)
    }

    fn to_payload(&self) -> Map<String, Value> {
        let value = match self {
            EventKind::AnalysisStarted(p) => serde_json::to_value(p),
            EventKind::AnalysisCompleted(p) => serde_json::to_value(p),
            EventKind::DirectiveShown(p) => serde_json::to_value(p),
            EventKind::UserAction(p) => serde_json::to_value(p),
            EventKind::OperatorModeSet(p) => serde_json::to_value(p),
            EventKind::PreferenceStated(p) => serde_json::to_value(p),
            EventKind::SessionStarted | EventKind::SessionEnded => return Map::new(),
            EventKind::Unrecognized { payload, .. } => return payload.clone(),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

fn typed<T: DeserializeOwned>(
    event_id: &str,
    event_type: &str,
    payload: Map<String, Value>,
) -> Result<T> {
    serde_json::from_value(Value::Object(payload))
        .map_err(|e| SpineError::schema(event_id, format!("{event_type} payload: {e}")))
}

// ---------------------------------------------------------------------------
// Validated event
// ---------------------------------------------------------------------------

/// An immutable, validated event.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub source: EventSource,
    pub privacy_layer: u8,
    pub occurred_at: DateTime<Utc>,
    pub session_id: String,
    pub correlation_id: Option<String>,
    pub schema_version: String,
}

impl AgentEvent {
    /// Build an event in-process with a fresh v4 id.
    pub fn new(session_id: &str, kind: EventKind, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            kind,
            source: EventSource::default(),
            privacy_layer: 0,
            occurred_at,
            session_id: session_id.to_string(),
            correlation_id: None,
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
        }
    }

    pub fn with_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_privacy_layer(mut self, layer: u8) -> Self {
        self.privacy_layer = layer;
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Validate a wire record: schema major, privacy range, typed payload.
    pub fn from_envelope(envelope: EventEnvelope) -> Result<Self> {
        let EventEnvelope {
            event_id,
            event_type,
            source,
            payload,
            privacy_layer,
            occurred_at,
            session_id,
            correlation_id,
            schema_version,
        } = envelope;

        match schema_major(&schema_version) {
            Some(SUPPORTED_SCHEMA_MAJOR) => {}
            Some(major) => {
                return Err(SpineError::schema(
                    &event_id,
                    format!("unsupported schema major version {major} ({schema_version})"),
                ));
            }
            None => {
                return Err(SpineError::schema(
                    &event_id,
                    format!("unparseable schema_version {schema_version:?}"),
                ));
            }
        }
        if privacy_layer > MAX_PRIVACY_LAYER {
            return Err(SpineError::schema(
                &event_id,
                format!("privacy_layer {privacy_layer} exceeds {MAX_PRIVACY_LAYER}"),
            ));
        }
        if session_id.trim().is_empty() {
            return Err(SpineError::schema(&event_id, "empty session_id"));
        }

        let kind = EventKind::from_wire(&event_id, event_type, payload)?;
        Ok(Self {
            event_id,
            kind,
            source,
            privacy_layer,
            occurred_at,
            session_id,
            correlation_id,
            schema_version,
        })
    }

    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id.clone(),
            event_type: self.kind.event_type().to_string(),
            source: self.source.clone(),
            payload: self.kind.to_payload(),
            privacy_layer: self.privacy_layer,
            occurred_at: self.occurred_at,
            session_id: self.session_id.clone(),
            correlation_id: self.correlation_id.clone(),
            schema_version: self.schema_version.clone(),
        }
    }

    pub fn event_type(&self) -> &str {
        self.kind.event_type()
    }

    /// Tool the event is about, if any.
    pub fn tool_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::AnalysisStarted(p) => Some(&p.tool_id),
            EventKind::AnalysisCompleted(p) => Some(&p.tool_id),
            EventKind::DirectiveShown(p) => p.tool_id.as_deref(),
            EventKind::UserAction(p) => p.tool_id.as_deref(),
            _ => None,
        }
    }

    /// Tool usage by the user (directives are agent output and don't count).
    pub fn user_tool(&self) -> Option<&str> {
        match &self.kind {
            EventKind::DirectiveShown(_) => None,
            _ => self.tool_id(),
        }
    }

    /// Explicit capability, else the tool, else `None`.
    pub fn capability(&self) -> Option<&str> {
        let explicit = match &self.kind {
            EventKind::AnalysisStarted(p) => p.capability.as_deref(),
            EventKind::AnalysisCompleted(p) => p.capability.as_deref(),
            EventKind::DirectiveShown(p) => p.capability.as_deref(),
            EventKind::UserAction(p) => p.capability.as_deref(),
            EventKind::OperatorModeSet(p) => Some(p.capability.as_str()),
            _ => None,
        };
        explicit.or_else(|| self.tool_id())
    }

    /// Capability with the default fallback applied.
    pub fn capability_or_default(&self) -> &str {
        self.capability().unwrap_or(DEFAULT_CAPABILITY)
    }

    pub fn as_directive(&self) -> Option<&DirectiveShown> {
        match &self.kind {
            EventKind::DirectiveShown(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_action(&self) -> Option<&UserAction> {
        match &self.kind {
            EventKind::UserAction(a) => Some(a),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_type: &str, payload: Value) -> EventEnvelope {
        serde_json::from_value(json!({
            "event_id": "e1",
            "event_type": event_type,
            "source": {"repo": "toolbox", "component": "panel", "version": "2.1.0"},
            "payload": payload,
            "privacy_layer": 1,
            "occurred_at": "2026-03-01T10:00:00Z",
            "session_id": "s1",
            "schema_version": "1.2"
        }))
        .unwrap()
    }

    #[test]
    fn test_schema_major_parsing() {
        assert_eq!(schema_major("1"), Some(1));
        assert_eq!(schema_major("1.4.2"), Some(1));
        assert_eq!(schema_major("v2.0"), Some(2));
        assert_eq!(schema_major("abc"), None);
    }

    #[test]
    fn test_numeric_schema_version_accepted() {
        let env: EventEnvelope = serde_json::from_value(json!({
            "event_id": "e1",
            "event_type": "session_started",
            "occurred_at": "2026-03-01T10:00:00Z",
            "session_id": "s1",
            "schema_version": 1
        }))
        .unwrap();
        assert_eq!(env.schema_version, "1");
        assert!(AgentEvent::from_envelope(env).is_ok());
    }

    #[test]
    fn test_typed_directive() {
        let event = AgentEvent::from_envelope(envelope(
            "attention_directive_shown",
            json!({"directive_id": "d1", "capability": "toolpath"}),
        ))
        .unwrap();
        let directive = event.as_directive().unwrap();
        assert_eq!(directive.directive_id.as_deref(), Some("d1"));
        assert_eq!(event.capability(), Some("toolpath"));
        assert_eq!(event.event_type(), "attention_directive_shown");
    }

    #[test]
    fn test_directive_alias_maps_to_canonical_name() {
        let event =
            AgentEvent::from_envelope(envelope("directive_shown", json!({"capability": "c"})))
                .unwrap();
        assert_eq!(event.to_envelope().event_type, "attention_directive_shown");
    }

    #[test]
    fn test_unknown_major_rejected() {
        let mut env = envelope("session_started", json!({}));
        env.schema_version = "2.0".into();
        let err = AgentEvent::from_envelope(env).unwrap_err();
        assert_eq!(err.kind(), "schema");
    }

    #[test]
    fn test_privacy_layer_out_of_range() {
        let mut env = envelope("session_started", json!({}));
        env.privacy_layer = 6;
        assert!(matches!(
            AgentEvent::from_envelope(env),
            Err(SpineError::Schema { .. })
        ));
    }

    #[test]
    fn test_known_type_with_bad_payload_rejected() {
        let err = AgentEvent::from_envelope(envelope("analysis_started", json!({"tool": 3})))
            .unwrap_err();
        assert!(err.to_string().contains("analysis_started payload"));
    }

    #[test]
    fn test_quality_outside_unit_interval_rejected() {
        let err = AgentEvent::from_envelope(envelope(
            "analysis_completed",
            json!({"tool_id": "x", "quality": 1.5}),
        ))
        .unwrap_err();
        assert_eq!(err.kind(), "schema");
    }

    #[test]
    fn test_unrecognized_type_preserved() {
        let payload = json!({"anything": [1, 2, 3]});
        let event =
            AgentEvent::from_envelope(envelope("feasibility_scored", payload.clone())).unwrap();
        match &event.kind {
            EventKind::Unrecognized {
                event_type,
                payload: kept,
            } => {
                assert_eq!(event_type, "feasibility_scored");
                assert_eq!(Value::Object(kept.clone()), payload);
            }
            other => panic!("expected Unrecognized, got {other:?}"),
        }
        assert_eq!(event.to_envelope().payload, payload.as_object().unwrap().clone());
    }

    #[test]
    fn test_unknown_action_falls_back_to_other() {
        let event = AgentEvent::from_envelope(envelope(
            "user_action",
            json!({"action": "pinch_zoom", "capability": "viewer"}),
        ))
        .unwrap();
        assert_eq!(event.as_action().unwrap().action, ActionKind::Other);
    }

    #[test]
    fn test_hesitation_classes() {
        let hover = |ms| UserAction {
            action: ActionKind::Hover,
            capability: None,
            tool_id: None,
            hover_ms: ms,
        };
        assert!(hover(Some(LONG_HOVER_MS)).is_hesitation());
        assert!(!hover(Some(200)).is_hesitation());
        assert!(!hover(None).is_hesitation());
        assert!(ActionKind::Dismiss.is_rejection());
        assert!(ActionKind::Apply.is_accept());
        assert!(!ActionKind::Modify.is_accept());
    }

    #[test]
    fn test_capability_falls_back_to_tool_then_default() {
        let event = AgentEvent::from_envelope(envelope(
            "analysis_started",
            json!({"tool_id": "feeds_speeds"}),
        ))
        .unwrap();
        assert_eq!(event.capability(), Some("feeds_speeds"));

        let bare = AgentEvent::from_envelope(envelope("session_started", json!({}))).unwrap();
        assert_eq!(bare.capability_or_default(), DEFAULT_CAPABILITY);
    }

    #[test]
    fn test_directive_is_not_user_tool_usage() {
        let event = AgentEvent::from_envelope(envelope(
            "attention_directive_shown",
            json!({"tool_id": "x"}),
        ))
        .unwrap();
        assert_eq!(event.tool_id(), Some("x"));
        assert_eq!(event.user_tool(), None);
    }

    #[test]
    fn test_envelope_roundtrip_preserves_typed_payload() {
        let env = envelope(
            "analysis_completed",
            json!({"tool_id": "x", "quality": 0.93, "duration_ms": 1200}),
        );
        let event = AgentEvent::from_envelope(env.clone()).unwrap();
        assert_eq!(event.to_envelope(), env);
    }
}
