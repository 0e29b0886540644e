//! Deterministic replay of a recorded event log.
//!
//! Events are stable-sorted by timestamp and fed through a fresh `Spine`.
//! All time comes from event timestamps and every map in the report is a
//! `BTreeMap`, so the same input and mode serialize to identical bytes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SpineConfig;
use crate::constants::NEUTRAL;
use crate::cooldown::Suppression;
use crate::error::SpineError;
use crate::event::{EventEnvelope, schema_major};
use crate::moment::{Moment, MomentType};
use crate::policy::{Decision, DecisionAction, ModeTransition, OperatingMode};
use crate::spine::{PassOutcome, Spine, SuppressedCandidate};
use crate::uwsm::{Dimension, DimensionState, UwsmLogEntry};

pub const REPORT_SCHEMA_VERSION: &str = "1.0";

/// Accept a report written under any `REPORT_SCHEMA_VERSION` with the same
/// major version.
pub fn check_report_schema(version: &str) -> crate::error::Result<()> {
    match (schema_major(version), schema_major(REPORT_SCHEMA_VERSION)) {
        (Some(found), Some(supported)) if found == supported => Ok(()),
        _ => Err(SpineError::ReportSchema {
            found: version.to_string(),
            expected: REPORT_SCHEMA_VERSION.to_string(),
        }),
    }
}

/// Starting mode for every capability during a replay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplayMode {
    /// Shadow
    #[default]
    M0,
    /// Advisory
    M1,
    /// Actuated
    M2,
}

impl ReplayMode {
    pub fn operating_mode(self) -> OperatingMode {
        match self {
            ReplayMode::M0 => OperatingMode::Shadow,
            ReplayMode::M1 => OperatingMode::Advisory,
            ReplayMode::M2 => OperatingMode::Actuated,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReplayMode::M0 => "M0",
            ReplayMode::M1 => "M1",
            ReplayMode::M2 => "M2",
        }
    }
}

impl fmt::Display for ReplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "M0" | "SHADOW" => Ok(ReplayMode::M0),
            "M1" | "ADVISORY" => Ok(ReplayMode::M1),
            "M2" | "ACTUATED" => Ok(ReplayMode::M2),
            other => Err(format!("unknown replay mode {other:?}, expected M0, M1 or M2")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayOptions {
    pub mode: ReplayMode,
    /// Include a per-event audit trail in each session report.
    pub verbose: bool,
}

/// An event the spine refused, with the error class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RejectedEvent {
    pub event_id: String,
    pub session_id: String,
    pub error: String,
    pub reason: String,
}

/// One line of the verbose audit trail.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrailEntry {
    pub event_id: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suppressed: Vec<SuppressedCandidate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uwsm_rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<DecisionAction>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub events: usize,
    pub moment_counts: BTreeMap<MomentType, usize>,
    pub decision_counts: BTreeMap<DecisionAction, usize>,
    pub suppressed_counts: BTreeMap<Suppression, usize>,
    /// Decisions where a directive would have been shown outside Shadow.
    pub would_have_emitted: usize,
    pub gate_suppressed: usize,
    /// Mean UWSM confidence at the end minus the neutral starting point.
    pub confidence_delta: f64,
    pub uwsm_final: BTreeMap<Dimension, DimensionState>,
    #[serde(default)]
    pub transitions: Vec<ModeTransition>,
    #[serde(default)]
    pub uwsm_audit: Vec<UwsmLogEntry>,
    #[serde(default)]
    pub moments: Vec<Moment>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub suppressed: Vec<SuppressedCandidate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trail: Vec<TrailEntry>,
}

impl SessionReport {
    fn record(&mut self, outcome: &PassOutcome, trail: Option<TrailEntry>) {
        self.events += 1;
        if let Some(moment) = &outcome.moment {
            *self.moment_counts.entry(moment.moment_type).or_default() += 1;
            self.moments.push(moment.clone());
        }
        for decision in &outcome.decisions {
            *self.decision_counts.entry(decision.action).or_default() += 1;
            if decision.diagnostic.would_have_emitted {
                self.would_have_emitted += 1;
            }
            if decision.action == DecisionAction::SuppressedByGate {
                self.gate_suppressed += 1;
            }
        }
        for candidate in &outcome.suppressed {
            *self.suppressed_counts.entry(candidate.reason).or_default() += 1;
        }
        self.decisions.extend(outcome.decisions.iter().cloned());
        self.suppressed.extend(outcome.suppressed.iter().cloned());
        self.trail.extend(trail);
    }

    pub fn moment_total(&self) -> usize {
        self.moment_counts.values().sum()
    }

    pub fn decision_total(&self) -> usize {
        self.decision_counts.values().sum()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub schema_version: String,
    pub mode: ReplayMode,
    pub events_total: usize,
    pub events_accepted: usize,
    pub sessions: BTreeMap<String, SessionReport>,
    #[serde(default)]
    pub rejected: Vec<RejectedEvent>,
}

impl Report {
    pub fn empty(mode: ReplayMode) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            mode,
            events_total: 0,
            events_accepted: 0,
            sessions: BTreeMap::new(),
            rejected: Vec::new(),
        }
    }

    /// Counts only: per-item detail (moments, decisions, audit, trail) removed.
    pub fn summary(&self) -> Report {
        let sessions = self
            .sessions
            .iter()
            .map(|(id, s)| {
                let counts = SessionReport {
                    events: s.events,
                    moment_counts: s.moment_counts.clone(),
                    decision_counts: s.decision_counts.clone(),
                    suppressed_counts: s.suppressed_counts.clone(),
                    would_have_emitted: s.would_have_emitted,
                    gate_suppressed: s.gate_suppressed,
                    confidence_delta: s.confidence_delta,
                    uwsm_final: s.uwsm_final.clone(),
                    ..SessionReport::default()
                };
                (id.clone(), counts)
            })
            .collect();
        Report {
            sessions,
            ..self.clone()
        }
    }

    pub fn moment_total(&self) -> usize {
        self.sessions.values().map(SessionReport::moment_total).sum()
    }

    pub fn decision_total(&self) -> usize {
        self.sessions.values().map(SessionReport::decision_total).sum()
    }
}

/// Feed `events` through a fresh spine and report what would have happened.
pub fn replay(mut events: Vec<EventEnvelope>, options: ReplayOptions, config: &SpineConfig) -> Report {
    events.sort_by_key(|e| e.occurred_at);

    let mut report = Report::empty(options.mode);
    report.events_total = events.len();
    let mut spine = Spine::with_initial_mode(config.clone(), options.mode.operating_mode());

    for envelope in events {
        let session_id = envelope.session_id.clone();
        let event_id = envelope.event_id.clone();
        let event_type = envelope.event_type.clone();
        let occurred_at = envelope.occurred_at;

        match spine.ingest(envelope) {
            Ok(outcome) => {
                report.events_accepted += 1;
                let trail = options.verbose.then(|| TrailEntry {
                    event_id,
                    event_type,
                    occurred_at,
                    moment_id: outcome.moment.as_ref().map(|m| m.moment_id.clone()),
                    suppressed: outcome.suppressed.clone(),
                    uwsm_rules: outcome.uwsm_changes.iter().map(|e| e.rule_id.clone()).collect(),
                    decisions: outcome.decisions.iter().map(|d| d.action).collect(),
                });
                report
                    .sessions
                    .entry(session_id)
                    .or_default()
                    .record(&outcome, trail);
            }
            Err(e) => {
                debug!(event_id = %event_id, error = %e, "replay skipped event");
                report.rejected.push(RejectedEvent {
                    event_id,
                    session_id,
                    error: e.kind().to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    for (session_id, state) in spine.sessions() {
        let Some(session) = report.sessions.get_mut(session_id) else {
            continue;
        };
        let uwsm = state.uwsm();
        session.transitions = state.policy().transitions().to_vec();
        session.uwsm_audit = uwsm.log.clone();
        session.uwsm_final = uwsm.dimensions.clone();
        session.confidence_delta = uwsm.mean_confidence() - NEUTRAL;
    }

    info!(
        mode = %options.mode,
        events = report.events_total,
        accepted = report.events_accepted,
        sessions = report.sessions.len(),
        moments = report.moment_total(),
        "replay complete"
    );
    report
}
