use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{CONFIDENCE_AT_THRESHOLD, CONFIDENCE_CAP, CONFIDENCE_STEP};
use crate::cooldown::rule_for;
use crate::uwsm::Dimension;

/// The seven canonical behavioral patterns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MomentType {
    FirstSignal,
    Hesitation,
    Overload,
    ConfidenceClimb,
    TrustErosion,
    WorkflowShift,
    MasteryPlateau,
}

/// Highest priority first. When several matchers fire on the same event,
/// only the earliest entry here is emitted.
pub const PRIORITY_ORDER: [MomentType; 7] = [
    MomentType::TrustErosion,
    MomentType::Overload,
    MomentType::Hesitation,
    MomentType::ConfidenceClimb,
    MomentType::WorkflowShift,
    MomentType::MasteryPlateau,
    MomentType::FirstSignal,
];

impl MomentType {
    pub const ALL: [MomentType; 7] = [
        MomentType::FirstSignal,
        MomentType::Hesitation,
        MomentType::Overload,
        MomentType::ConfidenceClimb,
        MomentType::TrustErosion,
        MomentType::WorkflowShift,
        MomentType::MasteryPlateau,
    ];

    /// Rank in `PRIORITY_ORDER`; 0 is the strongest.
    pub fn priority(self) -> usize {
        PRIORITY_ORDER
            .iter()
            .position(|t| *t == self)
            .unwrap_or(PRIORITY_ORDER.len())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MomentType::FirstSignal => "FIRST_SIGNAL",
            MomentType::Hesitation => "HESITATION",
            MomentType::Overload => "OVERLOAD",
            MomentType::ConfidenceClimb => "CONFIDENCE_CLIMB",
            MomentType::TrustErosion => "TRUST_EROSION",
            MomentType::WorkflowShift => "WORKFLOW_SHIFT",
            MomentType::MasteryPlateau => "MASTERY_PLATEAU",
        }
    }
}

impl fmt::Display for MomentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Margin-over-threshold confidence: 0.6 at the boundary, +0.05 per extra
/// occurrence, capped at 0.95.
pub fn confidence_for(observed: usize, threshold: usize) -> f64 {
    let extra = observed.saturating_sub(threshold) as f64;
    (CONFIDENCE_AT_THRESHOLD + CONFIDENCE_STEP * extra).min(CONFIDENCE_CAP)
}

/// What a matcher reports before hysteresis and priority are applied.
#[derive(Clone, Debug, PartialEq)]
pub struct MomentCandidate {
    pub moment_type: MomentType,
    pub capability: Option<String>,
    pub tool_id: Option<String>,
    pub trigger_events: Vec<String>,
    pub privacy_layer: u8,
    pub observed: usize,
    pub confidence: f64,
}

impl MomentCandidate {
    /// Key this candidate's hysteresis is checked and recorded under.
    pub fn cooldown_key(&self) -> Option<&str> {
        rule_for(self.moment_type)
            .scope
            .key(self.tool_id.as_deref(), self.capability.as_deref())
    }
}

/// A detected, immutable moment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Moment {
    pub moment_id: String,
    pub moment_type: MomentType,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub trigger_events: Vec<String>,
    pub uwsm_updates: BTreeMap<Dimension, f64>,
    pub confidence: f64,
    pub privacy_layer: u8,
}

impl Moment {
    pub fn cooldown_key(&self) -> Option<&str> {
        rule_for(self.moment_type)
            .scope
            .key(self.tool_id.as_deref(), self.capability.as_deref())
    }
}
