//! User Working Style Model: a bounded preference vector with provenance.
//!
//! Every value or confidence change goes through `UwsmUpdater` and leaves a
//! `UwsmLogEntry` naming the rule that caused it. Values and confidences are
//! clamped to [0, 1] on every write.
//!
//! Confidence decays toward the neutral 0.5 with a configurable half-life,
//! measured between event timestamps:
//!
//! ```text
//! c(t) = 0.5 + (c0 - 0.5) * 2^(-Δt / half_life)
//! ```
//!
//! A fresh sample then moves confidence a fixed share of the way to 1.0.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::config::UwsmConfig;
use crate::constants::NEUTRAL;
use crate::moment::{Moment, MomentType};

/// Rule id for values the user stated directly.
pub const EXPLICIT_PREFERENCE_RULE: &str = "explicit_preference";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    TrustAgentSuggestions,
    DetailPreference,
    AutomationComfort,
    InterruptionTolerance,
    BatchVsRealtime,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::TrustAgentSuggestions,
        Dimension::DetailPreference,
        Dimension::AutomationComfort,
        Dimension::InterruptionTolerance,
        Dimension::BatchVsRealtime,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::TrustAgentSuggestions => "trust_agent_suggestions",
            Dimension::DetailPreference => "detail_preference",
            Dimension::AutomationComfort => "automation_comfort",
            Dimension::InterruptionTolerance => "interruption_tolerance",
            Dimension::BatchVsRealtime => "batch_vs_realtime",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == raw)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed deltas each moment type applies. WORKFLOW_SHIFT has none: it
/// lowers confidence instead of asserting a new preference.
pub fn rule_deltas(moment_type: MomentType) -> BTreeMap<Dimension, f64> {
    use Dimension::*;
    let pairs: &[(Dimension, f64)] = match moment_type {
        MomentType::FirstSignal => &[(DetailPreference, 0.05)],
        MomentType::Hesitation => &[(TrustAgentSuggestions, -0.05), (InterruptionTolerance, -0.05)],
        MomentType::Overload => &[(InterruptionTolerance, -0.15), (BatchVsRealtime, 0.10)],
        MomentType::ConfidenceClimb => &[(TrustAgentSuggestions, 0.10), (AutomationComfort, 0.05)],
        MomentType::TrustErosion => &[(TrustAgentSuggestions, -0.20), (AutomationComfort, -0.15)],
        MomentType::WorkflowShift => &[],
        MomentType::MasteryPlateau => &[(DetailPreference, -0.10), (AutomationComfort, 0.10)],
    };
    pairs.iter().copied().collect()
}

/// Decay confidence toward neutral over `elapsed`.
pub fn decay_toward_neutral(confidence: f64, elapsed: TimeDelta, half_life: TimeDelta) -> f64 {
    let half_life_secs = half_life.num_milliseconds() as f64 / 1000.0;
    let elapsed_secs = elapsed.num_milliseconds().max(0) as f64 / 1000.0;
    if half_life_secs <= 0.0 || elapsed_secs == 0.0 {
        return confidence.clamp(0.0, 1.0);
    }
    let factor = 0.5f64.powf(elapsed_secs / half_life_secs);
    (NEUTRAL + (confidence - NEUTRAL) * factor).clamp(0.0, 1.0)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DimensionState {
    pub value: f64,
    pub confidence: f64,
    pub samples: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for DimensionState {
    fn default() -> Self {
        Self {
            value: NEUTRAL,
            confidence: NEUTRAL,
            samples: 0,
            last_updated: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Value,
    Confidence,
}

/// One audited mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UwsmLogEntry {
    pub rule_id: String,
    /// Moment or event that carried the rule.
    pub cause_id: String,
    pub dimension: Dimension,
    pub kind: ChangeKind,
    /// Requested change.
    pub delta: f64,
    /// Change actually applied after clamping.
    pub applied: f64,
    pub before: f64,
    pub after: f64,
    pub at: DateTime<Utc>,
}

/// Per-session model state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UwsmState {
    pub dimensions: BTreeMap<Dimension, DimensionState>,
    pub log: Vec<UwsmLogEntry>,
}

impl Default for UwsmState {
    fn default() -> Self {
        Self::new()
    }
}

impl UwsmState {
    pub fn new() -> Self {
        Self {
            dimensions: Dimension::ALL
                .into_iter()
                .map(|d| (d, DimensionState::default()))
                .collect(),
            log: Vec::new(),
        }
    }

    pub fn value(&self, dimension: Dimension) -> f64 {
        self.dimensions
            .get(&dimension)
            .map_or(NEUTRAL, |d| d.value)
    }

    /// Confidence as of the last update.
    pub fn confidence(&self, dimension: Dimension) -> f64 {
        self.dimensions
            .get(&dimension)
            .map_or(NEUTRAL, |d| d.confidence)
    }

    /// Confidence decayed to `now`.
    pub fn confidence_at(&self, dimension: Dimension, now: DateTime<Utc>, half_life: TimeDelta) -> f64 {
        match self.dimensions.get(&dimension) {
            Some(DimensionState {
                confidence,
                last_updated: Some(at),
                ..
            }) => decay_toward_neutral(*confidence, now - *at, half_life),
            Some(state) => state.confidence,
            None => NEUTRAL,
        }
    }

    pub fn mean_confidence(&self) -> f64 {
        if self.dimensions.is_empty() {
            return NEUTRAL;
        }
        self.dimensions.values().map(|d| d.confidence).sum::<f64>() / self.dimensions.len() as f64
    }

    fn entry(&mut self, dimension: Dimension) -> &mut DimensionState {
        self.dimensions.entry(dimension).or_default()
    }
}

/// Applies moments and explicit preferences to a `UwsmState`.
#[derive(Clone, Debug)]
pub struct UwsmUpdater {
    half_life: TimeDelta,
    sample_gain: f64,
    workflow_cut: f64,
}

impl UwsmUpdater {
    pub fn new(config: &UwsmConfig) -> Self {
        let half_life_ms = (config.half_life_hours * 3_600_000.0).round() as i64;
        Self {
            half_life: TimeDelta::milliseconds(half_life_ms),
            sample_gain: config.sample_gain.clamp(0.0, 1.0),
            workflow_cut: config.workflow_shift_confidence_cut.clamp(0.0, 1.0),
        }
    }

    pub fn half_life(&self) -> TimeDelta {
        self.half_life
    }

    /// Apply a moment's deltas (or the WORKFLOW_SHIFT confidence cut) and
    /// return the entries appended to the audit log.
    pub fn apply(&self, state: &mut UwsmState, moment: &Moment) -> Vec<UwsmLogEntry> {
        let rule_id = moment.moment_type.as_str();
        let at = moment.detected_at;
        let mut entries = Vec::new();

        if moment.moment_type == MomentType::WorkflowShift {
            for dimension in Dimension::ALL {
                let dim = state.entry(dimension);
                let decayed = self.decayed(dim, at);
                let after = (decayed * (1.0 - self.workflow_cut)).clamp(0.0, 1.0);
                dim.confidence = after;
                dim.last_updated = Some(at);
                entries.push(UwsmLogEntry {
                    rule_id: rule_id.to_string(),
                    cause_id: moment.moment_id.clone(),
                    dimension,
                    kind: ChangeKind::Confidence,
                    delta: after - decayed,
                    applied: after - decayed,
                    before: decayed,
                    after,
                    at,
                });
            }
        } else {
            for (&dimension, &delta) in &moment.uwsm_updates {
                entries.push(self.shift(state, dimension, delta, rule_id, &moment.moment_id, at));
            }
        }

        state.log.extend(entries.iter().cloned());
        entries
    }

    /// Set a dimension to a value the user stated directly.
    pub fn apply_explicit(
        &self,
        state: &mut UwsmState,
        event_id: &str,
        dimension: Dimension,
        value: f64,
        at: DateTime<Utc>,
    ) -> UwsmLogEntry {
        let delta = value.clamp(0.0, 1.0) - state.value(dimension);
        let entry = self.shift(state, dimension, delta, EXPLICIT_PREFERENCE_RULE, event_id, at);
        state.log.push(entry.clone());
        entry
    }

    fn shift(
        &self,
        state: &mut UwsmState,
        dimension: Dimension,
        delta: f64,
        rule_id: &str,
        cause_id: &str,
        at: DateTime<Utc>,
    ) -> UwsmLogEntry {
        let dim = state.entry(dimension);
        let before = dim.value;
        let after = (before + delta).clamp(0.0, 1.0);

        let decayed = self.decayed(dim, at);
        dim.confidence = (decayed + (1.0 - decayed) * self.sample_gain).clamp(0.0, 1.0);
        dim.value = after;
        dim.samples = dim.samples.saturating_add(1);
        dim.last_updated = Some(at);

        UwsmLogEntry {
            rule_id: rule_id.to_string(),
            cause_id: cause_id.to_string(),
            dimension,
            kind: ChangeKind::Value,
            delta,
            applied: after - before,
            before,
            after,
            at,
        }
    }

    fn decayed(&self, dim: &DimensionState, at: DateTime<Utc>) -> f64 {
        match dim.last_updated {
            Some(last) => decay_toward_neutral(dim.confidence, at - last, self.half_life),
            None => dim.confidence,
        }
    }
}
