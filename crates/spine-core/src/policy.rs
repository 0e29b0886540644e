//! Decision policy: one Shadow / Advisory / Actuated state machine per
//! capability.
//!
//! Transitions:
//!
//! | from | to | trigger |
//! |---|---|---|
//! | any | any | operator request; Actuated only from Advisory, through the gate |
//! | Advisory | Actuated | CONFIDENCE_CLIMB with the gate passing |
//! | Actuated | Advisory | TRUST_EROSION, always, even when the moment itself is suppressed |
//! | Advisory, Actuated | Shadow | WORKFLOW_SHIFT, when `demote_on_workflow_shift` |
//!
//! In Shadow the engine still works out what it would have done, but never
//! returns `ShowDirective`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::PolicyConfig;
use crate::constants::EPSILON;
use crate::cooldown::Suppression;
use crate::moment::{Moment, MomentType};
use crate::uwsm::{Dimension, UwsmState};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    #[default]
    #[serde(alias = "Shadow", alias = "SHADOW")]
    Shadow,
    #[serde(alias = "Advisory", alias = "ADVISORY")]
    Advisory,
    #[serde(alias = "Actuated", alias = "ACTUATED")]
    Actuated,
}

impl OperatingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OperatingMode::Shadow => "shadow",
            OperatingMode::Advisory => "advisory",
            OperatingMode::Actuated => "actuated",
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    None,
    ShowDirective,
    SuppressedByGate,
    ModeChanged,
}

impl DecisionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionAction::None => "none",
            DecisionAction::ShowDirective => "show_directive",
            DecisionAction::SuppressedByGate => "suppressed_by_gate",
            DecisionAction::ModeChanged => "mode_changed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressedBy {
    /// A directive landed inside an OVERLOAD recovery window.
    OverloadRecovery,
    /// An Actuated request failed the actuation gate.
    ActuationGate,
    /// An Actuated request for a capability still in Shadow.
    AdvisoryFirst,
}

/// Inputs and result of one actuation-gate evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GateCheck {
    pub trust: f64,
    pub automation: f64,
    pub climbs: u32,
    pub passed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionTrigger {
    Moment {
        moment_id: String,
        moment_type: MomentType,
    },
    Directive {
        event_id: String,
    },
    Operator {
        event_id: String,
    },
    /// A candidate that did not become a moment but still forces a fail-safe.
    SuppressedMoment {
        moment_type: MomentType,
        reason: Suppression,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Whether a directive would have been shown outside Shadow.
    pub would_have_emitted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppressed_by: Option<SuppressedBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateCheck>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub at: DateTime<Utc>,
    /// `None` for session-wide triggers (WORKFLOW_SHIFT with nothing to demote).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    pub trigger: DecisionTrigger,
    pub action: DecisionAction,
    pub mode_before: OperatingMode,
    pub mode_after: OperatingMode,
    pub diagnostic: Diagnostic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// Starting mode set for the whole run (replay `--mode`).
    Initial,
    Operator,
    Gate,
    TrustErosion,
    WorkflowShift,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModeTransition {
    pub capability: String,
    pub from: OperatingMode,
    pub to: OperatingMode,
    pub at: DateTime<Utc>,
    pub reason: TransitionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateCheck>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CapabilityState {
    pub mode: OperatingMode,
    pub climbs: u32,
    pub overload_until: Option<DateTime<Utc>>,
}

/// One session's policy state.
#[derive(Clone, Debug)]
pub struct PolicyEngine {
    config: PolicyConfig,
    initial_mode: OperatingMode,
    capabilities: BTreeMap<String, CapabilityState>,
    transitions: Vec<ModeTransition>,
}

impl PolicyEngine {
    pub fn new(config: &PolicyConfig, initial_mode: OperatingMode) -> Self {
        Self {
            config: config.clone(),
            initial_mode,
            capabilities: BTreeMap::new(),
            transitions: Vec::new(),
        }
    }

    pub fn mode(&self, capability: &str) -> OperatingMode {
        self.capabilities
            .get(capability)
            .map_or(self.initial_mode, |c| c.mode)
    }

    pub fn capability(&self, capability: &str) -> Option<&CapabilityState> {
        self.capabilities.get(capability)
    }

    pub fn transitions(&self) -> &[ModeTransition] {
        &self.transitions
    }

    /// Evaluate the actuation gate for `capability` against current UWSM.
    pub fn gate(&self, capability: &str, uwsm: &UwsmState) -> GateCheck {
        let trust = uwsm.value(Dimension::TrustAgentSuggestions);
        let automation = uwsm.value(Dimension::AutomationComfort);
        let climbs = self.capabilities.get(capability).map_or(0, |c| c.climbs);
        GateCheck {
            trust,
            automation,
            climbs,
            passed: trust + EPSILON >= self.config.gate_trust
                && automation + EPSILON >= self.config.gate_automation
                && climbs >= self.config.gate_climbs,
        }
    }

    fn state_mut(&mut self, capability: &str, at: DateTime<Utc>) -> &mut CapabilityState {
        if !self.capabilities.contains_key(capability) {
            if self.initial_mode != OperatingMode::Shadow {
                self.transitions.push(ModeTransition {
                    capability: capability.to_string(),
                    from: OperatingMode::Shadow,
                    to: self.initial_mode,
                    at,
                    reason: TransitionReason::Initial,
                    gate: None,
                });
            }
            self.capabilities.insert(
                capability.to_string(),
                CapabilityState {
                    mode: self.initial_mode,
                    ..CapabilityState::default()
                },
            );
        }
        self.capabilities.entry(capability.to_string()).or_default()
    }

    fn transition(
        &mut self,
        capability: &str,
        to: OperatingMode,
        at: DateTime<Utc>,
        reason: TransitionReason,
        gate: Option<GateCheck>,
    ) -> OperatingMode {
        let state = self.state_mut(capability, at);
        let from = state.mode;
        state.mode = to;
        info!(capability, %from, %to, ?reason, "mode transition");
        self.transitions.push(ModeTransition {
            capability: capability.to_string(),
            from,
            to,
            at,
            reason,
            gate,
        });
        from
    }

    /// What to do about a directive for `capability` right now.
    fn directive_outcome(
        &mut self,
        capability: &str,
        at: DateTime<Utc>,
    ) -> (DecisionAction, OperatingMode, Diagnostic) {
        let state = self.state_mut(capability, at);
        let mode = state.mode;
        if state.overload_until.is_some_and(|until| at < until) {
            let diagnostic = Diagnostic {
                would_have_emitted: false,
                suppressed_by: Some(SuppressedBy::OverloadRecovery),
                gate: None,
            };
            return (DecisionAction::SuppressedByGate, mode, diagnostic);
        }
        let action = match mode {
            OperatingMode::Shadow => DecisionAction::None,
            OperatingMode::Advisory | OperatingMode::Actuated => DecisionAction::ShowDirective,
        };
        let diagnostic = Diagnostic {
            would_have_emitted: true,
            ..Diagnostic::default()
        };
        (action, mode, diagnostic)
    }

    /// Decide on a directive a producer reported as shown.
    pub fn decide_directive(
        &mut self,
        event_id: &str,
        capability: &str,
        at: DateTime<Utc>,
    ) -> Decision {
        let (action, mode, diagnostic) = self.directive_outcome(capability, at);
        Decision {
            at,
            capability: Some(capability.to_string()),
            trigger: DecisionTrigger::Directive {
                event_id: event_id.to_string(),
            },
            action,
            mode_before: mode,
            mode_after: mode,
            diagnostic,
        }
    }

    /// Apply an explicit operator mode request.
    pub fn operator_set(
        &mut self,
        event_id: &str,
        capability: &str,
        requested: OperatingMode,
        uwsm: &UwsmState,
        at: DateTime<Utc>,
    ) -> Decision {
        let before = self.state_mut(capability, at).mode;
        let trigger = DecisionTrigger::Operator {
            event_id: event_id.to_string(),
        };
        let decision = |action, after, diagnostic| Decision {
            at,
            capability: Some(capability.to_string()),
            trigger: trigger.clone(),
            action,
            mode_before: before,
            mode_after: after,
            diagnostic,
        };

        if requested == before {
            return decision(DecisionAction::None, before, Diagnostic::default());
        }
        if requested == OperatingMode::Actuated && before == OperatingMode::Shadow {
            let diagnostic = Diagnostic {
                would_have_emitted: false,
                suppressed_by: Some(SuppressedBy::AdvisoryFirst),
                gate: None,
            };
            return decision(DecisionAction::SuppressedByGate, before, diagnostic);
        }
        if requested == OperatingMode::Actuated {
            let gate = self.gate(capability, uwsm);
            if !gate.passed {
                let diagnostic = Diagnostic {
                    would_have_emitted: false,
                    suppressed_by: Some(SuppressedBy::ActuationGate),
                    gate: Some(gate),
                };
                return decision(DecisionAction::SuppressedByGate, before, diagnostic);
            }
            self.transition(capability, requested, at, TransitionReason::Operator, Some(gate));
            let diagnostic = Diagnostic {
                gate: Some(gate),
                ..Diagnostic::default()
            };
            return decision(DecisionAction::ModeChanged, requested, diagnostic);
        }
        self.transition(capability, requested, at, TransitionReason::Operator, None);
        decision(DecisionAction::ModeChanged, requested, Diagnostic::default())
    }

    /// Decide on an emitted moment. `uwsm` must already include the
    /// moment's own updates.
    pub fn decide(&mut self, moment: &Moment, uwsm: &UwsmState) -> Vec<Decision> {
        let at = moment.detected_at;
        let trigger = DecisionTrigger::Moment {
            moment_id: moment.moment_id.clone(),
            moment_type: moment.moment_type,
        };

        if moment.moment_type == MomentType::WorkflowShift {
            return self.on_workflow_shift(trigger, at);
        }

        let capability = moment
            .capability
            .clone()
            .unwrap_or_else(|| crate::constants::DEFAULT_CAPABILITY.to_string());
        let before = self.state_mut(&capability, at).mode;
        let single = |action, after, diagnostic| {
            vec![Decision {
                at,
                capability: Some(capability.clone()),
                trigger: trigger.clone(),
                action,
                mode_before: before,
                mode_after: after,
                diagnostic,
            }]
        };

        match moment.moment_type {
            MomentType::TrustErosion => {
                if before == OperatingMode::Actuated {
                    self.transition(
                        &capability,
                        OperatingMode::Advisory,
                        at,
                        TransitionReason::TrustErosion,
                        None,
                    );
                    return single(DecisionAction::ModeChanged, OperatingMode::Advisory, Diagnostic::default());
                }
                single(DecisionAction::None, before, Diagnostic::default())
            }
            MomentType::Overload => {
                let recovery = TimeDelta::seconds(self.config.overload_recovery_secs as i64);
                self.state_mut(&capability, at).overload_until = Some(at + recovery);
                single(DecisionAction::None, before, Diagnostic::default())
            }
            MomentType::ConfidenceClimb => {
                self.state_mut(&capability, at).climbs += 1;
                if before == OperatingMode::Advisory {
                    let gate = self.gate(&capability, uwsm);
                    if gate.passed {
                        self.transition(
                            &capability,
                            OperatingMode::Actuated,
                            at,
                            TransitionReason::Gate,
                            Some(gate),
                        );
                        let diagnostic = Diagnostic {
                            gate: Some(gate),
                            ..Diagnostic::default()
                        };
                        return single(DecisionAction::ModeChanged, OperatingMode::Actuated, diagnostic);
                    }
                }
                let (action, mode, diagnostic) = self.directive_outcome(&capability, at);
                single(action, mode, diagnostic)
            }
            MomentType::FirstSignal | MomentType::Hesitation | MomentType::MasteryPlateau => {
                let (action, mode, diagnostic) = self.directive_outcome(&capability, at);
                single(action, mode, diagnostic)
            }
            MomentType::WorkflowShift => Vec::new(),
        }
    }

    /// Actuated to Advisory for a TRUST_EROSION candidate that hysteresis or
    /// priority kept from becoming a moment. `None` when not Actuated.
    pub fn fail_safe(
        &mut self,
        capability: &str,
        reason: Suppression,
        at: DateTime<Utc>,
    ) -> Option<Decision> {
        if self.state_mut(capability, at).mode != OperatingMode::Actuated {
            return None;
        }
        let from = self.transition(
            capability,
            OperatingMode::Advisory,
            at,
            TransitionReason::TrustErosion,
            None,
        );
        Some(Decision {
            at,
            capability: Some(capability.to_string()),
            trigger: DecisionTrigger::SuppressedMoment {
                moment_type: MomentType::TrustErosion,
                reason,
            },
            action: DecisionAction::ModeChanged,
            mode_before: from,
            mode_after: OperatingMode::Advisory,
            diagnostic: Diagnostic::default(),
        })
    }

    fn on_workflow_shift(&mut self, trigger: DecisionTrigger, at: DateTime<Utc>) -> Vec<Decision> {
        let mut decisions = Vec::new();
        if self.config.demote_on_workflow_shift {
            self.initial_mode = OperatingMode::Shadow;
            let promoted: Vec<String> = self
                .capabilities
                .iter()
                .filter(|(_, s)| s.mode != OperatingMode::Shadow)
                .map(|(c, _)| c.clone())
                .collect();
            for capability in promoted {
                let from = self.transition(
                    &capability,
                    OperatingMode::Shadow,
                    at,
                    TransitionReason::WorkflowShift,
                    None,
                );
                decisions.push(Decision {
                    at,
                    capability: Some(capability),
                    trigger: trigger.clone(),
                    action: DecisionAction::ModeChanged,
                    mode_before: from,
                    mode_after: OperatingMode::Shadow,
                    diagnostic: Diagnostic::default(),
                });
            }
        }
        if decisions.is_empty() {
            decisions.push(Decision {
                at,
                capability: None,
                trigger,
                action: DecisionAction::None,
                mode_before: self.initial_mode,
                mode_after: self.initial_mode,
                diagnostic: Diagnostic::default(),
            });
        }
        decisions
    }
}
