//! The session store and the per-event pipeline.
//!
//! `Spine` is an explicit handle: callers create one, feed it events and
//! drop it. Each session owns its window, history, moment log, cooldown
//! table, UWSM state and policy engine; nothing is shared between sessions
//! except the read-only configuration.
//!
//! One pass per accepted event, run to completion before the next:
//!
//! 1. validate (duplicate id, ordering, correlated privacy layer)
//! 2. append to window, fold into history
//! 3. run all matchers; a HESITATION that clears hysteresis counts toward
//!    TRUST_EROSION in the same pass
//! 4. drop candidates that fail hysteresis, then keep the highest priority
//! 5. fail safe on any TRUST_EROSION that did not make it through step 4
//! 6. decide on the event itself (directive shown, operator request,
//!    stated preference)
//! 7. emit the moment, apply its UWSM updates, decide on it

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SpineConfig;
use crate::cooldown::{CooldownTracker, Suppression};
use crate::error::{Result, SpineError};
use crate::event::{AgentEvent, EventEnvelope, EventKind};
use crate::history::SessionHistory;
use crate::matchers::{MatchContext, evaluate_all, trust_erosion_with};
use crate::moment::{Moment, MomentCandidate, MomentType};
use crate::policy::{Decision, OperatingMode, PolicyEngine};
use crate::uwsm::{UwsmLogEntry, UwsmState, UwsmUpdater, rule_deltas};
use crate::window::SessionWindow;

/// A candidate that did not become a moment, and why.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuppressedCandidate {
    pub moment_type: MomentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    pub reason: Suppression,
    pub at: DateTime<Utc>,
    pub confidence: f64,
}

/// Everything one event's pass produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PassOutcome {
    pub event_id: String,
    pub moment: Option<Moment>,
    pub suppressed: Vec<SuppressedCandidate>,
    pub uwsm_changes: Vec<UwsmLogEntry>,
    pub decisions: Vec<Decision>,
    pub evicted: usize,
}

#[derive(Clone, Debug)]
pub struct SessionState {
    window: SessionWindow,
    history: SessionHistory,
    moments: Vec<Moment>,
    cooldowns: CooldownTracker,
    uwsm: UwsmState,
    policy: PolicyEngine,
    last_at: Option<DateTime<Utc>>,
}

impl SessionState {
    fn new(config: &SpineConfig, initial_mode: OperatingMode) -> Self {
        Self {
            window: SessionWindow::new(&config.window),
            history: SessionHistory::new(),
            moments: Vec::new(),
            cooldowns: CooldownTracker::new(),
            uwsm: UwsmState::new(),
            policy: PolicyEngine::new(&config.policy, initial_mode),
            last_at: None,
        }
    }

    pub fn window(&self) -> &SessionWindow {
        &self.window
    }

    pub fn history(&self) -> &SessionHistory {
        &self.history
    }

    pub fn moments(&self) -> &[Moment] {
        &self.moments
    }

    pub fn cooldowns(&self) -> &CooldownTracker {
        &self.cooldowns
    }

    pub fn uwsm(&self) -> &UwsmState {
        &self.uwsm
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.last_at
    }
}

pub struct Spine {
    config: SpineConfig,
    updater: UwsmUpdater,
    initial_mode: OperatingMode,
    sessions: BTreeMap<String, SessionState>,
}

impl Spine {
    pub fn new(config: SpineConfig) -> Self {
        Self::with_initial_mode(config, OperatingMode::Shadow)
    }

    /// Every capability of every session starts in `initial_mode` rather
    /// than Shadow. Used by replay to simulate M1/M2 runs.
    pub fn with_initial_mode(config: SpineConfig, initial_mode: OperatingMode) -> Self {
        Self {
            updater: UwsmUpdater::new(&config.uwsm),
            config,
            initial_mode,
            sessions: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &SpineConfig {
        &self.config
    }

    /// Validate a wire record and run its pass.
    pub fn ingest(&mut self, envelope: EventEnvelope) -> Result<PassOutcome> {
        let event = AgentEvent::from_envelope(envelope).inspect_err(|e| {
            warn!(error = %e, "rejected event");
        })?;
        self.ingest_event(event)
    }

    /// Run one pass for an already-typed event.
    pub fn ingest_event(&mut self, event: AgentEvent) -> Result<PassOutcome> {
        self.check_admissible(&event).inspect_err(|e| {
            warn!(error = %e, session = %event.session_id, "rejected event");
        })?;

        let session = self
            .sessions
            .entry(event.session_id.clone())
            .or_insert_with(|| SessionState::new(&self.config, self.initial_mode));
        let now = event.occurred_at;
        let mut outcome = PassOutcome {
            event_id: event.event_id.clone(),
            ..PassOutcome::default()
        };

        session.last_at = Some(now);
        session.history.observe(&event);
        outcome.evicted = session.window.push(event.clone());

        let ctx = MatchContext {
            window: session.window.events(),
            history: &session.history,
            moments: &session.moments,
            now,
        };
        let mut candidates = evaluate_all(&ctx);
        let hesitation = candidates
            .iter()
            .find(|c| {
                c.moment_type == MomentType::Hesitation
                    && session.cooldowns.may_fire(c.moment_type, c.cooldown_key(), now)
            })
            .cloned();
        if let Some(hesitation) = hesitation
            && let Some(erosion) = trust_erosion_with(&ctx, &hesitation)
            && !candidates.iter().any(|c| {
                c.moment_type == MomentType::TrustErosion && c.capability == erosion.capability
            })
        {
            candidates.push(erosion);
        }
        let winner = select(session, candidates, now, &mut outcome.suppressed);

        for missed in &outcome.suppressed {
            if missed.moment_type != MomentType::TrustErosion {
                continue;
            }
            let Some(capability) = missed.capability.as_deref() else {
                continue;
            };
            if let Some(decision) = session.policy.fail_safe(capability, missed.reason, now) {
                warn!(capability, reason = %missed.reason, "fail-safe demotion for suppressed trust erosion");
                outcome.decisions.push(decision);
            }
        }

        match &event.kind {
            EventKind::DirectiveShown(_) => {
                let decision = session.policy.decide_directive(
                    &event.event_id,
                    event.capability_or_default(),
                    now,
                );
                outcome.decisions.push(decision);
            }
            EventKind::OperatorModeSet(request) => {
                let decision = session.policy.operator_set(
                    &event.event_id,
                    &request.capability,
                    request.mode,
                    &session.uwsm,
                    now,
                );
                outcome.decisions.push(decision);
            }
            EventKind::PreferenceStated(stated) => {
                let entry = self.updater.apply_explicit(
                    &mut session.uwsm,
                    &event.event_id,
                    stated.dimension,
                    stated.value,
                    now,
                );
                outcome.uwsm_changes.push(entry);
            }
            _ => {}
        }

        if let Some(candidate) = winner {
            let moment = Moment {
                moment_id: format!("{}:m{:04}", event.session_id, session.moments.len() + 1),
                moment_type: candidate.moment_type,
                session_id: event.session_id.clone(),
                capability: candidate.capability,
                tool_id: candidate.tool_id,
                detected_at: now,
                trigger_events: candidate.trigger_events,
                uwsm_updates: rule_deltas(candidate.moment_type),
                confidence: candidate.confidence,
                privacy_layer: candidate.privacy_layer,
            };
            session
                .cooldowns
                .record_fire(moment.moment_type, moment.cooldown_key(), now);
            debug!(
                moment_id = %moment.moment_id,
                moment_type = %moment.moment_type,
                confidence = moment.confidence,
                "moment detected"
            );
            outcome
                .uwsm_changes
                .extend(self.updater.apply(&mut session.uwsm, &moment));
            outcome
                .decisions
                .extend(session.policy.decide(&moment, &session.uwsm));
            session.moments.push(moment.clone());
            outcome.moment = Some(moment);
        }

        debug!(
            event_id = %outcome.event_id,
            suppressed = outcome.suppressed.len(),
            decisions = outcome.decisions.len(),
            "pass complete"
        );
        Ok(outcome)
    }

    fn check_admissible(&self, event: &AgentEvent) -> Result<()> {
        let Some(session) = self.sessions.get(&event.session_id) else {
            return Ok(());
        };
        if session.history.contains(&event.event_id) {
            return Err(SpineError::DuplicateEvent {
                event_id: event.event_id.clone(),
                session_id: event.session_id.clone(),
            });
        }
        if let Some(last) = session.last_at
            && event.occurred_at < last
        {
            return Err(SpineError::OutOfOrder {
                event_id: event.event_id.clone(),
                session_id: event.session_id.clone(),
                occurred_at: event.occurred_at,
                last_seen: last,
            });
        }
        if let Some(required) = event
            .correlation_id
            .as_deref()
            .and_then(|cid| session.history.privacy_of(cid))
            && event.privacy_layer < required
        {
            return Err(SpineError::PrivacyViolation {
                event_id: event.event_id.clone(),
                layer: event.privacy_layer,
                required,
            });
        }
        Ok(())
    }

    fn session_state(&self, session_id: &str) -> Result<&SessionState> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| SpineError::UnknownSession(session_id.to_string()))
    }

    pub fn session(&self, session_id: &str) -> Result<&SessionState> {
        self.session_state(session_id)
    }

    /// Current window of a session, oldest first.
    pub fn snapshot(&self, session_id: &str) -> Result<&[AgentEvent]> {
        Ok(self.session_state(session_id)?.window.events())
    }

    pub fn uwsm(&self, session_id: &str) -> Result<&UwsmState> {
        Ok(&self.session_state(session_id)?.uwsm)
    }

    pub fn mode(&self, session_id: &str, capability: &str) -> Result<OperatingMode> {
        Ok(self.session_state(session_id)?.policy.mode(capability))
    }

    /// Whether `moment_type` could fire now. `scope` is the tool or
    /// capability for types tracked per tool or per capability. An unknown
    /// session has no cooldowns yet.
    pub fn may_fire(
        &self,
        session_id: &str,
        moment_type: MomentType,
        scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        self.sessions
            .get(session_id)
            .is_none_or(|s| s.cooldowns.may_fire(moment_type, scope, now))
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&str, &SessionState)> {
        self.sessions.iter().map(|(id, s)| (id.as_str(), s))
    }

    /// Drop a session and hand back its final state.
    pub fn close_session(&mut self, session_id: &str) -> Result<SessionState> {
        self.sessions
            .remove(session_id)
            .ok_or_else(|| SpineError::UnknownSession(session_id.to_string()))
    }
}

/// Hysteresis first, then priority. Everything that does not win is
/// recorded in `suppressed`.
fn select(
    session: &SessionState,
    candidates: Vec<MomentCandidate>,
    now: DateTime<Utc>,
    suppressed: &mut Vec<SuppressedCandidate>,
) -> Option<MomentCandidate> {
    let mut survivors = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match session
            .cooldowns
            .check(candidate.moment_type, candidate.cooldown_key(), now)
        {
            Ok(()) => survivors.push(candidate),
            Err(reason) => {
                debug!(moment_type = %candidate.moment_type, %reason, "candidate suppressed");
                suppressed.push(suppression(&candidate, reason, now));
            }
        }
    }

    survivors.sort_by_key(|c| c.moment_type.priority());
    let mut survivors = survivors.into_iter();
    let winner = survivors.next();
    for candidate in survivors {
        suppressed.push(suppression(&candidate, Suppression::Priority, now));
    }
    winner
}

fn suppression(candidate: &MomentCandidate, reason: Suppression, at: DateTime<Utc>) -> SuppressedCandidate {
    SuppressedCandidate {
        moment_type: candidate.moment_type,
        capability: candidate.capability.clone(),
        reason,
        at,
        confidence: candidate.confidence,
    }
}
