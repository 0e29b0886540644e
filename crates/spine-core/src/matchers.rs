//! The seven moment matchers.
//!
//! Each matcher is a plain function of a `MatchContext` and is re-run from
//! scratch after every ingested event. None of them keep state between
//! calls; anything long-range comes from `SessionHistory` or the moment log.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};

use crate::constants::{
    CLIMB_MIN_ACCEPT_RATE, CLIMB_MIN_PAIRS, EPSILON, EROSION_MIN_HESITATIONS, EROSION_MIN_PAIRS,
    EROSION_MIN_REJECT_RATE, EROSION_WINDOW_SECS, HESITATION_THRESHOLD, HESITATION_WINDOW_SECS,
    MASTERY_MIN_CONSISTENCY, MASTERY_MIN_QUALITY, MASTERY_THRESHOLD, MASTERY_WINDOW_SECS,
    OVERLOAD_THRESHOLD, OVERLOAD_WINDOW_SECS, WORKFLOW_BASELINE_SECS, WORKFLOW_GAP_DELTA,
    WORKFLOW_LENGTH_DELTA, WORKFLOW_MIN_BASELINE_SEGMENTS, WORKFLOW_MIN_REORDERED,
};
use crate::event::{AgentEvent, EventKind};
use crate::history::{DirectiveRecord, SessionHistory, WorkSegment};
use crate::moment::{Moment, MomentCandidate, MomentType, confidence_for};

/// Everything a matcher may look at.
pub struct MatchContext<'a> {
    pub window: &'a [AgentEvent],
    pub history: &'a SessionHistory,
    pub moments: &'a [Moment],
    pub now: DateTime<Utc>,
}

impl MatchContext<'_> {
    fn latest(&self) -> Option<&AgentEvent> {
        self.window.last()
    }

    /// When the last moment of `moment_type` for `capability` was detected.
    fn last_moment(&self, moment_type: MomentType, capability: &str) -> Option<DateTime<Utc>> {
        self.moments
            .iter()
            .rev()
            .find(|m| m.moment_type == moment_type && m.capability.as_deref() == Some(capability))
            .map(|m| m.detected_at)
    }
}

pub type Matcher = fn(&MatchContext<'_>) -> Option<MomentCandidate>;

/// Registry in declaration order. Evaluation order has no effect on which
/// moment wins; that is decided by `PRIORITY_ORDER`.
pub const MATCHERS: [(MomentType, Matcher); 7] = [
    (MomentType::FirstSignal, first_signal),
    (MomentType::Hesitation, hesitation),
    (MomentType::Overload, overload),
    (MomentType::ConfidenceClimb, confidence_climb),
    (MomentType::TrustErosion, trust_erosion),
    (MomentType::WorkflowShift, workflow_shift),
    (MomentType::MasteryPlateau, mastery_plateau),
];

/// Run every matcher against the context.
pub fn evaluate_all(ctx: &MatchContext<'_>) -> Vec<MomentCandidate> {
    MATCHERS.iter().filter_map(|(_, matcher)| matcher(ctx)).collect()
}

fn candidate(
    moment_type: MomentType,
    capability: Option<String>,
    tool_id: Option<String>,
    triggers: Vec<(&str, u8)>,
    observed: usize,
    threshold: usize,
) -> MomentCandidate {
    MomentCandidate {
        moment_type,
        capability,
        tool_id,
        privacy_layer: triggers.iter().map(|(_, p)| *p).max().unwrap_or(0),
        trigger_events: triggers.into_iter().map(|(id, _)| id.to_string()).collect(),
        observed,
        confidence: confidence_for(observed, threshold),
    }
}

fn pair_triggers(pairs: &[&DirectiveRecord]) -> Vec<(String, u8)> {
    let mut triggers = Vec::with_capacity(pairs.len() * 2);
    for record in pairs {
        triggers.push((record.event_id.clone(), record.privacy_layer));
        if let Some(response) = &record.response {
            triggers.push((response.event_id.clone(), response.privacy_layer));
        }
    }
    triggers
}

/// Answered directives of `capability` whose response came after `since`.
fn pairs_since<'h>(
    history: &'h SessionHistory,
    capability: &str,
    since: Option<DateTime<Utc>>,
) -> Vec<&'h DirectiveRecord> {
    history
        .directives()
        .iter()
        .filter(|d| d.capability == capability)
        .filter(|d| {
            d.response
                .as_ref()
                .is_some_and(|r| since.is_none_or(|s| r.at > s))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// FIRST_SIGNAL
// ---------------------------------------------------------------------------

/// First user event for a tool in this session.
pub fn first_signal(ctx: &MatchContext<'_>) -> Option<MomentCandidate> {
    let latest = ctx.latest()?;
    let tool = latest.user_tool()?;
    if ctx.history.first_seen_event(tool)? != latest.event_id {
        return None;
    }
    Some(candidate(
        MomentType::FirstSignal,
        Some(latest.capability_or_default().to_string()),
        Some(tool.to_string()),
        vec![(latest.event_id.as_str(), latest.privacy_layer)],
        1,
        1,
    ))
}

// ---------------------------------------------------------------------------
// HESITATION
// ---------------------------------------------------------------------------

/// A directive followed within 30 s by undo, dismiss, long hover or no-action.
pub fn hesitation(ctx: &MatchContext<'_>) -> Option<MomentCandidate> {
    let latest = ctx.latest()?;
    if !latest.as_action()?.is_hesitation() {
        return None;
    }
    let window = TimeDelta::seconds(HESITATION_WINDOW_SECS);
    let capability = latest.capability_or_default();

    let responds_to = |event: &AgentEvent, directive: &AgentEvent| -> bool {
        let shown = directive.as_directive();
        match event.correlation_id.as_deref() {
            Some(cid) => {
                directive.event_id == cid
                    || shown.and_then(|d| d.directive_id.as_deref()) == Some(cid)
            }
            None => directive.capability_or_default() == event.capability_or_default(),
        }
    };

    let directive_pos = ctx.window.iter().rposition(|e| {
        e.as_directive().is_some()
            && ctx.now - e.occurred_at <= window
            && responds_to(latest, e)
    })?;
    let directive = &ctx.window[directive_pos];

    let mut triggers = vec![(directive.event_id.as_str(), directive.privacy_layer)];
    for event in &ctx.window[directive_pos + 1..] {
        if event.as_action().is_some_and(|a| a.is_hesitation()) && responds_to(event, directive) {
            triggers.push((&event.event_id, event.privacy_layer));
        }
    }
    let observed = triggers.len() - 1;
    if observed < HESITATION_THRESHOLD {
        return None;
    }

    let capability = directive
        .capability()
        .unwrap_or(capability)
        .to_string();
    Some(candidate(
        MomentType::Hesitation,
        Some(capability),
        latest.tool_id().map(str::to_string),
        triggers,
        observed,
        HESITATION_THRESHOLD,
    ))
}

// ---------------------------------------------------------------------------
// OVERLOAD
// ---------------------------------------------------------------------------

/// Five or more directives shown within 60 s, checked as each directive lands.
pub fn overload(ctx: &MatchContext<'_>) -> Option<MomentCandidate> {
    let latest = ctx.latest()?;
    latest.as_directive()?;
    let window = TimeDelta::seconds(OVERLOAD_WINDOW_SECS);

    let shown: Vec<(&str, u8)> = ctx
        .window
        .iter()
        .filter(|e| e.as_directive().is_some() && ctx.now - e.occurred_at <= window)
        .map(|e| (e.event_id.as_str(), e.privacy_layer))
        .collect();
    if shown.len() < OVERLOAD_THRESHOLD {
        return None;
    }

    let observed = shown.len();
    Some(candidate(
        MomentType::Overload,
        Some(latest.capability_or_default().to_string()),
        None,
        shown,
        observed,
        OVERLOAD_THRESHOLD,
    ))
}

// ---------------------------------------------------------------------------
// CONFIDENCE_CLIMB
// ---------------------------------------------------------------------------

/// At least five accepted directives, at >= 80 % acceptance, since the
/// capability's previous climb.
pub fn confidence_climb(ctx: &MatchContext<'_>) -> Option<MomentCandidate> {
    let latest = ctx.latest()?;
    let completed = ctx.history.pair_completed_by(&latest.event_id)?;
    let capability = completed.capability.as_str();

    let since = ctx.last_moment(MomentType::ConfidenceClimb, capability);
    let pairs = pairs_since(ctx.history, capability, since);
    let accepted: Vec<&DirectiveRecord> = pairs
        .iter()
        .copied()
        .filter(|d| d.response.as_ref().is_some_and(|r| r.action.is_accept()))
        .collect();

    let rate = accepted.len() as f64 / pairs.len() as f64;
    if accepted.len() < CLIMB_MIN_PAIRS || rate + EPSILON < CLIMB_MIN_ACCEPT_RATE {
        return None;
    }

    let triggers = pair_triggers(&accepted);
    Some(candidate(
        MomentType::ConfidenceClimb,
        Some(capability.to_string()),
        None,
        triggers.iter().map(|(id, p)| (id.as_str(), *p)).collect(),
        accepted.len(),
        CLIMB_MIN_PAIRS,
    ))
}

// ---------------------------------------------------------------------------
// TRUST_EROSION
// ---------------------------------------------------------------------------

/// Three HESITATION moments for one capability within 5 minutes, or at
/// least five answered directives with >= 60 % rejected, counted since the
/// capability's previous erosion.
pub fn trust_erosion(ctx: &MatchContext<'_>) -> Option<MomentCandidate> {
    erosion_by_hesitation(ctx, None).or_else(|| erosion_by_rejection(ctx))
}

/// The hesitation branch of `trust_erosion` for the capability of this
/// pass's HESITATION, counting that hesitation as already fired. Only valid
/// once the hesitation is known to clear hysteresis.
pub fn trust_erosion_with(
    ctx: &MatchContext<'_>,
    hesitation: &MomentCandidate,
) -> Option<MomentCandidate> {
    erosion_by_hesitation(ctx, Some(hesitation))
}

/// One hesitation counted toward erosion: its triggers and privacy layer.
type Counted<'a> = (&'a [String], u8);

fn erosion_by_hesitation(
    ctx: &MatchContext<'_>,
    pending: Option<&MomentCandidate>,
) -> Option<MomentCandidate> {
    let window = TimeDelta::seconds(EROSION_WINDOW_SECS);
    let mut by_capability: BTreeMap<&str, Vec<Counted<'_>>> = BTreeMap::new();
    let after_last_erosion = |capability: &str, at: DateTime<Utc>| {
        ctx.last_moment(MomentType::TrustErosion, capability)
            .is_none_or(|since| at > since)
    };

    for moment in ctx.moments {
        if moment.moment_type != MomentType::Hesitation || ctx.now - moment.detected_at > window {
            continue;
        }
        let Some(capability) = moment.capability.as_deref() else {
            continue;
        };
        if pending.is_some_and(|p| p.capability.as_deref() != Some(capability)) {
            continue;
        }
        if after_last_erosion(capability, moment.detected_at) {
            by_capability
                .entry(capability)
                .or_default()
                .push((&moment.trigger_events, moment.privacy_layer));
        }
    }
    if let Some(pending) = pending.filter(|p| p.moment_type == MomentType::Hesitation)
        && let Some(capability) = pending.capability.as_deref()
        && after_last_erosion(capability, ctx.now)
    {
        by_capability
            .entry(capability)
            .or_default()
            .push((&pending.trigger_events, pending.privacy_layer));
    }

    // most hesitations wins; ties go to the lexically first capability
    let (capability, hesitations) = by_capability
        .into_iter()
        .filter(|(_, hs)| hs.len() >= EROSION_MIN_HESITATIONS)
        .max_by(|(cap_a, a), (cap_b, b)| a.len().cmp(&b.len()).then_with(|| cap_b.cmp(cap_a)))?;

    let mut triggers: Vec<(&str, u8)> = Vec::new();
    for (ids, privacy_layer) in &hesitations {
        for id in ids.iter() {
            if !triggers.iter().any(|(t, _)| *t == id.as_str()) {
                triggers.push((id.as_str(), *privacy_layer));
            }
        }
    }
    Some(candidate(
        MomentType::TrustErosion,
        Some(capability.to_string()),
        None,
        triggers,
        hesitations.len(),
        EROSION_MIN_HESITATIONS,
    ))
}

fn erosion_by_rejection(ctx: &MatchContext<'_>) -> Option<MomentCandidate> {
    let latest = ctx.latest()?;
    let completed = ctx.history.pair_completed_by(&latest.event_id)?;
    let capability = completed.capability.as_str();

    let since = ctx.last_moment(MomentType::TrustErosion, capability);
    let pairs = pairs_since(ctx.history, capability, since);
    if pairs.len() < EROSION_MIN_PAIRS {
        return None;
    }
    let rejected = pairs
        .iter()
        .filter(|d| d.response.as_ref().is_some_and(|r| r.action.is_rejection()))
        .count();
    let rate = rejected as f64 / pairs.len() as f64;
    if rate + EPSILON < EROSION_MIN_REJECT_RATE {
        return None;
    }

    let triggers = pair_triggers(&pairs);
    Some(candidate(
        MomentType::TrustErosion,
        Some(capability.to_string()),
        None,
        triggers.iter().map(|(id, p)| (id.as_str(), *p)).collect(),
        pairs.len(),
        EROSION_MIN_PAIRS,
    ))
}

// ---------------------------------------------------------------------------
// WORKFLOW_SHIFT
// ---------------------------------------------------------------------------

/// Tools common to both orders whose relative position differs.
pub fn reordered_steps(baseline: &[String], current: &[String]) -> usize {
    let common_base: Vec<&String> = baseline.iter().filter(|t| current.contains(t)).collect();
    let common_current: Vec<&String> = current.iter().filter(|t| baseline.contains(t)).collect();
    common_base
        .iter()
        .zip(common_current.iter())
        .filter(|(a, b)| a != b)
        .count()
}

fn relative_delta(value: f64, baseline: f64) -> Option<f64> {
    (baseline > EPSILON).then(|| (value - baseline).abs() / baseline)
}

/// Evaluated when a work segment closes, against the segments closed in the
/// preceding 7 days.
pub fn workflow_shift(ctx: &MatchContext<'_>) -> Option<MomentCandidate> {
    let latest = ctx.latest()?;
    let closed = ctx.history.segment_closed_by(&latest.event_id)?;
    let segments = ctx.history.segments();
    let horizon = closed.end - TimeDelta::seconds(WORKFLOW_BASELINE_SECS);
    let baseline: Vec<&WorkSegment> = segments[..segments.len().saturating_sub(1)]
        .iter()
        .filter(|s| s.end >= horizon)
        .collect();
    if baseline.len() < WORKFLOW_MIN_BASELINE_SEGMENTS {
        return None;
    }

    let n = baseline.len() as f64;
    let mean_length = baseline.iter().map(|s| s.length_secs()).sum::<f64>() / n;
    let mean_gap = baseline.iter().map(|s| s.mean_gap_secs).sum::<f64>() / n;

    let mut conditions = 0;
    if relative_delta(closed.length_secs(), mean_length).is_some_and(|d| d > WORKFLOW_LENGTH_DELTA) {
        conditions += 1;
    }
    if let Some(reference) = baseline.last()
        && reordered_steps(&reference.tool_order, &closed.tool_order) >= WORKFLOW_MIN_REORDERED
    {
        conditions += 1;
    }
    if relative_delta(closed.mean_gap_secs, mean_gap).is_some_and(|d| d > WORKFLOW_GAP_DELTA) {
        conditions += 1;
    }
    if conditions == 0 {
        return None;
    }

    Some(candidate(
        MomentType::WorkflowShift,
        None,
        None,
        vec![(latest.event_id.as_str(), latest.privacy_layer)],
        conditions,
        1,
    ))
}

// ---------------------------------------------------------------------------
// MASTERY_PLATEAU
// ---------------------------------------------------------------------------

/// Twenty or more high-quality completions of one tool within 30 days, at
/// >= 85 % consistency.
pub fn mastery_plateau(ctx: &MatchContext<'_>) -> Option<MomentCandidate> {
    let latest = ctx.latest()?;
    let EventKind::AnalysisCompleted(completed) = &latest.kind else {
        return None;
    };
    let window = TimeDelta::seconds(MASTERY_WINDOW_SECS);
    let recent: Vec<_> = ctx
        .history
        .completions(&completed.tool_id)
        .iter()
        .filter(|c| ctx.now - c.at <= window)
        .collect();
    let qualifying: Vec<(&str, u8)> = recent
        .iter()
        .filter(|c| c.quality.is_some_and(|q| q + EPSILON >= MASTERY_MIN_QUALITY))
        .map(|c| (c.event_id.as_str(), c.privacy_layer))
        .collect();

    if qualifying.len() < MASTERY_THRESHOLD {
        return None;
    }
    let consistency = qualifying.len() as f64 / recent.len() as f64;
    if consistency + EPSILON < MASTERY_MIN_CONSISTENCY {
        return None;
    }

    let observed = qualifying.len();
    Some(candidate(
        MomentType::MasteryPlateau,
        Some(latest.capability_or_default().to_string()),
        Some(completed.tool_id.clone()),
        qualifying,
        observed,
        MASTERY_THRESHOLD,
    ))
}
