//! Long-range session evidence the bounded window cannot hold: first tool
//! sightings, directive/response pairs, analysis completions and work
//! segments.
//!
//! History is folded forward by the ingestion path only. Matchers read it
//! and never write, which keeps every matcher a pure function of
//! (window, history, moment log, now).
//!
//! Everything is bounded by event time: directives and known event ids
//! expire after `HISTORY_HORIZON_SECS`, completions after the mastery
//! window, segments after two workflow baselines.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};

use crate::constants::{
    HISTORY_HORIZON_SECS, MASTERY_WINDOW_SECS, PAIRING_WINDOW_SECS, SEGMENT_IDLE_SECS,
    WORKFLOW_BASELINE_SECS,
};
use crate::event::{ActionKind, AgentEvent, EventKind, UserAction};

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub event_id: String,
    pub at: DateTime<Utc>,
    pub action: ActionKind,
    pub privacy_layer: u8,
}

/// A directive and, once the user reacted, the reaction.
#[derive(Clone, Debug, PartialEq)]
pub struct DirectiveRecord {
    pub event_id: String,
    pub directive_id: Option<String>,
    pub capability: String,
    pub shown_at: DateTime<Utc>,
    pub privacy_layer: u8,
    pub response: Option<Response>,
}

impl DirectiveRecord {
    fn answers(&self, correlation_id: &str) -> bool {
        self.event_id == correlation_id || self.directive_id.as_deref() == Some(correlation_id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    pub event_id: String,
    pub at: DateTime<Utc>,
    pub quality: Option<f64>,
    pub privacy_layer: u8,
}

/// A closed stretch of continuous activity.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkSegment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub event_count: usize,
    pub mean_gap_secs: f64,
    /// Tools in order of first use within the segment.
    pub tool_order: Vec<String>,
}

impl WorkSegment {
    pub fn length_secs(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64 / 1000.0
    }
}

#[derive(Clone, Debug)]
struct OpenSegment {
    start: DateTime<Utc>,
    last: DateTime<Utc>,
    event_count: usize,
    gap_total_secs: f64,
    tool_order: Vec<String>,
}

impl OpenSegment {
    fn begin(event: &AgentEvent) -> Self {
        let mut segment = Self {
            start: event.occurred_at,
            last: event.occurred_at,
            event_count: 0,
            gap_total_secs: 0.0,
            tool_order: Vec::new(),
        };
        segment.add(event);
        segment
    }

    fn add(&mut self, event: &AgentEvent) {
        if self.event_count > 0 {
            self.gap_total_secs += (event.occurred_at - self.last).num_milliseconds() as f64 / 1000.0;
        }
        self.event_count += 1;
        self.last = event.occurred_at;
        if let Some(tool) = event.user_tool()
            && !self.tool_order.iter().any(|t| t == tool)
        {
            self.tool_order.push(tool.to_string());
        }
    }

    fn close(self) -> WorkSegment {
        let gaps = self.event_count.saturating_sub(1);
        WorkSegment {
            start: self.start,
            end: self.last,
            event_count: self.event_count,
            mean_gap_secs: if gaps == 0 {
                0.0
            } else {
                self.gap_total_secs / gaps as f64
            },
            tool_order: self.tool_order,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionHistory {
    first_seen: BTreeMap<String, String>,
    directives: Vec<DirectiveRecord>,
    completions: BTreeMap<String, Vec<Completion>>,
    segments: Vec<WorkSegment>,
    open_segment: Option<OpenSegment>,
    last_closed_by: Option<String>,
    privacy: HashMap<String, u8>,
    /// Keys of `privacy` in arrival order.
    arrivals: VecDeque<(DateTime<Utc>, String)>,
}

impl SessionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one accepted event into the history.
    pub fn observe(&mut self, event: &AgentEvent) {
        self.expire(event.occurred_at);
        self.privacy
            .insert(event.event_id.clone(), event.privacy_layer);
        self.arrivals
            .push_back((event.occurred_at, event.event_id.clone()));
        self.last_closed_by = None;
        self.track_segment(event);

        if let Some(tool) = event.user_tool() {
            self.first_seen
                .entry(tool.to_string())
                .or_insert_with(|| event.event_id.clone());
        }

        match &event.kind {
            EventKind::DirectiveShown(directive) => self.directives.push(DirectiveRecord {
                event_id: event.event_id.clone(),
                directive_id: directive.directive_id.clone(),
                capability: event.capability_or_default().to_string(),
                shown_at: event.occurred_at,
                privacy_layer: event.privacy_layer,
                response: None,
            }),
            EventKind::UserAction(action) => self.pair_response(event, action),
            EventKind::AnalysisCompleted(completed) => {
                let horizon = event.occurred_at - TimeDelta::seconds(MASTERY_WINDOW_SECS);
                let entries = self.completions.entry(completed.tool_id.clone()).or_default();
                entries.retain(|c| c.at >= horizon);
                entries.push(Completion {
                    event_id: event.event_id.clone(),
                    at: event.occurred_at,
                    quality: completed.quality,
                    privacy_layer: event.privacy_layer,
                });
            }
            _ => {}
        }
    }

    /// Drop directives and event ids from before the horizon. Both are in
    /// event-time order, so only the front is ever stale.
    fn expire(&mut self, now: DateTime<Utc>) {
        let horizon = now - TimeDelta::seconds(HISTORY_HORIZON_SECS);
        while self.arrivals.front().is_some_and(|(at, _)| *at < horizon) {
            if let Some((_, id)) = self.arrivals.pop_front() {
                self.privacy.remove(&id);
            }
        }
        let stale = self.directives.partition_point(|d| d.shown_at < horizon);
        if stale > 0 {
            self.directives.drain(..stale);
        }
    }

    /// Attach a decisive action to the directive it answers: the correlated
    /// one, else the latest unanswered directive of the same capability
    /// shown within the pairing window.
    fn pair_response(&mut self, event: &AgentEvent, action: &UserAction) {
        if matches!(action.action, ActionKind::Hover | ActionKind::Other) {
            return;
        }
        let target = match event.correlation_id.as_deref() {
            Some(cid) => self.directives.iter().rposition(|d| d.answers(cid)),
            None => {
                let capability = event.capability_or_default();
                let window = TimeDelta::seconds(PAIRING_WINDOW_SECS);
                self.directives.iter().rposition(|d| {
                    d.response.is_none()
                        && d.capability == capability
                        && event.occurred_at - d.shown_at <= window
                })
            }
        };
        if let Some(i) = target
            && self.directives[i].response.is_none()
        {
            self.directives[i].response = Some(Response {
                event_id: event.event_id.clone(),
                at: event.occurred_at,
                action: action.action,
                privacy_layer: event.privacy_layer,
            });
        }
    }

    fn track_segment(&mut self, event: &AgentEvent) {
        match event.kind {
            EventKind::SessionStarted => {
                self.close_segment(&event.event_id);
                self.open_segment = Some(OpenSegment::begin(event));
            }
            EventKind::SessionEnded => {
                match self.open_segment.as_mut() {
                    Some(open) => open.add(event),
                    None => self.open_segment = Some(OpenSegment::begin(event)),
                }
                self.close_segment(&event.event_id);
            }
            _ => {
                let idle = TimeDelta::seconds(SEGMENT_IDLE_SECS);
                let stale = self
                    .open_segment
                    .as_ref()
                    .is_some_and(|open| event.occurred_at - open.last > idle);
                if stale {
                    self.close_segment(&event.event_id);
                }
                match self.open_segment.as_mut() {
                    Some(open) => open.add(event),
                    None => self.open_segment = Some(OpenSegment::begin(event)),
                }
            }
        }

        let horizon = event.occurred_at - TimeDelta::seconds(2 * WORKFLOW_BASELINE_SECS);
        self.segments.retain(|s| s.end >= horizon);
    }

    fn close_segment(&mut self, closing_event_id: &str) {
        let Some(open) = self.open_segment.take() else {
            return;
        };
        let segment = open.close();
        if segment.event_count >= 2 {
            self.segments.push(segment);
            self.last_closed_by = Some(closing_event_id.to_string());
        }
    }

    // --- Read side ---

    pub fn first_seen_event(&self, tool: &str) -> Option<&str> {
        self.first_seen.get(tool).map(String::as_str)
    }

    pub fn tools_seen(&self) -> usize {
        self.first_seen.len()
    }

    pub fn directives(&self) -> &[DirectiveRecord] {
        &self.directives
    }

    /// Directive whose response is `event_id`, if that event completed a pair.
    pub fn pair_completed_by(&self, event_id: &str) -> Option<&DirectiveRecord> {
        self.directives
            .iter()
            .rev()
            .find(|d| d.response.as_ref().is_some_and(|r| r.event_id == event_id))
    }

    pub fn completions(&self, tool: &str) -> &[Completion] {
        self.completions.get(tool).map_or(&[], Vec::as_slice)
    }

    pub fn segments(&self) -> &[WorkSegment] {
        &self.segments
    }

    /// The segment this event just closed, if any.
    pub fn segment_closed_by(&self, event_id: &str) -> Option<&WorkSegment> {
        if self.last_closed_by.as_deref() == Some(event_id) {
            self.segments.last()
        } else {
            None
        }
    }

    pub fn privacy_of(&self, event_id: &str) -> Option<u8> {
        self.privacy.get(event_id).copied()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.privacy.contains_key(event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AnalysisStarted, DirectiveShown};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_772_000_000 + secs, 0).unwrap()
    }

    fn directive(id: &str, cap: &str, secs: i64) -> AgentEvent {
        AgentEvent::new(
            "s",
            EventKind::DirectiveShown(DirectiveShown {
                directive_id: Some(format!("d-{id}")),
                capability: Some(cap.into()),
                tool_id: None,
            }),
            t(secs),
        )
        .with_id(id)
    }

    fn action(id: &str, cap: &str, kind: ActionKind, secs: i64) -> AgentEvent {
        AgentEvent::new(
            "s",
            EventKind::UserAction(UserAction {
                action: kind,
                capability: Some(cap.into()),
                tool_id: None,
                hover_ms: None,
            }),
            t(secs),
        )
        .with_id(id)
    }

    fn started(id: &str, tool: &str, secs: i64) -> AgentEvent {
        AgentEvent::new(
            "s",
            EventKind::AnalysisStarted(AnalysisStarted {
                tool_id: tool.into(),
                capability: None,
            }),
            t(secs),
        )
        .with_id(id)
    }

    #[test]
    fn test_first_seen_is_sticky() {
        let mut h = SessionHistory::new();
        h.observe(&started("a", "x", 0));
        h.observe(&started("b", "x", 5));
        h.observe(&started("c", "y", 6));
        assert_eq!(h.first_seen_event("x"), Some("a"));
        assert_eq!(h.first_seen_event("y"), Some("c"));
        assert_eq!(h.tools_seen(), 2);
    }

    #[test]
    fn test_pairs_by_capability_within_window() {
        let mut h = SessionHistory::new();
        h.observe(&directive("d1", "cam", 0));
        h.observe(&action("a1", "cam", ActionKind::Accept, 5));
        assert_eq!(h.pair_completed_by("a1").map(|d| d.event_id.as_str()), Some("d1"));

        // second action has nothing left to answer
        h.observe(&action("a2", "cam", ActionKind::Dismiss, 6));
        assert!(h.pair_completed_by("a2").is_none());

        // stale directive does not pair
        h.observe(&directive("d2", "cam", 100));
        h.observe(&action("a3", "cam", ActionKind::Accept, 200));
        assert!(h.pair_completed_by("a3").is_none());
    }

    #[test]
    fn test_pairs_by_correlation_id() {
        let mut h = SessionHistory::new();
        h.observe(&directive("d1", "cam", 0));
        h.observe(&directive("d2", "other", 1));
        h.observe(&action("a1", "cam", ActionKind::Undo, 500).with_correlation("d-d1"));
        let record = h.pair_completed_by("a1").unwrap();
        assert_eq!(record.event_id, "d1");
        assert_eq!(record.response.as_ref().unwrap().action, ActionKind::Undo);
    }

    #[test]
    fn test_hover_does_not_claim_a_directive() {
        let mut h = SessionHistory::new();
        h.observe(&directive("d1", "cam", 0));
        h.observe(&action("h1", "cam", ActionKind::Hover, 1));
        h.observe(&action("a1", "cam", ActionKind::Accept, 2));
        assert_eq!(h.pair_completed_by("a1").map(|d| d.event_id.as_str()), Some("d1"));
    }

    #[test]
    fn test_idle_gap_closes_segment() {
        let mut h = SessionHistory::new();
        h.observe(&started("a", "x", 0));
        h.observe(&started("b", "y", 60));
        h.observe(&started("c", "x", 60 + SEGMENT_IDLE_SECS + 1));
        let closed = h.segment_closed_by("c").unwrap();
        assert_eq!(closed.event_count, 2);
        assert_eq!(closed.length_secs(), 60.0);
        assert_eq!(closed.tool_order, ["x", "y"]);
        assert_eq!(closed.mean_gap_secs, 60.0);

        h.observe(&started("d", "x", 60 + SEGMENT_IDLE_SECS + 2));
        assert!(h.segment_closed_by("d").is_none());
    }

    #[test]
    fn test_session_end_closes_segment() {
        let mut h = SessionHistory::new();
        h.observe(&AgentEvent::new("s", EventKind::SessionStarted, t(0)).with_id("s0"));
        h.observe(&started("a", "x", 10));
        h.observe(&AgentEvent::new("s", EventKind::SessionEnded, t(40)).with_id("s1"));
        let closed = h.segment_closed_by("s1").unwrap();
        assert_eq!(closed.event_count, 3);
        assert_eq!(closed.length_secs(), 40.0);
        assert_eq!(h.segments().len(), 1);
    }

    #[test]
    fn test_old_directives_and_ids_expire() {
        let mut h = SessionHistory::new();
        h.observe(&directive("d1", "cam", 0).with_privacy_layer(2));
        h.observe(&action("a1", "cam", ActionKind::Dismiss, 5));
        h.observe(&directive("d2", "cam", 100));
        assert_eq!(h.directives().len(), 2);

        h.observe(&started("late", "x", HISTORY_HORIZON_SECS + 50));
        let kept: Vec<&str> = h.directives().iter().map(|d| d.event_id.as_str()).collect();
        assert_eq!(kept, ["d2"]);
        assert_eq!(h.privacy_of("d1"), None);
        assert!(!h.contains("a1"));
        assert!(h.contains("d2"));
        assert!(h.contains("late"));
        assert!(h.pair_completed_by("a1").is_none());
    }

    #[test]
    fn test_privacy_lookup() {
        let mut h = SessionHistory::new();
        h.observe(&started("a", "x", 0).with_privacy_layer(3));
        assert_eq!(h.privacy_of("a"), Some(3));
        assert!(h.contains("a"));
        assert!(!h.contains("zzz"));
    }
}
