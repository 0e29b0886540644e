use chrono::TimeDelta;

use crate::config::WindowConfig;
use crate::event::AgentEvent;

/// Ordered, append-only buffer of one session's recent events.
///
/// The oldest event is evicted only when both bounds are exceeded: the
/// buffer holds more than `max_events` AND that event is older than `span`
/// relative to the newest one. A burst inside the span is therefore kept
/// whole, so short-window matchers never miss an event.
#[derive(Clone, Debug)]
pub struct SessionWindow {
    events: Vec<AgentEvent>,
    span: TimeDelta,
    max_events: usize,
}

impl SessionWindow {
    pub fn new(config: &WindowConfig) -> Self {
        Self {
            events: Vec::new(),
            span: TimeDelta::seconds(config.span_secs.min(i64::MAX as u64) as i64),
            max_events: config.max_events.max(1),
        }
    }

    /// Append and evict. Returns the number of events evicted.
    pub fn push(&mut self, event: AgentEvent) -> usize {
        let newest = event.occurred_at;
        self.events.push(event);

        let mut evict = 0;
        while self.events.len() - evict > self.max_events
            && newest - self.events[evict].occurred_at > self.span
        {
            evict += 1;
        }
        if evict > 0 {
            self.events.drain(..evict);
        }
        evict
    }

    pub fn events(&self) -> &[AgentEvent] {
        &self.events
    }

    pub fn latest(&self) -> Option<&AgentEvent> {
        self.events.last()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
