//! Hysteresis: minimum spacing plus per-session and per-day caps, so no
//! matcher can fire unboundedly.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::moment::MomentType;

/// What a type's spacing and caps are counted against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CooldownScope {
    Session,
    Tool,
    Capability,
}

impl CooldownScope {
    /// The key a moment with this tool and capability is counted under.
    /// `None` means the whole session.
    pub fn key<'a>(self, tool: Option<&'a str>, capability: Option<&'a str>) -> Option<&'a str> {
        match self {
            CooldownScope::Session => None,
            CooldownScope::Tool => tool,
            CooldownScope::Capability => capability,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CooldownRule {
    pub cooldown_secs: i64,
    pub max_per_session: Option<u32>,
    pub max_per_day: Option<u32>,
    pub scope: CooldownScope,
}

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;

pub fn rule_for(moment_type: MomentType) -> CooldownRule {
    use CooldownScope::{Capability, Session, Tool};
    let (cooldown_secs, max_per_session, max_per_day, scope) = match moment_type {
        MomentType::FirstSignal => (0, None, None, Tool),
        MomentType::Hesitation => (60, Some(30), Some(60), Session),
        MomentType::Overload => (5 * 60, Some(12), Some(24), Session),
        MomentType::ConfidenceClimb => (60, Some(10), Some(20), Session),
        // one capability's erosion must not mask another's
        MomentType::TrustErosion => (10 * 60, Some(6), Some(12), Capability),
        MomentType::WorkflowShift => (DAY, Some(3), Some(1), Session),
        MomentType::MasteryPlateau => (7 * DAY, Some(5), Some(1), Tool),
    };
    CooldownRule {
        cooldown_secs,
        max_per_session,
        max_per_day,
        scope,
    }
}

/// Why a candidate did not become a moment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suppression {
    Cooldown,
    SessionCap,
    DailyCap,
    /// Lost to a higher-priority candidate in the same pass.
    Priority,
}

impl Suppression {
    pub fn as_str(self) -> &'static str {
        match self {
            Suppression::Cooldown => "cooldown",
            Suppression::SessionCap => "session_cap",
            Suppression::DailyCap => "daily_cap",
            Suppression::Priority => "priority",
        }
    }
}

impl fmt::Display for Suppression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownRecord {
    pub last_fired_at: DateTime<Utc>,
    /// Fires in this session.
    pub count_in_window: u32,
    /// Fires on the UTC date of `last_fired_at`.
    pub count_today: u32,
}

/// One session's cooldown table, keyed by (moment type, scope key). The key
/// is the tool id or capability for scoped types and empty otherwise.
/// Callers pass the key from `CooldownScope::key`.
#[derive(Clone, Debug, Default)]
pub struct CooldownTracker {
    records: BTreeMap<(MomentType, String), CooldownRecord>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(moment_type: MomentType, scope: Option<&str>) -> (MomentType, String) {
        let scope = match rule_for(moment_type).scope {
            CooldownScope::Session => String::new(),
            CooldownScope::Tool | CooldownScope::Capability => scope.unwrap_or_default().to_string(),
        };
        (moment_type, scope)
    }

    /// `Ok(())` if the type may fire now, else the first limit it hits.
    pub fn check(
        &self,
        moment_type: MomentType,
        scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), Suppression> {
        let rule = rule_for(moment_type);
        let Some(record) = self.records.get(&Self::key(moment_type, scope)) else {
            return Ok(());
        };

        if rule.cooldown_secs > 0 && now - record.last_fired_at <= TimeDelta::seconds(rule.cooldown_secs) {
            return Err(Suppression::Cooldown);
        }
        if rule
            .max_per_session
            .is_some_and(|cap| record.count_in_window >= cap)
        {
            return Err(Suppression::SessionCap);
        }
        let same_day = now.date_naive() == record.last_fired_at.date_naive();
        if same_day && rule.max_per_day.is_some_and(|cap| record.count_today >= cap) {
            return Err(Suppression::DailyCap);
        }
        Ok(())
    }

    pub fn may_fire(&self, moment_type: MomentType, scope: Option<&str>, now: DateTime<Utc>) -> bool {
        self.check(moment_type, scope, now).is_ok()
    }

    pub fn record_fire(&mut self, moment_type: MomentType, scope: Option<&str>, now: DateTime<Utc>) {
        let key = Self::key(moment_type, scope);
        match self.records.get_mut(&key) {
            Some(record) => {
                if now.date_naive() != record.last_fired_at.date_naive() {
                    record.count_today = 0;
                }
                record.last_fired_at = now;
                record.count_in_window += 1;
                record.count_today += 1;
            }
            None => {
                self.records.insert(
                    key,
                    CooldownRecord {
                        last_fired_at: now,
                        count_in_window: 1,
                        count_today: 1,
                    },
                );
            }
        }
    }

    pub fn record(&self, moment_type: MomentType, scope: Option<&str>) -> Option<&CooldownRecord> {
        self.records.get(&Self::key(moment_type, scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        // 2026-03-01T00:00:00Z
        Utc.timestamp_opt(1_772_323_200 + secs, 0).unwrap()
    }

    #[test]
    fn test_fresh_tracker_allows_everything() {
        let tracker = CooldownTracker::new();
        for ty in MomentType::ALL {
            assert!(tracker.may_fire(ty, Some("x"), t(0)));
        }
    }

    #[test]
    fn test_hesitation_cooldown_boundary() {
        let mut tracker = CooldownTracker::new();
        tracker.record_fire(MomentType::Hesitation, None, t(0));
        assert_eq!(
            tracker.check(MomentType::Hesitation, None, t(20)),
            Err(Suppression::Cooldown)
        );
        assert_eq!(
            tracker.check(MomentType::Hesitation, None, t(60)),
            Err(Suppression::Cooldown)
        );
        assert!(tracker.may_fire(MomentType::Hesitation, None, t(61)));
        // other types are independent
        assert!(tracker.may_fire(MomentType::Overload, None, t(1)));
    }

    #[test]
    fn test_session_cap() {
        let mut tracker = CooldownTracker::new();
        for i in 0..6 {
            tracker.record_fire(MomentType::TrustErosion, None, t(i * 601));
        }
        assert_eq!(
            tracker.check(MomentType::TrustErosion, None, t(10 * 601)),
            Err(Suppression::SessionCap)
        );
    }

    #[test]
    fn test_daily_cap_resets_on_new_utc_date() {
        let mut tracker = CooldownTracker::new();
        tracker.record_fire(MomentType::WorkflowShift, None, t(0));
        // past the 24h cooldown and on a new UTC date
        assert!(tracker.may_fire(MomentType::WorkflowShift, None, t(DAY + 1)));
        tracker.record_fire(MomentType::WorkflowShift, None, t(DAY + 1));
        assert_eq!(tracker.record(MomentType::WorkflowShift, None).unwrap().count_today, 1);
        assert_eq!(tracker.record(MomentType::WorkflowShift, None).unwrap().count_in_window, 2);
    }

    #[test]
    fn test_daily_cap_blocks_same_day() {
        let mut tracker = CooldownTracker::new();
        for i in 0..24 {
            tracker.record_fire(MomentType::Overload, None, t(i * 301));
        }
        // 12 per session trips first
        assert_eq!(
            tracker.check(MomentType::Overload, None, t(25 * 301)),
            Err(Suppression::SessionCap)
        );

        // counts carried over from an earlier session of the same day
        let mut tracker = CooldownTracker::new();
        tracker.records.insert(
            (MomentType::Hesitation, String::new()),
            CooldownRecord {
                last_fired_at: t(0),
                count_in_window: 2,
                count_today: 60,
            },
        );
        assert_eq!(
            tracker.check(MomentType::Hesitation, None, t(120)),
            Err(Suppression::DailyCap)
        );
        assert!(tracker.may_fire(MomentType::Hesitation, None, t(DAY)));
    }

    #[test]
    fn test_per_tool_scope() {
        let mut tracker = CooldownTracker::new();
        tracker.record_fire(MomentType::MasteryPlateau, Some("x"), t(0));
        assert!(!tracker.may_fire(MomentType::MasteryPlateau, Some("x"), t(3600)));
        assert!(tracker.may_fire(MomentType::MasteryPlateau, Some("y"), t(3600)));

        // session-scoped types ignore the tool
        tracker.record_fire(MomentType::Hesitation, Some("x"), t(0));
        assert!(!tracker.may_fire(MomentType::Hesitation, Some("y"), t(10)));
    }

    #[test]
    fn test_trust_erosion_scoped_per_capability() {
        let mut tracker = CooldownTracker::new();
        tracker.record_fire(MomentType::TrustErosion, Some("a"), t(0));
        assert_eq!(
            tracker.check(MomentType::TrustErosion, Some("a"), t(120)),
            Err(Suppression::Cooldown)
        );
        assert!(tracker.may_fire(MomentType::TrustErosion, Some("b"), t(120)));

        let scope = rule_for(MomentType::TrustErosion).scope;
        assert_eq!(scope.key(Some("tool"), Some("a")), Some("a"));
        assert_eq!(CooldownScope::Session.key(Some("tool"), Some("a")), None);
    }

    #[test]
    fn test_first_signal_unbounded() {
        let mut tracker = CooldownTracker::new();
        for i in 0..100 {
            tracker.record_fire(MomentType::FirstSignal, Some("x"), t(i));
        }
        assert!(tracker.may_fire(MomentType::FirstSignal, Some("x"), t(100)));
    }
}
