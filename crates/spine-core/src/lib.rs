//! Agentic event spine.
//!
//! Turns a stream of user/tool interaction events into named behavioral
//! moments, a bounded per-session working-style model (UWSM) and an
//! auditable decision about what an assistive agent may do next: stay
//! silent, show a directive, or act.
//!
//! Zero I/O. All time comes from event timestamps, so replaying the same
//! log always yields the same report.

pub mod config;
pub mod constants;
pub mod cooldown;
pub mod error;
pub mod event;
pub mod eventlog;
pub mod history;
pub mod matchers;
pub mod moment;
pub mod policy;
pub mod replay;
pub mod scoreboard;
pub mod spine;
pub mod uwsm;
pub mod window;

pub use config::{PolicyConfig, RetentionConfig, SpineConfig, UwsmConfig, WindowConfig};
pub use cooldown::{
    CooldownRecord, CooldownRule, CooldownScope, CooldownTracker, Suppression, rule_for,
};
pub use error::{Result, SpineError};
pub use event::{
    ActionKind, AgentEvent, AnalysisCompleted, AnalysisStarted, DirectiveShown, EventEnvelope,
    EventKind, EventSource, OperatorModeSet, PreferenceStated, UserAction,
};
pub use eventlog::parse_event_log;
pub use history::SessionHistory;
pub use matchers::{MATCHERS, MatchContext, evaluate_all, trust_erosion_with};
pub use moment::{Moment, MomentCandidate, MomentType, PRIORITY_ORDER};
pub use policy::{
    Decision, DecisionAction, DecisionTrigger, Diagnostic, GateCheck, ModeTransition,
    OperatingMode, PolicyEngine, SuppressedBy, TransitionReason,
};
pub use replay::{
    REPORT_SCHEMA_VERSION, Report, ReplayMode, ReplayOptions, SessionReport, check_report_schema,
    replay,
};
pub use scoreboard::Scoreboard;
pub use spine::{PassOutcome, SessionState, Spine, SuppressedCandidate};
pub use uwsm::{Dimension, DimensionState, UwsmLogEntry, UwsmState, UwsmUpdater};
pub use window::SessionWindow;
