//! Detection thresholds, windows and rule constants.
//!
//! All durations are in seconds and are compared against event timestamps,
//! never the wall clock.

/// Numerical epsilon for threshold comparisons on accumulated floats
pub const EPSILON: f64 = 1e-9;

/// Neutral value and neutral confidence for every UWSM dimension
pub const NEUTRAL: f64 = 0.5;

/// Confidence at exactly the occurrence threshold
pub const CONFIDENCE_AT_THRESHOLD: f64 = 0.6;

/// Confidence gained per occurrence beyond the threshold
pub const CONFIDENCE_STEP: f64 = 0.05;

/// Ceiling for matcher confidence
pub const CONFIDENCE_CAP: f64 = 0.95;

// --- Matcher windows and thresholds ---

pub const HESITATION_WINDOW_SECS: i64 = 30;
pub const HESITATION_THRESHOLD: usize = 1;

/// A hover at least this long counts as hesitation
pub const LONG_HOVER_MS: u64 = 3_000;

pub const OVERLOAD_WINDOW_SECS: i64 = 60;
pub const OVERLOAD_THRESHOLD: usize = 5;

pub const CLIMB_MIN_PAIRS: usize = 5;
pub const CLIMB_MIN_ACCEPT_RATE: f64 = 0.8;

pub const EROSION_WINDOW_SECS: i64 = 5 * 60;
pub const EROSION_MIN_HESITATIONS: usize = 3;
pub const EROSION_MIN_PAIRS: usize = 5;
pub const EROSION_MIN_REJECT_RATE: f64 = 0.6;

pub const WORKFLOW_BASELINE_SECS: i64 = 7 * 24 * 3600;
pub const WORKFLOW_MIN_BASELINE_SEGMENTS: usize = 2;
pub const WORKFLOW_LENGTH_DELTA: f64 = 0.5;
pub const WORKFLOW_MIN_REORDERED: usize = 3;
pub const WORKFLOW_GAP_DELTA: f64 = 0.3;

/// Idle time that closes a work segment
pub const SEGMENT_IDLE_SECS: i64 = 30 * 60;

pub const MASTERY_WINDOW_SECS: i64 = 30 * 24 * 3600;
pub const MASTERY_THRESHOLD: usize = 20;
pub const MASTERY_MIN_QUALITY: f64 = 0.9;
pub const MASTERY_MIN_CONSISTENCY: f64 = 0.85;

/// Directives and event ids older than this are dropped from session
/// history. Matches the longest matcher window.
pub const HISTORY_HORIZON_SECS: i64 = MASTERY_WINDOW_SECS;

/// A response without correlation pairs with a directive shown at most this long ago
pub const PAIRING_WINDOW_SECS: i64 = 30;

/// Capability used when an event names neither a capability nor a tool
pub const DEFAULT_CAPABILITY: &str = "default";

/// Highest privacy layer an event may carry
pub const MAX_PRIVACY_LAYER: u8 = 5;

/// Supported major version of the event envelope
pub const SUPPORTED_SCHEMA_MAJOR: u64 = 1;

/// Version stamped on events built in-process
pub const CURRENT_SCHEMA_VERSION: &str = "1.0";
