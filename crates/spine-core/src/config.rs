//! Tunables for the spine. Every section defaults independently, so a config
//! file only needs the keys it changes.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpineConfig {
    pub window: WindowConfig,
    pub uwsm: UwsmConfig,
    pub policy: PolicyConfig,
    pub retention: RetentionConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Sliding time span of the per-session window.
    pub span_secs: u64,
    /// Count bound; an event past it is evicted once it is also outside the span.
    pub max_events: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            span_secs: 600,
            max_events: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UwsmConfig {
    /// Half-life of dimension confidence decaying back toward neutral.
    pub half_life_hours: f64,
    /// Share of the remaining headroom a single sample adds to confidence.
    pub sample_gain: f64,
    /// Fraction of confidence removed from every dimension on WORKFLOW_SHIFT.
    pub workflow_shift_confidence_cut: f64,
}

impl Default for UwsmConfig {
    fn default() -> Self {
        Self {
            half_life_hours: 72.0,
            sample_gain: 0.2,
            workflow_shift_confidence_cut: 0.2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Conservative policy: WORKFLOW_SHIFT drops every capability to Shadow.
    pub demote_on_workflow_shift: bool,
    pub overload_recovery_secs: u64,
    pub gate_trust: f64,
    pub gate_automation: f64,
    pub gate_climbs: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            demote_on_workflow_shift: true,
            overload_recovery_secs: 300,
            gate_trust: 0.7,
            gate_automation: 0.6,
            gate_climbs: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// How long a persisted UWSM profile outlives its last update.
    pub uwsm_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { uwsm_days: 30 }
    }
}

impl SpineConfig {
    /// Reject values that would break the [0, 1] invariants downstream.
    pub fn validate(&self) -> Result<(), String> {
        let unit = |name: &str, v: f64| {
            if v.is_finite() && (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(format!("{name} must be within [0, 1], got {v}"))
            }
        };
        unit("uwsm.sample_gain", self.uwsm.sample_gain)?;
        unit(
            "uwsm.workflow_shift_confidence_cut",
            self.uwsm.workflow_shift_confidence_cut,
        )?;
        unit("policy.gate_trust", self.policy.gate_trust)?;
        unit("policy.gate_automation", self.policy.gate_automation)?;
        if !(self.uwsm.half_life_hours.is_finite() && self.uwsm.half_life_hours > 0.0) {
            return Err(format!(
                "uwsm.half_life_hours must be positive, got {}",
                self.uwsm.half_life_hours
            ));
        }
        if self.window.max_events == 0 {
            return Err("window.max_events must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(SpineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_other_defaults() {
        let config: SpineConfig =
            serde_json::from_str(r#"{"policy": {"demote_on_workflow_shift": false}}"#).unwrap();
        assert!(!config.policy.demote_on_workflow_shift);
        assert_eq!(config.policy.overload_recovery_secs, 300);
        assert_eq!(config.window, WindowConfig::default());
    }

    #[test]
    fn test_out_of_range_gain_rejected() {
        let mut config = SpineConfig::default();
        config.uwsm.sample_gain = 1.5;
        assert!(config.validate().is_err());
        config.uwsm.sample_gain = 0.2;
        config.uwsm.half_life_hours = 0.0;
        assert!(config.validate().is_err());
    }
}
