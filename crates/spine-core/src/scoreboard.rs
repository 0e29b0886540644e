//! Read-only aggregation over replay reports.

use std::collections::BTreeMap;
use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::moment::MomentType;
use crate::policy::DecisionAction;
use crate::replay::Report;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Scoreboard {
    pub reports: usize,
    pub sessions: usize,
    pub moment_distribution: BTreeMap<MomentType, usize>,
    pub decision_distribution: BTreeMap<DecisionAction, usize>,
    /// Sessions where at least one directive would have been shown.
    pub sessions_with_intervention: usize,
    pub gate_suppressed: usize,
    /// Mean over sessions of the UWSM confidence delta; 0 with no sessions.
    pub mean_confidence_delta: f64,
}

impl Scoreboard {
    pub fn from_reports(reports: &[Report]) -> Self {
        let mut board = Scoreboard {
            reports: reports.len(),
            ..Scoreboard::default()
        };
        let mut delta_sum = 0.0;

        for session in reports.iter().flat_map(|r| r.sessions.values()) {
            board.sessions += 1;
            for (ty, n) in &session.moment_counts {
                *board.moment_distribution.entry(*ty).or_default() += n;
            }
            for (action, n) in &session.decision_counts {
                *board.decision_distribution.entry(*action).or_default() += n;
            }
            if session.would_have_emitted > 0 {
                board.sessions_with_intervention += 1;
            }
            board.gate_suppressed += session.gate_suppressed;
            delta_sum += session.confidence_delta;
        }

        if board.sessions > 0 {
            board.mean_confidence_delta = delta_sum / board.sessions as f64;
        }
        board
    }

    /// Plain-text rendering for terminals.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "reports:       {}", self.reports);
        let _ = writeln!(out, "sessions:      {}", self.sessions);
        let _ = writeln!(out, "interventions: {}", self.sessions_with_intervention);
        let _ = writeln!(out, "gate_blocked:  {}", self.gate_suppressed);
        let _ = writeln!(out, "conf_delta:    {:+.4}", self.mean_confidence_delta);
        let _ = writeln!(out, "moments:");
        for ty in MomentType::ALL {
            let n = self.moment_distribution.get(&ty).copied().unwrap_or(0);
            let _ = writeln!(out, "  {:<18}{n}", ty.as_str());
        }
        let _ = writeln!(out, "decisions:");
        for (action, n) in &self.decision_distribution {
            let _ = writeln!(out, "  {:<18}{n}", action.as_str());
        }
        out
    }
}
