//! Champion-challenger lifecycle vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ArbiterId;

/// Lifecycle stage of a challenger configuration.
///
/// `Rejected` is terminal; a superseded champion also ends up `Rejected`
/// (reason `superseded`) and stays reachable through the ledger by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// 0% live traffic, observation only.
    Shadow,
    /// Small fixed traffic fraction.
    Canary,
    /// Full traffic.
    Champion,
    /// Terminal.
    Rejected,
}

impl LifecycleState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Rejected)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Shadow => write!(f, "shadow"),
            LifecycleState::Canary => write!(f, "canary"),
            LifecycleState::Champion => write!(f, "champion"),
            LifecycleState::Rejected => write!(f, "rejected"),
        }
    }
}

/// Rolling operational metrics accumulated over a challenger's observation
/// window. Verdict counters cover the same window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CumulativeMetrics {
    pub observations: u64,
    /// Observations that could not be completed (dispatch denied, provider
    /// outage). Counted separately — they never count toward the window.
    pub inconclusive: u64,
    pub error_count: u64,
    pub crash_count: u64,
    pub total_latency_s: f64,
    pub total_cost_usd: f64,
    pub promote_verdicts: u64,
    pub canary_verdicts: u64,
    pub rollback_verdicts: u64,
}

impl CumulativeMetrics {
    /// Error rate over completed observations. 0.0 when nothing observed yet.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.observations == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.observations as f64
    }

    /// Mean latency over completed observations. 0.0 when nothing observed yet.
    #[must_use]
    pub fn mean_latency_s(&self) -> f64 {
        if self.observations == 0 {
            return 0.0;
        }
        self.total_latency_s / self.observations as f64
    }
}

/// One challenger configuration moving through the pipeline.
///
/// `parent_id` is a lineage pointer by id, resolved through the ledger —
/// never a live reference, so history stays independently reconstructible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengerRecord {
    pub id: ArbiterId,
    pub generation: u64,
    pub parent_id: Option<ArbiterId>,
    pub lifecycle_state: LifecycleState,
    pub cumulative: CumulativeMetrics,
    pub registered_at: DateTime<Utc>,
}

impl ChallengerRecord {
    #[must_use]
    pub fn new(generation: u64, parent_id: Option<ArbiterId>) -> Self {
        Self {
            id: ArbiterId::new(),
            generation,
            parent_id,
            lifecycle_state: LifecycleState::Shadow,
            cumulative: CumulativeMetrics::default(),
            registered_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_challenger_starts_in_shadow() {
        let rec = ChallengerRecord::new(3, Some(ArbiterId::from_name("champion.gen2")));
        assert_eq!(rec.lifecycle_state, LifecycleState::Shadow);
        assert_eq!(rec.cumulative.observations, 0);
        assert!(!rec.lifecycle_state.is_terminal());
    }

    #[test]
    fn test_error_rate_and_latency_handle_empty_window() {
        let m = CumulativeMetrics::default();
        assert_eq!(m.error_rate(), 0.0);
        assert_eq!(m.mean_latency_s(), 0.0);
    }

    #[test]
    fn test_error_rate() {
        let m = CumulativeMetrics {
            observations: 8,
            error_count: 2,
            total_latency_s: 4.0,
            ..Default::default()
        };
        assert!((m.error_rate() - 0.25).abs() < f64::EPSILON);
        assert!((m.mean_latency_s() - 0.5).abs() < f64::EPSILON);
    }
}
