//! Gate vocabulary: the fixed-shape metrics snapshot, the resolved threshold
//! configuration, and the verdict produced by non-compensatory evaluation.
//!
//! The mathematics behind the individual scores (ECE, bias ratio, coherence)
//! is computed by external collaborators; the core only consumes the numbers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ══════════════════════════════════════════════════════════════
// Metrics snapshot
// ══════════════════════════════════════════════════════════════

/// One immutable metrics snapshot for a challenger evaluation.
/// Constructed fresh per evaluation; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateMetrics {
    /// Contractivity ρ — risk/uncertainty must strictly decrease (ρ < 1 to pass).
    pub contractivity: f64,
    /// Expected calibration error.
    pub calibration_error: f64,
    /// Bias ratio across protected cohorts.
    pub bias_ratio: f64,
    /// Self-reflection score.
    pub sr_score: f64,
    /// Global coherence score.
    pub coherence: f64,
    /// ΔL∞ — quality delta versus the champion.
    pub delta_linf: f64,
    /// Cost increase ratio versus the champion.
    pub cost_increase: f64,
    /// Stability constant κ.
    pub kappa: f64,
    /// Operator consent flag. Absolute veto when false.
    pub consent: bool,
    /// Ecological-constraint flag. Absolute veto when false.
    pub ecological_ok: bool,
}

impl GateMetrics {
    /// All numeric fields must be finite; a gate fed NaN/∞ must fail closed
    /// rather than compare garbage.
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("contractivity", self.contractivity),
            ("calibration_error", self.calibration_error),
            ("bias_ratio", self.bias_ratio),
            ("sr_score", self.sr_score),
            ("coherence", self.coherence),
            ("delta_linf", self.delta_linf),
            ("cost_increase", self.cost_increase),
            ("kappa", self.kappa),
        ];
        for (name, val) in fields {
            if !val.is_finite() {
                return Err(format!("{} must be finite, got {}", name, val));
            }
        }
        Ok(())
    }
}

// ══════════════════════════════════════════════════════════════
// Threshold configuration
// ══════════════════════════════════════════════════════════════

/// Resolved numeric thresholds, typically produced by an external declarative
/// policy evaluator. The core never sees the policy language, only these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub rho_max: f64,
    pub ece_max: f64,
    pub rho_bias_max: f64,
    pub sr_min: f64,
    pub coherence_min: f64,
    pub beta_min: f64,
    pub cost_max_increase: f64,
    pub kappa_min: f64,
    /// Near-threshold canary zone factor applied to `beta_min`.
    /// Required configuration — there is no rigorously derived default.
    pub canary_relaxation: f64,
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("rho_max", self.rho_max),
            ("ece_max", self.ece_max),
            ("rho_bias_max", self.rho_bias_max),
            ("sr_min", self.sr_min),
            ("coherence_min", self.coherence_min),
            ("beta_min", self.beta_min),
            ("cost_max_increase", self.cost_max_increase),
            ("kappa_min", self.kappa_min),
            ("canary_relaxation", self.canary_relaxation),
        ];
        for (name, val) in fields {
            if !val.is_finite() {
                return Err(format!("{} must be finite, got {}", name, val));
            }
        }
        if !(0.0..=1.0).contains(&self.canary_relaxation) {
            return Err(format!(
                "canary_relaxation must be in [0.0, 1.0], got {}",
                self.canary_relaxation
            ));
        }
        Ok(())
    }
}

// ══════════════════════════════════════════════════════════════
// Verdict
// ══════════════════════════════════════════════════════════════

/// The ten fixed gate criteria. Every evaluation reports all of them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Criterion {
    Contractivity,
    Calibration,
    BiasRatio,
    SelfReflection,
    Coherence,
    QualityDelta,
    CostIncrease,
    Stability,
    Consent,
    Ecology,
}

impl Criterion {
    pub const ALL: [Criterion; 10] = [
        Criterion::Contractivity,
        Criterion::Calibration,
        Criterion::BiasRatio,
        Criterion::SelfReflection,
        Criterion::Coherence,
        Criterion::QualityDelta,
        Criterion::CostIncrease,
        Criterion::Stability,
        Criterion::Consent,
        Criterion::Ecology,
    ];
}

impl std::fmt::Display for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Criterion::Contractivity => "contractivity",
            Criterion::Calibration => "calibration",
            Criterion::BiasRatio => "bias_ratio",
            Criterion::SelfReflection => "sr_score",
            Criterion::Coherence => "coherence",
            Criterion::QualityDelta => "delta_linf",
            Criterion::CostIncrease => "cost_increase",
            Criterion::Stability => "kappa",
            Criterion::Consent => "consent",
            Criterion::Ecology => "ecological_ok",
        };
        write!(f, "{}", name)
    }
}

/// What the orchestrator should do with the challenger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    Promote,
    Canary,
    Rollback,
    /// Reserved for operator holds; never produced by `evaluate` itself.
    Block,
}

impl std::fmt::Display for GateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateAction::Promote => write!(f, "promote"),
            GateAction::Canary => write!(f, "canary"),
            GateAction::Rollback => write!(f, "rollback"),
            GateAction::Block => write!(f, "block"),
        }
    }
}

/// Deterministic pure function of (GateMetrics, ThresholdConfig).
/// `criteria` uses a BTreeMap so serialization order is stable — identical
/// inputs must yield a bit-identical verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub passed: bool,
    pub action: GateAction,
    pub criteria: BTreeMap<Criterion, bool>,
    pub reason: String,
}

impl GateVerdict {
    /// Criteria that failed, in stable order.
    #[must_use]
    pub fn failing(&self) -> Vec<Criterion> {
        self.criteria
            .iter()
            .filter(|(_, pass)| !**pass)
            .map(|(c, _)| *c)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_validate_rejects_non_finite() {
        let mut m = GateMetrics {
            contractivity: 0.9,
            calibration_error: 0.01,
            bias_ratio: 1.0,
            sr_score: 0.8,
            coherence: 0.8,
            delta_linf: 0.02,
            cost_increase: 0.0,
            kappa: 0.5,
            consent: true,
            ecological_ok: true,
        };
        assert!(m.validate().is_ok());
        m.kappa = f64::NAN;
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_threshold_validate_relaxation_range() {
        let mut t = ThresholdConfig {
            rho_max: 1.0,
            ece_max: 0.05,
            rho_bias_max: 1.2,
            sr_min: 0.5,
            coherence_min: 0.5,
            beta_min: 0.01,
            cost_max_increase: 0.2,
            kappa_min: 0.1,
            canary_relaxation: 0.95,
        };
        assert!(t.validate().is_ok());
        t.canary_relaxation = 1.5;
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_criterion_display_names_are_unique() {
        let names: std::collections::HashSet<String> =
            Criterion::ALL.iter().map(|c| c.to_string()).collect();
        assert_eq!(names.len(), Criterion::ALL.len());
    }
}
