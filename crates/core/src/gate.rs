//! Non-compensatory policy gate.
//!
//! `evaluate` is a pure function: no I/O, no mutable state, no clock, no
//! randomness. Identical `(metrics, thresholds)` always yield a bit-identical
//! verdict, and it is safe to call concurrently without coordination.

use std::collections::BTreeMap;

use arbiter_shared::{
    CoreError, CoreResult, Criterion, GateAction, GateMetrics, GateVerdict, ThresholdConfig,
};

/// Evaluates all ten criteria and maps the result to an action.
///
/// Every criterion is always evaluated — the verdict reports every failing
/// criterion, not just the first, even though `passed` is a plain AND.
/// `consent` and `ecological_ok` are absolute vetoes: their failure forces
/// `Rollback` regardless of how well everything else scored.
pub fn evaluate(metrics: &GateMetrics, thresholds: &ThresholdConfig) -> CoreResult<GateVerdict> {
    metrics
        .validate()
        .map_err(CoreError::GateEvaluationError)?;
    thresholds
        .validate()
        .map_err(CoreError::GateEvaluationError)?;

    let mut criteria = BTreeMap::new();
    criteria.insert(Criterion::Contractivity, metrics.contractivity < thresholds.rho_max);
    criteria.insert(Criterion::Calibration, metrics.calibration_error <= thresholds.ece_max);
    criteria.insert(Criterion::BiasRatio, metrics.bias_ratio <= thresholds.rho_bias_max);
    criteria.insert(Criterion::SelfReflection, metrics.sr_score >= thresholds.sr_min);
    criteria.insert(Criterion::Coherence, metrics.coherence >= thresholds.coherence_min);
    criteria.insert(Criterion::QualityDelta, metrics.delta_linf >= thresholds.beta_min);
    criteria.insert(Criterion::CostIncrease, metrics.cost_increase <= thresholds.cost_max_increase);
    criteria.insert(Criterion::Stability, metrics.kappa >= thresholds.kappa_min);
    criteria.insert(Criterion::Consent, metrics.consent);
    criteria.insert(Criterion::Ecology, metrics.ecological_ok);

    let passed = criteria.values().all(|pass| *pass);
    let action = decide_action(&criteria, metrics, thresholds, passed);
    let reason = build_reason(&criteria, action);

    Ok(GateVerdict {
        passed,
        action,
        criteria,
        reason,
    })
}

/// passed → promote; near-threshold quality with the safety trio intact →
/// canary; everything else → rollback. Veto failures never reach the canary
/// zone.
fn decide_action(
    criteria: &BTreeMap<Criterion, bool>,
    metrics: &GateMetrics,
    thresholds: &ThresholdConfig,
    passed: bool,
) -> GateAction {
    if passed {
        return GateAction::Promote;
    }
    if !criteria[&Criterion::Consent] || !criteria[&Criterion::Ecology] {
        return GateAction::Rollback;
    }

    let near_threshold =
        metrics.delta_linf >= thresholds.canary_relaxation * thresholds.beta_min;
    let safety_trio_pass = criteria[&Criterion::Contractivity]
        && criteria[&Criterion::Calibration]
        && criteria[&Criterion::BiasRatio];

    if near_threshold && safety_trio_pass {
        GateAction::Canary
    } else {
        GateAction::Rollback
    }
}

fn build_reason(criteria: &BTreeMap<Criterion, bool>, action: GateAction) -> String {
    let failing: Vec<String> = criteria
        .iter()
        .filter(|(_, pass)| !**pass)
        .map(|(c, _)| c.to_string())
        .collect();
    if failing.is_empty() {
        "all criteria passed".to_string()
    } else {
        format!("{}: failed criteria [{}]", action, failing.join(", "))
    }
}

// ══════════════════════════════════════════════════════════════
// Tests
// ══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{passing_metrics, thresholds};

    #[test]
    fn test_all_passing_promotes() {
        let verdict = evaluate(&passing_metrics(), &thresholds()).unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.action, GateAction::Promote);
        assert_eq!(verdict.criteria.len(), 10);
        assert!(verdict.criteria.values().all(|p| *p));
        assert_eq!(verdict.reason, "all criteria passed");
    }

    #[test]
    fn test_determinism_bit_identical_verdicts() {
        let metrics = passing_metrics();
        let config = thresholds();
        let first = evaluate(&metrics, &config).unwrap();
        for _ in 0..50 {
            let again = evaluate(&metrics, &config).unwrap();
            assert_eq!(first, again);
            // Bit-identical through serialization as well.
            assert_eq!(
                serde_json::to_vec(&first).unwrap(),
                serde_json::to_vec(&again).unwrap()
            );
        }
    }

    /// Excellence elsewhere never compensates: fail each criterion alone,
    /// with every other metric at its best value, and the gate must fail.
    #[test]
    fn test_non_compensatory_single_criterion_failures() {
        let config = thresholds();
        let break_one: Vec<(Criterion, Box<dyn Fn(&mut GateMetrics)>)> = vec![
            (Criterion::Contractivity, Box::new(|m| m.contractivity = 1.2)),
            (Criterion::Calibration, Box::new(|m| m.calibration_error = 0.5)),
            (Criterion::BiasRatio, Box::new(|m| m.bias_ratio = 5.0)),
            (Criterion::SelfReflection, Box::new(|m| m.sr_score = 0.0)),
            (Criterion::Coherence, Box::new(|m| m.coherence = 0.0)),
            (Criterion::QualityDelta, Box::new(|m| m.delta_linf = -1.0)),
            (Criterion::CostIncrease, Box::new(|m| m.cost_increase = 10.0)),
            (Criterion::Stability, Box::new(|m| m.kappa = -1.0)),
            (Criterion::Consent, Box::new(|m| m.consent = false)),
            (Criterion::Ecology, Box::new(|m| m.ecological_ok = false)),
        ];

        for (criterion, sabotage) in break_one {
            let mut metrics = passing_metrics();
            sabotage(&mut metrics);
            let verdict = evaluate(&metrics, &config).unwrap();
            assert!(!verdict.passed, "{} alone must fail the gate", criterion);
            assert_eq!(verdict.failing(), vec![criterion]);
            assert!(
                verdict.reason.contains(&criterion.to_string()),
                "reason must name {}",
                criterion
            );
        }
    }

    #[test]
    fn test_canary_promotion_scenario() {
        // delta_linf = 0.02 ≥ beta_min = 0.01 with everything else passing.
        let mut metrics = passing_metrics();
        metrics.delta_linf = 0.02;
        let mut config = thresholds();
        config.beta_min = 0.01;

        let verdict = evaluate(&metrics, &config).unwrap();
        assert_eq!(verdict.action, GateAction::Promote);

        // Dropping delta_linf below the relaxed zone flips to rollback.
        metrics.delta_linf = 0.005;
        let verdict = evaluate(&metrics, &config).unwrap();
        assert!(!verdict.passed);
        assert_eq!(verdict.action, GateAction::Rollback);
    }

    #[test]
    fn test_near_threshold_zone_yields_canary() {
        // 0.0096 < beta_min = 0.01 but ≥ 0.95 * beta_min = 0.0095, and the
        // contractivity/calibration/bias trio passes.
        let mut metrics = passing_metrics();
        metrics.delta_linf = 0.0096;
        let mut config = thresholds();
        config.beta_min = 0.01;
        config.canary_relaxation = 0.95;

        let verdict = evaluate(&metrics, &config).unwrap();
        assert!(!verdict.passed);
        assert_eq!(verdict.action, GateAction::Canary);
    }

    #[test]
    fn test_canary_zone_denied_when_safety_trio_fails() {
        let mut metrics = passing_metrics();
        metrics.delta_linf = 0.0096;
        metrics.bias_ratio = 5.0;
        let mut config = thresholds();
        config.beta_min = 0.01;

        let verdict = evaluate(&metrics, &config).unwrap();
        assert_eq!(verdict.action, GateAction::Rollback);
    }

    #[test]
    fn test_consent_veto_always_rolls_back() {
        // Identical near-threshold metrics, but consent = false: the veto
        // forces rollback, never canary.
        let mut metrics = passing_metrics();
        metrics.delta_linf = 0.0096;
        metrics.consent = false;
        let mut config = thresholds();
        config.beta_min = 0.01;

        let verdict = evaluate(&metrics, &config).unwrap();
        assert_eq!(verdict.action, GateAction::Rollback);

        // Even with a fully passing delta, consent alone vetoes.
        metrics.delta_linf = 0.5;
        let verdict = evaluate(&metrics, &config).unwrap();
        assert!(!verdict.passed);
        assert_eq!(verdict.action, GateAction::Rollback);
    }

    #[test]
    fn test_ecological_veto_always_rolls_back() {
        let mut metrics = passing_metrics();
        metrics.delta_linf = 0.0096;
        metrics.ecological_ok = false;
        let mut config = thresholds();
        config.beta_min = 0.01;

        let verdict = evaluate(&metrics, &config).unwrap();
        assert_eq!(verdict.action, GateAction::Rollback);
    }

    #[test]
    fn test_non_finite_metrics_fail_closed() {
        let mut metrics = passing_metrics();
        metrics.contractivity = f64::NAN;
        let err = evaluate(&metrics, &thresholds()).unwrap_err();
        assert!(matches!(err, CoreError::GateEvaluationError(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_multiple_failures_all_reported() {
        let mut metrics = passing_metrics();
        metrics.coherence = 0.0;
        metrics.kappa = -1.0;
        metrics.cost_increase = 10.0;

        let verdict = evaluate(&metrics, &thresholds()).unwrap();
        assert_eq!(
            verdict.failing(),
            vec![
                Criterion::Coherence,
                Criterion::CostIncrease,
                Criterion::Stability
            ]
        );
        assert!(verdict.reason.contains("coherence"));
        assert!(verdict.reason.contains("cost_increase"));
        assert!(verdict.reason.contains("kappa"));
    }
}
