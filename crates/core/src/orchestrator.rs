//! Champion-challenger lifecycle state machine.
//!
//! The orchestrator ties the other three subsystems together: it obtains
//! metrics by running challenger requests through the Router, asks the Gate
//! for a verdict, and records every decision in the Ledger. The one invariant
//! everything here bends around: a lifecycle transition is applied to the
//! in-memory record only after the corresponding ledger record has been
//! appended successfully — never the reverse.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use arbiter_shared::{
    ArbiterId, ChallengerRecord, CoreError, CoreResult, GateAction, GateMetrics, GateVerdict,
    GovernanceEvent, LifecycleState, ProviderRequest, ProviderResponse, ThresholdConfig,
};

use crate::gate;
use crate::ledger::Ledger;
use crate::router::Router;

// ══════════════════════════════════════════════════════════════
// External collaborators and configuration
// ══════════════════════════════════════════════════════════════

/// Computes a metrics snapshot from one challenger exchange. The score
/// mathematics (ECE, bias ratio, coherence) lives outside the core; the
/// orchestrator only consumes the resulting numbers.
#[async_trait]
pub trait ScoreSource: Send + Sync {
    async fn score(
        &self,
        request: &ProviderRequest,
        response: &ProviderResponse,
    ) -> CoreResult<GateMetrics>;
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub thresholds: ThresholdConfig,
    /// Observations required before shadow→canary is considered.
    pub shadow_min_observations: u64,
    /// Observations required before canary→champion is considered.
    pub canary_min_observations: u64,
    /// Fraction of live traffic a canary receives (consumed by the external
    /// traffic splitter via `traffic_fraction`).
    pub canary_traffic_fraction: f64,
    /// Maximum tolerated error-rate increase over the champion baseline.
    pub max_error_rate_delta: f64,
    /// Maximum tolerated mean-latency ratio over the champion baseline.
    pub max_latency_ratio: f64,
    /// Champion operational baseline, supplied by the deployment.
    pub champion_error_rate: f64,
    pub champion_mean_latency_s: f64,
}

impl OrchestratorConfig {
    pub fn validate(&self) -> CoreResult<()> {
        self.thresholds
            .validate()
            .map_err(CoreError::ConfigError)?;
        if self.shadow_min_observations == 0 || self.canary_min_observations == 0 {
            return Err(CoreError::ConfigError(
                "observation minimums must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.canary_traffic_fraction) {
            return Err(CoreError::ConfigError(format!(
                "canary_traffic_fraction must be in [0.0, 1.0], got {}",
                self.canary_traffic_fraction
            )));
        }
        if self.max_latency_ratio < 1.0 {
            return Err(CoreError::ConfigError(
                "max_latency_ratio below 1.0 would reject identical latency".into(),
            ));
        }
        Ok(())
    }
}

/// What one observation produced.
#[derive(Debug, Clone)]
pub enum ObservationOutcome {
    /// Dispatch succeeded and the gate evaluated the exchange.
    Scored(GateVerdict),
    /// The provider call failed operationally; counts toward regression.
    Errored(String),
    /// The router denied the dispatch (budget/availability); recorded in the
    /// ledger and counted as inconclusive, never silently dropped.
    Inconclusive(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub halted: bool,
    pub champion: Option<ArbiterId>,
    pub challengers: Vec<ChallengerRecord>,
}

// ══════════════════════════════════════════════════════════════
// Orchestrator
// ══════════════════════════════════════════════════════════════

pub struct Orchestrator {
    config: OrchestratorConfig,
    router: Arc<Router>,
    ledger: Arc<Ledger>,
    scores: Arc<dyn ScoreSource>,
    challengers: RwLock<HashMap<ArbiterId, ChallengerRecord>>,
    /// Fail-closed master switch: set on any integrity failure, clears only
    /// with a process restart after manual resolution.
    halted: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        router: Arc<Router>,
        ledger: Arc<Ledger>,
        scores: Arc<dyn ScoreSource>,
    ) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            router,
            ledger,
            scores,
            challengers: RwLock::new(HashMap::new()),
            halted: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst) || self.ledger.is_halted()
    }

    fn ensure_active(&self) -> CoreResult<()> {
        if self.is_halted() {
            return Err(CoreError::IntegrityError(
                "promotion activity halted pending manual resolution".into(),
            ));
        }
        Ok(())
    }

    /// Absorbs a fatal error: halts all promotion activity and, when the
    /// ledger itself is still writable, leaves an `IntegrityHalt` record.
    async fn absorb_fatal(&self, err: CoreError) -> CoreError {
        if err.is_fatal() {
            self.halted.store(true, Ordering::SeqCst);
            error!(error = %err, "Fatal governance error — halting orchestrator");
            if !self.ledger.is_halted() {
                let halt_event = GovernanceEvent::IntegrityHalt {
                    detail: err.to_string(),
                };
                if let Err(e) = self.ledger.append(&halt_event).await {
                    warn!(error = %e, "Could not record integrity halt");
                }
            }
        }
        err
    }

    // ── Public operations ──

    /// Registers a new challenger in `shadow` and returns its id.
    pub async fn register_challenger(
        &self,
        generation: u64,
        parent_id: Option<ArbiterId>,
    ) -> CoreResult<ArbiterId> {
        self.ensure_active()?;
        let record = ChallengerRecord::new(generation, parent_id);
        let event = GovernanceEvent::ChallengerRegistered {
            challenger_id: record.id,
            generation,
            parent_id,
        };
        // Ledger first; the in-memory record exists only once durably logged.
        if let Err(e) = self.ledger.append(&event).await {
            return Err(self.absorb_fatal(e).await);
        }
        let id = record.id;
        self.challengers.write().await.insert(id, record);
        info!(challenger = %id, generation, "Challenger registered in shadow");
        Ok(id)
    }

    /// Runs one observation for `challenger_id`: dispatch the request through
    /// the router, score the exchange, evaluate the gate, record everything.
    pub async fn observe(
        &self,
        challenger_id: ArbiterId,
        request: &ProviderRequest,
        candidates: &[String],
    ) -> CoreResult<ObservationOutcome> {
        self.ensure_active()?;
        self.expect_observable(challenger_id).await?;

        let response = match self.router.dispatch(request, candidates).await {
            Ok(response) => response,
            Err(err @ (CoreError::BudgetExceeded { .. } | CoreError::AllProvidersUnavailable(_))) => {
                // A denial is an externally visible decision: exactly one
                // ledger record, then the observation is inconclusive.
                let reason = err.to_string();
                let event = GovernanceEvent::DispatchDenied {
                    challenger_id,
                    reason: reason.clone(),
                };
                if let Err(e) = self.ledger.append(&event).await {
                    return Err(self.absorb_fatal(e).await);
                }
                self.with_record(challenger_id, |record| {
                    record.cumulative.inconclusive += 1;
                })
                .await?;
                warn!(challenger = %challenger_id, reason = %reason, "Dispatch denied");
                return Ok(ObservationOutcome::Inconclusive(reason));
            }
            Err(err) if err.is_fatal() => return Err(self.absorb_fatal(err).await),
            Err(err) => {
                // Operational provider failure: counts toward regression.
                let reason = err.to_string();
                self.with_record(challenger_id, |record| {
                    record.cumulative.observations += 1;
                    record.cumulative.error_count += 1;
                })
                .await?;
                return Ok(ObservationOutcome::Errored(reason));
            }
        };

        let metrics = match self.scores.score(request, &response).await {
            Ok(metrics) => metrics,
            Err(err) => return Err(self.absorb_fatal(err).await),
        };
        let verdict = match gate::evaluate(&metrics, &self.config.thresholds) {
            Ok(verdict) => verdict,
            Err(err) => return Err(self.absorb_fatal(err).await),
        };

        let event = GovernanceEvent::GateEvaluated {
            challenger_id,
            verdict: verdict.clone(),
        };
        if let Err(e) = self.ledger.append(&event).await {
            return Err(self.absorb_fatal(e).await);
        }

        self.with_record(challenger_id, |record| {
            let c = &mut record.cumulative;
            c.observations += 1;
            c.total_latency_s += response.latency_s;
            c.total_cost_usd += response.cost_usd;
            match verdict.action {
                GateAction::Promote => c.promote_verdicts += 1,
                GateAction::Canary => c.canary_verdicts += 1,
                GateAction::Rollback | GateAction::Block => c.rollback_verdicts += 1,
            }
        })
        .await?;

        Ok(ObservationOutcome::Scored(verdict))
    }

    /// Reports a crash attributed to the challenger (from the external
    /// deployment); any crash is an immediate rejection trigger.
    pub async fn report_crash(&self, challenger_id: ArbiterId) -> CoreResult<()> {
        self.with_record(challenger_id, |record| {
            record.cumulative.crash_count += 1;
        })
        .await
    }

    /// Applies the lifecycle transition the observation window supports, if
    /// any, and returns the (possibly unchanged) state.
    pub async fn advance_challenger(&self, challenger_id: ArbiterId) -> CoreResult<LifecycleState> {
        self.ensure_active()?;
        let record = self.challenger(challenger_id).await?;
        let c = &record.cumulative;

        match record.lifecycle_state {
            LifecycleState::Rejected => Err(CoreError::InvalidTransition(format!(
                "challenger {} is rejected (terminal)",
                challenger_id
            ))),
            LifecycleState::Champion => Ok(LifecycleState::Champion),
            LifecycleState::Shadow => {
                if c.rollback_verdicts > 0 || c.crash_count > 0 || self.regressed(&record) {
                    let reason = self.rejection_reason(&record);
                    self.apply_transition(
                        challenger_id,
                        LifecycleState::Shadow,
                        LifecycleState::Rejected,
                        &reason,
                    )
                    .await?;
                    return Ok(LifecycleState::Rejected);
                }
                let scored = c.promote_verdicts + c.canary_verdicts;
                if c.observations >= self.config.shadow_min_observations
                    && scored == c.observations
                    && scored > 0
                {
                    self.apply_transition(
                        challenger_id,
                        LifecycleState::Shadow,
                        LifecycleState::Canary,
                        "observation window aggregate verdict promote/canary",
                    )
                    .await?;
                    return Ok(LifecycleState::Canary);
                }
                Ok(LifecycleState::Shadow)
            }
            LifecycleState::Canary => {
                if c.rollback_verdicts > 0 || c.crash_count > 0 || self.regressed(&record) {
                    let reason = self.rejection_reason(&record);
                    self.apply_transition(
                        challenger_id,
                        LifecycleState::Canary,
                        LifecycleState::Rejected,
                        &reason,
                    )
                    .await?;
                    return Ok(LifecycleState::Rejected);
                }
                // Sustained promote: every scored observation promoted, the
                // window is big enough, and operations look at least as good
                // as the champion baseline.
                if c.observations >= self.config.canary_min_observations
                    && c.promote_verdicts == c.observations
                {
                    self.promote_to_champion(challenger_id).await?;
                    return Ok(LifecycleState::Champion);
                }
                Ok(LifecycleState::Canary)
            }
        }
    }

    /// Explicit external rollback request. The only path that may demote a
    /// champion; also usable to abandon a shadow/canary challenger early.
    pub async fn force_rollback(
        &self,
        challenger_id: ArbiterId,
        operator_reason: &str,
    ) -> CoreResult<()> {
        self.ensure_active()?;
        let record = self.challenger(challenger_id).await?;
        if record.lifecycle_state.is_terminal() {
            return Err(CoreError::InvalidTransition(format!(
                "challenger {} is already rejected",
                challenger_id
            )));
        }
        let event = GovernanceEvent::ForcedRollback {
            challenger_id,
            operator_reason: operator_reason.to_string(),
        };
        if let Err(e) = self.ledger.append(&event).await {
            return Err(self.absorb_fatal(e).await);
        }
        self.with_record(challenger_id, |record| {
            record.lifecycle_state = LifecycleState::Rejected;
        })
        .await?;
        warn!(challenger = %challenger_id, reason = %operator_reason, "Forced rollback");
        Ok(())
    }

    /// Audits the full hash chain; a broken chain halts promotion system-wide.
    pub async fn audit_ledger(&self) -> CoreResult<bool> {
        let intact = self.ledger.verify_chain(0, i64::MAX).await?;
        if !intact {
            self.halted.store(true, Ordering::SeqCst);
            error!("Ledger audit failed — promotion activity halted");
        }
        Ok(intact)
    }

    pub async fn get_status(&self) -> OrchestratorStatus {
        let challengers = self.challengers.read().await;
        let mut list: Vec<ChallengerRecord> = challengers.values().cloned().collect();
        list.sort_by_key(|r| r.registered_at);
        OrchestratorStatus {
            halted: self.is_halted(),
            champion: list
                .iter()
                .find(|r| r.lifecycle_state == LifecycleState::Champion)
                .map(|r| r.id),
            challengers: list,
        }
    }

    pub async fn challenger(&self, challenger_id: ArbiterId) -> CoreResult<ChallengerRecord> {
        self.challengers
            .read()
            .await
            .get(&challenger_id)
            .cloned()
            .ok_or_else(|| CoreError::ChallengerNotFound(challenger_id.to_string()))
    }

    /// Live-traffic share for the external traffic splitter.
    #[must_use]
    pub fn traffic_fraction(&self, state: LifecycleState) -> f64 {
        match state {
            LifecycleState::Shadow | LifecycleState::Rejected => 0.0,
            LifecycleState::Canary => self.config.canary_traffic_fraction,
            LifecycleState::Champion => 1.0,
        }
    }

    // ── Internals ──

    async fn expect_observable(&self, challenger_id: ArbiterId) -> CoreResult<()> {
        let record = self.challenger(challenger_id).await?;
        if record.lifecycle_state.is_terminal() {
            return Err(CoreError::InvalidTransition(format!(
                "challenger {} is rejected and cannot be observed",
                challenger_id
            )));
        }
        Ok(())
    }

    async fn with_record<F>(&self, challenger_id: ArbiterId, mutate: F) -> CoreResult<()>
    where
        F: FnOnce(&mut ChallengerRecord),
    {
        let mut challengers = self.challengers.write().await;
        let record = challengers
            .get_mut(&challenger_id)
            .ok_or_else(|| CoreError::ChallengerNotFound(challenger_id.to_string()))?;
        mutate(record);
        Ok(())
    }

    /// Operational regression versus the champion baseline.
    fn regressed(&self, record: &ChallengerRecord) -> bool {
        let c = &record.cumulative;
        if c.observations == 0 {
            return false;
        }
        let error_delta = c.error_rate() - self.config.champion_error_rate;
        if error_delta > self.config.max_error_rate_delta {
            return true;
        }
        if self.config.champion_mean_latency_s > 0.0 {
            let ratio = c.mean_latency_s() / self.config.champion_mean_latency_s;
            if ratio > self.config.max_latency_ratio {
                return true;
            }
        }
        false
    }

    fn rejection_reason(&self, record: &ChallengerRecord) -> String {
        let c = &record.cumulative;
        if c.crash_count > 0 {
            format!("crash count {} > 0", c.crash_count)
        } else if c.rollback_verdicts > 0 {
            format!("{} rollback verdict(s) in observation window", c.rollback_verdicts)
        } else {
            format!(
                "operational regression: error rate {:.4} vs baseline {:.4}, mean latency {:.3}s vs baseline {:.3}s",
                c.error_rate(),
                self.config.champion_error_rate,
                c.mean_latency_s(),
                self.config.champion_mean_latency_s
            )
        }
    }

    /// Ledger-write-then-apply: the durable record and the in-memory state
    /// can never diverge, because a failed append leaves the state untouched.
    async fn apply_transition(
        &self,
        challenger_id: ArbiterId,
        from: LifecycleState,
        to: LifecycleState,
        reason: &str,
    ) -> CoreResult<()> {
        let event = GovernanceEvent::LifecycleTransition {
            challenger_id,
            from,
            to,
            reason: reason.to_string(),
        };
        if let Err(e) = self.ledger.append(&event).await {
            return Err(self.absorb_fatal(e).await);
        }
        self.with_record(challenger_id, |record| {
            record.lifecycle_state = to;
        })
        .await?;
        info!(challenger = %challenger_id, %from, %to, reason, "Lifecycle transition");
        Ok(())
    }

    /// Promotion supersedes the previous champion: the old champion is
    /// archived as rejected (reason `superseded`) and remains reachable
    /// through the ledger by id.
    async fn promote_to_champion(&self, challenger_id: ArbiterId) -> CoreResult<()> {
        let previous = {
            let challengers = self.challengers.read().await;
            challengers
                .values()
                .find(|r| r.lifecycle_state == LifecycleState::Champion)
                .map(|r| r.id)
        };
        if let Some(old_champion) = previous {
            self.apply_transition(
                old_champion,
                LifecycleState::Champion,
                LifecycleState::Rejected,
                "superseded",
            )
            .await?;
        }
        self.apply_transition(
            challenger_id,
            LifecycleState::Canary,
            LifecycleState::Champion,
            "sustained promote verdict with no operational regression",
        )
        .await
    }
}

// ══════════════════════════════════════════════════════════════
// Tests
// ══════════════════════════════════════════════════════════════
