//! Cost-aware, circuit-breaking request router.
//!
//! The Router owns the only two mutable shared resources in the core: the
//! daily budget and the per-provider circuit health. Both are mutated solely
//! through the atomic outcome-recording paths in this module; callers get a
//! handle to one Router instance, never ambient global state, so independent
//! orchestrators (e.g. in tests) run with isolated budgets.

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use arbiter_shared::{
    events::ProviderUsage, CoreError, CoreResult, GovernanceEvent, Provider, ProviderRequest,
    ProviderResponse,
};

use crate::ledger::Ledger;

// ══════════════════════════════════════════════════════════════
// Configuration
// ══════════════════════════════════════════════════════════════

/// Weights of the provider scoring function; configuration, never hardcoded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub quality: f64,
    pub latency: f64,
    pub cost: f64,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub daily_limit_usd: f64,
    pub weights: ScoreWeights,
    /// Consecutive failures before a provider's circuit opens.
    pub failure_threshold: u32,
    /// Open→half-open cooldown. Required input; no derived default exists.
    pub cooldown: Duration,
    /// In-flight dispatch deadline; exceeding it counts as a provider failure.
    pub dispatch_timeout: Duration,
}

impl RouterConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if !self.daily_limit_usd.is_finite() || self.daily_limit_usd < 0.0 {
            return Err(CoreError::ConfigError(format!(
                "daily_limit_usd must be a non-negative finite number, got {}",
                self.daily_limit_usd
            )));
        }
        if self.failure_threshold == 0 {
            return Err(CoreError::ConfigError(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if self.cooldown.is_zero() {
            return Err(CoreError::ConfigError(
                "cooldown must be non-zero (required input, no default)".into(),
            ));
        }
        if self.dispatch_timeout.is_zero() {
            return Err(CoreError::ConfigError(
                "dispatch_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

// ══════════════════════════════════════════════════════════════
// Budget and provider health
// ══════════════════════════════════════════════════════════════

/// Rolling daily budget. Invariant: `daily_spend == Σ per_provider.cost_usd`
/// after every operation, and `daily_spend + reserved` never exceeds the
/// configured limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub daily_spend: f64,
    /// Worst-case estimates of dispatches currently in flight.
    pub reserved: f64,
    pub last_reset_date: NaiveDate,
    pub per_provider: HashMap<String, ProviderUsage>,
}

impl BudgetState {
    fn new(today: NaiveDate) -> Self {
        Self {
            daily_spend: 0.0,
            reserved: 0.0,
            last_reset_date: today,
            per_provider: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-provider circuit breaker state. Transitions:
/// closed→open (failure threshold), open→half_open (cooldown elapsed),
/// half_open→closed (trial success), half_open→open (trial failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider_id: String,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    /// Exactly one trial request may be in flight while half-open.
    pub trial_in_flight: bool,
}

impl ProviderHealth {
    fn new(provider_id: String) -> Self {
        Self {
            provider_id,
            circuit_state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// Point-in-time view for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub daily_limit_usd: f64,
    pub daily_spend: f64,
    pub reserved: f64,
    pub last_reset_date: NaiveDate,
    pub per_provider: HashMap<String, ProviderUsage>,
    pub health: Vec<ProviderHealth>,
    /// Circuit trip/recovery events that could not be appended to the
    /// ledger. Non-zero means the audit trail is missing circuit records.
    pub ledger_append_failures: u64,
}

// ══════════════════════════════════════════════════════════════
// Router
// ══════════════════════════════════════════════════════════════

pub struct Router {
    config: RouterConfig,
    ledger: Arc<Ledger>,
    providers: HashMap<String, Arc<dyn Provider>>,
    budget: Mutex<BudgetState>,
    health: DashMap<String, ProviderHealth>,
    /// Count of circuit events lost to ledger append failures, surfaced in
    /// `status()` so callers can detect an incomplete audit trail.
    ledger_append_failures: AtomicU64,
}

impl Router {
    pub fn new(
        config: RouterConfig,
        ledger: Arc<Ledger>,
        providers: Vec<Arc<dyn Provider>>,
    ) -> CoreResult<Self> {
        config.validate()?;
        let health = DashMap::new();
        let mut registry = HashMap::new();
        for provider in providers {
            let id = provider.id().to_string();
            health.insert(id.clone(), ProviderHealth::new(id.clone()));
            registry.insert(id, provider);
        }
        Ok(Self {
            config,
            ledger,
            providers: registry,
            budget: Mutex::new(BudgetState::new(Utc::now().date_naive())),
            health,
            ledger_append_failures: AtomicU64::new(0),
        })
    }

    /// Dispatches `request` to the best available candidate provider.
    ///
    /// Pre-dispatch, in order: budget check (conservative, against the
    /// worst-case candidate estimate), circuit filter, weighted scoring.
    /// On any failure the reservation is released; on success the actual
    /// cost is recorded atomically.
    pub async fn dispatch(
        &self,
        request: &ProviderRequest,
        candidates: &[String],
    ) -> CoreResult<ProviderResponse> {
        let estimate = self.worst_case_estimate(request, candidates);

        // Budget check and lazy daily reset share one critical section, so
        // two concurrent dispatches can never both observe a pending reset.
        {
            let mut budget = self.budget.lock().await;
            self.roll_over_if_new_day(&mut budget).await?;
            let committed = budget.daily_spend + budget.reserved;
            if committed + estimate > self.config.daily_limit_usd {
                return Err(CoreError::BudgetExceeded {
                    spent: budget.daily_spend,
                    estimated: estimate,
                    limit: self.config.daily_limit_usd,
                });
            }
            budget.reserved += estimate;
        }

        let outcome = self.dispatch_admitted(request, candidates).await;

        // Settle the reservation on every exit path.
        match outcome {
            Ok((provider_id, response)) => {
                self.settle_success(&provider_id, estimate, &response).await;
                self.record_provider_success(&provider_id).await;
                Ok(response)
            }
            Err((provider_id, err)) => {
                {
                    let mut budget = self.budget.lock().await;
                    budget.reserved -= estimate;
                }
                if let Some(id) = provider_id {
                    self.record_provider_failure(&id).await;
                }
                Err(err)
            }
        }
    }

    /// Current budget and circuit view.
    pub async fn status(&self) -> RouterStatus {
        let budget = self.budget.lock().await;
        let mut health: Vec<ProviderHealth> =
            self.health.iter().map(|entry| entry.value().clone()).collect();
        health.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        RouterStatus {
            daily_limit_usd: self.config.daily_limit_usd,
            daily_spend: budget.daily_spend,
            reserved: budget.reserved,
            last_reset_date: budget.last_reset_date,
            per_provider: budget.per_provider.clone(),
            health,
            ledger_append_failures: self.ledger_append_failures.load(Ordering::Relaxed),
        }
    }

    pub fn provider_health(&self, provider_id: &str) -> Option<ProviderHealth> {
        self.health.get(provider_id).map(|entry| entry.value().clone())
    }

    // ── Candidate admission and execution ──

    /// Worst-case estimate across the candidate set, used for the budget
    /// check before any provider selection happens.
    fn worst_case_estimate(&self, request: &ProviderRequest, candidates: &[String]) -> f64 {
        candidates
            .iter()
            .filter_map(|id| self.providers.get(id))
            .map(|p| p.estimated_cost(request).max(0.0))
            .fold(0.0, f64::max)
    }

    async fn dispatch_admitted(
        &self,
        request: &ProviderRequest,
        candidates: &[String],
    ) -> Result<(String, ProviderResponse), (Option<String>, CoreError)> {
        let ranked = self.rank_candidates(request, candidates);
        if ranked.is_empty() {
            return Err((
                None,
                CoreError::AllProvidersUnavailable(
                    "no registered candidate with a non-open circuit".into(),
                ),
            ));
        }

        // Highest score first; admission re-checks the circuit so a racing
        // dispatch can never start a second half-open trial.
        for (provider_id, _score) in ranked {
            if !self.try_admit(&provider_id) {
                continue;
            }
            let provider = self
                .providers
                .get(&provider_id)
                .cloned()
                .ok_or_else(|| {
                    (
                        None,
                        CoreError::ProviderFailure {
                            id: provider_id.clone(),
                            message: "provider disappeared from registry".into(),
                        },
                    )
                })?;

            debug!(provider = %provider_id, request = %request.id, "Dispatching");
            let call = provider.call(request);
            return match tokio::time::timeout(self.config.dispatch_timeout, call).await {
                Ok(Ok(response)) => Ok((provider_id, response)),
                Ok(Err(err)) => Err((Some(provider_id), err)),
                // A late result past the deadline is discarded; the timeout
                // counts toward consecutive_failures like any failure.
                Err(_) => Err((
                    Some(provider_id.clone()),
                    CoreError::Timeout(format!(
                        "provider '{}' exceeded dispatch timeout of {:?}",
                        provider_id, self.config.dispatch_timeout
                    )),
                )),
            };
        }

        Err((
            None,
            CoreError::AllProvidersUnavailable(
                "all candidates open or awaiting a half-open trial slot".into(),
            ),
        ))
    }

    /// Scores the candidates whose circuit is not open, descending.
    /// `score = w_q·quality + w_l·(1/latency) − w_c·cost`; ties break on
    /// provider id so selection is deterministic.
    fn rank_candidates(
        &self,
        request: &ProviderRequest,
        candidates: &[String],
    ) -> Vec<(String, f64)> {
        let now = Utc::now();
        let mut ranked = Vec::new();
        for id in candidates {
            let Some(provider) = self.providers.get(id) else {
                warn!(provider = %id, "Unknown candidate provider, skipping");
                continue;
            };
            let Some(mut health) = self.health.get_mut(id) else {
                continue;
            };

            // open→half_open once the cooldown has elapsed.
            if health.circuit_state == CircuitState::Open {
                let cooled = health
                    .opened_at
                    .map(|t| now.signed_duration_since(t).to_std().unwrap_or_default())
                    .map(|elapsed| elapsed >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    info!(provider = %id, "Circuit cooldown elapsed, entering half-open");
                    health.circuit_state = CircuitState::HalfOpen;
                    health.trial_in_flight = false;
                }
            }
            if health.circuit_state == CircuitState::Open {
                continue;
            }
            drop(health);

            let latency = provider.expected_latency_s().max(1e-6);
            let w = self.config.weights;
            let score = w.quality * provider.quality_signal() + w.latency * (1.0 / latency)
                - w.cost * provider.estimated_cost(request);
            ranked.push((id.clone(), score));
        }
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked
    }

    /// Final admission check under the health entry lock. Closed circuits
    /// always admit; half-open admits exactly one trial.
    fn try_admit(&self, provider_id: &str) -> bool {
        let Some(mut health) = self.health.get_mut(provider_id) else {
            return false;
        };
        match health.circuit_state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if health.trial_in_flight {
                    false
                } else {
                    health.trial_in_flight = true;
                    true
                }
            }
            CircuitState::Open => false,
        }
    }

    // ── Outcome recording (the atomic critical sections) ──

    async fn settle_success(&self, provider_id: &str, estimate: f64, response: &ProviderResponse) {
        let mut budget = self.budget.lock().await;
        budget.reserved -= estimate;
        budget.daily_spend += response.cost_usd;
        let usage = budget
            .per_provider
            .entry(provider_id.to_string())
            .or_default();
        usage.cost_usd += response.cost_usd;
        usage.tokens += response.tokens;
        usage.call_count += 1;
    }

    async fn record_provider_success(&self, provider_id: &str) {
        let mut recovered = false;
        if let Some(mut health) = self.health.get_mut(provider_id) {
            health.consecutive_failures = 0;
            health.trial_in_flight = false;
            if health.circuit_state == CircuitState::HalfOpen {
                health.circuit_state = CircuitState::Closed;
                health.opened_at = None;
                recovered = true;
            }
        }
        // Ledger write happens outside the health entry lock.
        if recovered {
            info!(provider = %provider_id, "Circuit closed after successful trial");
            if let Err(e) = self
                .ledger
                .append(&GovernanceEvent::CircuitClosed {
                    provider_id: provider_id.to_string(),
                })
                .await
            {
                self.ledger_append_failures.fetch_add(1, Ordering::Relaxed);
                warn!(provider = %provider_id, error = %e, "Failed to record circuit recovery");
            }
        }
    }

    async fn record_provider_failure(&self, provider_id: &str) {
        let mut tripped: Option<u32> = None;
        if let Some(mut health) = self.health.get_mut(provider_id) {
            let now = Utc::now();
            health.consecutive_failures += 1;
            health.last_failure_time = Some(now);
            match health.circuit_state {
                CircuitState::HalfOpen => {
                    // Failed trial re-opens immediately.
                    health.circuit_state = CircuitState::Open;
                    health.opened_at = Some(now);
                    health.trial_in_flight = false;
                    tripped = Some(health.consecutive_failures);
                }
                CircuitState::Closed => {
                    if health.consecutive_failures >= self.config.failure_threshold {
                        health.circuit_state = CircuitState::Open;
                        health.opened_at = Some(now);
                        tripped = Some(health.consecutive_failures);
                    }
                }
                CircuitState::Open => {}
            }
        }
        if let Some(consecutive_failures) = tripped {
            warn!(
                provider = %provider_id,
                consecutive_failures,
                "Circuit opened"
            );
            if let Err(e) = self
                .ledger
                .append(&GovernanceEvent::CircuitOpened {
                    provider_id: provider_id.to_string(),
                    consecutive_failures,
                })
                .await
            {
                self.ledger_append_failures.fetch_add(1, Ordering::Relaxed);
                warn!(provider = %provider_id, error = %e, "Failed to record circuit trip");
            }
        }
    }

    /// Lazy daily rollover. Prior totals are persisted to the ledger before
    /// the counters zero; a failed append aborts the reset (fail-closed) so
    /// no day's spend can vanish silently.
    async fn roll_over_if_new_day(&self, budget: &mut BudgetState) -> CoreResult<()> {
        let today = Utc::now().date_naive();
        if budget.last_reset_date == today {
            return Ok(());
        }
        let per_provider: BTreeMap<String, ProviderUsage> = budget
            .per_provider
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.ledger
            .append(&GovernanceEvent::BudgetRollover {
                date: budget.last_reset_date,
                daily_spend: budget.daily_spend,
                per_provider,
            })
            .await?;
        info!(
            prior_date = %budget.last_reset_date,
            prior_spend = budget.daily_spend,
            "Daily budget reset"
        );
        budget.daily_spend = 0.0;
        budget.per_provider.clear();
        budget.last_reset_date = today;
        Ok(())
    }
}

// ══════════════════════════════════════════════════════════════
// Tests
// ══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{memory_pool, router_config, MockProvider};

    async fn test_router(
        config: RouterConfig,
        providers: Vec<Arc<MockProvider>>,
    ) -> (Arc<Router>, Arc<Ledger>) {
        let ledger = Arc::new(Ledger::open(memory_pool().await).await.unwrap());
        let dyn_providers: Vec<Arc<dyn Provider>> = providers
            .into_iter()
            .map(|p| p as Arc<dyn Provider>)
            .collect();
        let router = Arc::new(Router::new(config, ledger.clone(), dyn_providers).unwrap());
        (router, ledger)
    }

    fn request() -> ProviderRequest {
        ProviderRequest::new("evaluate challenger output", 256)
    }

    #[tokio::test]
    async fn test_budget_denial_scenario() {
        // daily_limit = $1.00; three $0.30 calls pass, the fourth is denied
        // and daily_spend stays at $0.90.
        let mut config = router_config();
        config.daily_limit_usd = 1.0;
        let provider = MockProvider::healthy("provider.alpha", 0.30);
        let (router, _ledger) = test_router(config, vec![provider]).await;
        let candidates = vec!["provider.alpha".to_string()];

        for _ in 0..3 {
            router.dispatch(&request(), &candidates).await.unwrap();
        }
        let err = router.dispatch(&request(), &candidates).await.unwrap_err();
        assert!(matches!(err, CoreError::BudgetExceeded { .. }));

        let status = router.status().await;
        assert!((status.daily_spend - 0.90).abs() < 1e-9);
        assert_eq!(status.per_provider["provider.alpha"].call_count, 3);
    }

    #[tokio::test]
    async fn test_budget_conservation_under_concurrency() {
        let mut config = router_config();
        config.daily_limit_usd = 1.0;
        let provider = MockProvider::healthy("provider.alpha", 0.30);
        let (router, _ledger) = test_router(config, vec![provider]).await;

        let mut handles = Vec::new();
        for _ in 0..12 {
            let router = router.clone();
            handles.push(tokio::spawn(async move {
                router
                    .dispatch(&request(), &["provider.alpha".to_string()])
                    .await
            }));
        }
        let mut successes = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        // At $0.30 each under a $1.00 limit, at most 3 can ever land.
        assert_eq!(successes, 3);

        let status = router.status().await;
        assert!(status.daily_spend <= status.daily_limit_usd + 1e-9);
        assert!(status.daily_spend >= 0.0);
        assert!((status.reserved - 0.0).abs() < 1e-9);
        let total: f64 = status.per_provider.values().map(|u| u.cost_usd).sum();
        assert!((status.daily_spend - total).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold_and_alternate_selected() {
        let mut config = router_config();
        config.failure_threshold = 3;
        let flaky = MockProvider::healthy("provider.flaky", 0.01);
        flaky.fail_next(usize::MAX);
        // The flaky provider scores higher, so it is picked until it trips.
        flaky.set_quality(0.99);
        let backup = MockProvider::healthy("provider.backup", 0.01);
        backup.set_quality(0.10);
        let (router, ledger) = test_router(config, vec![flaky, backup]).await;
        let candidates = vec!["provider.flaky".to_string(), "provider.backup".to_string()];

        for _ in 0..3 {
            let err = router.dispatch(&request(), &candidates).await.unwrap_err();
            assert!(matches!(err, CoreError::ProviderFailure { .. }));
        }
        let health = router.provider_health("provider.flaky").unwrap();
        assert_eq!(health.circuit_state, CircuitState::Open);
        assert_eq!(health.consecutive_failures, 3);

        // Next dispatch must not touch the tripped provider.
        let response = router.dispatch(&request(), &candidates).await.unwrap();
        assert!(response.content.contains("provider.backup"));
        let flaky_health = router.provider_health("provider.flaky").unwrap();
        assert_eq!(flaky_health.consecutive_failures, 3);

        // Exactly one trip record.
        let trips = ledger
            .query(&crate::ledger::LedgerFilter {
                event_type: Some("circuit_opened".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(trips.len(), 1);
    }

    #[tokio::test]
    async fn test_all_providers_unavailable_when_every_circuit_open() {
        let mut config = router_config();
        config.failure_threshold = 1;
        let only = MockProvider::healthy("provider.only", 0.01);
        only.fail_next(1);
        let (router, _ledger) = test_router(config, vec![only]).await;
        let candidates = vec!["provider.only".to_string()];

        router.dispatch(&request(), &candidates).await.unwrap_err();
        let err = router.dispatch(&request(), &candidates).await.unwrap_err();
        assert!(matches!(err, CoreError::AllProvidersUnavailable(_)));
    }

    #[tokio::test]
    async fn test_half_open_trial_success_closes_circuit() {
        let mut config = router_config();
        config.failure_threshold = 1;
        config.cooldown = Duration::from_millis(10);
        let provider = MockProvider::healthy("provider.alpha", 0.01);
        provider.fail_next(1);
        let (router, ledger) = test_router(config, vec![provider]).await;
        let candidates = vec!["provider.alpha".to_string()];

        router.dispatch(&request(), &candidates).await.unwrap_err();
        assert_eq!(
            router.provider_health("provider.alpha").unwrap().circuit_state,
            CircuitState::Open
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        router.dispatch(&request(), &candidates).await.unwrap();
        let health = router.provider_health("provider.alpha").unwrap();
        assert_eq!(health.circuit_state, CircuitState::Closed);
        assert_eq!(health.consecutive_failures, 0);
        assert!(!health.trial_in_flight);

        let recoveries = ledger
            .query(&crate::ledger::LedgerFilter {
                event_type: Some("circuit_closed".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recoveries.len(), 1);
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() {
        let mut config = router_config();
        config.failure_threshold = 1;
        config.cooldown = Duration::from_millis(10);
        let provider = MockProvider::healthy("provider.alpha", 0.01);
        provider.fail_next(2);
        let (router, _ledger) = test_router(config, vec![provider]).await;
        let candidates = vec!["provider.alpha".to_string()];

        router.dispatch(&request(), &candidates).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.dispatch(&request(), &candidates).await.unwrap_err();

        let health = router.provider_health("provider.alpha").unwrap();
        assert_eq!(health.circuit_state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admits_exactly_one_trial() {
        let config = router_config();
        let provider = MockProvider::healthy("provider.alpha", 0.01);
        let (router, _ledger) = test_router(config, vec![provider]).await;

        // Force half-open with a trial already claimed by another dispatch.
        {
            let mut health = router.health.get_mut("provider.alpha").unwrap();
            health.circuit_state = CircuitState::HalfOpen;
            health.trial_in_flight = true;
        }
        let err = router
            .dispatch(&request(), &["provider.alpha".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AllProvidersUnavailable(_)));
    }

    #[tokio::test]
    async fn test_scoring_prefers_quality_and_breaks_ties_deterministically() {
        let config = router_config();
        let good = MockProvider::healthy("provider.good", 0.01);
        good.set_quality(0.9);
        let poor = MockProvider::healthy("provider.poor", 0.01);
        poor.set_quality(0.2);
        let (router, _ledger) = test_router(config, vec![poor, good]).await;

        let response = router
            .dispatch(
                &request(),
                &["provider.poor".to_string(), "provider.good".to_string()],
            )
            .await
            .unwrap();
        assert!(response.content.contains("provider.good"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_provider_failure() {
        let mut config = router_config();
        config.failure_threshold = 1;
        config.dispatch_timeout = Duration::from_millis(20);
        let slow = MockProvider::healthy("provider.slow", 0.01);
        slow.set_delay(Duration::from_secs(5));
        let (router, _ledger) = test_router(config, vec![slow]).await;

        let err = router
            .dispatch(&request(), &["provider.slow".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));
        assert_eq!(
            router.provider_health("provider.slow").unwrap().circuit_state,
            CircuitState::Open
        );
        // The reservation must have been released.
        let status = router.status().await;
        assert!((status.reserved - 0.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_lost_circuit_records_are_counted() {
        let mut config = router_config();
        config.failure_threshold = 1;
        let provider = MockProvider::healthy("provider.alpha", 0.01);
        provider.fail_next(1);
        let (router, ledger) = test_router(config, vec![provider]).await;

        // Poison the ledger so the circuit trip record cannot be appended.
        ledger
            .append(&GovernanceEvent::CircuitClosed {
                provider_id: "provider.other".into(),
            })
            .await
            .unwrap();
        sqlx::query("UPDATE ledger_records SET hash = 'junk' WHERE sequence_no = 1")
            .execute(ledger.pool())
            .await
            .unwrap();
        assert!(!ledger.verify_chain(0, i64::MAX).await.unwrap());

        let err = router
            .dispatch(&request(), &["provider.alpha".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ProviderFailure { .. }));

        // The circuit still tripped, and the lost record is visible.
        assert_eq!(
            router.provider_health("provider.alpha").unwrap().circuit_state,
            CircuitState::Open
        );
        let status = router.status().await;
        assert_eq!(status.ledger_append_failures, 1);
    }

    #[tokio::test]
    async fn test_lazy_rollover_persists_prior_totals() {
        let config = router_config();
        let provider = MockProvider::healthy("provider.alpha", 0.25);
        let (router, ledger) = test_router(config, vec![provider]).await;
        let candidates = vec!["provider.alpha".to_string()];

        router.dispatch(&request(), &candidates).await.unwrap();

        // Pretend the last reset happened yesterday.
        let yesterday = Utc::now().date_naive().pred_opt().unwrap();
        {
            let mut budget = router.budget.lock().await;
            budget.last_reset_date = yesterday;
        }

        router.dispatch(&request(), &candidates).await.unwrap();

        let status = router.status().await;
        assert_eq!(status.last_reset_date, Utc::now().date_naive());
        // Only the post-reset call remains in today's spend.
        assert!((status.daily_spend - 0.25).abs() < 1e-9);

        let rollovers = ledger
            .query(&crate::ledger::LedgerFilter {
                event_type: Some("budget_rollover".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rollovers.len(), 1);
        let data = &rollovers[0].payload["data"];
        assert_eq!(data["date"], yesterday.to_string());
        assert!((data["daily_spend"].as_f64().unwrap() - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_empty_candidate_set_is_unavailable() {
        let config = router_config();
        let provider = MockProvider::healthy("provider.alpha", 0.01);
        let (router, _ledger) = test_router(config, vec![provider]).await;
        let err = router.dispatch(&request(), &[]).await.unwrap_err();
        assert!(matches!(err, CoreError::AllProvidersUnavailable(_)));
    }

    #[test]
    fn test_config_rejects_missing_required_inputs() {
        let mut config = router_config();
        config.cooldown = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = router_config();
        config.failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
