//! Shared test helpers: in-memory storage, deterministic providers, and
//! baseline configurations.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use arbiter_shared::{
    CoreError, CoreResult, GateMetrics, Provider, ProviderRequest, ProviderResponse,
    ThresholdConfig,
};

use crate::orchestrator::{OrchestratorConfig, ScoreSource};
use crate::router::{RouterConfig, ScoreWeights};

/// In-memory SQLite pool for tests. Capped at one connection: every
/// `:memory:` connection is its own database, so a larger pool would hand
/// out connections that cannot see the schema.
pub async fn memory_pool() -> SqlitePool {
    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("in-memory sqlite pool")
}

// ══════════════════════════════════════════════════════════════
// Mock provider
// ══════════════════════════════════════════════════════════════

/// Deterministic provider double. Succeeds by default; `fail_next(n)` makes
/// the next `n` calls fail, `set_delay` makes calls slow enough to trip the
/// dispatch timeout.
pub struct MockProvider {
    id: String,
    cost_per_call: f64,
    failures_remaining: AtomicUsize,
    quality: Mutex<f64>,
    delay: Mutex<Option<Duration>>,
}

impl MockProvider {
    pub fn healthy(id: &str, cost_per_call: f64) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            cost_per_call,
            failures_remaining: AtomicUsize::new(0),
            quality: Mutex::new(0.8),
            delay: Mutex::new(None),
        })
    }

    /// The next `n` calls return a `ProviderFailure`.
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn set_quality(&self, quality: f64) {
        *self.quality.lock().unwrap() = quality;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn estimated_cost(&self, _request: &ProviderRequest) -> f64 {
        self.cost_per_call
    }

    fn quality_signal(&self) -> f64 {
        *self.quality.lock().unwrap()
    }

    fn expected_latency_s(&self) -> f64 {
        0.05
    }

    async fn call(&self, request: &ProviderRequest) -> CoreResult<ProviderResponse> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.take_failure() {
            return Err(CoreError::ProviderFailure {
                id: self.id.clone(),
                message: "injected failure".into(),
            });
        }
        Ok(ProviderResponse {
            content: format!("{}: response to {}", self.id, request.id),
            cost_usd: self.cost_per_call,
            tokens: u64::from(request.max_tokens),
            latency_s: 0.05,
        })
    }
}

// ══════════════════════════════════════════════════════════════
// Score source doubles
// ══════════════════════════════════════════════════════════════

/// Score source that returns a fixed metrics snapshot every time.
pub struct StaticScores {
    metrics: GateMetrics,
}

impl StaticScores {
    /// Metrics that pass all ten criteria under `thresholds()`.
    pub fn passing() -> Arc<Self> {
        Arc::new(Self {
            metrics: passing_metrics(),
        })
    }

    /// Metrics whose quality delta is far below the canary zone, so the gate
    /// verdict is a plain rollback.
    pub fn failing() -> Arc<Self> {
        let mut metrics = passing_metrics();
        metrics.delta_linf = -1.0;
        Arc::new(Self { metrics })
    }

    pub fn fixed(metrics: GateMetrics) -> Arc<Self> {
        Arc::new(Self { metrics })
    }
}

#[async_trait]
impl ScoreSource for StaticScores {
    async fn score(
        &self,
        _request: &ProviderRequest,
        _response: &ProviderResponse,
    ) -> CoreResult<GateMetrics> {
        Ok(self.metrics.clone())
    }
}

// ══════════════════════════════════════════════════════════════
// Baseline configurations
// ══════════════════════════════════════════════════════════════

/// A metrics snapshot well inside every threshold of `thresholds()`.
pub fn passing_metrics() -> GateMetrics {
    GateMetrics {
        contractivity: 0.85,
        calibration_error: 0.01,
        bias_ratio: 1.05,
        sr_score: 0.85,
        coherence: 0.90,
        delta_linf: 0.05,
        cost_increase: 0.02,
        kappa: 0.90,
        consent: true,
        ecological_ok: true,
    }
}

pub fn thresholds() -> ThresholdConfig {
    ThresholdConfig {
        rho_max: 1.0,
        ece_max: 0.02,
        rho_bias_max: 1.3,
        sr_min: 0.7,
        coherence_min: 0.8,
        beta_min: 0.01,
        cost_max_increase: 0.10,
        kappa_min: 0.5,
        canary_relaxation: 0.95,
    }
}

pub fn router_config() -> RouterConfig {
    RouterConfig {
        daily_limit_usd: 50.0,
        weights: ScoreWeights {
            quality: 1.0,
            latency: 0.05,
            cost: 1.0,
        },
        failure_threshold: 5,
        cooldown: Duration::from_secs(60),
        dispatch_timeout: Duration::from_secs(5),
    }
}

pub fn orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        thresholds: thresholds(),
        shadow_min_observations: 3,
        canary_min_observations: 5,
        canary_traffic_fraction: 0.05,
        max_error_rate_delta: 0.05,
        max_latency_ratio: 2.0,
        champion_error_rate: 0.01,
        champion_mean_latency_s: 1.0,
    }
}
