//! Environment-driven configuration for the governance core.
//!
//! Every tunable reads from an `ARBITER_*` variable. Two inputs carry no
//! default on purpose: the canary relaxation factor and the circuit cooldown
//! are tunable-but-not-derivable constants, so deployments must state them
//! explicitly rather than inherit a number nobody chose.

use anyhow::Context;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use arbiter_shared::ThresholdConfig;

use crate::orchestrator::OrchestratorConfig;
use crate::router::{RouterConfig, ScoreWeights};

/// Returns the directory containing the running executable.
/// Falls back to CWD if the exe path cannot be determined.
#[must_use]
pub fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub router: RouterConfig,
    pub orchestrator: OrchestratorConfig,
}

fn env_f64(name: &str, default: &str) -> anyhow::Result<f64> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<f64>()
        .with_context(|| format!("Failed to parse {name}"))
}

fn env_u64(name: &str, default: &str) -> anyhow::Result<u64> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<u64>()
        .with_context(|| format!("Failed to parse {name}"))
}

/// Required variable: absence is a configuration error, never a default.
fn require_f64(name: &str) -> anyhow::Result<f64> {
    let raw = env::var(name)
        .map_err(|_| anyhow::anyhow!("{name} is required and has no default"))?;
    raw.parse::<f64>()
        .with_context(|| format!("Failed to parse {name}"))
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| {
            let db_path = exe_dir().join("data").join("arbiter_ledger.db");
            format!("sqlite:{}", db_path.display())
        });

        // ── Router ──

        let daily_limit_usd = env_f64("ARBITER_DAILY_LIMIT_USD", "25.0")?;
        if !daily_limit_usd.is_finite() || daily_limit_usd < 0.0 {
            anyhow::bail!(
                "ARBITER_DAILY_LIMIT_USD must be a non-negative finite number (got {})",
                daily_limit_usd
            );
        }

        let weights = ScoreWeights {
            quality: env_f64("ARBITER_WEIGHT_QUALITY", "1.0")?,
            latency: env_f64("ARBITER_WEIGHT_LATENCY", "0.05")?,
            cost: env_f64("ARBITER_WEIGHT_COST", "1.0")?,
        };

        let failure_threshold = env_u64("ARBITER_FAILURE_THRESHOLD", "5")?;
        if failure_threshold == 0 || failure_threshold > 100 {
            anyhow::bail!(
                "ARBITER_FAILURE_THRESHOLD must be between 1 and 100 (got {})",
                failure_threshold
            );
        }

        let cooldown_secs = env::var("ARBITER_CIRCUIT_COOLDOWN_SECS")
            .map_err(|_| {
                anyhow::anyhow!("ARBITER_CIRCUIT_COOLDOWN_SECS is required and has no default")
            })?
            .parse::<u64>()
            .context("Failed to parse ARBITER_CIRCUIT_COOLDOWN_SECS")?;
        if cooldown_secs == 0 || cooldown_secs > 86_400 {
            anyhow::bail!(
                "ARBITER_CIRCUIT_COOLDOWN_SECS must be between 1 and 86400 (got {})",
                cooldown_secs
            );
        }

        let dispatch_timeout_secs = env_u64("ARBITER_DISPATCH_TIMEOUT_SECS", "30")?;
        if dispatch_timeout_secs == 0 || dispatch_timeout_secs > 600 {
            anyhow::bail!(
                "ARBITER_DISPATCH_TIMEOUT_SECS must be between 1 and 600 (got {})",
                dispatch_timeout_secs
            );
        }

        let router = RouterConfig {
            daily_limit_usd,
            weights,
            failure_threshold: u32::try_from(failure_threshold)
                .context("ARBITER_FAILURE_THRESHOLD out of range")?,
            cooldown: Duration::from_secs(cooldown_secs),
            dispatch_timeout: Duration::from_secs(dispatch_timeout_secs),
        };
        router.validate().map_err(|e| anyhow::anyhow!("{e}"))?;

        // ── Gate thresholds ──

        let canary_relaxation = require_f64("ARBITER_CANARY_RELAXATION")?;
        if !(0.0..=1.0).contains(&canary_relaxation) {
            anyhow::bail!(
                "ARBITER_CANARY_RELAXATION must be between 0.0 and 1.0 (got {})",
                canary_relaxation
            );
        }

        let thresholds = ThresholdConfig {
            rho_max: env_f64("ARBITER_RHO_MAX", "1.0")?,
            ece_max: env_f64("ARBITER_ECE_MAX", "0.02")?,
            rho_bias_max: env_f64("ARBITER_RHO_BIAS_MAX", "1.3")?,
            sr_min: env_f64("ARBITER_SR_MIN", "0.7")?,
            coherence_min: env_f64("ARBITER_COHERENCE_MIN", "0.8")?,
            beta_min: env_f64("ARBITER_BETA_MIN", "0.01")?,
            cost_max_increase: env_f64("ARBITER_COST_MAX_INCREASE", "0.10")?,
            kappa_min: env_f64("ARBITER_KAPPA_MIN", "0.5")?,
            canary_relaxation,
        };
        thresholds.validate().map_err(|e| anyhow::anyhow!("{e}"))?;

        // ── Orchestrator ──

        let canary_traffic_fraction = env_f64("ARBITER_CANARY_TRAFFIC_FRACTION", "0.05")?;
        if !(0.0..=1.0).contains(&canary_traffic_fraction) {
            anyhow::bail!(
                "ARBITER_CANARY_TRAFFIC_FRACTION must be between 0.0 and 1.0 (got {})",
                canary_traffic_fraction
            );
        }

        let orchestrator = OrchestratorConfig {
            thresholds,
            shadow_min_observations: env_u64("ARBITER_SHADOW_MIN_OBSERVATIONS", "20")?,
            canary_min_observations: env_u64("ARBITER_CANARY_MIN_OBSERVATIONS", "100")?,
            canary_traffic_fraction,
            max_error_rate_delta: env_f64("ARBITER_MAX_ERROR_RATE_DELTA", "0.05")?,
            max_latency_ratio: env_f64("ARBITER_MAX_LATENCY_RATIO", "1.5")?,
            champion_error_rate: env_f64("ARBITER_CHAMPION_ERROR_RATE", "0.0")?,
            champion_mean_latency_s: env_f64("ARBITER_CHAMPION_MEAN_LATENCY_S", "0.0")?,
        };
        orchestrator.validate().map_err(|e| anyhow::anyhow!("{e}"))?;

        Ok(Self {
            database_url,
            router,
            orchestrator,
        })
    }
}
