use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub mod events;
pub mod gate;
pub mod lifecycle;

pub use events::GovernanceEvent;
pub use gate::{Criterion, GateAction, GateMetrics, GateVerdict, ThresholdConfig};
pub use lifecycle::{ChallengerRecord, CumulativeMetrics, LifecycleState};

/// SDK version constant for consistent version reporting across the workspace.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Unique identifier within the Arbiter platform (challengers, traces, requests).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArbiterId(Uuid);

impl std::fmt::Display for ArbiterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default generates a random UUID v4, so each default ArbiterId is unique.
/// For deterministic IDs, use `ArbiterId::from_name()` instead.
impl Default for ArbiterId {
    fn default() -> Self {
        Self::new()
    }
}

impl ArbiterId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id derived from a name (UUID v5, DNS namespace).
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let namespace = Uuid::NAMESPACE_DNS;
        Self(Uuid::new_v5(&namespace, name.as_bytes()))
    }
}

/// Error taxonomy of the governance core, organized by failure semantics
/// rather than by module.
///
/// `IntegrityError` and `GateEvaluationError` are fatal: once raised, promotion
/// activity must halt until an operator intervenes. Everything else is
/// recoverable at the call site.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum CoreError {
    #[error("Budget exceeded: spent ${spent:.4} + estimated ${estimated:.4} > daily limit ${limit:.4}")]
    BudgetExceeded {
        spent: f64,
        estimated: f64,
        limit: f64,
    },
    #[error("All candidate providers unavailable: {0}")]
    AllProvidersUnavailable(String),
    #[error("Ledger integrity failure: {0}")]
    IntegrityError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Gate evaluation error: {0}")]
    GateEvaluationError(String),
    #[error("Provider failure: {id} - {message}")]
    ProviderFailure { id: String, message: String },
    #[error("Timeout occurred: {0}")]
    Timeout(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Challenger not found: {0}")]
    ChallengerNotFound(String),
    #[error("Invalid lifecycle transition: {0}")]
    InvalidTransition(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// Fatal errors halt all promotion activity system-wide until resolved.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::IntegrityError(_) | CoreError::GateEvaluationError(_)
        )
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// An evaluation/inference request dispatched against a backend provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub id: ArbiterId,
    pub prompt: String,
    pub max_tokens: u32,
    pub metadata: HashMap<String, String>,
}

impl ProviderRequest {
    #[must_use]
    pub fn new(prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            id: ArbiterId::new(),
            prompt: prompt.into(),
            max_tokens,
            metadata: HashMap::new(),
        }
    }
}

/// What a backend provider returns on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    pub cost_usd: f64,
    pub tokens: u64,
    pub latency_s: f64,
}

/// Abstract backend provider contract. Concrete SDK adapters live outside
/// the core; the Router only needs this fixed capability set.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    /// Estimated cost in USD of serving `request`, used for the pre-dispatch
    /// budget check. Must be an upper-bound-ish estimate, never negative.
    fn estimated_cost(&self, request: &ProviderRequest) -> f64;

    /// Rolling quality signal in [0.0, 1.0] used by the scoring function.
    fn quality_signal(&self) -> f64;

    /// Expected latency in seconds used by the scoring function.
    fn expected_latency_s(&self) -> f64;

    async fn call(&self, request: &ProviderRequest) -> CoreResult<ProviderResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_from_name_is_deterministic() {
        let a = ArbiterId::from_name("challenger.gen7");
        let b = ArbiterId::from_name("challenger.gen7");
        assert_eq!(a, b);
        assert_ne!(a, ArbiterId::from_name("challenger.gen8"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(CoreError::IntegrityError("hash mismatch".into()).is_fatal());
        assert!(CoreError::GateEvaluationError("NaN metric".into()).is_fatal());
        assert!(!CoreError::BudgetExceeded {
            spent: 0.9,
            estimated: 0.3,
            limit: 1.0
        }
        .is_fatal());
        assert!(!CoreError::AllProvidersUnavailable("all circuits open".into()).is_fatal());
    }

    #[test]
    fn test_error_serialization_round_trip() {
        let err = CoreError::ProviderFailure {
            id: "provider.alpha".into(),
            message: "upstream 503".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "ProviderFailure");
        let back: CoreError = serde_json::from_value(json).unwrap();
        assert!(matches!(back, CoreError::ProviderFailure { .. }));
    }
}
