//! Evolution governance core: audit ledger, cost-aware router, policy gate,
//! and the champion-challenger orchestrator that ties them together.

pub mod config;
pub mod gate;
pub mod ledger;
pub mod orchestrator;
pub mod router;
pub mod test_utils;

pub use config::AppConfig;
pub use gate::evaluate;
pub use ledger::{Ledger, LedgerFilter, LedgerRecord, GENESIS_HASH};
pub use orchestrator::{
    ObservationOutcome, Orchestrator, OrchestratorConfig, OrchestratorStatus, ScoreSource,
};
pub use router::{
    BudgetState, CircuitState, ProviderHealth, Router, RouterConfig, RouterStatus, ScoreWeights,
};
