//! Governance events — the payload vocabulary of the audit ledger.
//!
//! Every externally visible decision (promotion, rollback, budget denial,
//! circuit-breaker trip) maps to exactly one of these, appended as one
//! ledger record.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::gate::GateVerdict;
use crate::lifecycle::LifecycleState;
use crate::ArbiterId;

/// Per-provider usage totals inside one budget day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub cost_usd: f64,
    pub tokens: u64,
    pub call_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GovernanceEvent {
    /// A new challenger entered the pipeline.
    ChallengerRegistered {
        challenger_id: ArbiterId,
        generation: u64,
        parent_id: Option<ArbiterId>,
    },
    /// The gate evaluated one observation of a challenger.
    GateEvaluated {
        challenger_id: ArbiterId,
        verdict: GateVerdict,
    },
    /// A lifecycle transition was decided (durably, before it is applied).
    LifecycleTransition {
        challenger_id: ArbiterId,
        from: LifecycleState,
        to: LifecycleState,
        reason: String,
    },
    /// The router refused a dispatch (budget or availability).
    DispatchDenied {
        challenger_id: ArbiterId,
        reason: String,
    },
    /// A provider's circuit breaker tripped closed→open.
    CircuitOpened {
        provider_id: String,
        consecutive_failures: u32,
    },
    /// A provider recovered (half_open→closed on trial success).
    CircuitClosed { provider_id: String },
    /// Daily budget rollover: the prior day's totals, persisted before reset.
    BudgetRollover {
        date: NaiveDate,
        daily_spend: f64,
        per_provider: BTreeMap<String, ProviderUsage>,
    },
    /// Explicit external rollback request demoting a champion.
    ForcedRollback {
        challenger_id: ArbiterId,
        operator_reason: String,
    },
    /// A ledger integrity failure halted promotion activity.
    IntegrityHalt { detail: String },
}

impl GovernanceEvent {
    /// Stable event-type string stored in the ledger's `event_type` column
    /// and usable as a query filter.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            GovernanceEvent::ChallengerRegistered { .. } => "challenger_registered",
            GovernanceEvent::GateEvaluated { .. } => "gate_evaluated",
            GovernanceEvent::LifecycleTransition { .. } => "lifecycle_transition",
            GovernanceEvent::DispatchDenied { .. } => "dispatch_denied",
            GovernanceEvent::CircuitOpened { .. } => "circuit_opened",
            GovernanceEvent::CircuitClosed { .. } => "circuit_closed",
            GovernanceEvent::BudgetRollover { .. } => "budget_rollover",
            GovernanceEvent::ForcedRollback { .. } => "forced_rollback",
            GovernanceEvent::IntegrityHalt { .. } => "integrity_halt",
        }
    }
}
