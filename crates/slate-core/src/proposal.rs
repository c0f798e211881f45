use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::roles::AgentRole;

/// What an agent role hands back after running against scene context:
/// a suggested change plus the usage it cost to produce. Not yet persisted;
/// the proposal store turns a draft into a pending proposal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalDraft {
    pub role: AgentRole,
    pub summary: String,
    pub rationale: String,
    /// Structured change payload. Opaque to the ledger; interpreted as a
    /// `SceneDiff` when the proposal is applied.
    pub diff: Value,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

impl ProposalDraft {
    pub fn new(role: AgentRole, summary: impl Into<String>, diff: Value) -> Self {
        Self {
            role,
            summary: summary.into(),
            rationale: String::new(),
            diff,
            tokens_used: 0,
            cost_usd: 0.0,
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_usage(mut self, tokens_used: u64, cost_usd: f64) -> Self {
        self.tokens_used = tokens_used;
        self.cost_usd = cost_usd;
        self
    }
}
