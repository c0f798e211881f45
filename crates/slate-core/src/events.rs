use serde::{Deserialize, Serialize};

/// Event types recorded in the append-only ledger.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventType {
    ProjectCreated,
    ProjectBudgetChanged,
    ProjectDeleted,
    SceneCreated,
    SceneUpdated,
    SceneStatusChanged,
    SceneLocked,
    SceneLockReleased,
    AgentProposalCreated,
    ProposalApplied,
    ProposalDismissed,
}

impl std::fmt::Display for LedgerEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

impl std::str::FromStr for LedgerEventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_owned()))
            .map_err(|_| format!("unknown ledger event type: {s}"))
    }
}
