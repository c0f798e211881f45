use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use slate_core::proposal::ProposalDraft;
use slate_core::roles::AgentRole;
use slate_store::scenes::SceneRow;

/// Failure inside an agent role invocation (upstream inference error, bad
/// response, timeout). The executor performs no retries of its own; retry
/// policy lives entirely in the job runner.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct AgentRunError {
    pub message: String,
}

impl AgentRunError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Runs a single agent role against scene context, producing at most one
/// proposal draft plus the usage it cost.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, scene: &SceneRow, role: AgentRole) -> Result<ProposalDraft, AgentRunError>;
}

/// Scripted executor for tests and local dev loops: deterministic drafts,
/// per-role cost overrides, per-role injected failures.
pub struct MockExecutor {
    costs: Mutex<HashMap<AgentRole, f64>>,
    failures: Mutex<HashMap<AgentRole, String>>,
    diffs: Mutex<HashMap<AgentRole, serde_json::Value>>,
    calls: AtomicU32,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            costs: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            diffs: Mutex::new(HashMap::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_cost(self, role: AgentRole, cost_usd: f64) -> Self {
        self.costs.lock().insert(role, cost_usd);
        self
    }

    pub fn with_failure(self, role: AgentRole, message: &str) -> Self {
        self.failures.lock().insert(role, message.to_string());
        self
    }

    pub fn with_diff(self, role: AgentRole, diff: serde_json::Value) -> Self {
        self.diffs.lock().insert(role, diff);
        self
    }

    /// Clear an injected failure so a later attempt succeeds.
    pub fn clear_failure(&self, role: AgentRole) {
        self.failures.lock().remove(&role);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AgentExecutor for MockExecutor {
    async fn execute(&self, scene: &SceneRow, role: AgentRole) -> Result<ProposalDraft, AgentRunError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if let Some(message) = self.failures.lock().get(&role) {
            return Err(AgentRunError::new(message.clone()));
        }

        let cost_usd = self
            .costs
            .lock()
            .get(&role)
            .copied()
            .unwrap_or_else(|| role.cost_estimate_usd());
        let diff = self
            .diffs
            .lock()
            .get(&role)
            .cloned()
            .unwrap_or_else(|| json!({"narrative_goal": format!("{role} notes for {}", scene.title)}));

        Ok(
            ProposalDraft::new(role, format!("{role} pass on {}", scene.title), diff)
                .with_rationale(format!("{role} reviewed the current draft"))
                .with_usage(1200, cost_usd),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slate_store::projects::ProjectRepo;
    use slate_store::scenes::SceneRepo;
    use slate_store::Database;

    fn scene() -> SceneRow {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create("P", 0.0, "t").unwrap();
        SceneRepo::new(db).create(&project.id, "Cold Open", "t").unwrap()
    }

    #[tokio::test]
    async fn produces_draft_with_role_cost() {
        let executor = MockExecutor::new();
        let draft = executor.execute(&scene(), AgentRole::Writer).await.unwrap();
        assert_eq!(draft.role, AgentRole::Writer);
        assert!((draft.cost_usd - AgentRole::Writer.cost_estimate_usd()).abs() < f64::EPSILON);
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn injected_failure_propagates() {
        let executor = MockExecutor::new().with_failure(AgentRole::Director, "backend 503");
        let err = executor.execute(&scene(), AgentRole::Director).await.unwrap_err();
        assert_eq!(err.message, "backend 503");

        executor.clear_failure(AgentRole::Director);
        assert!(executor.execute(&scene(), AgentRole::Director).await.is_ok());
    }

    #[tokio::test]
    async fn cost_override_applies() {
        let executor = MockExecutor::new().with_cost(AgentRole::Editor, 2.5);
        let draft = executor.execute(&scene(), AgentRole::Editor).await.unwrap();
        assert!((draft.cost_usd - 2.5).abs() < f64::EPSILON);
    }
}
