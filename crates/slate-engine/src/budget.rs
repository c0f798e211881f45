use tracing::instrument;

use slate_core::errors::DomainError;
use slate_core::ids::ProjectId;
use slate_store::projects::ProjectRepo;
use slate_store::proposals::ProposalRepo;
use slate_store::Database;

use crate::error::PipelineError;

/// Pre-execution budget authorization.
///
/// Spend is computed as a live fold over the proposal history, never a
/// stored counter, so it cannot drift from the ledger. The check is
/// per-role: a run may clear roles 1..k and stop at k+1 with the earlier
/// proposals (and their cost) intact.
///
/// Known limitation: two scenes' pipelines on the same project can both pass
/// authorization from a spend snapshot that is immediately stale. Only the
/// scene lock serializes spend, so across scenes the cap is best-effort
/// advisory.
pub struct BudgetGuard {
    projects: ProjectRepo,
    proposals: ProposalRepo,
}

impl BudgetGuard {
    pub fn new(db: Database) -> Self {
        Self {
            projects: ProjectRepo::new(db.clone()),
            proposals: ProposalRepo::new(db),
        }
    }

    /// Total cost of every proposal ever created under the project.
    pub fn current_spend(&self, project_id: &ProjectId) -> Result<f64, PipelineError> {
        Ok(self.proposals.project_spend(project_id)?)
    }

    /// Allow the estimated increment iff it keeps spend within the cap.
    /// A cap of zero (or unset) means unlimited.
    #[instrument(skip(self), fields(project_id = %project_id, estimated_cost_usd))]
    pub fn authorize(
        &self,
        project_id: &ProjectId,
        estimated_cost_usd: f64,
    ) -> Result<(), PipelineError> {
        let project = self.projects.get(project_id)?;
        if project.budget_cap_usd <= 0.0 {
            return Ok(());
        }

        let spend = self.proposals.project_spend(project_id)?;
        if spend + estimated_cost_usd > project.budget_cap_usd {
            return Err(DomainError::BudgetExceeded {
                spend_usd: spend,
                estimated_usd: estimated_cost_usd,
                cap_usd: project.budget_cap_usd,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use slate_core::ids::SceneId;
    use slate_core::proposal::ProposalDraft;
    use slate_core::roles::AgentRole;
    use slate_store::scenes::SceneRepo;

    fn setup(cap_usd: f64) -> (Database, BudgetGuard, ProjectId, SceneId) {
        let db = Database::in_memory().unwrap();
        let projects = ProjectRepo::new(db.clone());
        let project = projects.create("Season One", cap_usd, "test").unwrap();
        let scenes = SceneRepo::new(db.clone());
        let scene = scenes.create(&project.id, "Cold Open", "test").unwrap();
        (db.clone(), BudgetGuard::new(db), project.id, scene.id)
    }

    fn spend(db: &Database, scene_id: &SceneId, cost_usd: f64) {
        let proposals = ProposalRepo::new(db.clone());
        proposals
            .create(
                scene_id,
                None,
                &ProposalDraft::new(AgentRole::Writer, "pass", json!({})).with_usage(1000, cost_usd),
                "test",
            )
            .unwrap();
    }

    #[test]
    fn denies_increment_past_cap() {
        // Cap $10.00, prior spend $9.50, next estimate $1.00
        let (db, guard, project_id, scene_id) = setup(10.0);
        spend(&db, &scene_id, 9.50);

        let err = guard.authorize(&project_id, 1.0).unwrap_err();
        match err {
            PipelineError::Domain(DomainError::BudgetExceeded {
                spend_usd,
                estimated_usd,
                cap_usd,
            }) => {
                assert!((spend_usd - 9.5).abs() < 1e-9);
                assert!((estimated_usd - 1.0).abs() < 1e-9);
                assert!((cap_usd - 10.0).abs() < 1e-9);
            }
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
    }

    #[test]
    fn allows_spend_up_to_cap() {
        let (db, guard, project_id, scene_id) = setup(10.0);
        spend(&db, &scene_id, 9.50);
        guard.authorize(&project_id, 0.50).unwrap();
    }

    #[test]
    fn zero_cap_means_unlimited() {
        let (db, guard, project_id, scene_id) = setup(0.0);
        spend(&db, &scene_id, 1_000.0);
        guard.authorize(&project_id, 1_000.0).unwrap();
    }

    #[test]
    fn spend_never_decreases() {
        let (db, guard, project_id, scene_id) = setup(10.0);
        spend(&db, &scene_id, 2.0);
        let s1 = guard.current_spend(&project_id).unwrap();

        // Dismissing a proposal does not refund its cost
        let proposals = ProposalRepo::new(db.clone());
        let all = proposals.list_for_scene(&scene_id).unwrap();
        proposals.dismiss(&all[0].id, "user:x").unwrap();

        let s2 = guard.current_spend(&project_id).unwrap();
        assert!(s2 >= s1);
        assert!((s2 - 2.0).abs() < 1e-9);
    }

    #[test]
    fn missing_project_is_store_error() {
        let db = Database::in_memory().unwrap();
        let guard = BudgetGuard::new(db);
        let err = guard.authorize(&ProjectId::from_raw("proj_missing"), 1.0).unwrap_err();
        assert!(matches!(err, PipelineError::Store(_)));
    }
}
