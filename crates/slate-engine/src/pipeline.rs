use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use slate_core::ids::ProposalId;
use slate_core::notify::Notification;
use slate_core::roles::ROLE_SEQUENCE;
use slate_store::jobs::JobRow;
use slate_store::proposals::ProposalRepo;
use slate_store::scenes::{SceneRepo, SceneRow};
use slate_store::Database;

use crate::budget::BudgetGuard;
use crate::error::PipelineError;
use crate::executor::AgentExecutor;

/// Default TTL on the scene lock for a pipeline run. Long enough for the
/// slowest role sequence; a crashed worker's lock is reclaimed after this.
const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub lock_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }
}

/// Result of a completed run: the proposals it produced (or found already
/// produced by an earlier attempt of the same job), in role order.
#[derive(Clone, Debug)]
pub struct PipelineOutcome {
    pub proposal_ids: Vec<ProposalId>,
    pub roles_completed: usize,
}

/// Runs the fixed role sequence against one scene:
/// NotStarted -> Locking -> Running(i) -> Completed | Aborted(reason).
///
/// Per role: cancellation check, budget authorization, executor call,
/// proposal creation. An abort leaves proposals from completed roles intact;
/// the lock is released on every exit path.
pub struct PipelineOrchestrator {
    db: Database,
    executor: Arc<dyn AgentExecutor>,
    notify_tx: broadcast::Sender<Notification>,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    pub fn new(
        db: Database,
        executor: Arc<dyn AgentExecutor>,
        notify_tx: broadcast::Sender<Notification>,
    ) -> Self {
        Self {
            db,
            executor,
            notify_tx,
            config: PipelineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    fn notify(&self, notification: Notification) {
        if self.notify_tx.send(notification).is_err() {
            debug!("no notification receivers");
        }
    }

    #[instrument(skip(self, cancel), fields(job_id = %job.id, scene_id = %job.scene_id))]
    pub async fn run(
        &self,
        job: &JobRow,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let scenes = SceneRepo::new(self.db.clone());
        let scene = scenes.get(&job.scene_id)?;
        let holder = job.id.as_str();

        debug!(state = "locking");
        let result = match scenes.acquire_lock(&job.scene_id, holder, self.config.lock_ttl) {
            // Run against the row the CAS returned, not the pre-lock read.
            Ok(locked) => {
                let inner = self.run_roles(job, &locked, cancel).await;
                if let Err(e) = scenes.release_lock(&job.scene_id, holder) {
                    warn!(error = %e, "failed to release pipeline lock");
                }
                inner
            }
            // Contention: abort without touching the other holder's lock.
            Err(e) => Err(e.into()),
        };

        match &result {
            Ok(outcome) => {
                debug!(state = "completed", proposals = outcome.proposal_ids.len());
                self.notify(Notification::PipelineCompleted {
                    project_id: scene.project_id.clone(),
                    scene_id: scene.id.clone(),
                    job_id: job.id.clone(),
                    proposals: outcome.proposal_ids.len(),
                });
            }
            Err(e) => {
                debug!(state = "aborted", reason = e.code());
                if !matches!(e, PipelineError::Cancelled) {
                    self.notify(Notification::PipelineFailed {
                        project_id: scene.project_id.clone(),
                        scene_id: scene.id.clone(),
                        job_id: job.id.clone(),
                        code: e.code().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        result
    }

    async fn run_roles(
        &self,
        job: &JobRow,
        scene: &SceneRow,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let proposals = ProposalRepo::new(self.db.clone());
        let budget = BudgetGuard::new(self.db.clone());
        let mut proposal_ids = Vec::with_capacity(ROLE_SEQUENCE.len());

        for (index, role) in ROLE_SEQUENCE.into_iter().enumerate() {
            // Cancellation takes effect at role boundaries only; an in-flight
            // executor call runs to completion.
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            debug!(state = "running", role_index = index, role = %role);

            // A prior attempt of this job may already have billed this role.
            if let Some(existing) = proposals.get_for_job_role(&job.id, role)? {
                debug!(role = %role, proposal_id = %existing.id, "role already completed by earlier attempt");
                proposal_ids.push(existing.id);
                continue;
            }

            budget.authorize(&scene.project_id, role.cost_estimate_usd())?;

            let draft = self
                .executor
                .execute(scene, role)
                .await
                .map_err(|e| PipelineError::AgentRunFailed {
                    scene_id: scene.id.clone(),
                    role,
                    message: e.message,
                })?;

            let row = proposals.create(&scene.id, Some(&job.id), &draft, job.id.as_str())?;
            self.notify(Notification::ProposalCreated {
                project_id: scene.project_id.clone(),
                scene_id: scene.id.clone(),
                proposal_id: row.id.clone(),
                role,
            });
            proposal_ids.push(row.id);
        }

        Ok(PipelineOutcome {
            roles_completed: proposal_ids.len(),
            proposal_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;
    use slate_core::errors::DomainError;
    use slate_core::roles::AgentRole;
    use slate_core::events::LedgerEventType;
    use slate_core::ids::{ProjectId, SceneId};
    use slate_store::jobs::JobRepo;
    use slate_store::ledger::{EventFilter, LedgerRepo};
    use slate_store::projects::ProjectRepo;
    use slate_store::proposals::ProposalStatus;

    fn setup(cap_usd: f64) -> (Database, ProjectId, SceneId, JobRow) {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create("Season One", cap_usd, "test").unwrap();
        let scene = SceneRepo::new(db.clone()).create(&project.id, "Cold Open", "test").unwrap();
        let job = JobRepo::new(db.clone()).enqueue_pipeline(&scene.id).unwrap();
        (db, project.id, scene.id, job)
    }

    fn orchestrator(db: &Database, executor: Arc<MockExecutor>) -> PipelineOrchestrator {
        let (tx, _rx) = broadcast::channel(256);
        PipelineOrchestrator::new(db.clone(), executor, tx)
    }

    #[tokio::test]
    async fn full_run_creates_six_proposals_in_role_order() {
        let (db, _project_id, scene_id, job) = setup(0.0);
        let executor = Arc::new(MockExecutor::new());
        let orch = orchestrator(&db, Arc::clone(&executor));

        let outcome = orch.run(&job, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.roles_completed, 6);
        assert_eq!(executor.calls(), 6);

        let proposals = ProposalRepo::new(db.clone()).list_for_scene(&scene_id).unwrap();
        assert_eq!(proposals.len(), 6);
        for (proposal, role) in proposals.iter().zip(ROLE_SEQUENCE) {
            assert_eq!(proposal.role, role);
            assert_eq!(proposal.status, ProposalStatus::Pending);
        }

        // Exactly 6 creation events, in role order
        let ledger = LedgerRepo::new(db.clone());
        let events = ledger
            .query(&EventFilter {
                event_type: Some(LedgerEventType::AgentProposalCreated),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(events.len(), 6);
        for (event, role) in events.iter().zip(ROLE_SEQUENCE) {
            assert_eq!(event.payload["role"], role.to_string());
        }

        // Lock released
        assert!(!SceneRepo::new(db).is_locked(&scene_id).unwrap());
    }

    #[tokio::test]
    async fn locked_scene_aborts_before_any_role() {
        let (db, _project_id, scene_id, job) = setup(0.0);
        SceneRepo::new(db.clone())
            .acquire_lock(&scene_id, "job_other", Duration::from_secs(60))
            .unwrap();

        let executor = Arc::new(MockExecutor::new());
        let orch = orchestrator(&db, Arc::clone(&executor));

        let err = orch.run(&job, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Domain(DomainError::ConcurrentModification { .. })
        ));
        assert_eq!(executor.calls(), 0);

        // The other holder's lock is untouched
        assert!(SceneRepo::new(db).is_locked(&scene_id).unwrap());
    }

    #[tokio::test]
    async fn executor_failure_keeps_earlier_proposals_and_releases_lock() {
        let (db, _project_id, scene_id, job) = setup(0.0);
        let executor =
            Arc::new(MockExecutor::new().with_failure(AgentRole::Cinematographer, "backend 503"));
        let orch = orchestrator(&db, Arc::clone(&executor));

        let err = orch.run(&job, &CancellationToken::new()).await.unwrap_err();
        match &err {
            PipelineError::AgentRunFailed { role, message, .. } => {
                assert_eq!(*role, AgentRole::Cinematographer);
                assert_eq!(message, "backend 503");
            }
            other => panic!("expected AgentRunFailed, got {other:?}"),
        }

        // Writer and director proposals persist; nothing rolled back
        let proposals = ProposalRepo::new(db.clone()).list_for_scene(&scene_id).unwrap();
        assert_eq!(proposals.len(), 2);
        assert!(!SceneRepo::new(db).is_locked(&scene_id).unwrap());
    }

    #[tokio::test]
    async fn budget_stop_keeps_partial_proposals() {
        // Cap $1.00: writer (est .40) and director (est .30) pass, then
        // cinematographer (est .25) passes at .95, editor (est .20) crosses.
        let (db, _project_id, scene_id, job) = setup(1.0);
        let executor = Arc::new(MockExecutor::new());
        let orch = orchestrator(&db, Arc::clone(&executor));

        let err = orch.run(&job, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Domain(DomainError::BudgetExceeded { .. })
        ));

        let proposals = ProposalRepo::new(db.clone()).list_for_scene(&scene_id).unwrap();
        assert_eq!(proposals.len(), 3);
        assert_eq!(executor.calls(), 3);
        assert!(!SceneRepo::new(db).is_locked(&scene_id).unwrap());
    }

    #[tokio::test]
    async fn retry_skips_roles_completed_by_earlier_attempt() {
        let (db, _project_id, scene_id, job) = setup(0.0);
        let executor =
            Arc::new(MockExecutor::new().with_failure(AgentRole::Cinematographer, "backend 503"));
        let orch = orchestrator(&db, Arc::clone(&executor));

        let cancel = CancellationToken::new();
        orch.run(&job, &cancel).await.unwrap_err();
        assert_eq!(executor.calls(), 3); // writer, director, cinematographer (failed)

        executor.clear_failure(AgentRole::Cinematographer);
        let outcome = orch.run(&job, &cancel).await.unwrap();
        assert_eq!(outcome.roles_completed, 6);
        // Second attempt re-runs only the four remaining roles
        assert_eq!(executor.calls(), 7);

        // No duplicate proposals per role
        let proposals = ProposalRepo::new(db).list_for_scene(&scene_id).unwrap();
        assert_eq!(proposals.len(), 6);
        let mut roles: Vec<_> = proposals.iter().map(|p| p.role).collect();
        roles.dedup();
        assert_eq!(roles.len(), 6);
    }

    #[tokio::test]
    async fn cancellation_takes_effect_before_first_role() {
        let (db, _project_id, scene_id, job) = setup(0.0);
        let executor = Arc::new(MockExecutor::new());
        let orch = orchestrator(&db, Arc::clone(&executor));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orch.run(&job, &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(executor.calls(), 0);
        assert!(!SceneRepo::new(db).is_locked(&scene_id).unwrap());
    }

    #[tokio::test]
    async fn notifications_published_per_proposal_and_completion() {
        let (db, _project_id, _scene_id, job) = setup(0.0);
        let executor = Arc::new(MockExecutor::new());
        let (tx, mut rx) = broadcast::channel(256);
        let orch = PipelineOrchestrator::new(db, executor, tx);

        orch.run(&job, &CancellationToken::new()).await.unwrap();

        let mut created = 0;
        let mut completed = 0;
        while let Ok(n) = rx.try_recv() {
            match n {
                Notification::ProposalCreated { .. } => created += 1,
                Notification::PipelineCompleted { proposals, .. } => {
                    completed += 1;
                    assert_eq!(proposals, 6);
                }
                other => panic!("unexpected notification: {other:?}"),
            }
        }
        assert_eq!(created, 6);
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn failure_notification_carries_stable_code() {
        let (db, _project_id, scene_id, job) = setup(0.0);
        SceneRepo::new(db.clone())
            .acquire_lock(&scene_id, "job_other", Duration::from_secs(60))
            .unwrap();

        let executor = Arc::new(MockExecutor::new());
        let (tx, mut rx) = broadcast::channel(16);
        let orch = PipelineOrchestrator::new(db, executor, tx);

        orch.run(&job, &CancellationToken::new()).await.unwrap_err();

        let mut saw_failure = false;
        while let Ok(n) = rx.try_recv() {
            if let Notification::PipelineFailed { code, .. } = n {
                assert_eq!(code, "concurrent_modification");
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }
}
