use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use slate_core::errors::DomainError;
use slate_core::ids::JobId;
use slate_store::jobs::{JobKind, JobRepo, JobRow};
use slate_store::scenes::{SceneRepo, SceneStatus};
use slate_store::Database;

use crate::error::PipelineError;
use crate::pipeline::PipelineOrchestrator;
use crate::render::RenderInvoker;

/// Fixed backoff schedule, indexed by failed attempt count.
pub const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
];

/// A job is terminal after this many failed attempts.
pub const MAX_ATTEMPTS: i64 = 3;

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Worker loop over the durable job queue.
///
/// Claims due jobs, dispatches them to the pipeline orchestrator or the
/// render invoker, and applies the retry contract: retryable failures are
/// rescheduled on the fixed backoff schedule up to `MAX_ATTEMPTS`; failures
/// that would deterministically recur (budget exceeded and the other
/// business rules, cancellation) terminal-fail immediately. The
/// distinguishing reason text survives to the job-status surface either way.
pub struct JobRunner {
    db: Database,
    orchestrator: Arc<PipelineOrchestrator>,
    renderer: Arc<dyn RenderInvoker>,
    config: RunnerConfig,
    active: Arc<DashMap<JobId, CancellationToken>>,
}

impl JobRunner {
    pub fn new(
        db: Database,
        orchestrator: Arc<PipelineOrchestrator>,
        renderer: Arc<dyn RenderInvoker>,
    ) -> Self {
        Self {
            db,
            orchestrator,
            renderer,
            config: RunnerConfig::default(),
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Poll the queue until shutdown. Drains back-to-back due jobs without
    /// sleeping; idles on the poll interval otherwise.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("job runner started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "job queue poll failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
        info!("job runner stopped");
    }

    /// Claim and process at most one due job. Returns whether one ran.
    pub async fn run_once(&self) -> Result<bool, slate_store::StoreError> {
        let jobs = JobRepo::new(self.db.clone());
        let Some(job) = jobs.claim_due()? else {
            return Ok(false);
        };
        self.process(&jobs, job).await;
        Ok(true)
    }

    #[instrument(skip(self, jobs, job), fields(job_id = %job.id, kind = %job.kind, attempt = job.attempt))]
    async fn process(&self, jobs: &JobRepo, job: JobRow) {
        let cancel = CancellationToken::new();
        self.active.insert(job.id.clone(), cancel.clone());

        let result = self.dispatch(&job, &cancel).await;
        self.active.remove(&job.id);

        match result {
            Ok(()) => {
                if let Err(e) = jobs.mark_succeeded(&job.id) {
                    error!(error = %e, "failed to record job success");
                } else {
                    info!("job succeeded");
                }
            }
            Err(e) => self.record_failure(jobs, &job, &e),
        }
    }

    async fn dispatch(
        &self,
        job: &JobRow,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        match job.kind {
            JobKind::Pipeline => {
                self.orchestrator.run(job, cancel).await?;
                Ok(())
            }
            JobKind::Render => {
                let scene = SceneRepo::new(self.db.clone()).get(&job.scene_id)?;
                if scene.status != SceneStatus::Approved {
                    return Err(DomainError::SceneNotApproved(scene.id.to_string()).into());
                }
                self.renderer
                    .render(&scene)
                    .await
                    .map_err(|e| PipelineError::RenderFailed {
                        scene_id: scene.id.clone(),
                        message: e.message,
                    })
            }
        }
    }

    fn record_failure(&self, jobs: &JobRepo, job: &JobRow, error: &PipelineError) {
        let attempt = job.attempt + 1;
        let reason = format!("{}: {}", error.code(), error);

        if !error.is_retryable() {
            warn!(attempt, reason = %reason, "job failed terminally");
            if let Err(e) = jobs.mark_failed(&job.id, attempt, &reason) {
                error!(error = %e, "failed to record terminal failure");
            }
            return;
        }

        if attempt >= MAX_ATTEMPTS {
            warn!(attempt, reason = %reason, "retry budget exhausted");
            if let Err(e) = jobs.mark_failed(&job.id, attempt, &reason) {
                error!(error = %e, "failed to record terminal failure");
            }
            return;
        }

        let delay = RETRY_BACKOFF[((attempt - 1) as usize).min(RETRY_BACKOFF.len() - 1)];
        warn!(attempt, delay_secs = delay.as_secs(), reason = %reason, "rescheduling job");
        if let Err(e) = jobs.reschedule(&job.id, attempt, delay, &reason) {
            error!(error = %e, "failed to reschedule job");
        }
    }

    /// Cooperatively cancel an in-flight job. Takes effect at the next role
    /// boundary; returns false when the job is not currently processing.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        match self.active.get(job_id) {
            Some(entry) => {
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;
    use crate::pipeline::PipelineOrchestrator;
    use crate::render::{MockRenderer, NoopRenderer};
    use chrono::Utc;
    use slate_core::ids::SceneId;
    use slate_core::roles::AgentRole;
    use slate_store::jobs::JobState;
    use slate_store::projects::ProjectRepo;
    use slate_store::proposals::ProposalRepo;
    use tokio::sync::broadcast;

    fn setup(cap_usd: f64) -> (Database, SceneId) {
        let db = Database::in_memory().unwrap();
        let project = ProjectRepo::new(db.clone()).create("Season One", cap_usd, "test").unwrap();
        let scene = SceneRepo::new(db.clone()).create(&project.id, "Cold Open", "test").unwrap();
        (db, scene.id)
    }

    fn runner(db: &Database, executor: Arc<MockExecutor>) -> JobRunner {
        let (tx, _rx) = broadcast::channel(256);
        let orch = Arc::new(PipelineOrchestrator::new(db.clone(), executor, tx));
        JobRunner::new(db.clone(), orch, Arc::new(NoopRenderer))
    }

    fn force_due(db: &Database, job_id: &JobId) {
        let past = (Utc::now() - chrono::Duration::seconds(1)).to_rfc3339();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET run_at = ?1 WHERE id = ?2",
                rusqlite::params![past, job_id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[tokio::test]
    async fn successful_pipeline_job_succeeds() {
        let (db, scene_id) = setup(0.0);
        let jobs = JobRepo::new(db.clone());
        let job = jobs.enqueue_pipeline(&scene_id).unwrap();

        let runner = runner(&db, Arc::new(MockExecutor::new()));
        assert!(runner.run_once().await.unwrap());

        let status = jobs.status(&job.id).unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert!(status.reason.is_none());

        let proposals = ProposalRepo::new(db).list_for_scene(&scene_id).unwrap();
        assert_eq!(proposals.len(), 6);
    }

    #[tokio::test]
    async fn run_once_without_due_jobs_is_noop() {
        let (db, _scene_id) = setup(0.0);
        let runner = runner(&db, Arc::new(MockExecutor::new()));
        assert!(!runner.run_once().await.unwrap());
    }

    #[tokio::test]
    async fn agent_failure_reschedules_with_first_backoff() {
        let (db, scene_id) = setup(0.0);
        let jobs = JobRepo::new(db.clone());
        let job = jobs.enqueue_pipeline(&scene_id).unwrap();

        let executor = Arc::new(MockExecutor::new().with_failure(AgentRole::Cinematographer, "backend 503"));
        let runner = runner(&db, Arc::clone(&executor));
        runner.run_once().await.unwrap();

        let fetched = jobs.get(&job.id).unwrap();
        assert_eq!(fetched.state, JobState::Scheduled);
        assert_eq!(fetched.attempt, 1);
        assert!(fetched.last_error.as_deref().unwrap().contains("agent_run_failed"));

        // Rescheduled ~30s out: due no earlier than +25s, no later than +35s
        let run_at = chrono::DateTime::parse_from_rfc3339(&fetched.run_at).unwrap();
        let delta = run_at.signed_duration_since(Utc::now()).num_seconds();
        assert!((25..=35).contains(&delta), "backoff was {delta}s");

        // Earlier roles' proposals persist
        let proposals = ProposalRepo::new(db).list_for_scene(&scene_id).unwrap();
        assert_eq!(proposals.len(), 2);
    }

    #[tokio::test]
    async fn retried_job_finishes_without_duplicate_proposals() {
        let (db, scene_id) = setup(0.0);
        let jobs = JobRepo::new(db.clone());
        let job = jobs.enqueue_pipeline(&scene_id).unwrap();

        let executor = Arc::new(MockExecutor::new().with_failure(AgentRole::Cinematographer, "backend 503"));
        let runner = runner(&db, Arc::clone(&executor));
        runner.run_once().await.unwrap();

        executor.clear_failure(AgentRole::Cinematographer);
        force_due(&db, &job.id);
        runner.run_once().await.unwrap();

        assert_eq!(jobs.get(&job.id).unwrap().state, JobState::Succeeded);
        let proposals = ProposalRepo::new(db).list_for_scene(&scene_id).unwrap();
        assert_eq!(proposals.len(), 6);
    }

    #[tokio::test]
    async fn retryable_failure_exhausts_after_three_attempts() {
        let (db, scene_id) = setup(0.0);
        let jobs = JobRepo::new(db.clone());
        let job = jobs.enqueue_pipeline(&scene_id).unwrap();

        let executor = Arc::new(MockExecutor::new().with_failure(AgentRole::Writer, "backend 503"));
        let runner = runner(&db, Arc::clone(&executor));

        for _ in 0..3 {
            force_due(&db, &job.id);
            runner.run_once().await.unwrap();
        }

        let status = jobs.status(&job.id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert!(status.reason.unwrap().contains("backend 503"));
        assert_eq!(jobs.get(&job.id).unwrap().attempt, 3);
    }

    #[tokio::test]
    async fn budget_exceeded_fails_terminally_without_retries() {
        // Cap below the writer's estimate: the first role is denied.
        let (db, scene_id) = setup(0.10);
        let jobs = JobRepo::new(db.clone());
        let job = jobs.enqueue_pipeline(&scene_id).unwrap();

        let executor = Arc::new(MockExecutor::new());
        let runner = runner(&db, Arc::clone(&executor));
        runner.run_once().await.unwrap();

        let status = jobs.status(&job.id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        let reason = status.reason.unwrap();
        assert!(reason.starts_with("budget_exceeded:"), "got: {reason}");

        // One attempt only; nothing left on the queue
        assert_eq!(jobs.get(&job.id).unwrap().attempt, 1);
        assert!(!runner.run_once().await.unwrap());
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn lock_contention_is_retried_then_exhausted() {
        let (db, scene_id) = setup(0.0);
        let jobs = JobRepo::new(db.clone());
        let job = jobs.enqueue_pipeline(&scene_id).unwrap();

        // Another holder keeps the scene locked for the whole test.
        SceneRepo::new(db.clone())
            .acquire_lock(&scene_id, "job_other", Duration::from_secs(600))
            .unwrap();

        let runner = runner(&db, Arc::new(MockExecutor::new()));
        for _ in 0..3 {
            force_due(&db, &job.id);
            runner.run_once().await.unwrap();
        }

        let status = jobs.status(&job.id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert!(status.reason.unwrap().starts_with("concurrent_modification:"));
    }

    #[tokio::test]
    async fn render_job_retries_then_succeeds() {
        let (db, scene_id) = setup(0.0);
        let scenes = SceneRepo::new(db.clone());
        scenes.transition_status(&scene_id, SceneStatus::Review, "u").unwrap();
        scenes.transition_status(&scene_id, SceneStatus::Approved, "u").unwrap();

        let jobs = JobRepo::new(db.clone());
        let job = jobs.enqueue_render(&scene_id).unwrap();

        let (tx, _rx) = broadcast::channel(16);
        let orch = Arc::new(PipelineOrchestrator::new(db.clone(), Arc::new(MockExecutor::new()), tx));
        let renderer = Arc::new(MockRenderer::new(1));
        let runner = JobRunner::new(db.clone(), orch, Arc::clone(&renderer) as Arc<dyn RenderInvoker>);

        runner.run_once().await.unwrap();
        let fetched = jobs.get(&job.id).unwrap();
        assert_eq!(fetched.state, JobState::Scheduled);
        assert!(fetched.last_error.as_deref().unwrap().contains("render_failed"));

        force_due(&db, &job.id);
        runner.run_once().await.unwrap();
        assert_eq!(jobs.get(&job.id).unwrap().state, JobState::Succeeded);
        assert_eq!(renderer.calls(), 2);
    }

    #[tokio::test]
    async fn cancel_returns_false_when_idle() {
        let (db, _scene_id) = setup(0.0);
        let runner = runner(&db, Arc::new(MockExecutor::new()));
        assert!(!runner.cancel(&JobId::new()));
        assert_eq!(runner.active_count(), 0);
    }
}
