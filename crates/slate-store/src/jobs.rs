use std::time::Duration;

use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use slate_core::errors::DomainError;
use slate_core::ids::{JobId, SceneId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::scenes::{get_scene, SceneStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Pipeline,
    Render,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipeline => write!(f, "pipeline"),
            Self::Render => write!(f, "render"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pipeline" => Ok(Self::Pipeline),
            "render" => Ok(Self::Render),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Processing,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Processing => write!(f, "processing"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "processing" => Ok(Self::Processing),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRow {
    pub id: JobId,
    pub kind: JobKind,
    pub scene_id: SceneId,
    pub state: JobState,
    pub attempt: i64,
    pub last_error: Option<String>,
    pub run_at: String,
    pub created_at: String,
    pub updated_at: String,
}

/// What the job-status surface reports to callers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub created_at: String,
    pub last_changed_at: String,
    pub reason: Option<String>,
}

pub struct JobRepo {
    db: Database,
}

impl JobRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Enqueue a pipeline run for a scene. The scene must exist.
    #[instrument(skip(self), fields(scene_id = %scene_id))]
    pub fn enqueue_pipeline(&self, scene_id: &SceneId) -> Result<JobRow, StoreError> {
        self.db.with_tx(|conn| {
            get_scene(conn, scene_id)?;
            insert_job(conn, JobKind::Pipeline, scene_id)
        })
    }

    /// Enqueue a render for an approved scene. Rendering a scene that has
    /// not cleared review is rejected.
    #[instrument(skip(self), fields(scene_id = %scene_id))]
    pub fn enqueue_render(&self, scene_id: &SceneId) -> Result<JobRow, StoreError> {
        self.db.with_tx(|conn| {
            let scene = get_scene(conn, scene_id)?;
            if scene.status != SceneStatus::Approved {
                return Err(DomainError::SceneNotApproved(scene_id.to_string()).into());
            }
            insert_job(conn, JobKind::Render, scene_id)
        })
    }

    #[instrument(skip(self), fields(job_id = %id))]
    pub fn get(&self, id: &JobId) -> Result<JobRow, StoreError> {
        self.db.with_conn(|conn| get_job(conn, id))
    }

    /// The job-status query surface.
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn status(&self, id: &JobId) -> Result<JobStatus, StoreError> {
        let job = self.get(id)?;
        Ok(JobStatus {
            state: job.state,
            created_at: job.created_at,
            last_changed_at: job.updated_at,
            reason: job.last_error,
        })
    }

    /// Claim the earliest due scheduled job, moving it to processing.
    /// Claim and state flip happen in one transaction so two workers never
    /// take the same job.
    #[instrument(skip(self))]
    pub fn claim_due(&self) -> Result<Option<JobRow>, StoreError> {
        self.db.with_tx(|conn| {
            let now = Utc::now().to_rfc3339();
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM jobs WHERE state = 'scheduled' AND run_at <= ?1
                     ORDER BY run_at ASC, id ASC LIMIT 1",
                    [&now],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = id else {
                return Ok(None);
            };

            conn.execute(
                "UPDATE jobs SET state = 'processing', updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id],
            )?;

            Ok(Some(get_job(conn, &JobId::from_raw(id))?))
        })
    }

    #[instrument(skip(self), fields(job_id = %id))]
    pub fn mark_succeeded(&self, id: &JobId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE jobs SET state = 'succeeded', updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Put a failed attempt back on the queue after a backoff delay.
    #[instrument(skip(self), fields(job_id = %id, attempt))]
    pub fn reschedule(
        &self,
        id: &JobId,
        attempt: i64,
        delay: Duration,
        error: &str,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now();
            let run_at = (now + chrono::Duration::milliseconds(delay.as_millis() as i64)).to_rfc3339();
            conn.execute(
                "UPDATE jobs SET state = 'scheduled', attempt = ?1, last_error = ?2, run_at = ?3, updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![attempt, error, run_at, now.to_rfc3339(), id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Terminal failure. `error` keeps the distinguishing reason text for
    /// the job-status surface.
    #[instrument(skip(self), fields(job_id = %id, attempt))]
    pub fn mark_failed(&self, id: &JobId, attempt: i64, error: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE jobs SET state = 'failed', attempt = ?1, last_error = ?2, updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![attempt, error, now, id.as_str()],
            )?;
            Ok(())
        })
    }
}

fn insert_job(
    conn: &rusqlite::Connection,
    kind: JobKind,
    scene_id: &SceneId,
) -> Result<JobRow, StoreError> {
    let id = JobId::new();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO jobs (id, kind, scene_id, state, attempt, run_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'scheduled', 0, ?4, ?4, ?4)",
        rusqlite::params![id.as_str(), kind.to_string(), scene_id.as_str(), now],
    )?;

    get_job(conn, &id)
}

const JOB_COLUMNS: &str = "id, kind, scene_id, state, attempt, last_error, run_at, created_at, updated_at";

pub(crate) fn get_job(conn: &rusqlite::Connection, id: &JobId) -> Result<JobRow, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_job(row),
        None => Err(StoreError::NotFound(format!("job {id}"))),
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> Result<JobRow, StoreError> {
    let kind_str: String = row_helpers::get(row, 1, "jobs", "kind")?;
    let state_str: String = row_helpers::get(row, 3, "jobs", "state")?;

    Ok(JobRow {
        id: JobId::from_raw(row_helpers::get::<String>(row, 0, "jobs", "id")?),
        kind: row_helpers::parse_enum(&kind_str, "jobs", "kind")?,
        scene_id: SceneId::from_raw(row_helpers::get::<String>(row, 2, "jobs", "scene_id")?),
        state: row_helpers::parse_enum(&state_str, "jobs", "state")?,
        attempt: row_helpers::get(row, 4, "jobs", "attempt")?,
        last_error: row_helpers::get_opt(row, 5, "jobs", "last_error")?,
        run_at: row_helpers::get(row, 6, "jobs", "run_at")?,
        created_at: row_helpers::get(row, 7, "jobs", "created_at")?,
        updated_at: row_helpers::get(row, 8, "jobs", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::ProjectRepo;
    use crate::scenes::SceneRepo;
    use std::sync::Arc;

    fn setup() -> (Database, JobRepo, SceneId) {
        let db = Database::in_memory().unwrap();
        let projects = ProjectRepo::new(db.clone());
        let project = projects.create("Season One", 0.0, "test").unwrap();
        let scenes = SceneRepo::new(db.clone());
        let scene = scenes.create(&project.id, "Cold Open", "test").unwrap();
        (db.clone(), JobRepo::new(db.clone()), scene.id)
    }

    #[test]
    fn enqueue_pipeline_is_scheduled() {
        let (_db, repo, scene_id) = setup();
        let job = repo.enqueue_pipeline(&scene_id).unwrap();
        assert!(job.id.as_str().starts_with("job_"));
        assert_eq!(job.kind, JobKind::Pipeline);
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.attempt, 0);
        assert!(job.last_error.is_none());
    }

    #[test]
    fn enqueue_pipeline_requires_scene() {
        let (_db, repo, _) = setup();
        let result = repo.enqueue_pipeline(&SceneId::from_raw("scn_missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn enqueue_render_requires_approved_scene() {
        let (db, repo, scene_id) = setup();
        let err = repo.enqueue_render(&scene_id).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::SceneNotApproved(_))
        ));

        let scenes = SceneRepo::new(db);
        scenes.transition_status(&scene_id, SceneStatus::Review, "u").unwrap();
        scenes.transition_status(&scene_id, SceneStatus::Approved, "u").unwrap();

        let job = repo.enqueue_render(&scene_id).unwrap();
        assert_eq!(job.kind, JobKind::Render);
    }

    #[test]
    fn claim_due_flips_to_processing() {
        let (_db, repo, scene_id) = setup();
        let job = repo.enqueue_pipeline(&scene_id).unwrap();

        let claimed = repo.claim_due().unwrap().expect("job should be due");
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.state, JobState::Processing);

        // Nothing else to claim
        assert!(repo.claim_due().unwrap().is_none());
    }

    #[test]
    fn claim_skips_future_jobs() {
        let (db, repo, scene_id) = setup();
        let job = repo.enqueue_pipeline(&scene_id).unwrap();
        let future = (Utc::now() + chrono::Duration::seconds(60)).to_rfc3339();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET run_at = ?1 WHERE id = ?2",
                rusqlite::params![future, job.id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();

        assert!(repo.claim_due().unwrap().is_none());
    }

    #[test]
    fn concurrent_claims_take_distinct_jobs() {
        let (_db, repo, scene_id) = setup();
        repo.enqueue_pipeline(&scene_id).unwrap();
        repo.enqueue_pipeline(&scene_id).unwrap();

        let repo = Arc::new(repo);
        let mut handles = vec![];
        for _ in 0..4 {
            let repo = Arc::clone(&repo);
            handles.push(std::thread::spawn(move || {
                repo.claim_due().unwrap().map(|j| j.id)
            }));
        }

        let claimed: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(claimed.len(), 2);
        assert_ne!(claimed[0], claimed[1]);
    }

    #[test]
    fn reschedule_backs_off() {
        let (_db, repo, scene_id) = setup();
        let job = repo.enqueue_pipeline(&scene_id).unwrap();
        repo.claim_due().unwrap().unwrap();

        repo.reschedule(&job.id, 1, Duration::from_secs(30), "agent run failed: writer")
            .unwrap();

        let fetched = repo.get(&job.id).unwrap();
        assert_eq!(fetched.state, JobState::Scheduled);
        assert_eq!(fetched.attempt, 1);
        assert_eq!(fetched.last_error.as_deref(), Some("agent run failed: writer"));
        assert!(fetched.run_at > Utc::now().to_rfc3339());

        // Not claimable until the backoff lapses
        assert!(repo.claim_due().unwrap().is_none());
    }

    #[test]
    fn mark_failed_is_terminal_with_reason() {
        let (_db, repo, scene_id) = setup();
        let job = repo.enqueue_pipeline(&scene_id).unwrap();
        repo.claim_due().unwrap().unwrap();
        repo.mark_failed(&job.id, 3, "budget exceeded: spend 9.50 + estimate 1.00 > cap 10.00")
            .unwrap();

        let status = repo.status(&job.id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert!(status.reason.unwrap().contains("budget exceeded"));
        assert!(repo.claim_due().unwrap().is_none());
    }

    #[test]
    fn status_reports_timestamps() {
        let (_db, repo, scene_id) = setup();
        let job = repo.enqueue_pipeline(&scene_id).unwrap();
        let status = repo.status(&job.id).unwrap();
        assert_eq!(status.state, JobState::Scheduled);
        assert_eq!(status.created_at, job.created_at);
        assert!(status.reason.is_none());
    }

    #[test]
    fn mark_succeeded() {
        let (_db, repo, scene_id) = setup();
        let job = repo.enqueue_pipeline(&scene_id).unwrap();
        repo.claim_due().unwrap().unwrap();
        repo.mark_succeeded(&job.id).unwrap();
        assert_eq!(repo.get(&job.id).unwrap().state, JobState::Succeeded);
    }
}
