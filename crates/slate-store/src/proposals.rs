use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use slate_core::diff::SceneDiff;
use slate_core::errors::DomainError;
use slate_core::events::LedgerEventType;
use slate_core::ids::{JobId, ProjectId, ProposalId, SceneId};
use slate_core::proposal::ProposalDraft;
use slate_core::roles::AgentRole;

use crate::database::Database;
use crate::error::StoreError;
use crate::ledger;
use crate::row_helpers;
use crate::scenes::{apply_diff_in, ensure_editable, get_scene, SceneRepo, SceneRow};

/// How long an apply holds the scene lock. Covers the write; a crashed
/// caller is reclaimed via TTL expiry.
const APPLY_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Applied,
    Dismissed,
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Applied => write!(f, "applied"),
            Self::Dismissed => write!(f, "dismissed"),
        }
    }
}

impl std::str::FromStr for ProposalStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "dismissed" => Ok(Self::Dismissed),
            other => Err(format!("unknown proposal status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalRow {
    pub id: ProposalId,
    pub scene_id: SceneId,
    pub job_id: Option<JobId>,
    pub role: AgentRole,
    pub status: ProposalStatus,
    pub summary: String,
    pub rationale: String,
    pub diff: serde_json::Value,
    pub tokens_used: i64,
    pub cost_usd: f64,
    pub created_at: String,
    pub decided_at: Option<String>,
}

/// Result of applying a proposal. `scene_changed` is false when the diff
/// touched no recognized field.
#[derive(Clone, Debug)]
pub struct ApplyOutcome {
    pub proposal: ProposalRow,
    pub scene: SceneRow,
    pub scene_changed: bool,
}

pub struct ProposalRepo {
    db: Database,
}

impl ProposalRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist an agent draft as a pending proposal. Cost is incurred at
    /// creation time, so this is the point where project spend grows.
    /// Appends `agent_proposal_created` in the same transaction.
    #[instrument(skip(self, draft), fields(scene_id = %scene_id, role = %draft.role))]
    pub fn create(
        &self,
        scene_id: &SceneId,
        job_id: Option<&JobId>,
        draft: &ProposalDraft,
        actor: &str,
    ) -> Result<ProposalRow, StoreError> {
        let id = ProposalId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_tx(|conn| {
            let scene = get_scene(conn, scene_id)?;

            conn.execute(
                "INSERT INTO proposals (id, scene_id, job_id, role, status, summary, rationale, diff, tokens_used, cost_usd, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    id.as_str(),
                    scene_id.as_str(),
                    job_id.map(|j| j.as_str()),
                    draft.role.to_string(),
                    draft.summary,
                    draft.rationale,
                    serde_json::to_string(&draft.diff)?,
                    draft.tokens_used as i64,
                    draft.cost_usd,
                    now,
                ],
            )?;

            ledger::append_in(
                conn,
                LedgerEventType::AgentProposalCreated,
                &scene.project_id,
                id.as_str(),
                json!({
                    "scene_id": scene_id.as_str(),
                    "role": draft.role.to_string(),
                    "summary": draft.summary,
                    "tokens_used": draft.tokens_used,
                    "cost_usd": draft.cost_usd,
                }),
                actor,
            )?;

            get_proposal(conn, &id)
        })
    }

    #[instrument(skip(self), fields(proposal_id = %id))]
    pub fn get(&self, id: &ProposalId) -> Result<ProposalRow, StoreError> {
        self.db.with_conn(|conn| get_proposal(conn, id))
    }

    /// The proposal a given job already produced for a role, if any.
    /// Retried jobs use this to skip roles that completed in an earlier
    /// attempt instead of double-billing them.
    #[instrument(skip(self), fields(job_id = %job_id, role = %role))]
    pub fn get_for_job_role(
        &self,
        job_id: &JobId,
        role: AgentRole,
    ) -> Result<Option<ProposalRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE job_id = ?1 AND role = ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![job_id.as_str(), role.to_string()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_proposal(row)?)),
                None => Ok(None),
            }
        })
    }

    /// List proposals for a scene, oldest first.
    #[instrument(skip(self), fields(scene_id = %scene_id))]
    pub fn list_for_scene(&self, scene_id: &SceneId) -> Result<Vec<ProposalRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE scene_id = ?1 ORDER BY created_at ASC, id ASC"
            ))?;
            let mut rows = stmt.query([scene_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_proposal(row)?);
            }
            Ok(results)
        })
    }

    /// Live spend for a project: the fold of cost over every proposal ever
    /// created under its scenes, whatever their status. There is no stored
    /// counter to drift from this history.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn project_spend(&self, project_id: &ProjectId) -> Result<f64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(SUM(p.cost_usd), 0.0)
                 FROM proposals p JOIN scenes s ON p.scene_id = s.id
                 WHERE s.project_id = ?1",
                [project_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// Accept a pending proposal: interpret its diff as a partial scene
    /// update and apply every touched field as one scene version increment.
    /// Takes the scene lock for the duration so concurrent applies, manual
    /// edits and pipeline runs are mutually excluded; transition, scene
    /// update and events commit in one transaction.
    #[instrument(skip(self), fields(proposal_id = %id, actor))]
    pub fn apply(&self, id: &ProposalId, actor: &str) -> Result<ApplyOutcome, StoreError> {
        let proposal = self.get(id)?;

        let scenes = SceneRepo::new(self.db.clone());
        scenes.acquire_lock(&proposal.scene_id, actor, APPLY_LOCK_TTL)?;
        let result = self.db.with_tx(|conn| {
            let proposal = get_proposal(conn, id)?;
            if proposal.status != ProposalStatus::Pending {
                return Err(DomainError::NotPending(id.to_string()).into());
            }

            let scene = get_scene(conn, &proposal.scene_id)?;
            ensure_editable(&scene, actor)?;

            let diff = SceneDiff::from_value(&proposal.diff)?;
            diff.validate()?;

            let (scene_after, scene_changed) = if diff.is_empty() {
                (scene.clone(), false)
            } else {
                (apply_diff_in(conn, &scene, &diff, actor)?, true)
            };

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE proposals SET status = 'applied', decided_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;

            ledger::append_in(
                conn,
                LedgerEventType::ProposalApplied,
                &scene.project_id,
                id.as_str(),
                json!({
                    "scene_id": scene.id.as_str(),
                    "role": proposal.role.to_string(),
                    "scene_changed": scene_changed,
                }),
                actor,
            )?;

            let proposal = get_proposal(conn, id)?;
            Ok(ApplyOutcome {
                proposal,
                scene: scene_after,
                scene_changed,
            })
        });
        if let Err(e) = scenes.release_lock(&proposal.scene_id, actor) {
            tracing::warn!(proposal_id = %id, error = %e, "failed to release apply lock");
        }
        result
    }

    /// Reject a pending proposal. No scene mutation; the cost it incurred
    /// stays on the books.
    #[instrument(skip(self), fields(proposal_id = %id, actor))]
    pub fn dismiss(&self, id: &ProposalId, actor: &str) -> Result<ProposalRow, StoreError> {
        self.db.with_tx(|conn| {
            let proposal = get_proposal(conn, id)?;
            if proposal.status != ProposalStatus::Pending {
                return Err(DomainError::NotPending(id.to_string()).into());
            }

            let scene = get_scene(conn, &proposal.scene_id)?;
            ensure_editable(&scene, actor)?;

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE proposals SET status = 'dismissed', decided_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;

            ledger::append_in(
                conn,
                LedgerEventType::ProposalDismissed,
                &scene.project_id,
                id.as_str(),
                json!({"scene_id": scene.id.as_str(), "role": proposal.role.to_string()}),
                actor,
            )?;

            get_proposal(conn, id)
        })
    }
}

const PROPOSAL_COLUMNS: &str = "id, scene_id, job_id, role, status, summary, rationale, diff, tokens_used, cost_usd, created_at, decided_at";

fn get_proposal(
    conn: &rusqlite::Connection,
    id: &ProposalId,
) -> Result<ProposalRow, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE id = ?1"
    ))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_proposal(row),
        None => Err(StoreError::NotFound(format!("proposal {id}"))),
    }
}

fn row_to_proposal(row: &rusqlite::Row<'_>) -> Result<ProposalRow, StoreError> {
    let role_str: String = row_helpers::get(row, 3, "proposals", "role")?;
    let status_str: String = row_helpers::get(row, 4, "proposals", "status")?;
    let diff_str: String = row_helpers::get(row, 7, "proposals", "diff")?;

    Ok(ProposalRow {
        id: ProposalId::from_raw(row_helpers::get::<String>(row, 0, "proposals", "id")?),
        scene_id: SceneId::from_raw(row_helpers::get::<String>(row, 1, "proposals", "scene_id")?),
        job_id: row_helpers::get_opt::<String>(row, 2, "proposals", "job_id")?.map(JobId::from_raw),
        role: row_helpers::parse_enum(&role_str, "proposals", "role")?,
        status: row_helpers::parse_enum(&status_str, "proposals", "status")?,
        summary: row_helpers::get(row, 5, "proposals", "summary")?,
        rationale: row_helpers::get(row, 6, "proposals", "rationale")?,
        diff: row_helpers::parse_json(&diff_str, "proposals", "diff")?,
        tokens_used: row_helpers::get(row, 8, "proposals", "tokens_used")?,
        cost_usd: row_helpers::get(row, 9, "proposals", "cost_usd")?,
        created_at: row_helpers::get(row, 10, "proposals", "created_at")?,
        decided_at: row_helpers::get_opt(row, 11, "proposals", "decided_at")?,
    })
}
