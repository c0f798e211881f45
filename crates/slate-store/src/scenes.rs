use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use slate_core::diff::SceneDiff;
use slate_core::errors::DomainError;
use slate_core::events::LedgerEventType;
use slate_core::ids::{ProjectId, SceneId};

use crate::database::Database;
use crate::error::StoreError;
use crate::ledger;
use crate::projects::get_project;
use crate::row_helpers;

/// How long a manual edit holds the scene lock. Long enough to cover the
/// write, short enough that a crashed caller is reclaimed quickly.
const EDIT_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneStatus {
    Draft,
    Review,
    Approved,
}

impl SceneStatus {
    /// Allowed transitions: draft -> review, review -> draft (rework),
    /// review -> approved. Approved is terminal.
    pub fn can_transition_to(self, to: SceneStatus) -> bool {
        matches!(
            (self, to),
            (Self::Draft, Self::Review)
                | (Self::Review, Self::Draft)
                | (Self::Review, Self::Approved)
        )
    }
}

impl std::fmt::Display for SceneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Review => write!(f, "review"),
            Self::Approved => write!(f, "approved"),
        }
    }
}

impl std::str::FromStr for SceneStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "review" => Ok(Self::Review),
            "approved" => Ok(Self::Approved),
            other => Err(format!("unknown scene status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SceneRow {
    pub id: SceneId,
    pub project_id: ProjectId,
    pub status: SceneStatus,
    pub version: i64,
    pub locked_until: Option<String>,
    pub locked_by: Option<String>,
    pub title: String,
    pub script: String,
    pub narrative_goal: String,
    pub emotional_beat: String,
    pub location: String,
    pub time_of_day: String,
    pub characters: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl SceneRow {
    /// True iff `locked_until` is set and in the future.
    pub fn lock_active(&self) -> bool {
        self.locked_until
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|until| until > Utc::now())
            .unwrap_or(false)
    }
}

pub struct SceneRepo {
    db: Database,
}

impl SceneRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(project_id = %project_id, title))]
    pub fn create(
        &self,
        project_id: &ProjectId,
        title: &str,
        actor: &str,
    ) -> Result<SceneRow, StoreError> {
        let id = SceneId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_tx(|conn| {
            // Project must exist; cascade ties the scene's lifetime to it.
            get_project(conn, project_id)?;

            conn.execute(
                "INSERT INTO scenes (id, project_id, status, version, title, created_at, updated_at)
                 VALUES (?1, ?2, 'draft', 0, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), project_id.as_str(), title, now, now],
            )?;

            ledger::append_in(
                conn,
                LedgerEventType::SceneCreated,
                project_id,
                id.as_str(),
                json!({"title": title}),
                actor,
            )?;

            get_scene(conn, &id)
        })
    }

    #[instrument(skip(self), fields(scene_id = %id))]
    pub fn get(&self, id: &SceneId) -> Result<SceneRow, StoreError> {
        self.db.with_conn(|conn| get_scene(conn, id))
    }

    /// List scenes for a project, oldest first.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn list(&self, project_id: &ProjectId) -> Result<Vec<SceneRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCENE_COLUMNS} FROM scenes WHERE project_id = ?1 ORDER BY created_at ASC"
            ))?;
            let mut rows = stmt.query([project_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_scene(row)?);
            }
            Ok(results)
        })
    }

    /// Take the scene's time-bounded lock. A single compare-and-set against
    /// the lock columns: succeeds only when the scene is unlocked or the
    /// previous holder's TTL has lapsed (stale-lock reclaim). Contention
    /// fails with `ConcurrentModification` naming the current holder.
    #[instrument(skip(self), fields(scene_id = %id, holder))]
    pub fn acquire_lock(
        &self,
        id: &SceneId,
        holder: &str,
        ttl: Duration,
    ) -> Result<SceneRow, StoreError> {
        self.db.with_tx(|conn| {
            let now = Utc::now();
            let now_str = now.to_rfc3339();
            let until = (now + chrono::Duration::milliseconds(ttl.as_millis() as i64)).to_rfc3339();

            let changed = conn.execute(
                "UPDATE scenes SET locked_until = ?1, locked_by = ?2, updated_at = ?3
                 WHERE id = ?4 AND (locked_until IS NULL OR locked_until <= ?3)",
                rusqlite::params![until, holder, now_str, id.as_str()],
            )?;

            if changed == 0 {
                let scene = get_scene(conn, id)?;
                return Err(DomainError::ConcurrentModification {
                    holder: scene.locked_by.unwrap_or_else(|| "unknown".into()),
                }
                .into());
            }

            let scene = get_scene(conn, id)?;
            ledger::append_in(
                conn,
                LedgerEventType::SceneLocked,
                &scene.project_id,
                id.as_str(),
                json!({"holder": holder, "until": until}),
                holder,
            )?;
            Ok(scene)
        })
    }

    /// Release the lock. Idempotent: releasing an expired or already-released
    /// lock is not an error. Releasing a lock actively held by someone else
    /// fails with `NotHolder`.
    #[instrument(skip(self), fields(scene_id = %id, holder))]
    pub fn release_lock(&self, id: &SceneId, holder: &str) -> Result<(), StoreError> {
        self.db.with_tx(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE scenes SET locked_until = NULL, locked_by = NULL, updated_at = ?1
                 WHERE id = ?2 AND locked_by = ?3",
                rusqlite::params![now, id.as_str(), holder],
            )?;

            if changed == 1 {
                let scene = get_scene(conn, id)?;
                ledger::append_in(
                    conn,
                    LedgerEventType::SceneLockReleased,
                    &scene.project_id,
                    id.as_str(),
                    json!({"holder": holder}),
                    holder,
                )?;
                return Ok(());
            }

            let scene = get_scene(conn, id)?;
            match (&scene.locked_by, scene.lock_active()) {
                (Some(other), true) if other != holder => Err(DomainError::NotHolder {
                    holder: other.clone(),
                }
                .into()),
                _ => Ok(()),
            }
        })
    }

    #[instrument(skip(self), fields(scene_id = %id))]
    pub fn is_locked(&self, id: &SceneId) -> Result<bool, StoreError> {
        Ok(self.get(id)?.lock_active())
    }

    /// Manual partial edit. Takes the scene lock for the duration of the
    /// write so pipeline runs and other editors are totally ordered against
    /// it, applies every changed field as one update (single version
    /// increment, single `scene_updated` event). An empty diff changes
    /// nothing and emits nothing.
    #[instrument(skip(self, diff), fields(scene_id = %id, actor))]
    pub fn update(
        &self,
        id: &SceneId,
        diff: &SceneDiff,
        actor: &str,
    ) -> Result<SceneRow, StoreError> {
        diff.validate()?;

        self.acquire_lock(id, actor, EDIT_LOCK_TTL)?;
        let result = self.db.with_tx(|conn| {
            let scene = get_scene(conn, id)?;
            ensure_editable(&scene, actor)?;
            if diff.is_empty() {
                return Ok(scene);
            }
            apply_diff_in(conn, &scene, diff, actor)
        });
        if let Err(e) = self.release_lock(id, actor) {
            tracing::warn!(scene_id = %id, error = %e, "failed to release edit lock");
        }
        result
    }

    /// Move the scene through its status lifecycle. Locked scenes cannot be
    /// transitioned by another holder; invalid transitions are rejected.
    #[instrument(skip(self), fields(scene_id = %id, to = %to, actor))]
    pub fn transition_status(
        &self,
        id: &SceneId,
        to: SceneStatus,
        actor: &str,
    ) -> Result<SceneRow, StoreError> {
        self.acquire_lock(id, actor, EDIT_LOCK_TTL)?;
        let result = self.db.with_tx(|conn| {
            let scene = get_scene(conn, id)?;
            if !scene.status.can_transition_to(to) {
                return Err(DomainError::InvalidStatusTransition {
                    from: scene.status.to_string(),
                    to: to.to_string(),
                }
                .into());
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE scenes SET status = ?1, version = version + 1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![to.to_string(), now, id.as_str()],
            )?;

            ledger::append_in(
                conn,
                LedgerEventType::SceneStatusChanged,
                &scene.project_id,
                id.as_str(),
                json!({"from": scene.status.to_string(), "to": to.to_string(), "version": scene.version + 1}),
                actor,
            )?;

            get_scene(conn, id)
        });
        if let Err(e) = self.release_lock(id, actor) {
            tracing::warn!(scene_id = %id, error = %e, "failed to release edit lock");
        }
        result
    }
}

const SCENE_COLUMNS: &str = "id, project_id, status, version, locked_until, locked_by, title, script, narrative_goal, emotional_beat, location, time_of_day, characters, created_at, updated_at";

pub(crate) fn get_scene(conn: &rusqlite::Connection, id: &SceneId) -> Result<SceneRow, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {SCENE_COLUMNS} FROM scenes WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_scene(row),
        None => Err(StoreError::NotFound(format!("scene {id}"))),
    }
}

/// A scene is editable only in draft status and while not locked by another
/// holder.
pub(crate) fn ensure_editable(scene: &SceneRow, actor: &str) -> Result<(), DomainError> {
    if scene.status != SceneStatus::Draft {
        return Err(DomainError::SceneNotEditable(scene.id.to_string()));
    }
    if scene.lock_active() && scene.locked_by.as_deref() != Some(actor) {
        return Err(DomainError::ConcurrentModification {
            holder: scene.locked_by.clone().unwrap_or_else(|| "unknown".into()),
        });
    }
    Ok(())
}

/// Apply every field the diff touches as ONE scene update: a single version
/// increment and a single `scene_updated` ledger event regardless of how
/// many fields change. Caller has already validated the diff and checked
/// editability; caller's transaction makes update + event atomic.
pub(crate) fn apply_diff_in(
    conn: &rusqlite::Connection,
    scene: &SceneRow,
    diff: &SceneDiff,
    actor: &str,
) -> Result<SceneRow, StoreError> {
    let now = Utc::now().to_rfc3339();
    let mut sets = vec!["version = version + 1".to_string()];
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    let push = |sets: &mut Vec<String>, params: &mut Vec<Box<dyn rusqlite::types::ToSql>>, column: &str, value: String| {
        params.push(Box::new(value));
        sets.push(format!("{column} = ?{}", params.len()));
    };

    if let Some(v) = &diff.title {
        push(&mut sets, &mut params, "title", v.clone());
    }
    if let Some(v) = &diff.script {
        push(&mut sets, &mut params, "script", v.clone());
    }
    if let Some(v) = &diff.narrative_goal {
        push(&mut sets, &mut params, "narrative_goal", v.clone());
    }
    if let Some(v) = &diff.emotional_beat {
        push(&mut sets, &mut params, "emotional_beat", v.clone());
    }
    if let Some(v) = &diff.location {
        push(&mut sets, &mut params, "location", v.clone());
    }
    if let Some(v) = &diff.time_of_day {
        push(&mut sets, &mut params, "time_of_day", v.clone());
    }
    if let Some(v) = &diff.characters {
        push(&mut sets, &mut params, "characters", serde_json::to_string(v)?);
    }

    push(&mut sets, &mut params, "updated_at", now);
    params.push(Box::new(scene.id.as_str().to_string()));
    let sql = format!(
        "UPDATE scenes SET {} WHERE id = ?{}",
        sets.join(", "),
        params.len()
    );

    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    conn.execute(&sql, param_refs.as_slice())?;

    ledger::append_in(
        conn,
        LedgerEventType::SceneUpdated,
        &scene.project_id,
        scene.id.as_str(),
        json!({"fields": diff.changed_fields(), "version": scene.version + 1}),
        actor,
    )?;

    get_scene(conn, &scene.id)
}

fn row_to_scene(row: &rusqlite::Row<'_>) -> Result<SceneRow, StoreError> {
    let status_str: String = row_helpers::get(row, 2, "scenes", "status")?;
    let characters_str: String = row_helpers::get(row, 12, "scenes", "characters")?;
    let characters: Vec<String> = serde_json::from_str(&characters_str).map_err(|e| {
        StoreError::CorruptRow {
            table: "scenes",
            column: "characters",
            detail: format!("invalid JSON: {e}"),
        }
    })?;

    Ok(SceneRow {
        id: SceneId::from_raw(row_helpers::get::<String>(row, 0, "scenes", "id")?),
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 1, "scenes", "project_id")?),
        status: row_helpers::parse_enum(&status_str, "scenes", "status")?,
        version: row_helpers::get(row, 3, "scenes", "version")?,
        locked_until: row_helpers::get_opt(row, 4, "scenes", "locked_until")?,
        locked_by: row_helpers::get_opt(row, 5, "scenes", "locked_by")?,
        title: row_helpers::get(row, 6, "scenes", "title")?,
        script: row_helpers::get(row, 7, "scenes", "script")?,
        narrative_goal: row_helpers::get(row, 8, "scenes", "narrative_goal")?,
        emotional_beat: row_helpers::get(row, 9, "scenes", "emotional_beat")?,
        location: row_helpers::get(row, 10, "scenes", "location")?,
        time_of_day: row_helpers::get(row, 11, "scenes", "time_of_day")?,
        characters,
        created_at: row_helpers::get(row, 13, "scenes", "created_at")?,
        updated_at: row_helpers::get(row, 14, "scenes", "updated_at")?,
    })
}
