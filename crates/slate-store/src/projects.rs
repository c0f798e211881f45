use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use slate_core::errors::DomainError;
use slate_core::events::LedgerEventType;
use slate_core::ids::ProjectId;

use crate::database::Database;
use crate::error::StoreError;
use crate::ledger;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: ProjectId,
    pub name: String,
    /// Monetary cap on total proposal spend, in USD. Zero means unlimited.
    pub budget_cap_usd: f64,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ProjectRepo {
    db: Database,
}

impl ProjectRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(name))]
    pub fn create(&self, name: &str, budget_cap_usd: f64, actor: &str) -> Result<ProjectRow, StoreError> {
        if budget_cap_usd < 0.0 {
            return Err(DomainError::InvalidBudgetCap(budget_cap_usd).into());
        }

        let id = ProjectId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_tx(|conn| {
            conn.execute(
                "INSERT INTO projects (id, name, budget_cap_usd, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), name, budget_cap_usd, now, now],
            )?;

            ledger::append_in(
                conn,
                LedgerEventType::ProjectCreated,
                &id,
                id.as_str(),
                json!({"name": name, "budget_cap_usd": budget_cap_usd}),
                actor,
            )?;

            Ok(ProjectRow {
                id: id.clone(),
                name: name.to_string(),
                budget_cap_usd,
                created_at: now.clone(),
                updated_at: now.clone(),
            })
        })
    }

    #[instrument(skip(self), fields(project_id = %id))]
    pub fn get(&self, id: &ProjectId) -> Result<ProjectRow, StoreError> {
        self.db.with_conn(|conn| get_project(conn, id))
    }

    /// Change the budget cap. Negative values are rejected; zero means
    /// unlimited. Appends `project_budget_changed` in the same transaction.
    #[instrument(skip(self), fields(project_id = %id, budget_cap_usd))]
    pub fn set_budget_cap(
        &self,
        id: &ProjectId,
        budget_cap_usd: f64,
        actor: &str,
    ) -> Result<ProjectRow, StoreError> {
        if budget_cap_usd < 0.0 {
            return Err(DomainError::InvalidBudgetCap(budget_cap_usd).into());
        }

        self.db.with_tx(|conn| {
            let mut project = get_project(conn, id)?;
            let now = Utc::now().to_rfc3339();
            let previous = project.budget_cap_usd;

            conn.execute(
                "UPDATE projects SET budget_cap_usd = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![budget_cap_usd, now, id.as_str()],
            )?;

            ledger::append_in(
                conn,
                LedgerEventType::ProjectBudgetChanged,
                id,
                id.as_str(),
                json!({"from_usd": previous, "to_usd": budget_cap_usd}),
                actor,
            )?;

            project.budget_cap_usd = budget_cap_usd;
            project.updated_at = now;
            Ok(project)
        })
    }

    /// Delete a project. Scenes, proposals and jobs cascade; ledger history
    /// for the project is retained.
    #[instrument(skip(self), fields(project_id = %id))]
    pub fn delete(&self, id: &ProjectId, actor: &str) -> Result<(), StoreError> {
        self.db.with_tx(|conn| {
            let project = get_project(conn, id)?;

            ledger::append_in(
                conn,
                LedgerEventType::ProjectDeleted,
                id,
                id.as_str(),
                json!({"name": project.name}),
                actor,
            )?;

            conn.execute("DELETE FROM projects WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }
}

pub(crate) fn get_project(
    conn: &rusqlite::Connection,
    id: &ProjectId,
) -> Result<ProjectRow, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, name, budget_cap_usd, created_at, updated_at FROM projects WHERE id = ?1",
    )?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_project(row),
        None => Err(StoreError::NotFound(format!("project {id}"))),
    }
}

fn row_to_project(row: &rusqlite::Row<'_>) -> Result<ProjectRow, StoreError> {
    Ok(ProjectRow {
        id: ProjectId::from_raw(row_helpers::get::<String>(row, 0, "projects", "id")?),
        name: row_helpers::get(row, 1, "projects", "name")?,
        budget_cap_usd: row_helpers::get(row, 2, "projects", "budget_cap_usd")?,
        created_at: row_helpers::get(row, 3, "projects", "created_at")?,
        updated_at: row_helpers::get(row, 4, "projects", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{EventFilter, LedgerRepo};
    use crate::scenes::SceneRepo;

    fn setup() -> (Database, ProjectRepo) {
        let db = Database::in_memory().unwrap();
        let repo = ProjectRepo::new(db.clone());
        (db, repo)
    }

    #[test]
    fn create_project() {
        let (_db, repo) = setup();
        let project = repo.create("Season One", 25.0, "test").unwrap();
        assert!(project.id.as_str().starts_with("proj_"));
        assert_eq!(project.name, "Season One");
        assert!((project.budget_cap_usd - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn create_emits_ledger_event() {
        let (db, repo) = setup();
        let project = repo.create("Season One", 25.0, "test").unwrap();

        let ledger = LedgerRepo::new(db);
        let events = ledger
            .query(&EventFilter {
                project_id: Some(project.id),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "project_created");
    }

    #[test]
    fn negative_cap_rejected_on_create() {
        let (_db, repo) = setup();
        let err = repo.create("Bad", -1.0, "test").unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::InvalidBudgetCap(_))
        ));
    }

    #[test]
    fn set_budget_cap() {
        let (db, repo) = setup();
        let project = repo.create("Season One", 10.0, "test").unwrap();
        let updated = repo.set_budget_cap(&project.id, 50.0, "test").unwrap();
        assert!((updated.budget_cap_usd - 50.0).abs() < f64::EPSILON);

        let ledger = LedgerRepo::new(db);
        let events = ledger
            .query(&EventFilter {
                event_type: Some(LedgerEventType::ProjectBudgetChanged),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["to_usd"], 50.0);
    }

    #[test]
    fn negative_cap_rejected_on_update() {
        let (_db, repo) = setup();
        let project = repo.create("Season One", 10.0, "test").unwrap();
        let err = repo.set_budget_cap(&project.id, -0.01, "test").unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::InvalidBudgetCap(_))
        ));
        // Cap unchanged
        let fetched = repo.get(&project.id).unwrap();
        assert!((fetched.budget_cap_usd - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn get_nonexistent_fails() {
        let (_db, repo) = setup();
        let result = repo.get(&ProjectId::from_raw("proj_missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn delete_cascades_scenes_but_keeps_ledger() {
        let (db, repo) = setup();
        let project = repo.create("Season One", 0.0, "test").unwrap();
        let scenes = SceneRepo::new(db.clone());
        let scene = scenes.create(&project.id, "Cold Open", "test").unwrap();

        repo.delete(&project.id, "test").unwrap();

        assert!(matches!(repo.get(&project.id), Err(StoreError::NotFound(_))));
        assert!(matches!(scenes.get(&scene.id), Err(StoreError::NotFound(_))));

        let ledger = LedgerRepo::new(db);
        let (events, total) = ledger.project_events(&project.id, 10).unwrap();
        assert!(total >= 3); // project_created, scene_created, project_deleted
        assert!(events.iter().any(|e| e.event_type == "project_deleted"));
    }
}
