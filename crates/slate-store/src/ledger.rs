use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use slate_core::events::LedgerEventType;
use slate_core::ids::{EventId, ProjectId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// An immutable ledger row. Once written it is never updated or deleted;
/// `seq` breaks timestamp ties in insertion order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub seq: i64,
    pub event_id: EventId,
    pub event_type: String,
    pub project_id: ProjectId,
    pub entity_id: String,
    pub payload: Value,
    pub emitted_by: String,
    pub timestamp: String,
}

/// Filter for paged event queries.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub project_id: Option<ProjectId>,
    pub entity_id: Option<String>,
    pub event_type: Option<LedgerEventType>,
    pub from: Option<String>,
    pub to: Option<String>,
    /// 1-based page number; 0 is treated as 1.
    pub page: u32,
    pub page_size: u32,
}

const MAX_PAGE_SIZE: u32 = 500;
const DEFAULT_PAGE_SIZE: u32 = 50;

/// Append an event using the caller's connection, so the event commits in
/// the same transaction as the aggregate mutation it records. A failure here
/// is fatal to that transaction, never retried on its own.
pub(crate) fn append_in(
    conn: &Connection,
    event_type: LedgerEventType,
    project_id: &ProjectId,
    entity_id: &str,
    payload: Value,
    emitted_by: &str,
) -> Result<LedgerEvent, StoreError> {
    let event_id = EventId::new();
    let now = Utc::now().to_rfc3339();
    let type_str = event_type.to_string();

    conn.execute(
        "INSERT INTO ledger_events (event_id, event_type, project_id, entity_id, payload, emitted_by, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            event_id.as_str(),
            type_str,
            project_id.as_str(),
            entity_id,
            serde_json::to_string(&payload)?,
            emitted_by,
            now,
        ],
    )?;
    let seq = conn.last_insert_rowid();

    Ok(LedgerEvent {
        seq,
        event_id,
        event_type: type_str,
        project_id: project_id.clone(),
        entity_id: entity_id.to_string(),
        payload,
        emitted_by: emitted_by.to_string(),
        timestamp: now,
    })
}

pub struct LedgerRepo {
    db: Database,
}

impl LedgerRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a standalone event in its own transaction.
    #[instrument(skip(self, payload), fields(project_id = %project_id, event_type = %event_type))]
    pub fn append(
        &self,
        event_type: LedgerEventType,
        project_id: &ProjectId,
        entity_id: &str,
        payload: Value,
        emitted_by: &str,
    ) -> Result<LedgerEvent, StoreError> {
        self.db
            .with_tx(|conn| append_in(conn, event_type, project_id, entity_id, payload, emitted_by))
    }

    /// Query events with optional filters, ordered by timestamp then
    /// insertion order, paged.
    #[instrument(skip(self))]
    pub fn query(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>, StoreError> {
        self.db.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT seq, event_id, event_type, project_id, entity_id, payload, emitted_by, timestamp
                 FROM ledger_events WHERE 1=1",
            );
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

            if let Some(project_id) = &filter.project_id {
                sql.push_str(&format!(" AND project_id = ?{}", params.len() + 1));
                params.push(Box::new(project_id.as_str().to_string()));
            }
            if let Some(entity_id) = &filter.entity_id {
                sql.push_str(&format!(" AND entity_id = ?{}", params.len() + 1));
                params.push(Box::new(entity_id.clone()));
            }
            if let Some(event_type) = &filter.event_type {
                sql.push_str(&format!(" AND event_type = ?{}", params.len() + 1));
                params.push(Box::new(event_type.to_string()));
            }
            if let Some(from) = &filter.from {
                sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
                params.push(Box::new(from.clone()));
            }
            if let Some(to) = &filter.to {
                sql.push_str(&format!(" AND timestamp <= ?{}", params.len() + 1));
                params.push(Box::new(to.clone()));
            }

            let page_size = match filter.page_size {
                0 => DEFAULT_PAGE_SIZE,
                n => n.min(MAX_PAGE_SIZE),
            };
            let offset = (filter.page.max(1) - 1) * page_size;
            sql.push_str(&format!(
                " ORDER BY timestamp ASC, seq ASC LIMIT {page_size} OFFSET {offset}"
            ));

            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(param_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    /// Recent events for a project (newest first) plus the total count.
    /// `limit` is clamped to 500.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub fn project_events(
        &self,
        project_id: &ProjectId,
        limit: u32,
    ) -> Result<(Vec<LedgerEvent>, i64), StoreError> {
        self.db.with_conn(|conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM ledger_events WHERE project_id = ?1",
                [project_id.as_str()],
                |row| row.get(0),
            )?;

            let limit = limit.clamp(1, MAX_PAGE_SIZE);
            let mut stmt = conn.prepare(
                "SELECT seq, event_id, event_type, project_id, entity_id, payload, emitted_by, timestamp
                 FROM ledger_events WHERE project_id = ?1
                 ORDER BY timestamp DESC, seq DESC
                 LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![project_id.as_str(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok((results, total))
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<LedgerEvent, StoreError> {
    let payload_str: String = row_helpers::get(row, 5, "ledger_events", "payload")?;
    let payload = row_helpers::parse_json(&payload_str, "ledger_events", "payload")?;

    Ok(LedgerEvent {
        seq: row_helpers::get(row, 0, "ledger_events", "seq")?,
        event_id: EventId::from_raw(row_helpers::get::<String>(row, 1, "ledger_events", "event_id")?),
        event_type: row_helpers::get(row, 2, "ledger_events", "event_type")?,
        project_id: ProjectId::from_raw(row_helpers::get::<String>(row, 3, "ledger_events", "project_id")?),
        entity_id: row_helpers::get(row, 4, "ledger_events", "entity_id")?,
        payload,
        emitted_by: row_helpers::get(row, 6, "ledger_events", "emitted_by")?,
        timestamp: row_helpers::get(row, 7, "ledger_events", "timestamp")?,
    })
}
