use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use echelon_core::hierarchy::HierarchySpec;
use echelon_core::ids::{HierarchyId, RunId};
use echelon_core::run::{RunStatistics, RunStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A stored run row. `topology_snapshot` freezes the hierarchy as it
/// was when the run started.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRow {
    pub id: RunId,
    pub hierarchy_id: HierarchyId,
    pub task: String,
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub statistics: Option<RunStatistics>,
    pub topology_snapshot: HierarchySpec,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
}

pub struct RunRepo {
    db: Database,
}

impl RunRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a pending run with a topology snapshot.
    #[instrument(skip(self, snapshot), fields(hierarchy_id = %hierarchy_id))]
    pub fn create(
        &self,
        hierarchy_id: &HierarchyId,
        task: &str,
        snapshot: &HierarchySpec,
    ) -> Result<RunRow, StoreError> {
        let id = RunId::new();
        let now = Utc::now().to_rfc3339();
        let snapshot_json = serde_json::to_string(snapshot)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (id, hierarchy_id, task, status, topology_snapshot, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
                rusqlite::params![id.as_str(), hierarchy_id.as_str(), task, snapshot_json, now],
            )?;

            Ok(RunRow {
                id: id.clone(),
                hierarchy_id: hierarchy_id.clone(),
                task: task.to_string(),
                status: RunStatus::Pending,
                result: None,
                error: None,
                statistics: None,
                topology_snapshot: snapshot.clone(),
                started_at: None,
                completed_at: None,
                created_at: now.clone(),
            })
        })
    }

    #[instrument(skip(self), fields(run_id = %id))]
    pub fn get(&self, id: &RunId) -> Result<RunRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_RUN} WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_run(row),
                None => Err(StoreError::NotFound(format!("run {id}"))),
            }
        })
    }

    /// List runs newest-first, optionally filtered by status.
    #[instrument(skip(self))]
    pub fn list(
        &self,
        limit: u32,
        offset: u32,
        status: Option<RunStatus>,
    ) -> Result<Vec<RunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut results = Vec::new();
            match status {
                Some(status) => {
                    let mut stmt = conn.prepare(&format!(
                        "{SELECT_RUN} WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                    ))?;
                    let mut rows =
                        stmt.query(rusqlite::params![status.to_string(), limit, offset])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_run(row)?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "{SELECT_RUN} ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                    ))?;
                    let mut rows = stmt.query(rusqlite::params![limit, offset])?;
                    while let Some(row) = rows.next()? {
                        results.push(row_to_run(row)?);
                    }
                }
            }
            Ok(results)
        })
    }

    /// Transition pending -> running. A no-op if the run already left
    /// pending (terminal states absorb).
    #[instrument(skip(self), fields(run_id = %id))]
    pub fn mark_running(&self, id: &RunId) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE runs SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(updated > 0)
        })
    }

    /// Record a terminal outcome. Guarded so a run that already reached
    /// a terminal state is never overwritten.
    #[instrument(skip(self, statistics), fields(run_id = %id, status = %status))]
    pub fn finish(
        &self,
        id: &RunId,
        status: RunStatus,
        result: Option<&str>,
        error: Option<&str>,
        statistics: &RunStatistics,
    ) -> Result<bool, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "finish requires a terminal status, got {status}"
            )));
        }
        let now = Utc::now().to_rfc3339();
        let stats_json = serde_json::to_string(statistics)?;

        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE runs SET status = ?1, result = ?2, error = ?3, statistics = ?4, completed_at = ?5
                 WHERE id = ?6 AND status IN ('pending', 'running')",
                rusqlite::params![
                    status.to_string(),
                    result,
                    error,
                    stats_json,
                    now,
                    id.as_str()
                ],
            )?;
            Ok(updated > 0)
        })
    }
}

const SELECT_RUN: &str = "SELECT id, hierarchy_id, task, status, result, error, statistics, \
                          topology_snapshot, started_at, completed_at, created_at FROM runs";

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<RunRow, StoreError> {
    let status_raw: String = row_helpers::get(row, 3, "runs", "status")?;
    let status: RunStatus = row_helpers::parse_enum(&status_raw, "runs", "status")?;

    let statistics = row_helpers::get_opt::<String>(row, 6, "runs", "statistics")?
        .map(|raw| {
            serde_json::from_str::<RunStatistics>(&raw).map_err(|e| StoreError::CorruptRow {
                table: "runs",
                column: "statistics",
                detail: format!("invalid JSON: {e}"),
            })
        })
        .transpose()?;

    let snapshot_raw: String = row_helpers::get(row, 7, "runs", "topology_snapshot")?;
    let topology_snapshot: HierarchySpec =
        serde_json::from_str(&snapshot_raw).map_err(|e| StoreError::CorruptRow {
            table: "runs",
            column: "topology_snapshot",
            detail: format!("invalid spec JSON: {e}"),
        })?;

    Ok(RunRow {
        id: RunId::from_raw(row_helpers::get::<String>(row, 0, "runs", "id")?),
        hierarchy_id: HierarchyId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "runs",
            "hierarchy_id",
        )?),
        task: row_helpers::get(row, 2, "runs", "task")?,
        status,
        result: row_helpers::get_opt(row, 4, "runs", "result")?,
        error: row_helpers::get_opt(row, 5, "runs", "error")?,
        statistics,
        topology_snapshot,
        started_at: row_helpers::get_opt(row, 8, "runs", "started_at")?,
        completed_at: row_helpers::get_opt(row, 9, "runs", "completed_at")?,
        created_at: row_helpers::get(row, 10, "runs", "created_at")?,
    })
}
