use chrono::{DateTime, Utc};
use tracing::instrument;

use echelon_core::events::{AgentType, EventAction, EventCategory, EventSource, RunEvent};
use echelon_core::ids::{AgentId, EventId, RunId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Durable sink for run events. Sequence numbers are assigned upstream
/// by the event bus; this repo only persists and reads them back.
pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, event), fields(run_id = %event.run_id, sequence = event.sequence))]
    pub fn insert(&self, event: &RunEvent) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO run_events (id, run_id, sequence, timestamp, agent_type, agent_id,
                                         agent_name, team_name, category, action, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    event.id.as_str(),
                    event.run_id.as_str(),
                    event.sequence as i64,
                    event.timestamp.to_rfc3339(),
                    enum_str(&event.source.agent_type)?,
                    event.source.agent_id.as_str(),
                    event.source.agent_name,
                    event.source.team_name,
                    enum_str(&event.category)?,
                    enum_str(&event.action)?,
                    serde_json::to_string(&event.data)?,
                ],
            )?;
            Ok(())
        })
    }

    /// Events for a run with sequence >= from, ordered by sequence.
    #[instrument(skip(self), fields(run_id = %run_id, from))]
    pub fn list_from(
        &self,
        run_id: &RunId,
        from: u64,
        limit: u32,
    ) -> Result<Vec<RunEvent>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, sequence, timestamp, agent_type, agent_id, agent_name,
                        team_name, category, action, data
                 FROM run_events WHERE run_id = ?1 AND sequence >= ?2
                 ORDER BY sequence ASC LIMIT ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![run_id.as_str(), from as i64, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn count(&self, run_id: &RunId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM run_events WHERE run_id = ?1",
                [run_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// Delete events older than the cutoff. Returns rows removed.
    #[instrument(skip(self))]
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM run_events WHERE timestamp < ?1",
                [cutoff.to_rfc3339()],
            )?;
            Ok(deleted)
        })
    }

    /// Trim every run down to its most recent `max_per_run` events.
    #[instrument(skip(self))]
    pub fn trim_to_cap(&self, max_per_run: u64) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM run_events WHERE sequence < (
                     SELECT MAX(sequence) - ?1 + 1 FROM run_events e
                     WHERE e.run_id = run_events.run_id
                 )",
                [max_per_run as i64],
            )?;
            Ok(deleted)
        })
    }
}

fn enum_str<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Serialization(format!(
            "expected string variant, got {other}"
        ))),
    }
}

fn parse_variant<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).map_err(|_| {
        StoreError::CorruptRow {
            table,
            column,
            detail: format!("unknown variant: {raw}"),
        }
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<RunEvent, StoreError> {
    let timestamp_raw: String = row_helpers::get(row, 3, "run_events", "timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table: "run_events",
            column: "timestamp",
            detail: e.to_string(),
        })?;

    let agent_type: AgentType = parse_variant(
        &row_helpers::get::<String>(row, 4, "run_events", "agent_type")?,
        "run_events",
        "agent_type",
    )?;
    let category: EventCategory = parse_variant(
        &row_helpers::get::<String>(row, 8, "run_events", "category")?,
        "run_events",
        "category",
    )?;
    let action: EventAction = parse_variant(
        &row_helpers::get::<String>(row, 9, "run_events", "action")?,
        "run_events",
        "action",
    )?;

    let data_raw: String = row_helpers::get(row, 10, "run_events", "data")?;
    let data = row_helpers::parse_json(&data_raw, "run_events", "data")?;

    Ok(RunEvent {
        id: EventId::from_raw(row_helpers::get::<String>(row, 0, "run_events", "id")?),
        run_id: RunId::from_raw(row_helpers::get::<String>(row, 1, "run_events", "run_id")?),
        sequence: row_helpers::get::<i64>(row, 2, "run_events", "sequence")? as u64,
        timestamp,
        source: EventSource {
            agent_type,
            agent_id: AgentId::from_raw(row_helpers::get::<String>(
                row,
                5,
                "run_events",
                "agent_id",
            )?),
            agent_name: row_helpers::get(row, 6, "run_events", "agent_name")?,
            team_name: row_helpers::get_opt(row, 7, "run_events", "team_name")?,
        },
        category,
        action,
        data,
    })
}
