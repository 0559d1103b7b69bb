use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use echelon_core::hierarchy::HierarchySpec;
use echelon_core::ids::HierarchyId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A stored hierarchy row. The config column holds the full
/// `HierarchySpec` as JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HierarchyRow {
    pub id: HierarchyId,
    pub name: String,
    pub spec: HierarchySpec,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

pub struct HierarchyRepo {
    db: Database,
}

impl HierarchyRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a new hierarchy. The spec is validated before insert.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub fn create(&self, mut spec: HierarchySpec) -> Result<HierarchyRow, StoreError> {
        spec.validate()
            .map_err(StoreError::Serialization)?;

        let id = HierarchyId::new();
        spec.id = id.clone();
        let now = Utc::now().to_rfc3339();
        let config = serde_json::to_string(&spec)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO hierarchies (id, name, config, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5)",
                rusqlite::params![id.as_str(), spec.name, config, now, now],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Conflict(format!("hierarchy name already exists: {}", spec.name))
                }
                other => StoreError::Database(other.to_string()),
            })?;

            Ok(HierarchyRow {
                id: id.clone(),
                name: spec.name.clone(),
                spec: spec.clone(),
                version: 1,
                created_at: now.clone(),
                updated_at: now.clone(),
            })
        })
    }

    /// Load a hierarchy by id. Deserializes and re-validates the config.
    #[instrument(skip(self), fields(hierarchy_id = %id))]
    pub fn get(&self, id: &HierarchyId) -> Result<HierarchyRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, config, version, created_at, updated_at
                 FROM hierarchies WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_hierarchy(row),
                None => Err(StoreError::NotFound(format!("hierarchy {id}"))),
            }
        })
    }

    /// List stored hierarchies, newest first.
    #[instrument(skip(self))]
    pub fn list(&self, limit: u32, offset: u32) -> Result<Vec<HierarchyRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, config, version, created_at, updated_at
                 FROM hierarchies ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_hierarchy(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_hierarchy(row: &rusqlite::Row<'_>) -> Result<HierarchyRow, StoreError> {
    let config: String = row_helpers::get(row, 2, "hierarchies", "config")?;
    let spec: HierarchySpec =
        serde_json::from_str(&config).map_err(|e| StoreError::CorruptRow {
            table: "hierarchies",
            column: "config",
            detail: format!("invalid spec JSON: {e}"),
        })?;

    Ok(HierarchyRow {
        id: HierarchyId::from_raw(row_helpers::get::<String>(row, 0, "hierarchies", "id")?),
        name: row_helpers::get(row, 1, "hierarchies", "name")?,
        spec,
        version: row_helpers::get(row, 3, "hierarchies", "version")?,
        created_at: row_helpers::get(row, 4, "hierarchies", "created_at")?,
        updated_at: row_helpers::get(row, 5, "hierarchies", "updated_at")?,
    })
}
