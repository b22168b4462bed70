//! libSQL backend: async `FlagStore` implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! RFC 3339 UTC strings with fixed microsecond precision so that the
//! expiry and retention comparisons can be done with plain text ordering.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::flags::model::chrono_duration;
use crate::flags::{Flag, FlagStatus, FlagType, StatusCounts};
use crate::store::migrations;
use crate::store::traits::FlagStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_flags(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<Flag>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut flags = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
        {
            flags.push(row_to_flag(&row)?);
        }
        Ok(flags)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for every timestamp column.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: &str, s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("flag.{column} '{s}': {e}")))
}

fn parse_json(column: &str, s: &str) -> Result<serde_json::Value, DatabaseError> {
    if s.is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("flag.{column}: {e}")))
}

fn to_json(column: &str, value: &serde_json::Value) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("flag.{column}: {e}")))
}

/// Column list for flag SELECT queries (11 columns).
const FLAG_COLUMNS: &str = "id, session_id, flag_type, status, priority, data, created_at, updated_at, expires_at, agent_assigned, metadata";

/// Pending queue order; rowid keeps insertion order for equal timestamps.
const PENDING_ORDER: &str = "ORDER BY priority DESC, created_at ASC, rowid ASC";

fn row_to_flag(row: &libsql::Row) -> Result<Flag, DatabaseError> {
    let col = |i: i32, name: &str| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("flag.{name}: {e}")))
    };

    let id_str = col(0, "id")?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("flag.id parse: {e}")))?;

    let flag_type: FlagType = col(2, "flag_type")?
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("{e}")))?;
    let status: FlagStatus = col(3, "status")?
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("{e}")))?;

    let priority: i64 = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("flag.priority: {e}")))?;

    let agent_assigned = row.get::<String>(9).ok().filter(|s| !s.is_empty());

    Ok(Flag {
        id,
        session_id: col(1, "session_id")?,
        flag_type,
        status,
        priority,
        data: parse_json("data", &col(5, "data")?)?,
        created_at: parse_ts("created_at", &col(6, "created_at")?)?,
        updated_at: parse_ts("updated_at", &col(7, "updated_at")?)?,
        expires_at: parse_ts("expires_at", &col(8, "expires_at")?)?,
        agent_assigned,
        metadata: parse_json("metadata", &col(10, "metadata")?)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl FlagStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn create_flag(&self, flag: &Flag) -> Result<(), DatabaseError> {
        let data = to_json("data", &flag.data)?;
        let metadata = to_json("metadata", &flag.metadata)?;

        self.conn()
            .execute(
                "INSERT INTO flags (id, session_id, flag_type, status, priority, data, created_at, updated_at, expires_at, agent_assigned, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    flag.id.to_string(),
                    flag.session_id.as_str(),
                    flag.flag_type.as_str(),
                    flag.status.as_str(),
                    flag.priority,
                    data,
                    fmt_ts(flag.created_at),
                    fmt_ts(flag.updated_at),
                    fmt_ts(flag.expires_at),
                    flag.agent_assigned.clone(),
                    metadata,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_flag: {e}")))?;

        debug!(flag_id = %flag.id, flag_type = %flag.flag_type, "Flag created");
        Ok(())
    }

    async fn get_flag(&self, id: Uuid) -> Result<Option<Flag>, DatabaseError> {
        let mut flags = self
            .query_flags(
                &format!("SELECT {FLAG_COLUMNS} FROM flags WHERE id = ?1"),
                params![id.to_string()],
                "get_flag",
            )
            .await?;
        Ok(flags.pop())
    }

    async fn list_pending(&self, flag_type: Option<FlagType>) -> Result<Vec<Flag>, DatabaseError> {
        let now = fmt_ts(Utc::now());
        match flag_type {
            Some(ty) => {
                self.query_flags(
                    &format!(
                        "SELECT {FLAG_COLUMNS} FROM flags \
                         WHERE status = 'pending' AND expires_at > ?1 AND flag_type = ?2 \
                         {PENDING_ORDER}"
                    ),
                    params![now, ty.as_str()],
                    "list_pending",
                )
                .await
            }
            None => {
                self.query_flags(
                    &format!(
                        "SELECT {FLAG_COLUMNS} FROM flags \
                         WHERE status = 'pending' AND expires_at > ?1 \
                         {PENDING_ORDER}"
                    ),
                    params![now],
                    "list_pending",
                )
                .await
            }
        }
    }

    async fn list_session_flags(
        &self,
        session_id: &str,
        flag_type: Option<FlagType>,
    ) -> Result<Vec<Flag>, DatabaseError> {
        match flag_type {
            Some(ty) => {
                self.query_flags(
                    &format!(
                        "SELECT {FLAG_COLUMNS} FROM flags WHERE session_id = ?1 AND flag_type = ?2 \
                         ORDER BY created_at ASC, rowid ASC"
                    ),
                    params![session_id, ty.as_str()],
                    "list_session_flags",
                )
                .await
            }
            None => {
                self.query_flags(
                    &format!(
                        "SELECT {FLAG_COLUMNS} FROM flags WHERE session_id = ?1 \
                         ORDER BY created_at ASC, rowid ASC"
                    ),
                    params![session_id],
                    "list_session_flags",
                )
                .await
            }
        }
    }

    async fn has_flag(&self, session_id: &str, flag_type: FlagType) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM flags WHERE session_id = ?1 AND flag_type = ?2 LIMIT 1",
                params![session_id, flag_type.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_flag: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("has_flag row: {e}")))?;
        Ok(row.is_some())
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: FlagStatus,
        to: FlagStatus,
        agent: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        if !from.can_transition_to(to) {
            debug!(flag_id = %id, %from, %to, "Rejected illegal flag transition");
            return Ok(false);
        }

        let now = fmt_ts(Utc::now());
        let id_str = id.to_string();
        let conn = self.conn();

        let changed = match (to, agent) {
            (FlagStatus::InProgress, agent) => {
                conn.execute(
                    "UPDATE flags SET status = ?1, agent_assigned = ?2, updated_at = ?3 \
                     WHERE id = ?4 AND status = ?5 AND expires_at > ?3",
                    params![to.as_str(), agent.map(str::to_string), now, id_str, from.as_str()],
                )
                .await
            }
            (FlagStatus::Expired, _) => {
                conn.execute(
                    "UPDATE flags SET status = ?1, updated_at = ?2 \
                     WHERE id = ?3 AND status = ?4 AND expires_at <= ?2",
                    params![to.as_str(), now, id_str, from.as_str()],
                )
                .await
            }
            (_, Some(agent)) => {
                conn.execute(
                    "UPDATE flags SET status = ?1, updated_at = ?2 \
                     WHERE id = ?3 AND status = ?4 AND agent_assigned = ?5",
                    params![to.as_str(), now, id_str, from.as_str(), agent],
                )
                .await
            }
            (_, None) => {
                conn.execute(
                    "UPDATE flags SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                    params![to.as_str(), now, id_str, from.as_str()],
                )
                .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("transition_status: {e}")))?;

        debug!(flag_id = %id, %from, %to, changed, "Flag transition attempted");
        Ok(changed == 1)
    }

    async fn transition_with_metadata(
        &self,
        id: Uuid,
        from: FlagStatus,
        to: FlagStatus,
        agent: Option<&str>,
        key: &str,
        value: serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        if from != FlagStatus::InProgress || !from.can_transition_to(to) {
            debug!(flag_id = %id, %from, %to, "Rejected illegal flag transition");
            return Ok(false);
        }

        let path = format!("$.\"{key}\"");
        let value = to_json("metadata", &value)?;

        let changed = self
            .conn()
            .execute(
                "UPDATE flags SET status = ?1, updated_at = ?2, \
                 metadata = json_set(CASE WHEN json_valid(metadata) THEN metadata ELSE '{}' END, ?3, json(?4)) \
                 WHERE id = ?5 AND status = ?6 AND (?7 IS NULL OR agent_assigned = ?7)",
                params![
                    to.as_str(),
                    fmt_ts(Utc::now()),
                    path,
                    value,
                    id.to_string(),
                    from.as_str(),
                    agent.map(str::to_string),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_with_metadata: {e}")))?;

        debug!(flag_id = %id, %from, %to, key, changed, "Flag transition with metadata attempted");
        Ok(changed == 1)
    }

    async fn sweep_expired(&self) -> Result<usize, DatabaseError> {
        let now = fmt_ts(Utc::now());
        let count = self
            .conn()
            .execute(
                "UPDATE flags SET status = 'expired', updated_at = ?1 \
                 WHERE status = 'pending' AND expires_at <= ?1",
                params![now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("sweep_expired: {e}")))?;

        if count > 0 {
            info!(count, "Expired stale pending flags");
        }
        Ok(count as usize)
    }

    async fn delete_terminal(&self, older_than: Duration) -> Result<usize, DatabaseError> {
        let cutoff = Utc::now() - chrono_duration(older_than);
        let count = self
            .conn()
            .execute(
                "DELETE FROM flags \
                 WHERE status IN ('completed', 'failed', 'expired') AND updated_at < ?1",
                params![fmt_ts(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_terminal: {e}")))?;

        if count > 0 {
            info!(count, older_than_secs = older_than.as_secs(), "Deleted terminal flags");
        }
        Ok(count as usize)
    }

    async fn count_by_status(&self) -> Result<StatusCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM flags GROUP BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;

        let mut counts = StatusCounts::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_status row: {e}")))?
        {
            let status: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("count_by_status.status: {e}")))?;
            let n: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("count_by_status.count: {e}")))?;
            if let Ok(status) = status.parse::<FlagStatus>() {
                counts.add(status, n.max(0) as u64);
            }
        }
        Ok(counts)
    }
}
