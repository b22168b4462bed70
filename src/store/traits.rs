//! `FlagStore` trait: the single source of truth for flag state.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::flags::{Flag, FlagStatus, FlagType, StatusCounts};

/// Backend-agnostic flag persistence.
///
/// Every status change goes through [`FlagStore::transition_status`], a
/// conditional write keyed on the expected current status, so concurrent
/// claimants cannot both win.
#[async_trait]
pub trait FlagStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Insert a new flag row.
    async fn create_flag(&self, flag: &Flag) -> Result<(), DatabaseError>;

    /// Get a flag by ID.
    async fn get_flag(&self, id: Uuid) -> Result<Option<Flag>, DatabaseError>;

    /// Pending, non-expired flags, highest priority first, then oldest first.
    async fn list_pending(&self, flag_type: Option<FlagType>) -> Result<Vec<Flag>, DatabaseError>;

    /// All flags of a session (optionally one type), oldest first.
    async fn list_session_flags(
        &self,
        session_id: &str,
        flag_type: Option<FlagType>,
    ) -> Result<Vec<Flag>, DatabaseError>;

    /// Whether any flag of `flag_type` exists for the session, in any status.
    async fn has_flag(&self, session_id: &str, flag_type: FlagType) -> Result<bool, DatabaseError>;

    /// Move a flag from `from` to `to` if, and only if, it is currently in
    /// `from`. Returns `false` when no row matched.
    ///
    /// Claiming (`pending → in_progress`) records `agent` as the assignee and
    /// refuses flags already past `expires_at`. For the terminal transitions
    /// a supplied `agent` must match the assignee.
    async fn transition_status(
        &self,
        id: Uuid,
        from: FlagStatus,
        to: FlagStatus,
        agent: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// [`transition_status`](FlagStore::transition_status) out of
    /// `in_progress` that also sets `metadata[key] = value` in the same
    /// write, so no reader sees the new status without the note.
    async fn transition_with_metadata(
        &self,
        id: Uuid,
        from: FlagStatus,
        to: FlagStatus,
        agent: Option<&str>,
        key: &str,
        value: serde_json::Value,
    ) -> Result<bool, DatabaseError>;

    /// Flip pending flags past `expires_at` to expired.
    /// Returns the number of flags expired.
    async fn sweep_expired(&self) -> Result<usize, DatabaseError>;

    /// Delete completed/failed/expired flags last updated before
    /// `now - older_than`. Returns the number of rows deleted.
    async fn delete_terminal(&self, older_than: Duration) -> Result<usize, DatabaseError>;

    /// Row counts per status.
    async fn count_by_status(&self) -> Result<StatusCounts, DatabaseError>;
}
