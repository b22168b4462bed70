//! Flag data model: types, statuses, and event topics.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlagError;

/// Default time a flag stays claimable: 30 minutes.
pub const DEFAULT_FLAG_TTL: Duration = Duration::from_secs(30 * 60);

/// The closed set of work and result kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlagType {
    RequestPrediction,
    RequestReport,
    PredictionComplete,
    ReportComplete,
    VoiceOutput,
    CompleteSession,
    Test,
}

impl FlagType {
    pub const ALL: [FlagType; 7] = [
        FlagType::RequestPrediction,
        FlagType::RequestReport,
        FlagType::PredictionComplete,
        FlagType::ReportComplete,
        FlagType::VoiceOutput,
        FlagType::CompleteSession,
        FlagType::Test,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestPrediction => "request-prediction",
            Self::RequestReport => "request-report",
            Self::PredictionComplete => "prediction-complete",
            Self::ReportComplete => "report-complete",
            Self::VoiceOutput => "voice-output",
            Self::CompleteSession => "complete-session",
            Self::Test => "test",
        }
    }

    /// The result type a worker creates after finishing a request of this
    /// type. Only request types have one.
    pub fn completion_type(&self) -> Option<FlagType> {
        match self {
            Self::RequestPrediction => Some(Self::PredictionComplete),
            Self::RequestReport => Some(Self::ReportComplete),
            _ => None,
        }
    }
}

impl fmt::Display for FlagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlagType {
    type Err = FlagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlagType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| FlagError::UnknownType(s.to_string()))
    }
}

/// Lifecycle status of a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Worker finished successfully.
    Completed,
    /// Worker gave up.
    Failed,
    /// Nobody claimed it before `expires_at`.
    Expired,
}

impl FlagStatus {
    /// Legal moves: pending → in_progress → {completed, failed}, and
    /// pending → expired (sweep only).
    pub fn can_transition_to(&self, target: FlagStatus) -> bool {
        use FlagStatus::*;

        matches!(
            (self, target),
            (Pending, InProgress)
                | (Pending, Expired)
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for FlagStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlagStatus {
    type Err = FlagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(FlagError::UnknownStatus(other.to_string())),
        }
    }
}

/// A persisted unit of requested or completed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    /// Unique ID, fixed at creation.
    pub id: Uuid,
    /// Correlation key grouping flags of one logical interaction.
    pub session_id: String,
    pub flag_type: FlagType,
    pub status: FlagStatus,
    /// Higher values are handed out first among pending flags of a type.
    pub priority: i64,
    /// Payload interpreted only by the domain worker.
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Worker that claimed the flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_assigned: Option<String>,
    /// Free-form diagnostics.
    pub metadata: serde_json::Value,
}

impl Flag {
    /// Create a pending flag with the default 30 minute TTL.
    pub fn new(flag_type: FlagType, session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            flag_type,
            status: FlagStatus::Pending,
            priority: 0,
            data: empty_object(),
            created_at: now,
            updated_at: now,
            expires_at: now + chrono_duration(DEFAULT_FLAG_TTL),
            agent_assigned: None,
            metadata: empty_object(),
        }
    }

    /// Builder: set the payload. Non-object values are wrapped as `{"value": ..}`.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = into_object(data);
        self
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: expire `ttl` after creation. A zero TTL makes the flag
    /// eligible for the next expiry sweep.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = self.created_at + chrono_duration(ttl);
        self
    }

    /// Builder: set diagnostic metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = into_object(metadata);
        self
    }

    /// Whether `expires_at` has passed.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Pending and not yet past its expiry.
    pub fn is_claimable(&self) -> bool {
        self.status == FlagStatus::Pending && !self.is_expired()
    }
}

/// Lifecycle events published on the bus for every flag transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagEventKind {
    Created,
    Claimed,
    Completed,
    Failed,
}

impl FlagEventKind {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Created => "flag_created",
            Self::Claimed => "flag_claimed",
            Self::Completed => "flag_completed",
            Self::Failed => "flag_failed",
        }
    }

    /// Topic name, e.g. `flag_created:request-prediction`.
    pub fn topic(&self, flag_type: FlagType) -> String {
        format!("{}:{}", self.prefix(), flag_type)
    }

    /// The event emitted when a flag enters `status`, if any.
    pub fn for_status(status: FlagStatus) -> Option<FlagEventKind> {
        match status {
            FlagStatus::Pending => Some(Self::Created),
            FlagStatus::InProgress => Some(Self::Claimed),
            FlagStatus::Completed => Some(Self::Completed),
            FlagStatus::Failed => Some(Self::Failed),
            FlagStatus::Expired => None,
        }
    }
}

/// Per-status row counts, for stats and health output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub expired: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.failed + self.expired
    }

    pub(crate) fn add(&mut self, status: FlagStatus, n: u64) {
        match status {
            FlagStatus::Pending => self.pending += n,
            FlagStatus::InProgress => self.in_progress += n,
            FlagStatus::Completed => self.completed += n,
            FlagStatus::Failed => self.failed += n,
            FlagStatus::Expired => self.expired += n,
        }
    }
}

pub(crate) fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn into_object(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(_) => value,
        serde_json::Value::Null => empty_object(),
        other => serde_json::json!({ "value": other }),
    }
}

/// Longest TTL honoured; larger values are clamped so timestamps stay
/// four-digit-year RFC 3339 and keep sorting lexically.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d.min(MAX_TTL)).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_valid() {
        assert!(FlagStatus::Pending.can_transition_to(FlagStatus::InProgress));
        assert!(FlagStatus::Pending.can_transition_to(FlagStatus::Expired));
        assert!(FlagStatus::InProgress.can_transition_to(FlagStatus::Completed));
        assert!(FlagStatus::InProgress.can_transition_to(FlagStatus::Failed));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!FlagStatus::Pending.can_transition_to(FlagStatus::Completed));
        assert!(!FlagStatus::InProgress.can_transition_to(FlagStatus::Expired));
        assert!(!FlagStatus::InProgress.can_transition_to(FlagStatus::Pending));
        assert!(!FlagStatus::Completed.can_transition_to(FlagStatus::Failed));
        assert!(!FlagStatus::Expired.can_transition_to(FlagStatus::InProgress));
    }

    #[test]
    fn terminal_states() {
        assert!(FlagStatus::Completed.is_terminal());
        assert!(FlagStatus::Failed.is_terminal());
        assert!(FlagStatus::Expired.is_terminal());
        assert!(!FlagStatus::Pending.is_terminal());
        assert!(!FlagStatus::InProgress.is_terminal());
    }

    #[test]
    fn flag_type_wire_names() {
        assert_eq!(FlagType::RequestPrediction.to_string(), "request-prediction");
        assert_eq!(
            serde_json::to_string(&FlagType::CompleteSession).unwrap(),
            "\"complete-session\""
        );
        assert_eq!("report-complete".parse::<FlagType>().unwrap(), FlagType::ReportComplete);
        assert!("request_prediction".parse::<FlagType>().is_err());
    }

    #[test]
    fn completion_types() {
        assert_eq!(
            FlagType::RequestPrediction.completion_type(),
            Some(FlagType::PredictionComplete)
        );
        assert_eq!(FlagType::RequestReport.completion_type(), Some(FlagType::ReportComplete));
        assert_eq!(FlagType::VoiceOutput.completion_type(), None);
        assert_eq!(FlagType::PredictionComplete.completion_type(), None);
    }

    #[test]
    fn new_flag_defaults() {
        let flag = Flag::new(FlagType::Test, "s1");
        assert_eq!(flag.status, FlagStatus::Pending);
        assert_eq!(flag.priority, 0);
        assert!(flag.agent_assigned.is_none());
        assert_eq!(flag.expires_at - flag.created_at, chrono::Duration::minutes(30));
        assert!(flag.is_claimable());
    }

    #[test]
    fn zero_ttl_is_immediately_expired() {
        let flag = Flag::new(FlagType::Test, "s1").with_ttl(Duration::ZERO);
        assert!(flag.is_expired());
        assert!(!flag.is_claimable());
    }

    #[test]
    fn non_object_data_is_wrapped() {
        let flag = Flag::new(FlagType::Test, "s1").with_data(serde_json::json!(42));
        assert_eq!(flag.data["value"], 42);

        let flag = Flag::new(FlagType::Test, "s1").with_data(serde_json::Value::Null);
        assert!(flag.data.as_object().unwrap().is_empty());
    }

    #[test]
    fn topic_names() {
        assert_eq!(
            FlagEventKind::Created.topic(FlagType::RequestReport),
            "flag_created:request-report"
        );
        assert_eq!(
            FlagEventKind::Failed.topic(FlagType::VoiceOutput),
            "flag_failed:voice-output"
        );
    }

    #[test]
    fn status_serde_matches_column_values() {
        let json = serde_json::to_string(&FlagStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!("in_progress".parse::<FlagStatus>().unwrap(), FlagStatus::InProgress);
    }
}
