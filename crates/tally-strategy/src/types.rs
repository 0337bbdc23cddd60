//! Strategy and execution record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tally_common::UserId;

/// How often a strategy fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Fires at most once per user; the batch key is constant.
    OneShot,
    /// Fires on a cron schedule; the batch key varies with firing time.
    Periodic,
}

impl StrategyKind {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            StrategyKind::OneShot => "one-shot",
            StrategyKind::Periodic => "periodic",
        }
    }

    /// Parse from database string.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "one-shot" => Some(StrategyKind::OneShot),
            "periodic" => Some(StrategyKind::Periodic),
            _ => None,
        }
    }
}

/// A declarative recharge strategy.
///
/// Never deleted while execution records reference it; disable is the
/// terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStrategy {
    /// Surrogate id.
    pub id: Uuid,

    /// Unique name, referenced from RECHARGE audit rows.
    pub name: String,

    /// Operator-facing title.
    pub title: String,

    /// One-shot or periodic.
    pub kind: StrategyKind,

    /// Amount credited per execution. Always positive.
    pub amount: i64,

    /// Target model label.
    pub model: String,

    /// Six-field cron expression (seconds precision). Required for
    /// periodic strategies, ignored for one-shot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub periodic_expr: Option<String>,

    /// Condition DSL string; empty matches all users.
    pub condition: String,

    /// Enabled flag.
    pub status: bool,

    /// Per-user completed-execution cap; 0 means unbounded.
    pub max_exec_per_user: i32,

    /// Creation timestamp.
    pub create_time: DateTime<Utc>,

    /// Last update timestamp.
    pub update_time: DateTime<Utc>,
}

/// Outcome of one strategy execution attempt for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Row inserted, credit not yet applied.
    Pending,
    /// Credit applied; counts toward the per-user cap and the batch
    /// idempotence key.
    Completed,
    /// Credit failed; retained for observability, retried in the next
    /// batch.
    Failed,
}

impl ExecutionStatus {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    /// Parse from database string.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

/// Record that a strategy executed for a user in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Surrogate id.
    pub id: Uuid,

    /// Strategy that executed.
    pub strategy_id: Uuid,

    /// Target user.
    pub user_id: UserId,

    /// Batch key: `YYYYMMDDHH` of the most recent firing for periodic
    /// strategies, `SINGLE` for one-shot.
    pub batch_number: String,

    /// Attempt outcome.
    pub status: ExecutionStatus,

    /// Expiry assigned to the emitted credit, once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,

    /// Creation timestamp.
    pub create_time: DateTime<Utc>,

    /// Last update timestamp.
    pub update_time: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Create a record in the given initial status.
    pub fn new(
        strategy_id: Uuid,
        user_id: UserId,
        batch_number: impl Into<String>,
        status: ExecutionStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            strategy_id,
            user_id,
            batch_number: batch_number.into(),
            status,
            expiry_date: None,
            create_time: now,
            update_time: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_db_roundtrip() {
        assert_eq!(
            StrategyKind::from_db_str(StrategyKind::Periodic.as_db_str()),
            Some(StrategyKind::Periodic)
        );
        assert_eq!(StrategyKind::from_db_str("weekly"), None);
    }

    #[test]
    fn test_status_db_roundtrip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(ExecutionStatus::from_db_str(status.as_db_str()), Some(status));
        }
    }
}
