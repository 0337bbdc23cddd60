//! Strategy and execution-record persistence.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use tally_common::{TallyError, TallyResult, UserId};

use crate::types::{ExecutionRecord, ExecutionStatus, QuotaStrategy};

/// Repository for strategies and their execution records.
#[trait_variant::make(StrategyStore: Send)]
pub trait LocalStrategyStore {
    /// Insert a new strategy. The name must be unique.
    async fn create_strategy(&self, strategy: &QuotaStrategy) -> TallyResult<()>;

    /// Update an existing strategy by id.
    async fn update_strategy(&self, strategy: &QuotaStrategy) -> TallyResult<()>;

    /// Enable or disable a strategy.
    async fn set_enabled(&self, id: Uuid, enabled: bool) -> TallyResult<()>;

    /// Fetch a strategy by id.
    async fn get_by_id(&self, id: Uuid) -> TallyResult<Option<QuotaStrategy>>;

    /// Fetch a strategy by unique name.
    async fn get_by_name(&self, name: &str) -> TallyResult<Option<QuotaStrategy>>;

    /// List strategies, optionally restricted to enabled ones.
    async fn list(&self, enabled_only: bool) -> TallyResult<Vec<QuotaStrategy>>;

    /// Insert an execution record.
    async fn insert_execution(&self, record: &ExecutionRecord) -> TallyResult<()>;

    /// Update an execution record's status, recording the credit expiry
    /// on completion.
    async fn mark_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        expiry_date: Option<DateTime<Utc>>,
    ) -> TallyResult<()>;

    /// Completed executions of a strategy for a user, across batches.
    async fn completed_count(&self, strategy_id: Uuid, user: UserId) -> TallyResult<i64>;

    /// Whether a completed row exists for (strategy, user, batch).
    async fn completed_in_batch(
        &self,
        strategy_id: Uuid,
        user: UserId,
        batch_number: &str,
    ) -> TallyResult<bool>;

    /// Whether any completed row exists for (strategy, batch).
    async fn any_completed_in_batch(
        &self,
        strategy_id: Uuid,
        batch_number: &str,
    ) -> TallyResult<bool>;

    /// Recent execution records of a strategy, newest first.
    async fn executions_for_strategy(
        &self,
        strategy_id: Uuid,
        limit: i64,
    ) -> TallyResult<Vec<ExecutionRecord>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct State {
    strategies: Vec<QuotaStrategy>,
    executions: Vec<ExecutionRecord>,
}

/// Strategy store backed by process memory, for tests.
#[derive(Default)]
pub struct MemoryStrategyStore {
    state: RwLock<State>,
}

impl MemoryStrategyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl StrategyStore for MemoryStrategyStore {
    async fn create_strategy(&self, strategy: &QuotaStrategy) -> TallyResult<()> {
        let mut state = self.write();
        if state.strategies.iter().any(|s| s.name == strategy.name) {
            return Err(TallyError::InvalidInput(format!(
                "strategy name already exists: {}",
                strategy.name
            )));
        }
        state.strategies.push(strategy.clone());
        Ok(())
    }

    async fn update_strategy(&self, strategy: &QuotaStrategy) -> TallyResult<()> {
        let mut state = self.write();
        match state.strategies.iter_mut().find(|s| s.id == strategy.id) {
            Some(existing) => {
                *existing = strategy.clone();
                Ok(())
            }
            None => Err(TallyError::StrategyNotFound(strategy.id.to_string())),
        }
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> TallyResult<()> {
        let mut state = self.write();
        match state.strategies.iter_mut().find(|s| s.id == id) {
            Some(strategy) => {
                strategy.status = enabled;
                strategy.update_time = Utc::now();
                Ok(())
            }
            None => Err(TallyError::StrategyNotFound(id.to_string())),
        }
    }

    async fn get_by_id(&self, id: Uuid) -> TallyResult<Option<QuotaStrategy>> {
        Ok(self.read().strategies.iter().find(|s| s.id == id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> TallyResult<Option<QuotaStrategy>> {
        Ok(self
            .read()
            .strategies
            .iter()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn list(&self, enabled_only: bool) -> TallyResult<Vec<QuotaStrategy>> {
        Ok(self
            .read()
            .strategies
            .iter()
            .filter(|s| !enabled_only || s.status)
            .cloned()
            .collect())
    }

    async fn insert_execution(&self, record: &ExecutionRecord) -> TallyResult<()> {
        self.write().executions.push(record.clone());
        Ok(())
    }

    async fn mark_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        expiry_date: Option<DateTime<Utc>>,
    ) -> TallyResult<()> {
        let mut state = self.write();
        match state.executions.iter_mut().find(|e| e.id == id) {
            Some(record) => {
                record.status = status;
                record.expiry_date = expiry_date;
                record.update_time = Utc::now();
                Ok(())
            }
            None => Err(TallyError::Database(format!(
                "execution record not found: {id}"
            ))),
        }
    }

    async fn completed_count(&self, strategy_id: Uuid, user: UserId) -> TallyResult<i64> {
        Ok(self
            .read()
            .executions
            .iter()
            .filter(|e| {
                e.strategy_id == strategy_id
                    && e.user_id == user
                    && e.status == ExecutionStatus::Completed
            })
            .count() as i64)
    }

    async fn completed_in_batch(
        &self,
        strategy_id: Uuid,
        user: UserId,
        batch_number: &str,
    ) -> TallyResult<bool> {
        Ok(self.read().executions.iter().any(|e| {
            e.strategy_id == strategy_id
                && e.user_id == user
                && e.batch_number == batch_number
                && e.status == ExecutionStatus::Completed
        }))
    }

    async fn any_completed_in_batch(
        &self,
        strategy_id: Uuid,
        batch_number: &str,
    ) -> TallyResult<bool> {
        Ok(self.read().executions.iter().any(|e| {
            e.strategy_id == strategy_id
                && e.batch_number == batch_number
                && e.status == ExecutionStatus::Completed
        }))
    }

    async fn executions_for_strategy(
        &self,
        strategy_id: Uuid,
        limit: i64,
    ) -> TallyResult<Vec<ExecutionRecord>> {
        let mut records: Vec<ExecutionRecord> = self
            .read()
            .executions
            .iter()
            .filter(|e| e.strategy_id == strategy_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.create_time.cmp(&a.create_time));
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecutionRecord, ExecutionStatus, MemoryStrategyStore, QuotaStrategy, StrategyStore, UserId, Utc, Uuid};
    use crate::types::StrategyKind;

    fn strategy(name: &str) -> QuotaStrategy {
        QuotaStrategy {
            id: Uuid::now_v7(),
            name: name.to_string(),
            title: name.to_string(),
            kind: StrategyKind::OneShot,
            amount: 10,
            model: "default".to_string(),
            periodic_expr: None,
            condition: String::new(),
            status: true,
            max_exec_per_user: 0,
            create_time: Utc::now(),
            update_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_name() {
        let store = MemoryStrategyStore::new();
        store.create_strategy(&strategy("welcome")).await.unwrap();
        assert!(store.create_strategy(&strategy("welcome")).await.is_err());
    }

    #[tokio::test]
    async fn test_enable_disable() {
        let store = MemoryStrategyStore::new();
        let s = strategy("welcome");
        store.create_strategy(&s).await.unwrap();

        store.set_enabled(s.id, false).await.unwrap();
        assert!(store.list(true).await.unwrap().is_empty());
        assert_eq!(store.list(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_completed_counters() {
        let store = MemoryStrategyStore::new();
        let s = strategy("welcome");
        let user = UserId::new();

        let mut record = ExecutionRecord::new(s.id, user, "SINGLE", ExecutionStatus::Pending);
        store.insert_execution(&record).await.unwrap();
        assert_eq!(store.completed_count(s.id, user).await.unwrap(), 0);
        assert!(!store.completed_in_batch(s.id, user, "SINGLE").await.unwrap());

        store
            .mark_execution(record.id, ExecutionStatus::Completed, Some(Utc::now()))
            .await
            .unwrap();
        assert_eq!(store.completed_count(s.id, user).await.unwrap(), 1);
        assert!(store.completed_in_batch(s.id, user, "SINGLE").await.unwrap());
        assert!(store.any_completed_in_batch(s.id, "SINGLE").await.unwrap());

        // Failed rows do not count.
        record = ExecutionRecord::new(s.id, user, "SINGLE", ExecutionStatus::Failed);
        store.insert_execution(&record).await.unwrap();
        assert_eq!(store.completed_count(s.id, user).await.unwrap(), 1);
    }
}
