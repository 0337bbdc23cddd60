//! Operator-facing strategy management.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use tally_common::{TallyError, TallyResult};

use crate::batch::parse_periodic_expr;
use crate::condition::parse_condition;
use crate::store::StrategyStore;
use crate::types::{ExecutionRecord, QuotaStrategy, StrategyKind};

/// Operator input for creating or updating a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDraft {
    pub name: String,
    pub title: String,
    pub kind: StrategyKind,
    pub amount: i64,
    pub model: String,
    #[serde(default)]
    pub periodic_expr: Option<String>,
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub max_exec_per_user: i32,
}

impl StrategyDraft {
    /// Validate the draft: positive amount, parseable condition, and a
    /// valid periodic expression for periodic strategies. One-shot
    /// strategies ignore the periodic expression.
    fn validate(&self) -> TallyResult<()> {
        if self.name.trim().is_empty() {
            return Err(TallyError::InvalidInput(
                "strategy name must not be empty".to_string(),
            ));
        }
        if self.amount <= 0 {
            return Err(TallyError::InvalidInput(
                "strategy amount must be positive".to_string(),
            ));
        }
        if self.max_exec_per_user < 0 {
            return Err(TallyError::InvalidInput(
                "max executions per user must be non-negative".to_string(),
            ));
        }
        parse_condition(&self.condition)?;

        if self.kind == StrategyKind::Periodic {
            let expr = self.periodic_expr.as_deref().unwrap_or("").trim();
            if expr.is_empty() {
                return Err(TallyError::InvalidPeriodicExpr(
                    "periodic strategy requires a periodic expression".to_string(),
                ));
            }
            parse_periodic_expr(expr)?;
        }
        Ok(())
    }

    fn periodic_expr_for_kind(&self) -> Option<String> {
        match self.kind {
            StrategyKind::Periodic => self.periodic_expr.clone(),
            StrategyKind::OneShot => None,
        }
    }
}

/// Strategy CRUD with validation.
pub struct StrategyService<S> {
    store: Arc<S>,
}

impl<S: StrategyStore + Sync> StrategyService<S> {
    /// Create a service over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Create a strategy, enabled by default.
    #[instrument(name = "strategy.create", skip(self, draft), fields(name = %draft.name))]
    pub async fn create(&self, draft: StrategyDraft) -> TallyResult<QuotaStrategy> {
        draft.validate()?;
        let now = Utc::now();
        let strategy = QuotaStrategy {
            id: Uuid::now_v7(),
            name: draft.name.clone(),
            title: draft.title.clone(),
            kind: draft.kind,
            amount: draft.amount,
            model: draft.model.clone(),
            periodic_expr: draft.periodic_expr_for_kind(),
            condition: draft.condition.clone(),
            status: true,
            max_exec_per_user: draft.max_exec_per_user,
            create_time: now,
            update_time: now,
        };
        self.store.create_strategy(&strategy).await?;
        info!(id = %strategy.id, "strategy created");
        Ok(strategy)
    }

    /// Update a strategy in place, preserving id and creation time.
    #[instrument(name = "strategy.update", skip(self, draft))]
    pub async fn update(&self, id: Uuid, draft: StrategyDraft) -> TallyResult<QuotaStrategy> {
        draft.validate()?;
        let existing = self
            .store
            .get_by_id(id)
            .await?
            .ok_or_else(|| TallyError::StrategyNotFound(id.to_string()))?;

        let strategy = QuotaStrategy {
            id,
            name: draft.name.clone(),
            title: draft.title.clone(),
            kind: draft.kind,
            amount: draft.amount,
            model: draft.model.clone(),
            periodic_expr: draft.periodic_expr_for_kind(),
            condition: draft.condition.clone(),
            status: existing.status,
            max_exec_per_user: draft.max_exec_per_user,
            create_time: existing.create_time,
            update_time: Utc::now(),
        };
        self.store.update_strategy(&strategy).await?;
        Ok(strategy)
    }

    /// Enable a strategy.
    pub async fn enable(&self, id: Uuid) -> TallyResult<()> {
        self.store.set_enabled(id, true).await
    }

    /// Disable a strategy. Strategies are never deleted; this is the
    /// terminal state.
    pub async fn disable(&self, id: Uuid) -> TallyResult<()> {
        self.store.set_enabled(id, false).await
    }

    /// Fetch by id.
    pub async fn get(&self, id: Uuid) -> TallyResult<Option<QuotaStrategy>> {
        self.store.get_by_id(id).await
    }

    /// Fetch by unique name.
    pub async fn get_by_name(&self, name: &str) -> TallyResult<Option<QuotaStrategy>> {
        self.store.get_by_name(name).await
    }

    /// List strategies.
    pub async fn list(&self, enabled_only: bool) -> TallyResult<Vec<QuotaStrategy>> {
        self.store.list(enabled_only).await
    }

    /// Recent execution history of a strategy, newest first.
    pub async fn executions(&self, id: Uuid, limit: i64) -> TallyResult<Vec<ExecutionRecord>> {
        self.store.executions_for_strategy(id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStrategyStore;

    fn service() -> StrategyService<MemoryStrategyStore> {
        StrategyService::new(Arc::new(MemoryStrategyStore::new()))
    }

    fn draft(kind: StrategyKind) -> StrategyDraft {
        StrategyDraft {
            name: "monthly-vip".to_string(),
            title: "Monthly VIP top-up".to_string(),
            kind,
            amount: 100,
            model: "default".to_string(),
            periodic_expr: Some("0 0 2 1 * *".to_string()),
            condition: "is-vip(2)".to_string(),
            max_exec_per_user: 0,
        }
    }

    #[tokio::test]
    async fn test_create_validates_amount() {
        let service = service();
        let mut bad = draft(StrategyKind::OneShot);
        bad.amount = 0;
        assert!(matches!(
            service.create(bad).await,
            Err(TallyError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_create_validates_condition() {
        let service = service();
        let mut bad = draft(StrategyKind::OneShot);
        bad.condition = "bogus(".to_string();
        assert!(matches!(
            service.create(bad).await,
            Err(TallyError::InvalidCondition(_))
        ));
    }

    #[tokio::test]
    async fn test_periodic_requires_valid_expression() {
        let service = service();

        let mut missing = draft(StrategyKind::Periodic);
        missing.periodic_expr = None;
        assert!(matches!(
            service.create(missing).await,
            Err(TallyError::InvalidPeriodicExpr(_))
        ));

        let mut invalid = draft(StrategyKind::Periodic);
        invalid.periodic_expr = Some("whenever".to_string());
        assert!(matches!(
            service.create(invalid).await,
            Err(TallyError::InvalidPeriodicExpr(_))
        ));
    }

    #[tokio::test]
    async fn test_one_shot_drops_periodic_expression() {
        let service = service();
        let created = service.create(draft(StrategyKind::OneShot)).await.unwrap();
        assert_eq!(created.periodic_expr, None);
        assert!(created.status);
    }

    #[tokio::test]
    async fn test_update_preserves_enabled_flag() {
        let service = service();
        let created = service.create(draft(StrategyKind::Periodic)).await.unwrap();
        service.disable(created.id).await.unwrap();

        let mut change = draft(StrategyKind::Periodic);
        change.amount = 250;
        let updated = service.update(created.id, change).await.unwrap();
        assert_eq!(updated.amount, 250);
        assert!(!updated.status);
        assert_eq!(updated.create_time, created.create_time);
    }
}
