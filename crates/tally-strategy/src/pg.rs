//! PostgreSQL strategy store.
//!
//! Uses runtime SQL queries to avoid requiring DATABASE_URL at compile
//! time.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use tally_common::{TallyError, TallyResult, UserId};

use crate::store::StrategyStore;
use crate::types::{ExecutionRecord, ExecutionStatus, QuotaStrategy, StrategyKind};

/// Strategy store backed by PostgreSQL.
pub struct PgStrategyStore {
    pool: PgPool,
}

impl PgStrategyStore {
    /// Create a store over the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn strategy_from_row(row: &sqlx::postgres::PgRow) -> TallyResult<QuotaStrategy> {
    let kind_str: String = row.get("type");
    let kind = StrategyKind::from_db_str(&kind_str)
        .ok_or_else(|| TallyError::Database(format!("unknown strategy type: {kind_str}")))?;
    Ok(QuotaStrategy {
        id: row.get("id"),
        name: row.get("name"),
        title: row.get("title"),
        kind,
        amount: row.get("amount"),
        model: row.get("model"),
        periodic_expr: row.get("periodic_expr"),
        condition: row.get("condition"),
        status: row.get("status"),
        max_exec_per_user: row.get("max_exec_per_user"),
        create_time: row.get("create_time"),
        update_time: row.get("update_time"),
    })
}

fn execution_from_row(row: &sqlx::postgres::PgRow) -> TallyResult<ExecutionRecord> {
    let status_str: String = row.get("status");
    let status = ExecutionStatus::from_db_str(&status_str)
        .ok_or_else(|| TallyError::Database(format!("unknown execution status: {status_str}")))?;
    Ok(ExecutionRecord {
        id: row.get("id"),
        strategy_id: row.get("strategy_id"),
        user_id: UserId::from_uuid(row.get::<Uuid, _>("user_id")),
        batch_number: row.get("batch_number"),
        status,
        expiry_date: row.get("expiry_date"),
        create_time: row.get("create_time"),
        update_time: row.get("update_time"),
    })
}

impl StrategyStore for PgStrategyStore {
    async fn create_strategy(&self, strategy: &QuotaStrategy) -> TallyResult<()> {
        sqlx::query(
            r#"
            INSERT INTO quota_strategy (
                id, name, title, type, amount, model, periodic_expr,
                condition, status, max_exec_per_user, create_time, update_time
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(strategy.id)
        .bind(&strategy.name)
        .bind(&strategy.title)
        .bind(strategy.kind.as_db_str())
        .bind(strategy.amount)
        .bind(&strategy.model)
        .bind(&strategy.periodic_expr)
        .bind(&strategy.condition)
        .bind(strategy.status)
        .bind(strategy.max_exec_per_user)
        .bind(strategy.create_time)
        .bind(strategy.update_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_strategy(&self, strategy: &QuotaStrategy) -> TallyResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE quota_strategy
            SET name = $2, title = $3, type = $4, amount = $5, model = $6,
                periodic_expr = $7, condition = $8, status = $9,
                max_exec_per_user = $10, update_time = $11
            WHERE id = $1
            "#,
        )
        .bind(strategy.id)
        .bind(&strategy.name)
        .bind(&strategy.title)
        .bind(strategy.kind.as_db_str())
        .bind(strategy.amount)
        .bind(&strategy.model)
        .bind(&strategy.periodic_expr)
        .bind(&strategy.condition)
        .bind(strategy.status)
        .bind(strategy.max_exec_per_user)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TallyError::StrategyNotFound(strategy.id.to_string()));
        }
        Ok(())
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> TallyResult<()> {
        let result = sqlx::query(
            r#"UPDATE quota_strategy SET status = $2, update_time = NOW() WHERE id = $1"#,
        )
        .bind(id)
        .bind(enabled)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TallyError::StrategyNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> TallyResult<Option<QuotaStrategy>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, title, type, amount, model, periodic_expr,
                   condition, status, max_exec_per_user, create_time, update_time
            FROM quota_strategy
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(strategy_from_row).transpose()
    }

    async fn get_by_name(&self, name: &str) -> TallyResult<Option<QuotaStrategy>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, title, type, amount, model, periodic_expr,
                   condition, status, max_exec_per_user, create_time, update_time
            FROM quota_strategy
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(strategy_from_row).transpose()
    }

    async fn list(&self, enabled_only: bool) -> TallyResult<Vec<QuotaStrategy>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, title, type, amount, model, periodic_expr,
                   condition, status, max_exec_per_user, create_time, update_time
            FROM quota_strategy
            WHERE ($1 = FALSE OR status = TRUE)
            ORDER BY create_time
            "#,
        )
        .bind(enabled_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(strategy_from_row).collect()
    }

    async fn insert_execution(&self, record: &ExecutionRecord) -> TallyResult<()> {
        sqlx::query(
            r#"
            INSERT INTO quota_execute (
                id, strategy_id, user_id, batch_number, status,
                expiry_date, create_time, update_time
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.strategy_id)
        .bind(record.user_id.as_uuid())
        .bind(&record.batch_number)
        .bind(record.status.as_db_str())
        .bind(record.expiry_date)
        .bind(record.create_time)
        .bind(record.update_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        expiry_date: Option<DateTime<Utc>>,
    ) -> TallyResult<()> {
        sqlx::query(
            r#"
            UPDATE quota_execute
            SET status = $2, expiry_date = $3, update_time = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_db_str())
        .bind(expiry_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn completed_count(&self, strategy_id: Uuid, user: UserId) -> TallyResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM quota_execute
            WHERE strategy_id = $1 AND user_id = $2 AND status = 'completed'
            "#,
        )
        .bind(strategy_id)
        .bind(user.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("count"))
    }

    async fn completed_in_batch(
        &self,
        strategy_id: Uuid,
        user: UserId,
        batch_number: &str,
    ) -> TallyResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM quota_execute
                WHERE strategy_id = $1 AND user_id = $2
                  AND batch_number = $3 AND status = 'completed'
            ) AS present
            "#,
        )
        .bind(strategy_id)
        .bind(user.as_uuid())
        .bind(batch_number)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("present"))
    }

    async fn any_completed_in_batch(
        &self,
        strategy_id: Uuid,
        batch_number: &str,
    ) -> TallyResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM quota_execute
                WHERE strategy_id = $1 AND batch_number = $2 AND status = 'completed'
            ) AS present
            "#,
        )
        .bind(strategy_id)
        .bind(batch_number)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("present"))
    }

    async fn executions_for_strategy(
        &self,
        strategy_id: Uuid,
        limit: i64,
    ) -> TallyResult<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, strategy_id, user_id, batch_number, status,
                   expiry_date, create_time, update_time
            FROM quota_execute
            WHERE strategy_id = $1
            ORDER BY create_time DESC
            LIMIT $2
            "#,
        )
        .bind(strategy_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_from_row).collect()
    }
}
