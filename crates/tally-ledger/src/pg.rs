//! PostgreSQL ledger implementation.
//!
//! Uses runtime SQL queries to avoid requiring DATABASE_URL at compile
//! time. Every multi-row mutation runs inside one transaction with
//! explicit `SELECT … FOR UPDATE` row locks; quota rows are locked in
//! ascending `(user_id, expiry_date)` order. The gateway mirror call is
//! the last step before commit, so a gateway failure rolls the whole
//! operation back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use tally_common::{TallyError, TallyResult, UserId};
use tally_gateway::Gateway;

use crate::store::{credit_message, plan_transfer_in, QuotaLedger, TransferInPlan};
use crate::types::{
    earliest_expiry, plan_transfer_out_debits, strategy_expiry_now, validate_transfer_out,
    AuditEntry, AuditOperation, ExpireSummary, GiverInfo, QuotaRecord, QuotaStatus,
    TransferInOutcome, TransferInStatus, TransferItem, TransferOutReceipt, TransferOutRequest,
    UserQuota, VoucherRedemption,
};
use crate::voucher::{VoucherCodec, VoucherData};

/// Ledger backed by PostgreSQL.
pub struct PgLedger<G> {
    pool: PgPool,
    gateway: Arc<G>,
    codec: VoucherCodec,
}

impl<G> PgLedger<G> {
    /// Create a ledger over the given pool, gateway, and voucher codec.
    pub fn new(pool: PgPool, gateway: Arc<G>, codec: VoucherCodec) -> Self {
        Self {
            pool,
            gateway,
            codec,
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> TallyResult<QuotaRecord> {
    let status_str: String = row.get("status");
    let status = QuotaStatus::from_db_str(&status_str)
        .ok_or_else(|| TallyError::Database(format!("unknown quota status: {status_str}")))?;
    Ok(QuotaRecord {
        id: row.get("id"),
        user_id: UserId::from_uuid(row.get::<Uuid, _>("user_id")),
        amount: row.get("amount"),
        expiry_date: row.get("expiry_date"),
        status,
        create_time: row.get("create_time"),
        update_time: row.get("update_time"),
    })
}

async fn insert_audit(
    tx: &mut Transaction<'_, Postgres>,
    entry: &AuditEntry,
) -> TallyResult<()> {
    sqlx::query(
        r#"
        INSERT INTO quota_audit (
            id, user_id, operation, amount, expiry_date,
            strategy_name, voucher_code, create_time
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.id)
    .bind(entry.user_id.as_uuid())
    .bind(entry.operation.as_db_str())
    .bind(entry.amount)
    .bind(entry.expiry_date)
    .bind(&entry.strategy_name)
    .bind(&entry.voucher_code)
    .bind(entry.create_time)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Lock a user's VALID records in ascending `(user_id, expiry_date)`
/// order and return them.
async fn lock_valid_records(
    tx: &mut Transaction<'_, Postgres>,
    user: UserId,
) -> TallyResult<Vec<QuotaRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, amount, expiry_date, status, create_time, update_time
        FROM quota
        WHERE user_id = $1 AND status = 'VALID'
        ORDER BY user_id, expiry_date
        FOR UPDATE
        "#,
    )
    .bind(user.as_uuid())
    .fetch_all(&mut **tx)
    .await?;

    rows.iter().map(record_from_row).collect()
}

impl<G: Gateway + Send + Sync> QuotaLedger for PgLedger<G> {
    #[instrument(name = "ledger.add_quota_for_strategy", skip(self))]
    async fn add_quota_for_strategy(
        &self,
        user: UserId,
        amount: i64,
        strategy_name: &str,
    ) -> TallyResult<DateTime<Utc>> {
        if amount <= 0 {
            return Err(TallyError::InvalidInput(
                "recharge amount must be positive".to_string(),
            ));
        }

        let record = QuotaRecord::new(user, amount, strategy_expiry_now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO quota (id, user_id, amount, expiry_date, status, create_time, update_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id.as_uuid())
        .bind(record.amount)
        .bind(record.expiry_date)
        .bind(record.status.as_db_str())
        .bind(record.create_time)
        .bind(record.update_time)
        .execute(&mut *tx)
        .await?;

        let audit = AuditEntry::new(user, AuditOperation::Recharge, amount, record.expiry_date)
            .with_strategy(strategy_name);
        insert_audit(&mut tx, &audit).await?;

        // Mirror last; a gateway failure drops the transaction.
        self.gateway.delta_quota(user, amount).await?;
        tx.commit().await?;

        debug!(%user, amount, expiry = %record.expiry_date, strategy = strategy_name, "recharged quota");
        Ok(record.expiry_date)
    }

    #[instrument(name = "ledger.transfer_out", skip(self, giver, request))]
    async fn transfer_out(
        &self,
        giver: &GiverInfo,
        request: &TransferOutRequest,
    ) -> TallyResult<TransferOutReceipt> {
        let now = Utc::now();
        let receiver = validate_transfer_out(request, now)?;

        let mut tx = self.pool.begin().await?;
        let records = lock_valid_records(&mut tx, giver.id).await?;
        let used = self.gateway.query_used_quota(giver.id).await?;
        let debits = plan_transfer_out_debits(&records, used, &request.items)?;

        for (record_id, debit) in &debits {
            sqlx::query(
                r#"
                UPDATE quota SET amount = amount - $2, update_time = $3 WHERE id = $1
                "#,
            )
            .bind(record_id)
            .bind(debit)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let total: i64 = request.items.iter().map(|i| i.amount).sum();
        let earliest = earliest_expiry(&request.items)?;
        let voucher_code = self.codec.encode(&VoucherData {
            giver_id: giver.id,
            giver_name: giver.name.clone(),
            giver_phone: giver.phone.clone(),
            giver_github: giver.github.clone(),
            receiver_id: receiver,
            items: request.items.clone(),
        })?;

        let audit = AuditEntry::new(giver.id, AuditOperation::TransferOut, -total, earliest)
            .with_voucher(voucher_code.clone());
        insert_audit(&mut tx, &audit).await?;

        self.gateway.delta_quota(giver.id, -total).await?;
        tx.commit().await?;

        Ok(TransferOutReceipt {
            voucher_code,
            amount: total,
            earliest_expiry: earliest,
        })
    }

    #[instrument(name = "ledger.transfer_in", skip(self, voucher_code))]
    async fn transfer_in(
        &self,
        receiver: UserId,
        voucher_code: &str,
    ) -> TallyResult<TransferInOutcome> {
        let now = Utc::now();
        let (mut items, expired) =
            match plan_transfer_in(&self.codec, receiver, voucher_code, now) {
                TransferInPlan::Reject(outcome) => return Ok(outcome),
                TransferInPlan::Credit { items, expired } => (items, expired),
            };
        // Lock and credit in ascending expiry order.
        items.sort_by_key(|item| item.expiry_date);
        let total: i64 = items.iter().map(|i| i.amount).sum();
        let earliest = earliest_expiry(&items)?;

        let mut tx = self.pool.begin().await?;

        let already = sqlx::query(
            r#"SELECT voucher_code FROM voucher_redemption WHERE voucher_code = $1 FOR UPDATE"#,
        )
        .bind(voucher_code)
        .fetch_optional(&mut *tx)
        .await?;
        if already.is_some() {
            return Ok(TransferInOutcome::already_redeemed());
        }

        for item in &items {
            let existing = sqlx::query(
                r#"
                SELECT id FROM quota
                WHERE user_id = $1 AND status = 'VALID' AND expiry_date = $2
                ORDER BY user_id, expiry_date
                FOR UPDATE
                "#,
            )
            .bind(receiver.as_uuid())
            .bind(item.expiry_date)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(row) => {
                    sqlx::query(
                        r#"UPDATE quota SET amount = amount + $2, update_time = $3 WHERE id = $1"#,
                    )
                    .bind(row.get::<Uuid, _>("id"))
                    .bind(item.amount)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    let record = QuotaRecord::new(receiver, item.amount, item.expiry_date);
                    sqlx::query(
                        r#"
                        INSERT INTO quota (id, user_id, amount, expiry_date, status, create_time, update_time)
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        "#,
                    )
                    .bind(record.id)
                    .bind(record.user_id.as_uuid())
                    .bind(record.amount)
                    .bind(record.expiry_date)
                    .bind(record.status.as_db_str())
                    .bind(record.create_time)
                    .bind(record.update_time)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        let audit = AuditEntry::new(receiver, AuditOperation::TransferIn, total, earliest)
            .with_voucher(voucher_code.to_string());
        insert_audit(&mut tx, &audit).await?;

        // Redemption row is the last write: a concurrent attempt either
        // blocks here until this transaction commits and then sees the
        // unique violation, or commits first and we see it.
        let inserted = sqlx::query(
            r#"
            INSERT INTO voucher_redemption (voucher_code, user_id, amount, create_time)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(voucher_code)
        .bind(receiver.as_uuid())
        .bind(total)
        .bind(now)
        .execute(&mut *tx)
        .await;
        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                warn!(%receiver, "voucher redeemed concurrently");
                return Ok(TransferInOutcome::already_redeemed());
            }
            return Err(err.into());
        }

        self.gateway.delta_quota(receiver, total).await?;
        tx.commit().await?;

        let status = if expired == 0 {
            TransferInStatus::Success
        } else {
            TransferInStatus::PartialSuccess
        };
        Ok(TransferInOutcome {
            status,
            message: credit_message(expired),
            amount: total,
            items,
        })
    }

    #[instrument(name = "ledger.delta_used_quota", skip(self))]
    async fn delta_used_quota(&self, user: UserId, delta: i64) -> TallyResult<()> {
        if delta < 0 {
            return Err(TallyError::InvalidInput(
                "usage delta must be non-negative".to_string(),
            ));
        }
        self.gateway.delta_used_quota(user, delta).await?;

        let entry = AuditEntry::new(
            user,
            AuditOperation::Consume,
            -delta,
            tally_common::truncate_to_seconds(Utc::now()),
        );
        sqlx::query(
            r#"
            INSERT INTO quota_audit (
                id, user_id, operation, amount, expiry_date,
                strategy_name, voucher_code, create_time
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id.as_uuid())
        .bind(entry.operation.as_db_str())
        .bind(entry.amount)
        .bind(entry.expiry_date)
        .bind(&entry.strategy_name)
        .bind(&entry.voucher_code)
        .bind(entry.create_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(name = "ledger.get_user_quota", skip(self))]
    async fn get_user_quota(&self, user: UserId) -> TallyResult<UserQuota> {
        let rows = sqlx::query(
            r#"
            SELECT amount, expiry_date FROM quota
            WHERE user_id = $1 AND status = 'VALID'
            ORDER BY expiry_date
            "#,
        )
        .bind(user.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let records: Vec<TransferItem> = rows
            .iter()
            .map(|row| TransferItem::new(row.get("amount"), row.get("expiry_date")))
            .collect();
        let used_quota = self.gateway.query_used_quota(user).await?;

        Ok(UserQuota {
            total_quota: records.iter().map(|r| r.amount).sum(),
            used_quota,
            records,
        })
    }

    #[instrument(name = "ledger.expire_quotas", skip(self))]
    async fn expire_quotas(&self) -> TallyResult<ExpireSummary> {
        let candidates = sqlx::query(
            r#"
            SELECT id, user_id, amount, expiry_date FROM quota
            WHERE status = 'VALID' AND expiry_date <= NOW()
            ORDER BY user_id, expiry_date
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = ExpireSummary::default();
        for row in candidates {
            let id: Uuid = row.get("id");
            let user = UserId::from_uuid(row.get::<Uuid, _>("user_id"));
            let amount: i64 = row.get("amount");
            let expiry: DateTime<Utc> = row.get("expiry_date");

            let mut tx = self.pool.begin().await?;
            // Conditional flip keeps concurrent sweeps from double-deducting.
            let flipped = sqlx::query(
                r#"
                UPDATE quota SET status = 'EXPIRED', update_time = NOW()
                WHERE id = $1 AND status = 'VALID'
                "#,
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
            if flipped.rows_affected() == 0 {
                continue;
            }

            let audit = AuditEntry::new(user, AuditOperation::Expire, -amount, expiry);
            insert_audit(&mut tx, &audit).await?;
            self.gateway.delta_quota(user, -amount).await?;
            tx.commit().await?;

            summary.expired_records += 1;
            summary.expired_amount += amount;
        }

        if summary.expired_records > 0 {
            debug!(
                records = summary.expired_records,
                amount = summary.expired_amount,
                "expiry sweep complete"
            );
        }
        Ok(summary)
    }

    async fn audit_for_user(&self, user: UserId, limit: i64) -> TallyResult<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, operation, amount, expiry_date,
                   strategy_name, voucher_code, create_time
            FROM quota_audit
            WHERE user_id = $1
            ORDER BY create_time DESC
            LIMIT $2
            "#,
        )
        .bind(user.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let operation_str: String = row.get("operation");
                let operation = AuditOperation::from_db_str(&operation_str).ok_or_else(|| {
                    TallyError::Database(format!("unknown audit operation: {operation_str}"))
                })?;
                Ok(AuditEntry {
                    id: row.get("id"),
                    user_id: UserId::from_uuid(row.get::<Uuid, _>("user_id")),
                    operation,
                    amount: row.get("amount"),
                    expiry_date: row.get("expiry_date"),
                    strategy_name: row.get("strategy_name"),
                    voucher_code: row.get("voucher_code"),
                    create_time: row.get("create_time"),
                })
            })
            .collect()
    }

    async fn find_redemption(
        &self,
        voucher_code: &str,
    ) -> TallyResult<Option<VoucherRedemption>> {
        let row = sqlx::query(
            r#"
            SELECT voucher_code, user_id, amount, create_time
            FROM voucher_redemption
            WHERE voucher_code = $1
            "#,
        )
        .bind(voucher_code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| VoucherRedemption {
            voucher_code: row.get("voucher_code"),
            user_id: UserId::from_uuid(row.get::<Uuid, _>("user_id")),
            amount: row.get("amount"),
            create_time: row.get("create_time"),
        }))
    }
}
