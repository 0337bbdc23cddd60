//! In-memory ledger implementation.
//!
//! Mirrors the Postgres ledger's observable semantics for unit and
//! integration tests. Atomicity is approximated by planning under the
//! lock and mirroring to the gateway before applying state, so an
//! injected gateway failure leaves the ledger untouched; real row-level
//! locking lives in [`PgLedger`](crate::pg::PgLedger).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use tally_common::{truncate_to_seconds, TallyError, TallyResult, UserId};
use tally_gateway::Gateway;

use crate::store::{credit_message, plan_transfer_in, QuotaLedger, TransferInPlan};
use crate::types::{
    earliest_expiry, plan_transfer_out_debits, strategy_expiry_now, validate_transfer_out,
    AuditEntry, AuditOperation, ExpireSummary, GiverInfo, QuotaRecord, QuotaStatus,
    TransferInOutcome, TransferInStatus, TransferItem, TransferOutReceipt, TransferOutRequest,
    UserQuota, VoucherRedemption,
};
use crate::voucher::{VoucherCodec, VoucherData};

#[derive(Default)]
struct State {
    records: Vec<QuotaRecord>,
    audits: Vec<AuditEntry>,
    redemptions: HashMap<String, VoucherRedemption>,
}

/// Ledger backed by process memory.
pub struct MemoryLedger<G> {
    gateway: Arc<G>,
    codec: VoucherCodec,
    state: RwLock<State>,
}

impl<G> MemoryLedger<G> {
    /// Create an empty ledger over the given gateway and voucher codec.
    pub fn new(gateway: Arc<G>, codec: VoucherCodec) -> Self {
        Self {
            gateway,
            codec,
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Valid records of a user, sorted by expiry ascending.
    fn valid_records(&self, user: UserId) -> Vec<QuotaRecord> {
        let state = self.read();
        let mut records: Vec<QuotaRecord> = state
            .records
            .iter()
            .filter(|r| r.user_id == user && r.status == QuotaStatus::Valid)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.expiry_date);
        records
    }
}

impl<G: Gateway + Send + Sync> QuotaLedger for MemoryLedger<G> {
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

        let expiry = strategy_expiry_now();
        self.gateway.delta_quota(user, amount).await?;

        let mut state = self.write();
        state.records.push(QuotaRecord::new(user, amount, expiry));
        state.audits.push(
            AuditEntry::new(user, AuditOperation::Recharge, amount, expiry)
                .with_strategy(strategy_name),
        );
        debug!(%user, amount, %expiry, strategy = strategy_name, "recharged quota");
        Ok(expiry)
    }

    #[instrument(name = "ledger.transfer_out", skip(self, giver, request))]
    async fn transfer_out(
        &self,
        giver: &GiverInfo,
        request: &TransferOutRequest,
    ) -> TallyResult<TransferOutReceipt> {
        let now = Utc::now();
        let receiver = validate_transfer_out(request, now)?;
        let used = self.gateway.query_used_quota(giver.id).await?;

        // Plan debits against the gateway's earliest-expiry-first usage.
        let records = self.valid_records(giver.id);
        let debits = plan_transfer_out_debits(&records, used, &request.items)?;

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

        self.gateway.delta_quota(giver.id, -total).await?;

        let mut state = self.write();
        for (id, debit) in &debits {
            if let Some(record) = state.records.iter_mut().find(|r| r.id == *id) {
                record.amount -= debit;
                record.update_time = now;
            }
        }
        state.audits.push(
            AuditEntry::new(giver.id, AuditOperation::TransferOut, -total, earliest)
                .with_voucher(voucher_code.clone()),
        );

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
        let (items, expired) =
            match plan_transfer_in(&self.codec, receiver, voucher_code, now) {
                TransferInPlan::Reject(outcome) => return Ok(outcome),
                TransferInPlan::Credit { items, expired, .. } => (items, expired),
            };
        let total: i64 = items.iter().map(|i| i.amount).sum();

        // Claim the redemption first so a concurrent attempt observes it.
        {
            let mut state = self.write();
            if state.redemptions.contains_key(voucher_code) {
                return Ok(TransferInOutcome::already_redeemed());
            }
            state.redemptions.insert(
                voucher_code.to_string(),
                VoucherRedemption {
                    voucher_code: voucher_code.to_string(),
                    user_id: receiver,
                    amount: total,
                    create_time: now,
                },
            );
        }

        if let Err(err) = self.gateway.delta_quota(receiver, total).await {
            self.write().redemptions.remove(voucher_code);
            return Err(err);
        }

        let earliest = earliest_expiry(&items)?;
        let mut state = self.write();
        for item in &items {
            let existing = state.records.iter_mut().find(|r| {
                r.user_id == receiver
                    && r.status == QuotaStatus::Valid
                    && r.expiry_date == item.expiry_date
            });
            match existing {
                Some(record) => {
                    record.amount += item.amount;
                    record.update_time = now;
                }
                None => state
                    .records
                    .push(QuotaRecord::new(receiver, item.amount, item.expiry_date)),
            }
        }
        state.audits.push(
            AuditEntry::new(receiver, AuditOperation::TransferIn, total, earliest)
                .with_voucher(voucher_code.to_string()),
        );

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

        let now = truncate_to_seconds(Utc::now());
        self.write()
            .audits
            .push(AuditEntry::new(user, AuditOperation::Consume, -delta, now));
        Ok(())
    }

    #[instrument(name = "ledger.get_user_quota", skip(self))]
    async fn get_user_quota(&self, user: UserId) -> TallyResult<UserQuota> {
        let used_quota = self.gateway.query_used_quota(user).await?;
        let records = self.valid_records(user);
        Ok(UserQuota {
            total_quota: records.iter().map(|r| r.amount).sum(),
            used_quota,
            records: records
                .iter()
                .map(|r| TransferItem::new(r.amount, r.expiry_date))
                .collect(),
        })
    }

    #[instrument(name = "ledger.expire_quotas", skip(self))]
    async fn expire_quotas(&self) -> TallyResult<ExpireSummary> {
        let now = truncate_to_seconds(Utc::now());
        let candidates: Vec<(Uuid, UserId, i64, DateTime<Utc>)> = self
            .read()
            .records
            .iter()
            .filter(|r| r.status == QuotaStatus::Valid && r.expiry_date <= now)
            .map(|r| (r.id, r.user_id, r.amount, r.expiry_date))
            .collect();

        let mut summary = ExpireSummary::default();
        for (id, user, amount, expiry) in candidates {
            // Conditional flip keeps the sweep idempotent under races.
            let flipped = {
                let mut state = self.write();
                match state
                    .records
                    .iter_mut()
                    .find(|r| r.id == id && r.status == QuotaStatus::Valid)
                {
                    Some(record) => {
                        record.status = QuotaStatus::Expired;
                        record.update_time = Utc::now();
                        true
                    }
                    None => false,
                }
            };
            if !flipped {
                continue;
            }

            if let Err(err) = self.gateway.delta_quota(user, -amount).await {
                let mut state = self.write();
                if let Some(record) = state.records.iter_mut().find(|r| r.id == id) {
                    record.status = QuotaStatus::Valid;
                }
                return Err(err);
            }

            self.write()
                .audits
                .push(AuditEntry::new(user, AuditOperation::Expire, -amount, expiry));
            summary.expired_records += 1;
            summary.expired_amount += amount;
        }
        Ok(summary)
    }

    async fn audit_for_user(&self, user: UserId, limit: i64) -> TallyResult<Vec<AuditEntry>> {
        let state = self.read();
        let mut entries: Vec<AuditEntry> = state
            .audits
            .iter()
            .filter(|a| a.user_id == user)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.create_time.cmp(&a.create_time));
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn find_redemption(
        &self,
        voucher_code: &str,
    ) -> TallyResult<Option<VoucherRedemption>> {
        Ok(self.read().redemptions.get(voucher_code).cloned())
    }
}
