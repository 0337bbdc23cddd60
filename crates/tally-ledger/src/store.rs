//! The quota ledger operation surface.
//!
//! The ledger is the collection of per-user quota records, the audit log,
//! and the gateway mirror, treated as one transactional object. Two
//! implementations exist: [`PgLedger`](crate::pg::PgLedger) for
//! production and [`MemoryLedger`](crate::memory::MemoryLedger) for
//! tests.

use chrono::{DateTime, Utc};

use tally_common::{truncate_to_seconds, TallyError, TallyResult, UserId};

use crate::types::{
    AuditEntry, ExpireSummary, GiverInfo, TransferInOutcome, TransferItem, TransferOutReceipt,
    TransferOutRequest, UserQuota, VoucherRedemption,
};
use crate::voucher::VoucherCodec;

/// Public ledger operations. All mutations are transactional: either the
/// record updates, the audit row, and the gateway mirror all apply, or
/// none do.
#[trait_variant::make(QuotaLedger: Send)]
pub trait LocalQuotaLedger {
    /// Credit `amount` to `user` on behalf of a recharge strategy.
    ///
    /// Returns the expiry assigned to the new record: the last day of the
    /// current month (23:59:59 server-local), rolled to the end of next
    /// month when fewer than 30 days remain.
    async fn add_quota_for_strategy(
        &self,
        user: UserId,
        amount: i64,
        strategy_name: &str,
    ) -> TallyResult<DateTime<Utc>>;

    /// Debit the giver's records and emit a signed voucher for the
    /// receiver. Items apply all-or-nothing.
    async fn transfer_out(
        &self,
        giver: &GiverInfo,
        request: &TransferOutRequest,
    ) -> TallyResult<TransferOutReceipt>;

    /// Redeem a voucher for the authenticated receiver. Validation
    /// failures are reported in the outcome status, not as errors.
    async fn transfer_in(
        &self,
        receiver: UserId,
        voucher_code: &str,
    ) -> TallyResult<TransferInOutcome>;

    /// Forward a usage delta to the gateway and record a CONSUME audit
    /// row. Usage is a monotone counter at the gateway; idempotence is
    /// not required here.
    async fn delta_used_quota(&self, user: UserId, delta: i64) -> TallyResult<()>;

    /// Current totals plus the VALID record breakdown, expiry ascending.
    async fn get_user_quota(&self, user: UserId) -> TallyResult<UserQuota>;

    /// Flip overdue VALID records to EXPIRED and mirror the deduction.
    /// Idempotent; safe to run concurrently with itself.
    async fn expire_quotas(&self) -> TallyResult<ExpireSummary>;

    /// Most recent audit entries for a user, newest first.
    async fn audit_for_user(&self, user: UserId, limit: i64) -> TallyResult<Vec<AuditEntry>>;

    /// Look up a redemption marker by voucher code.
    async fn find_redemption(&self, voucher_code: &str)
        -> TallyResult<Option<VoucherRedemption>>;
}

/// Pre-store phase of a transfer-in, shared by both implementations.
#[derive(Debug)]
pub(crate) enum TransferInPlan {
    /// The attempt is rejected before touching any state.
    Reject(TransferInOutcome),
    /// Credit the listed items; `expired` counts the items dropped at
    /// redemption time.
    Credit {
        items: Vec<TransferItem>,
        expired: usize,
    },
}

/// Decode and validate a voucher against the authenticated receiver,
/// dropping items already expired at `now`.
pub(crate) fn plan_transfer_in(
    codec: &VoucherCodec,
    receiver: UserId,
    voucher_code: &str,
    now: DateTime<Utc>,
) -> TransferInPlan {
    let voucher = match codec.decode(voucher_code) {
        Ok(voucher) => voucher,
        Err(TallyError::VoucherInvalid) => {
            return TransferInPlan::Reject(TransferInOutcome::failed("invalid voucher"));
        }
        Err(other) => {
            return TransferInPlan::Reject(TransferInOutcome::failed(other.to_string()));
        }
    };

    if voucher.receiver_id != receiver {
        return TransferInPlan::Reject(TransferInOutcome::failed(
            "voucher is not addressed to this user",
        ));
    }

    let now = truncate_to_seconds(now);
    let (valid, expired): (Vec<TransferItem>, Vec<TransferItem>) = voucher
        .items
        .iter()
        .copied()
        .partition(|item| item.expiry_date > now);

    if valid.is_empty() {
        return TransferInPlan::Reject(TransferInOutcome::failed(
            "all transferred quota items have expired",
        ));
    }

    TransferInPlan::Credit {
        expired: expired.len(),
        items: valid,
    }
}

/// Diagnostic message for a (partially) credited transfer-in.
pub(crate) fn credit_message(expired: usize) -> String {
    if expired == 0 {
        "all items credited".to_string()
    } else {
        format!("{expired} expired item(s) were skipped")
    }
}
