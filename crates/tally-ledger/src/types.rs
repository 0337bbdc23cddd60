//! Ledger record and audit types, plus the pure expiry arithmetic shared
//! by the Postgres and in-memory stores.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tally_common::{truncate_to_seconds, TallyError, TallyResult, UserId};

// ─────────────────────────────────────────────────────────────────────────────
// Quota Records
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of a quota record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuotaStatus {
    /// The credit pool is live and counts toward the user's total.
    Valid,
    /// The pool expired; flipped exactly once by the sweep.
    Expired,
}

impl QuotaStatus {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            QuotaStatus::Valid => "VALID",
            QuotaStatus::Expired => "EXPIRED",
        }
    }

    /// Parse from database string.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "VALID" => Some(QuotaStatus::Valid),
            "EXPIRED" => Some(QuotaStatus::Expired),
            _ => None,
        }
    }
}

/// A per-user credit pool that expires atomically at its expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Surrogate id.
    pub id: Uuid,

    /// Owner.
    pub user_id: UserId,

    /// Remaining amount in the pool. Never negative.
    pub amount: i64,

    /// Expiry, second precision.
    pub expiry_date: DateTime<Utc>,

    /// Current status.
    pub status: QuotaStatus,

    /// Creation timestamp.
    pub create_time: DateTime<Utc>,

    /// Last update timestamp.
    pub update_time: DateTime<Utc>,
}

impl QuotaRecord {
    /// Create a fresh VALID record. The expiry is truncated to seconds.
    pub fn new(user_id: UserId, amount: i64, expiry_date: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            user_id,
            amount,
            expiry_date: truncate_to_seconds(expiry_date),
            status: QuotaStatus::Valid,
            create_time: now,
            update_time: now,
        }
    }

    /// Whether this record has passed its expiry at `now`.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date <= truncate_to_seconds(now)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Audit Log
// ─────────────────────────────────────────────────────────────────────────────

/// Ledger mutation kinds recorded in the append-only audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOperation {
    Recharge,
    TransferIn,
    TransferOut,
    Consume,
    Expire,
}

impl AuditOperation {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            AuditOperation::Recharge => "RECHARGE",
            AuditOperation::TransferIn => "TRANSFER_IN",
            AuditOperation::TransferOut => "TRANSFER_OUT",
            AuditOperation::Consume => "CONSUME",
            AuditOperation::Expire => "EXPIRE",
        }
    }

    /// Parse from database string.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "RECHARGE" => Some(AuditOperation::Recharge),
            "TRANSFER_IN" => Some(AuditOperation::TransferIn),
            "TRANSFER_OUT" => Some(AuditOperation::TransferOut),
            "CONSUME" => Some(AuditOperation::Consume),
            "EXPIRE" => Some(AuditOperation::Expire),
            _ => None,
        }
    }
}

/// One row of the append-only ledger audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Surrogate id.
    pub id: Uuid,

    /// User the mutation applied to.
    pub user_id: UserId,

    /// Mutation kind.
    pub operation: AuditOperation,

    /// Signed amount: positive for credits, negative for debits.
    pub amount: i64,

    /// Expiry recorded for the operation. For transfers, the earliest
    /// expiry among the (credited) items.
    pub expiry_date: DateTime<Utc>,

    /// Strategy name, present iff operation is RECHARGE.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_name: Option<String>,

    /// Related voucher, when the mutation came from a transfer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voucher_code: Option<String>,

    /// When the mutation happened.
    pub create_time: DateTime<Utc>,
}

impl AuditEntry {
    /// Create an audit entry stamped now.
    pub fn new(
        user_id: UserId,
        operation: AuditOperation,
        amount: i64,
        expiry_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            operation,
            amount,
            expiry_date: truncate_to_seconds(expiry_date),
            strategy_name: None,
            voucher_code: None,
            create_time: Utc::now(),
        }
    }

    /// Attach the originating strategy name.
    pub fn with_strategy(mut self, strategy_name: impl Into<String>) -> Self {
        self.strategy_name = Some(strategy_name.into());
        self
    }

    /// Attach the related voucher code.
    pub fn with_voucher(mut self, voucher_code: impl Into<String>) -> Self {
        self.voucher_code = Some(voucher_code.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transfers
// ─────────────────────────────────────────────────────────────────────────────

/// One (amount, expiry) slice of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItem {
    /// Amount to move.
    pub amount: i64,

    /// Expiry the amount is bound to, second precision.
    pub expiry_date: DateTime<Utc>,
}

impl TransferItem {
    /// Create an item with the expiry truncated to seconds.
    pub fn new(amount: i64, expiry_date: DateTime<Utc>) -> Self {
        Self {
            amount,
            expiry_date: truncate_to_seconds(expiry_date),
        }
    }
}

/// Giver identity attached to an outbound transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GiverInfo {
    pub id: UserId,
    pub name: String,
    pub phone: String,
    pub github: String,
}

/// Outbound transfer request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutRequest {
    /// Receiver the voucher is addressed to.
    pub receiver_id: Option<UserId>,

    /// Items to move, all-or-nothing.
    pub items: Vec<TransferItem>,
}

/// Result of a successful outbound transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutReceipt {
    /// Opaque voucher handed to the receiver.
    pub voucher_code: String,

    /// Total amount debited.
    pub amount: i64,

    /// Earliest expiry among the items, as recorded in the audit row.
    pub earliest_expiry: DateTime<Utc>,
}

/// Status of an inbound transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferInStatus {
    /// Every item was valid and credited.
    Success,
    /// Some items had expired; the rest were credited.
    PartialSuccess,
    /// The voucher code was redeemed before.
    AlreadyRedeemed,
    /// Invalid voucher, wrong receiver, or nothing left to credit.
    Failed,
}

/// Outcome of an inbound transfer. Validation failures are outcomes, not
/// errors; only transport-level failures surface as `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferInOutcome {
    pub status: TransferInStatus,

    /// Operator-readable diagnostic. Mentions "expired" whenever expired
    /// items were dropped.
    pub message: String,

    /// Total amount credited.
    pub amount: i64,

    /// Items actually credited.
    pub items: Vec<TransferItem>,
}

impl TransferInOutcome {
    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TransferInStatus::Failed,
            message: message.into(),
            amount: 0,
            items: Vec::new(),
        }
    }

    pub(crate) fn already_redeemed() -> Self {
        Self {
            status: TransferInStatus::AlreadyRedeemed,
            message: "voucher has already been redeemed".to_string(),
            amount: 0,
            items: Vec::new(),
        }
    }
}

/// Persisted at-most-once marker for a redeemed voucher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoucherRedemption {
    /// Unique voucher code.
    pub voucher_code: String,

    /// Redeemer.
    pub user_id: UserId,

    /// Amount credited at redemption.
    pub amount: i64,

    /// Redemption timestamp.
    pub create_time: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// User-facing quota view
// ─────────────────────────────────────────────────────────────────────────────

/// Per-user quota summary with the record breakdown transfer surfaces need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuota {
    /// Sum of VALID record amounts.
    pub total_quota: i64,

    /// Usage read from the gateway.
    pub used_quota: i64,

    /// VALID records ordered by expiry ascending.
    pub records: Vec<TransferItem>,
}

/// Summary returned by the expiry sweep.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExpireSummary {
    /// Records flipped VALID → EXPIRED in this run.
    pub expired_records: u64,

    /// Total amount deducted from gateway totals.
    pub expired_amount: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Expiry arithmetic
// ─────────────────────────────────────────────────────────────────────────────

/// Last instant (23:59:59) of the month containing `date`.
fn month_end(date: NaiveDate) -> NaiveDateTime {
    let (next_year, next_month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    // First day of next month is always constructible.
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("first of month")
        .and_hms_opt(0, 0, 0)
        .expect("midnight");
    first_of_next - Duration::seconds(1)
}

/// Expiry assigned to a strategy recharge issued at local time `now`:
/// the last day of the current month at 23:59:59, rolled to the end of
/// the next month when fewer than 30 days remain.
pub fn strategy_expiry_at(now: NaiveDateTime) -> NaiveDateTime {
    let current_end = month_end(now.date());
    if current_end - now < Duration::days(30) {
        month_end(
            current_end
                .date()
                .succ_opt()
                .expect("day after month end"),
        )
    } else {
        current_end
    }
}

/// Expiry for a strategy recharge issued now, in the server's local zone,
/// converted to UTC at second precision.
pub fn strategy_expiry_now() -> DateTime<Utc> {
    let local_now = Local::now().naive_local();
    let expiry = strategy_expiry_at(local_now);
    let localized = Local
        .from_local_datetime(&expiry)
        .earliest()
        .unwrap_or_else(|| Local.from_utc_datetime(&expiry));
    truncate_to_seconds(localized.with_timezone(&Utc))
}

/// Allocate gateway usage to records in ascending expiry order and return
/// the available amount per record.
///
/// The gateway consumes earliest-expiry-first; the ledger mirrors that
/// discipline when deciding how much of a record a transfer may take.
/// `records` must be sorted by expiry ascending.
pub fn available_amounts(records: &[QuotaRecord], used: i64) -> Vec<i64> {
    let mut remaining_used = used.max(0);
    records
        .iter()
        .map(|record| {
            let consumed = remaining_used.min(record.amount);
            remaining_used -= consumed;
            record.amount - consumed
        })
        .collect()
}

/// Plan the per-record debits for an outbound transfer.
///
/// `records` must be the giver's VALID records sorted by expiry
/// ascending; `used` is the gateway's usage counter. Each item must hit a
/// record with exactly its (second-truncated) expiry and enough available
/// amount once earlier-expiring usage is accounted for.
pub fn plan_transfer_out_debits(
    records: &[QuotaRecord],
    used: i64,
    items: &[TransferItem],
) -> TallyResult<Vec<(Uuid, i64)>> {
    let mut available = available_amounts(records, used);
    let mut debits: Vec<(Uuid, i64)> = Vec::new();
    for item in items {
        let index = records
            .iter()
            .position(|r| r.expiry_date == item.expiry_date)
            .ok_or_else(|| TallyError::QuotaNotFound {
                expiry: item.expiry_date.to_rfc3339(),
            })?;
        if available[index] < item.amount {
            return Err(TallyError::InsufficientQuota {
                requested: item.amount,
                available: available[index],
            });
        }
        available[index] -= item.amount;
        match debits.iter_mut().find(|(id, _)| *id == records[index].id) {
            Some((_, debit)) => *debit += item.amount,
            None => debits.push((records[index].id, item.amount)),
        }
    }
    Ok(debits)
}

/// Earliest expiry among a non-empty item list.
pub fn earliest_expiry(items: &[TransferItem]) -> TallyResult<DateTime<Utc>> {
    items
        .iter()
        .map(|item| item.expiry_date)
        .min()
        .ok_or_else(|| TallyError::InvalidInput("transfer item list is empty".to_string()))
}

/// Validate the shape of an outbound transfer request: receiver present,
/// at least one item, positive amounts, no item expiry in the past.
pub fn validate_transfer_out(
    request: &TransferOutRequest,
    now: DateTime<Utc>,
) -> TallyResult<UserId> {
    let receiver = request
        .receiver_id
        .ok_or_else(|| TallyError::InvalidInput("receiver id is empty".to_string()))?;

    if request.items.is_empty() {
        return Err(TallyError::InvalidInput(
            "transfer item list is empty".to_string(),
        ));
    }

    let now = truncate_to_seconds(now);
    for item in &request.items {
        if item.amount <= 0 {
            return Err(TallyError::InvalidInput(
                "transfer amount must be positive".to_string(),
            ));
        }
        if item.expiry_date <= now {
            return Err(TallyError::InvalidInput(format!(
                "item expiry {} is in the past",
                item.expiry_date
            )));
        }
    }

    Ok(receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn naive(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_month_end_regular_and_leap() {
        let feb = month_end(NaiveDate::from_ymd_opt(2024, 2, 10).unwrap());
        assert_eq!(feb, naive(2024, 2, 29, 23, 59, 59));

        let dec = month_end(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
        assert_eq!(dec, naive(2023, 12, 31, 23, 59, 59));
    }

    #[test]
    fn test_strategy_expiry_rolls_when_under_30_days() {
        // 2024-05-15: 16 days remain in May, roll to end of June.
        let expiry = strategy_expiry_at(naive(2024, 5, 15, 12, 0, 0));
        assert_eq!(expiry, naive(2024, 6, 30, 23, 59, 59));
    }

    #[test]
    fn test_strategy_expiry_keeps_month_when_30_days_remain() {
        // 2024-05-01 00:00: 30.99 days remain in May.
        let expiry = strategy_expiry_at(naive(2024, 5, 1, 0, 0, 0));
        assert_eq!(expiry, naive(2024, 5, 31, 23, 59, 59));
    }

    #[test]
    fn test_strategy_expiry_february_always_rolls() {
        // February never has 30 days left.
        let expiry = strategy_expiry_at(naive(2024, 2, 1, 0, 0, 0));
        assert_eq!(expiry, naive(2024, 3, 31, 23, 59, 59));
    }

    #[test]
    fn test_available_amounts_allocates_ascending() {
        let user = UserId::new();
        let records = vec![
            QuotaRecord::new(user, 100, Utc::now() + Duration::days(10)),
            QuotaRecord::new(user, 100, Utc::now() + Duration::days(30)),
        ];

        // 120 used: first record fully consumed, 20 taken from the second.
        let available = available_amounts(&records, 120);
        assert_eq!(available, vec![0, 80]);

        let untouched = available_amounts(&records, 0);
        assert_eq!(untouched, vec![100, 100]);

        let overdrawn = available_amounts(&records, 500);
        assert_eq!(overdrawn, vec![0, 0]);
    }

    #[test]
    fn test_validate_transfer_out_rejects_bad_input() {
        let now = Utc::now();
        let receiver = UserId::new();

        let no_receiver = TransferOutRequest {
            receiver_id: None,
            items: vec![TransferItem::new(10, now + Duration::days(1))],
        };
        assert!(matches!(
            validate_transfer_out(&no_receiver, now),
            Err(TallyError::InvalidInput(_))
        ));

        let past_expiry = TransferOutRequest {
            receiver_id: Some(receiver),
            items: vec![TransferItem::new(10, now - Duration::hours(1))],
        };
        assert!(matches!(
            validate_transfer_out(&past_expiry, now),
            Err(TallyError::InvalidInput(_))
        ));

        let ok = TransferOutRequest {
            receiver_id: Some(receiver),
            items: vec![TransferItem::new(10, now + Duration::days(1))],
        };
        assert_eq!(validate_transfer_out(&ok, now).unwrap(), receiver);
    }

    #[test]
    fn test_earliest_expiry() {
        let now = Utc::now();
        let items = vec![
            TransferItem::new(50, now + Duration::days(45)),
            TransferItem::new(70, now + Duration::days(15)),
        ];
        assert_eq!(
            earliest_expiry(&items).unwrap(),
            truncate_to_seconds(now + Duration::days(15))
        );
        assert!(earliest_expiry(&[]).is_err());
    }

    #[test]
    fn test_status_db_roundtrip() {
        assert_eq!(
            QuotaStatus::from_db_str(QuotaStatus::Valid.as_db_str()),
            Some(QuotaStatus::Valid)
        );
        assert_eq!(QuotaStatus::from_db_str("bogus"), None);
        assert_eq!(
            AuditOperation::from_db_str("TRANSFER_OUT"),
            Some(AuditOperation::TransferOut)
        );
    }
}
