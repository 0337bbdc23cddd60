//! # tally-ledger
//!
//! Per-user expirable quota ledger with transfer semantics.
//!
//! Each user holds an ordered set of quota records: undivided credit
//! pools that expire atomically at their expiry. The ledger supports
//! strategy recharges, voucher-based transfers between users,
//! consumption mirroring, and the expiry sweep. Every mutation is
//! mirrored to the AI gateway and logged in the append-only audit.

pub mod memory;
pub mod pg;
pub mod store;
pub mod sweep;
pub mod types;
pub mod voucher;

pub use memory::MemoryLedger;
pub use pg::PgLedger;
pub use store::QuotaLedger;
pub use sweep::run_expiry_sweep;
pub use types::{
    available_amounts, earliest_expiry, strategy_expiry_at, strategy_expiry_now, AuditEntry,
    AuditOperation, ExpireSummary, GiverInfo, QuotaRecord, QuotaStatus, TransferInOutcome,
    TransferInStatus, TransferItem, TransferOutReceipt, TransferOutRequest, UserQuota,
    VoucherRedemption,
};
pub use voucher::{VoucherCodec, VoucherData};
