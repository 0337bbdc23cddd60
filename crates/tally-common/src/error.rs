//! Error types for the Tally quota layer.

use thiserror::Error;

/// Result type alias for Tally operations.
pub type TallyResult<T> = Result<T, TallyError>;

/// Unified error type for all Tally operations.
#[derive(Error, Debug)]
pub enum TallyError {
    // ─────────────────────────────────────────────────────────────────────────
    // Input Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid condition expression: {0}")]
    InvalidCondition(String),

    #[error("Invalid periodic expression: {0}")]
    InvalidPeriodicExpr(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Ledger Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Quota not found for expiry {expiry}")]
    QuotaNotFound { expiry: String },

    #[error("Insufficient available quota: requested {requested}, available {available}")]
    InsufficientQuota { requested: i64, available: i64 },

    // ─────────────────────────────────────────────────────────────────────────
    // Voucher Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Invalid voucher")]
    VoucherInvalid,

    #[error("Voucher is not addressed to this user")]
    VoucherMismatch,

    #[error("All voucher items have expired")]
    VoucherExpired,

    #[error("Voucher has already been redeemed")]
    AlreadyRedeemed,

    // ─────────────────────────────────────────────────────────────────────────
    // Strategy Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),

    #[error("Condition evaluation failed: {0}")]
    EvalError(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Permission Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Employee not found: {0}")]
    EmployeeNotFound(String),

    #[error("Department not found: {0}")]
    DepartmentNotFound(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Gateway Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Gateway transient failure: {0}")]
    GatewayTransient(String),

    #[error("Gateway permanent failure: {0}")]
    GatewayPermanent(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Infrastructure Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TallyError {
    /// Whether a retry in a later tick may succeed.
    ///
    /// Permanent gateway failures and parse-level errors are not retried
    /// within the same tick; transient failures roll the enclosing
    /// transaction back and surface to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TallyError::GatewayTransient(_) | TallyError::Database(_)
        )
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for TallyError {
    fn from(err: sqlx::Error) -> Self {
        TallyError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TallyError::InsufficientQuota {
            requested: 90,
            available: 80,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient available quota: requested 90, available 80"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(TallyError::GatewayTransient("503".into()).is_transient());
        assert!(!TallyError::GatewayPermanent("403".into()).is_transient());
        assert!(!TallyError::VoucherInvalid.is_transient());
    }
}
