//! # tally-gateway
//!
//! Adapter for the external AI gateway: an idempotent key/value surface
//! holding per-user quota totals, usage counters, and per-employee model
//! allow-lists.
//!
//! The gateway enforces quota at inference time; Tally maintains the
//! ledger of allowances and mirrors every ledger mutation here.

pub mod client;
pub mod memory;

use tally_common::{EmployeeNumber, TallyResult, UserId};

/// Operations exposed by the AI gateway. All are idempotent on the
/// gateway side except usage deltas, which are monotone counters.
#[trait_variant::make(Gateway: Send)]
pub trait LocalGateway {
    /// Set a user's quota total to an absolute value.
    async fn set_quota(&self, user: UserId, value: i64) -> TallyResult<()>;

    /// Apply a signed delta to a user's quota total.
    async fn delta_quota(&self, user: UserId, delta: i64) -> TallyResult<()>;

    /// Read a user's current quota total.
    async fn query_quota_value(&self, user: UserId) -> TallyResult<i64>;

    /// Apply a non-negative delta to a user's usage counter.
    async fn delta_used_quota(&self, user: UserId, delta: i64) -> TallyResult<()>;

    /// Read a user's current usage counter.
    async fn query_used_quota(&self, user: UserId) -> TallyResult<i64>;

    /// Replace an employee's model allow-list.
    async fn set_models(&self, employee: &EmployeeNumber, models: &[String]) -> TallyResult<()>;

    /// Replace an employee's star-check flag.
    async fn set_star_check(&self, employee: &EmployeeNumber, enabled: bool) -> TallyResult<()>;

    /// Replace an employee's quota-check flag.
    async fn set_quota_check(&self, employee: &EmployeeNumber, enabled: bool) -> TallyResult<()>;
}

pub use client::HttpGateway;
pub use memory::MemoryGateway;
