//! # tally-strategy
//!
//! Recharge strategy engine: a condition DSL deciding which users a
//! strategy applies to, batch keys making execution at-most-once per
//! firing, and the periodic scheduler driving both.

pub mod batch;
pub mod condition;
pub mod pg;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod types;

pub use batch::{batch_key, most_recent_firing, parse_periodic_expr, SINGLE_BATCH};
pub use condition::{evaluate, parse_condition, Expr, QuotaProbe};
pub use pg::PgStrategyStore;
pub use scheduler::{ExecReport, GatewayProbe, StrategyScheduler, UserDirectory};
pub use service::{StrategyDraft, StrategyService};
pub use store::{MemoryStrategyStore, StrategyStore};
pub use types::{ExecutionRecord, ExecutionStatus, QuotaStrategy, StrategyKind};
