//! # tally-common
//!
//! Shared types and utilities for the Tally quota layer.
//!
//! This crate provides foundational types used across all Tally components:
//! - `tally-ledger`: Expirable quota ledger and voucher transfers
//! - `tally-strategy`: Recharge strategy engine and scheduler
//! - `tally-permission`: Model-access permission resolver and HR sync
//! - `tally-gateway`: AI gateway adapter

pub mod error;
pub mod identity;
pub mod types;

#[cfg(feature = "config")]
pub mod config;

#[cfg(all(feature = "sqlx", feature = "config"))]
pub mod db;

pub use error::{TallyError, TallyResult};
pub use identity::{EmployeeNumber, UserId};
pub use types::{truncate_to_seconds, UserProfile};

#[cfg(feature = "config")]
pub use config::{
    load_config, load_tally_config, ConfigManager, DatabaseConfig, GatewayConfig, HrSyncConfig,
    SchedulerConfig, TallyConfig, VoucherConfig,
};

#[cfg(all(feature = "sqlx", feature = "config"))]
pub use db::connect_pool;
