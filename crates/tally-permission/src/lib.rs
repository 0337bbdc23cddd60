//! # tally-permission
//!
//! Model-access permission management: a two-tier (user and department)
//! whitelist, per-employee effective permission resolution with
//! idempotent gateway propagation, the analogous star-check and
//! quota-check scalar settings, and the HR directory sync that reacts to
//! organizational changes.

pub mod hr;
pub mod pg;
pub mod resolver;
pub mod store;
pub mod types;

pub use hr::{
    department_paths, HrDepartment, HrEmployee, HrFeed, HrSyncDriver, HttpHrFeed, SyncReport,
};
pub use pg::PgPermissionStore;
pub use resolver::{EmployeeRef, IdentityMap, MemoryIdentityMap, PermissionResolver};
pub use store::{MemoryPermissionStore, PermissionStore};
pub use types::{
    normalize_models, EffectivePermission, EmployeeDepartment, ModelWhitelist, PermissionAudit,
    PermissionOperation, ScalarKind, TargetType,
};
