//! Common test utilities for integration tests.
//!
//! Everything runs against the in-memory stores and the in-memory
//! gateway; no database is required.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use tally_common::{EmployeeNumber, UserId, UserProfile};
use tally_gateway::MemoryGateway;
use tally_ledger::{
    GiverInfo, MemoryLedger, QuotaLedger, TransferInStatus, TransferItem, VoucherCodec,
    VoucherData,
};
use tally_permission::{MemoryIdentityMap, MemoryPermissionStore, PermissionResolver};
use tally_strategy::MemoryStrategyStore;

/// Process-wide signing key used by every test voucher.
pub const TEST_VOUCHER_KEY: [u8; 32] = [42u8; 32];

/// Codec bound to the shared test key.
pub fn test_codec() -> VoucherCodec {
    VoucherCodec::new(TEST_VOUCHER_KEY)
}

/// Ledger-side fixture: in-memory gateway plus in-memory ledger.
pub struct LedgerFixture {
    pub gateway: Arc<MemoryGateway>,
    pub ledger: Arc<MemoryLedger<MemoryGateway>>,
}

impl LedgerFixture {
    /// Create an empty fixture.
    pub fn new() -> Self {
        let gateway = Arc::new(MemoryGateway::new());
        let ledger = Arc::new(MemoryLedger::new(gateway.clone(), test_codec()));
        Self { gateway, ledger }
    }

    /// Seed VALID records with chosen expiries through the public API:
    /// encode a voucher addressed to `user` and redeem it.
    pub async fn seed_records(&self, user: UserId, items: &[TransferItem]) {
        let voucher = test_codec()
            .encode(&VoucherData {
                giver_id: UserId::new(),
                giver_name: "seed".to_string(),
                giver_phone: String::new(),
                giver_github: String::new(),
                receiver_id: user,
                items: items.to_vec(),
            })
            .expect("seed voucher encodes");
        let outcome = self
            .ledger
            .transfer_in(user, &voucher)
            .await
            .expect("seed transfer-in");
        assert_eq!(outcome.status, TransferInStatus::Success);
    }
}

impl Default for LedgerFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Permission-side fixture.
pub struct PermissionFixture {
    pub store: Arc<MemoryPermissionStore>,
    pub gateway: Arc<MemoryGateway>,
    pub identity: Arc<MemoryIdentityMap>,
    pub resolver:
        Arc<PermissionResolver<MemoryPermissionStore, MemoryGateway, MemoryIdentityMap>>,
}

impl PermissionFixture {
    /// Create a fixture; `hr_sync_enabled` governs existence checks.
    pub fn new(hr_sync_enabled: bool) -> Self {
        let store = Arc::new(MemoryPermissionStore::new());
        let gateway = Arc::new(MemoryGateway::new());
        let identity = Arc::new(MemoryIdentityMap::new());
        let resolver = Arc::new(PermissionResolver::new(
            store.clone(),
            gateway.clone(),
            identity.clone(),
            hr_sync_enabled,
        ));
        Self {
            store,
            gateway,
            identity,
            resolver,
        }
    }
}

/// Create an empty strategy store.
pub fn strategy_store() -> Arc<MemoryStrategyStore> {
    Arc::new(MemoryStrategyStore::new())
}

/// A user profile with the attributes the condition DSL consumes.
pub fn profile(vip_level: u32, company: &str, stars: &[&str]) -> UserProfile {
    let mut user = UserProfile::bare(UserId::new());
    user.vip_level = vip_level;
    user.company = company.to_string();
    for star in stars {
        user.github_stars.insert(star.to_string());
    }
    user
}

/// Giver identity for transfer tests.
pub fn giver(id: UserId) -> GiverInfo {
    GiverInfo {
        id,
        name: "Ada Lovelace".to_string(),
        phone: "+44 20 0000".to_string(),
        github: "ada".to_string(),
    }
}

/// An employee number for tests.
pub fn employee(number: &str) -> EmployeeNumber {
    EmployeeNumber::from(number)
}

/// Shorthand for a second-truncated future expiry.
pub fn expiry_in_days(days: i64) -> DateTime<Utc> {
    tally_common::truncate_to_seconds(Utc::now() + chrono::Duration::days(days))
}
