//! In-memory gateway double.
//!
//! Mirrors the external gateway's observable behavior for tests: totals,
//! monotone usage counters, model allow-lists, and per-employee flags.
//! Supports injecting one-shot failures to exercise rollback paths.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use tally_common::{EmployeeNumber, TallyError, TallyResult, UserId};

use crate::Gateway;

/// Failure to inject into the next gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Network-level / 5xx failure.
    Transient,
    /// 4xx / envelope rejection.
    Permanent,
}

#[derive(Default)]
struct State {
    totals: HashMap<UserId, i64>,
    used: HashMap<UserId, i64>,
    models: HashMap<EmployeeNumber, Vec<String>>,
    star_check: HashMap<EmployeeNumber, bool>,
    quota_check: HashMap<EmployeeNumber, bool>,
    set_models_calls: Vec<(EmployeeNumber, Vec<String>)>,
}

/// Gateway double backed by process memory.
#[derive(Default)]
pub struct MemoryGateway {
    state: RwLock<State>,
    fault: Mutex<Option<Fault>>,
}

impl MemoryGateway {
    /// Create an empty gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call fail with the given fault, then recover.
    pub fn inject_fault(&self, fault: Fault) {
        *self.fault.lock().unwrap_or_else(|p| p.into_inner()) = Some(fault);
    }

    fn take_fault(&self) -> TallyResult<()> {
        let fault = self
            .fault
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match fault {
            Some(Fault::Transient) => Err(TallyError::GatewayTransient("injected".to_string())),
            Some(Fault::Permanent) => Err(TallyError::GatewayPermanent("injected".to_string())),
            None => Ok(()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Current total for a user (0 when never written).
    pub fn total(&self, user: UserId) -> i64 {
        self.read().totals.get(&user).copied().unwrap_or(0)
    }

    /// Current usage counter for a user.
    pub fn used(&self, user: UserId) -> i64 {
        self.read().used.get(&user).copied().unwrap_or(0)
    }

    /// Current allow-list for an employee.
    pub fn models(&self, employee: &EmployeeNumber) -> Vec<String> {
        self.read().models.get(employee).cloned().unwrap_or_default()
    }

    /// Every `set_models` call observed, in order.
    pub fn set_models_calls(&self) -> Vec<(EmployeeNumber, Vec<String>)> {
        self.read().set_models_calls.clone()
    }

    /// Current star-check flag for an employee.
    pub fn star_check(&self, employee: &EmployeeNumber) -> Option<bool> {
        self.read().star_check.get(employee).copied()
    }

    /// Current quota-check flag for an employee.
    pub fn quota_check(&self, employee: &EmployeeNumber) -> Option<bool> {
        self.read().quota_check.get(employee).copied()
    }
}

impl Gateway for MemoryGateway {
    async fn set_quota(&self, user: UserId, value: i64) -> TallyResult<()> {
        self.take_fault()?;
        self.write().totals.insert(user, value);
        Ok(())
    }

    async fn delta_quota(&self, user: UserId, delta: i64) -> TallyResult<()> {
        self.take_fault()?;
        *self.write().totals.entry(user).or_insert(0) += delta;
        Ok(())
    }

    async fn query_quota_value(&self, user: UserId) -> TallyResult<i64> {
        self.take_fault()?;
        Ok(self.total(user))
    }

    async fn delta_used_quota(&self, user: UserId, delta: i64) -> TallyResult<()> {
        self.take_fault()?;
        if delta < 0 {
            return Err(TallyError::InvalidInput(
                "usage delta must be non-negative".to_string(),
            ));
        }
        *self.write().used.entry(user).or_insert(0) += delta;
        Ok(())
    }

    async fn query_used_quota(&self, user: UserId) -> TallyResult<i64> {
        self.take_fault()?;
        Ok(self.used(user))
    }

    async fn set_models(&self, employee: &EmployeeNumber, models: &[String]) -> TallyResult<()> {
        self.take_fault()?;
        let mut state = self.write();
        state.models.insert(employee.clone(), models.to_vec());
        state
            .set_models_calls
            .push((employee.clone(), models.to_vec()));
        Ok(())
    }

    async fn set_star_check(&self, employee: &EmployeeNumber, enabled: bool) -> TallyResult<()> {
        self.take_fault()?;
        self.write().star_check.insert(employee.clone(), enabled);
        Ok(())
    }

    async fn set_quota_check(&self, employee: &EmployeeNumber, enabled: bool) -> TallyResult<()> {
        self.take_fault()?;
        self.write().quota_check.insert(employee.clone(), enabled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delta_and_query() {
        let gateway = MemoryGateway::new();
        let user = UserId::new();

        gateway.delta_quota(user, 100).await.unwrap();
        gateway.delta_quota(user, -30).await.unwrap();
        assert_eq!(gateway.query_quota_value(user).await.unwrap(), 70);

        gateway.delta_used_quota(user, 25).await.unwrap();
        assert_eq!(gateway.query_used_quota(user).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_fault_is_one_shot() {
        let gateway = MemoryGateway::new();
        let user = UserId::new();

        gateway.inject_fault(Fault::Transient);
        let err = gateway.delta_quota(user, 10).await.unwrap_err();
        assert!(matches!(err, TallyError::GatewayTransient(_)));
        assert_eq!(gateway.total(user), 0);

        gateway.delta_quota(user, 10).await.unwrap();
        assert_eq!(gateway.total(user), 10);
    }

    #[tokio::test]
    async fn test_set_models_records_calls() {
        let gateway = MemoryGateway::new();
        let emp = EmployeeNumber::from("E1001");

        gateway
            .set_models(&emp, &["gpt-4o".to_string()])
            .await
            .unwrap();
        gateway
            .set_models(&emp, &["gpt-4o".to_string(), "claude-3".to_string()])
            .await
            .unwrap();

        assert_eq!(gateway.models(&emp).len(), 2);
        assert_eq!(gateway.set_models_calls().len(), 2);
    }
}
