//! Effective-permission resolution and propagation.
//!
//! The model whitelist is two-tier: user-level rows override nothing,
//! they UNION with every department row on the employee's path. The
//! scalar settings (star-check, quota-check) share the resolver shape
//! but merge by override precedence: user, then leaf department up to
//! the root, then the kind's default.
//!
//! Gateway writes are idempotent and diffed against the cached effective
//! row, so an unchanged resolution issues no call.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use tracing::{debug, info, instrument};

use tally_common::{EmployeeNumber, TallyError, TallyResult, UserId};
use tally_gateway::Gateway;

use crate::store::PermissionStore;
use crate::types::{
    normalize_models, EmployeeDepartment, PermissionAudit, PermissionOperation, ScalarKind,
    TargetType,
};

/// Input accepted by permission recomputation: an employee number
/// directly, or a user id resolved through the identity mapping when HR
/// sync is enabled.
#[derive(Debug, Clone)]
pub enum EmployeeRef {
    Number(EmployeeNumber),
    User(UserId),
}

impl From<EmployeeNumber> for EmployeeRef {
    fn from(value: EmployeeNumber) -> Self {
        EmployeeRef::Number(value)
    }
}

impl From<UserId> for EmployeeRef {
    fn from(value: UserId) -> Self {
        EmployeeRef::User(value)
    }
}

/// External identity mapping from platform users to employee numbers.
#[trait_variant::make(IdentityMap: Send)]
pub trait LocalIdentityMap {
    /// Employee number for a user, when the user is an employee.
    async fn employee_for_user(&self, user: UserId) -> TallyResult<Option<EmployeeNumber>>;
}

/// Identity mapping backed by process memory, for tests.
#[derive(Default)]
pub struct MemoryIdentityMap {
    map: RwLock<HashMap<UserId, EmployeeNumber>>,
}

impl MemoryIdentityMap {
    /// Create an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user → employee correlation.
    pub fn insert(&self, user: UserId, employee: EmployeeNumber) {
        self.map
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(user, employee);
    }
}

impl IdentityMap for MemoryIdentityMap {
    async fn employee_for_user(&self, user: UserId) -> TallyResult<Option<EmployeeNumber>> {
        Ok(self
            .map
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&user)
            .cloned())
    }
}

/// Resolves and propagates per-employee permissions.
pub struct PermissionResolver<S, G, M> {
    store: Arc<S>,
    gateway: Arc<G>,
    identity: Arc<M>,
    hr_sync_enabled: bool,
}

impl<S, G, M> PermissionResolver<S, G, M>
where
    S: PermissionStore + Sync,
    G: Gateway + Send + Sync,
    M: IdentityMap + Sync,
{
    /// Create a resolver.
    pub fn new(
        store: Arc<S>,
        gateway: Arc<G>,
        identity: Arc<M>,
        hr_sync_enabled: bool,
    ) -> Self {
        Self {
            store,
            gateway,
            identity,
            hr_sync_enabled,
        }
    }

    async fn resolve_ref(&self, reference: EmployeeRef) -> TallyResult<EmployeeNumber> {
        match reference {
            EmployeeRef::Number(number) => Ok(number),
            EmployeeRef::User(user) => self
                .identity
                .employee_for_user(user)
                .await?
                .ok_or_else(|| TallyError::EmployeeNotFound(user.to_string())),
        }
    }

    /// Union of the employee's user-level whitelist with every
    /// department whitelist on the employee's path. Set semantics over
    /// model names; result sorted.
    pub async fn resolve(&self, employee: &EmployeeNumber) -> TallyResult<Vec<String>> {
        let mut effective: BTreeSet<String> = BTreeSet::new();

        if let Some(models) = self
            .store
            .get_whitelist(TargetType::User, employee.as_str())
            .await?
        {
            effective.extend(models);
        }

        if let Some(entry) = self.store.get_employee(employee).await? {
            for department in &entry.dept_path {
                if let Some(models) = self
                    .store
                    .get_whitelist(TargetType::Department, department)
                    .await?
                {
                    effective.extend(models);
                }
            }
        }

        Ok(effective.into_iter().collect())
    }

    /// Upsert a user-level whitelist and recompute this employee.
    ///
    /// When HR sync is enabled the employee must exist in the directory.
    #[instrument(name = "permission.set_user_whitelist", skip(self, models))]
    pub async fn set_user_whitelist(
        &self,
        employee: &EmployeeNumber,
        models: &[String],
    ) -> TallyResult<()> {
        if self.hr_sync_enabled && self.store.get_employee(employee).await?.is_none() {
            return Err(TallyError::EmployeeNotFound(employee.to_string()));
        }

        let normalized = normalize_models(models);
        self.store
            .upsert_whitelist(TargetType::User, employee.as_str(), &normalized)
            .await?;
        self.store
            .insert_audit(&PermissionAudit::new(
                employee.clone(),
                PermissionOperation::UserWhitelistSet,
                normalized.join(","),
            ))
            .await?;
        self.update_employee_permissions(employee.clone().into())
            .await
    }

    /// Upsert a department whitelist and recompute every employee whose
    /// path contains the department. The department must be referenced
    /// by at least one employee.
    #[instrument(name = "permission.set_department_whitelist", skip(self, models))]
    pub async fn set_department_whitelist(
        &self,
        department: &str,
        models: &[String],
    ) -> TallyResult<()> {
        if !self.store.department_exists(department).await? {
            return Err(TallyError::DepartmentNotFound(department.to_string()));
        }

        let normalized = normalize_models(models);
        self.store
            .upsert_whitelist(TargetType::Department, department, &normalized)
            .await?;

        let members = self.store.employees_in_department(department).await?;
        for member in &members {
            self.store
                .insert_audit(&PermissionAudit::new(
                    member.employee_number.clone(),
                    PermissionOperation::DepartmentWhitelistSet,
                    format!("{department}: {}", normalized.join(",")),
                ))
                .await?;
            self.update_employee_permissions(member.employee_number.clone().into())
                .await?;
        }
        Ok(())
    }

    /// Recompute an employee's effective models; push to the gateway and
    /// refresh the cache only when the resolution changed.
    #[instrument(name = "permission.update_employee", skip(self))]
    pub async fn update_employee_permissions(&self, reference: EmployeeRef) -> TallyResult<()> {
        let employee = self.resolve_ref(reference).await?;
        let effective = self.resolve(&employee).await?;
        let cached = self.store.get_effective_models(&employee).await?;

        if cached.as_ref() == Some(&effective) {
            debug!(%employee, "effective models unchanged");
            return Ok(());
        }
        if effective.is_empty() && cached.is_none() {
            return Ok(());
        }

        self.gateway.set_models(&employee, &effective).await?;
        self.store
            .upsert_effective_models(&employee, &effective)
            .await?;
        self.store
            .insert_audit(&PermissionAudit::new(
                employee.clone(),
                PermissionOperation::EffectiveUpdated,
                effective.join(","),
            ))
            .await?;
        info!(%employee, models = effective.len(), "effective models pushed");
        Ok(())
    }

    /// HR sync: a new employee appeared.
    pub async fn add_employee(&self, entry: &EmployeeDepartment) -> TallyResult<()> {
        self.store.upsert_employee(entry).await?;
        self.update_employee_permissions(entry.employee_number.clone().into())
            .await
    }

    /// HR sync: the employee's department path changed. Personal grants
    /// are scoped to the granting department's context and are forfeited
    /// on transfer, so the user-level whitelist is deleted before the
    /// recomputation.
    #[instrument(name = "permission.department_change", skip(self, entry), fields(employee = %entry.employee_number))]
    pub async fn handle_department_change(&self, entry: &EmployeeDepartment) -> TallyResult<()> {
        let employee = &entry.employee_number;
        let cleared = self
            .store
            .delete_whitelist(TargetType::User, employee.as_str())
            .await?;
        if cleared {
            self.store
                .insert_audit(&PermissionAudit::new(
                    employee.clone(),
                    PermissionOperation::PersonalWhitelistCleared,
                    entry.path_to_db(),
                ))
                .await?;
        }
        self.store.upsert_employee(entry).await?;
        self.update_employee_permissions(employee.clone().into())
            .await
    }

    /// HR sync: the employee left. Directory row, caches, and personal
    /// rows are removed, and the gateway allow-list is emptied.
    #[instrument(name = "permission.remove_employee", skip(self))]
    pub async fn remove_employee(&self, employee: &EmployeeNumber) -> TallyResult<()> {
        self.gateway.set_models(employee, &[]).await?;

        self.store.delete_employee(employee).await?;
        self.store.delete_effective_models(employee).await?;
        self.store
            .delete_whitelist(TargetType::User, employee.as_str())
            .await?;
        for kind in [ScalarKind::StarCheck, ScalarKind::QuotaCheck] {
            self.store
                .delete_setting(kind, TargetType::User, employee.as_str())
                .await?;
            self.store.delete_effective_setting(kind, employee).await?;
        }
        self.store
            .insert_audit(&PermissionAudit::new(
                employee.clone(),
                PermissionOperation::EmployeeRemoved,
                String::new(),
            ))
            .await?;
        Ok(())
    }

    // ── Scalar settings ─────────────────────────────────────────────────

    /// Resolve a scalar setting: user override, then leaf-to-root
    /// department overrides, then the kind's default.
    pub async fn resolve_setting(
        &self,
        kind: ScalarKind,
        employee: &EmployeeNumber,
    ) -> TallyResult<bool> {
        if let Some(enabled) = self
            .store
            .get_setting(kind, TargetType::User, employee.as_str())
            .await?
        {
            return Ok(enabled);
        }

        if let Some(entry) = self.store.get_employee(employee).await? {
            for department in entry.dept_path.iter().rev() {
                if let Some(enabled) = self
                    .store
                    .get_setting(kind, TargetType::Department, department)
                    .await?
                {
                    return Ok(enabled);
                }
            }
        }

        Ok(kind.default_value())
    }

    /// Upsert a user-level scalar setting and recompute this employee.
    pub async fn set_user_setting(
        &self,
        kind: ScalarKind,
        employee: &EmployeeNumber,
        enabled: bool,
    ) -> TallyResult<()> {
        if self.hr_sync_enabled && self.store.get_employee(employee).await?.is_none() {
            return Err(TallyError::EmployeeNotFound(employee.to_string()));
        }
        self.store
            .upsert_setting(kind, TargetType::User, employee.as_str(), enabled)
            .await?;
        self.update_employee_setting(kind, employee).await
    }

    /// Upsert a department scalar setting and recompute its members.
    pub async fn set_department_setting(
        &self,
        kind: ScalarKind,
        department: &str,
        enabled: bool,
    ) -> TallyResult<()> {
        if !self.store.department_exists(department).await? {
            return Err(TallyError::DepartmentNotFound(department.to_string()));
        }
        self.store
            .upsert_setting(kind, TargetType::Department, department, enabled)
            .await?;

        let members = self.store.employees_in_department(department).await?;
        for member in &members {
            self.update_employee_setting(kind, &member.employee_number)
                .await?;
        }
        Ok(())
    }

    /// Recompute one employee's effective scalar value; push to the
    /// gateway only when it changed.
    pub async fn update_employee_setting(
        &self,
        kind: ScalarKind,
        employee: &EmployeeNumber,
    ) -> TallyResult<()> {
        let effective = self.resolve_setting(kind, employee).await?;
        let cached = self.store.get_effective_setting(kind, employee).await?;

        if cached == Some(effective) {
            return Ok(());
        }
        if effective == kind.default_value() && cached.is_none() {
            return Ok(());
        }

        match kind {
            ScalarKind::StarCheck => self.gateway.set_star_check(employee, effective).await?,
            ScalarKind::QuotaCheck => self.gateway.set_quota_check(employee, effective).await?,
        }
        self.store
            .upsert_effective_setting(kind, employee, effective)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPermissionStore;
    use std::sync::Arc;
    use tally_gateway::MemoryGateway;

    type TestResolver =
        PermissionResolver<MemoryPermissionStore, MemoryGateway, MemoryIdentityMap>;

    fn fixture(
        hr_sync_enabled: bool,
    ) -> (
        Arc<MemoryPermissionStore>,
        Arc<MemoryGateway>,
        Arc<MemoryIdentityMap>,
        TestResolver,
    ) {
        let store = Arc::new(MemoryPermissionStore::new());
        let gateway = Arc::new(MemoryGateway::new());
        let identity = Arc::new(MemoryIdentityMap::new());
        let resolver = PermissionResolver::new(
            store.clone(),
            gateway.clone(),
            identity.clone(),
            hr_sync_enabled,
        );
        (store, gateway, identity, resolver)
    }

    async fn seed_employee(store: &MemoryPermissionStore, number: &str, path: &[&str]) {
        store
            .upsert_employee(&EmployeeDepartment::new(
                EmployeeNumber::from(number),
                number.to_lowercase(),
                path.iter().map(|s| s.to_string()).collect(),
            ))
            .await
            .unwrap();
    }

    fn models(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_resolve_unions_user_and_path() {
        let (store, _, _, resolver) = fixture(true);
        let emp = EmployeeNumber::from("E1");
        seed_employee(&store, "E1", &["Company", "R&D"]).await;

        store
            .upsert_whitelist(TargetType::User, "E1", &models(&["m-user"]))
            .await
            .unwrap();
        store
            .upsert_whitelist(TargetType::Department, "Company", &models(&["m-base"]))
            .await
            .unwrap();
        store
            .upsert_whitelist(
                TargetType::Department,
                "R&D",
                &models(&["m-rd", "m-base"]),
            )
            .await
            .unwrap();

        assert_eq!(
            resolver.resolve(&emp).await.unwrap(),
            models(&["m-base", "m-rd", "m-user"])
        );
    }

    #[tokio::test]
    async fn test_update_is_idempotent_against_cache() {
        let (store, gateway, _, resolver) = fixture(true);
        let emp = EmployeeNumber::from("E1");
        seed_employee(&store, "E1", &["Company"]).await;

        resolver
            .set_user_whitelist(&emp, &models(&["m1"]))
            .await
            .unwrap();
        assert_eq!(gateway.set_models_calls().len(), 1);

        // Same list again: no second gateway call.
        resolver
            .update_employee_permissions(emp.clone().into())
            .await
            .unwrap();
        assert_eq!(gateway.set_models_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_resolution_without_cache_makes_no_call() {
        let (store, gateway, _, resolver) = fixture(true);
        let emp = EmployeeNumber::from("E1");
        seed_employee(&store, "E1", &["Company"]).await;

        resolver
            .update_employee_permissions(emp.into())
            .await
            .unwrap();
        assert!(gateway.set_models_calls().is_empty());
    }

    #[tokio::test]
    async fn test_user_whitelist_requires_employee_when_sync_enabled() {
        let (_, _, _, resolver) = fixture(true);
        let err = resolver
            .set_user_whitelist(&EmployeeNumber::from("ghost"), &models(&["m"]))
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::EmployeeNotFound(_)));

        // With sync disabled, no directory check applies.
        let (_, gateway, _, resolver) = fixture(false);
        resolver
            .set_user_whitelist(&EmployeeNumber::from("ghost"), &models(&["m"]))
            .await
            .unwrap();
        assert_eq!(gateway.set_models_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_department_whitelist_recomputes_members_only() {
        let (store, gateway, _, resolver) = fixture(true);
        seed_employee(&store, "E1", &["Company", "R&D"]).await;
        seed_employee(&store, "E2", &["Company", "Sales"]).await;

        resolver
            .set_department_whitelist("R&D", &models(&["m-rd"]))
            .await
            .unwrap();

        let calls = gateway.set_models_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.as_str(), "E1");
        assert_eq!(calls[0].1, models(&["m-rd"]));
    }

    #[tokio::test]
    async fn test_unknown_department_rejected() {
        let (_, _, _, resolver) = fixture(true);
        assert!(matches!(
            resolver
                .set_department_whitelist("Nowhere", &models(&["m"]))
                .await,
            Err(TallyError::DepartmentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_department_change_clears_personal_whitelist() {
        // Employee has a personal grant and a department grant; HR moves
        // them. The personal grant is forfeited, the effective row is
        // recomputed from the new path, exactly one set_models call.
        let (store, gateway, _, resolver) = fixture(true);
        let emp = EmployeeNumber::from("E1");
        seed_employee(&store, "E1", &["Company", "R&D"]).await;
        store
            .upsert_whitelist(TargetType::Department, "R&D", &models(&["m-rd"]))
            .await
            .unwrap();
        store
            .upsert_whitelist(TargetType::Department, "Sales", &models(&["m-sales"]))
            .await
            .unwrap();
        resolver
            .set_user_whitelist(&emp, &models(&["m-personal"]))
            .await
            .unwrap();
        let calls_before = gateway.set_models_calls().len();

        let moved = EmployeeDepartment::new(
            emp.clone(),
            "e1",
            vec!["Company".to_string(), "Sales".to_string()],
        );
        resolver.handle_department_change(&moved).await.unwrap();

        assert!(store
            .get_whitelist(TargetType::User, "E1")
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store.get_effective_models(&emp).await.unwrap(),
            Some(models(&["m-sales"]))
        );
        assert_eq!(gateway.set_models_calls().len(), calls_before + 1);
        assert_eq!(gateway.models(&emp), models(&["m-sales"]));
    }

    #[tokio::test]
    async fn test_remove_employee_clears_gateway_and_rows() {
        let (store, gateway, _, resolver) = fixture(true);
        let emp = EmployeeNumber::from("E1");
        seed_employee(&store, "E1", &["Company"]).await;
        resolver
            .set_user_whitelist(&emp, &models(&["m1"]))
            .await
            .unwrap();

        resolver.remove_employee(&emp).await.unwrap();

        assert!(store.get_employee(&emp).await.unwrap().is_none());
        assert!(store.get_effective_models(&emp).await.unwrap().is_none());
        assert!(gateway.models(&emp).is_empty());
    }

    #[tokio::test]
    async fn test_user_ref_resolves_through_identity_map() {
        let (store, gateway, identity, resolver) = fixture(true);
        let emp = EmployeeNumber::from("E1");
        let user = UserId::new();
        seed_employee(&store, "E1", &["Company"]).await;
        identity.insert(user, emp.clone());
        store
            .upsert_whitelist(TargetType::User, "E1", &models(&["m1"]))
            .await
            .unwrap();

        resolver
            .update_employee_permissions(user.into())
            .await
            .unwrap();
        assert_eq!(gateway.models(&emp), models(&["m1"]));

        let unknown = resolver
            .update_employee_permissions(UserId::new().into())
            .await
            .unwrap_err();
        assert!(matches!(unknown, TallyError::EmployeeNotFound(_)));
    }

    #[tokio::test]
    async fn test_scalar_precedence_user_over_department() {
        let (store, gateway, _, resolver) = fixture(true);
        let emp = EmployeeNumber::from("E1");
        seed_employee(&store, "E1", &["Company", "R&D"]).await;

        // Default applies with nothing configured.
        assert!(!resolver
            .resolve_setting(ScalarKind::StarCheck, &emp)
            .await
            .unwrap());

        // Root department turns it on; leaf overrides it off; user wins.
        resolver
            .set_department_setting(ScalarKind::StarCheck, "Company", true)
            .await
            .unwrap();
        assert!(resolver
            .resolve_setting(ScalarKind::StarCheck, &emp)
            .await
            .unwrap());
        assert_eq!(gateway.star_check(&emp), Some(true));

        resolver
            .set_department_setting(ScalarKind::StarCheck, "R&D", false)
            .await
            .unwrap();
        assert!(!resolver
            .resolve_setting(ScalarKind::StarCheck, &emp)
            .await
            .unwrap());

        resolver
            .set_user_setting(ScalarKind::StarCheck, &emp, true)
            .await
            .unwrap();
        assert!(resolver
            .resolve_setting(ScalarKind::StarCheck, &emp)
            .await
            .unwrap());
        assert_eq!(gateway.star_check(&emp), Some(true));
    }

    #[tokio::test]
    async fn test_scalar_kinds_are_independent() {
        let (store, gateway, _, resolver) = fixture(true);
        let emp = EmployeeNumber::from("E1");
        seed_employee(&store, "E1", &["Company"]).await;

        resolver
            .set_user_setting(ScalarKind::QuotaCheck, &emp, true)
            .await
            .unwrap();
        assert_eq!(gateway.quota_check(&emp), Some(true));
        assert_eq!(gateway.star_check(&emp), None);
    }
}
