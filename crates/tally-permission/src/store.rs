//! Permission persistence: employee directory, whitelists, effective
//! caches, scalar settings, and the audit trail.

use std::collections::HashMap;
use std::sync::RwLock;

use tally_common::{EmployeeNumber, TallyResult};

use crate::types::{
    normalize_models, EmployeeDepartment, PermissionAudit, ScalarKind, TargetType,
};

/// Repository for all permission state.
#[trait_variant::make(PermissionStore: Send)]
pub trait LocalPermissionStore {
    // ── Employee directory ──────────────────────────────────────────────

    /// Insert or update an employee's path.
    async fn upsert_employee(&self, entry: &EmployeeDepartment) -> TallyResult<()>;

    /// Fetch an employee by number.
    async fn get_employee(
        &self,
        employee: &EmployeeNumber,
    ) -> TallyResult<Option<EmployeeDepartment>>;

    /// Remove an employee.
    async fn delete_employee(&self, employee: &EmployeeNumber) -> TallyResult<()>;

    /// Every synced employee.
    async fn list_employees(&self) -> TallyResult<Vec<EmployeeDepartment>>;

    /// Employees whose path contains the department.
    async fn employees_in_department(
        &self,
        department: &str,
    ) -> TallyResult<Vec<EmployeeDepartment>>;

    /// Whether any employee's path references the department.
    async fn department_exists(&self, department: &str) -> TallyResult<bool>;

    // ── Model whitelist ─────────────────────────────────────────────────

    /// Insert or replace a whitelist row.
    async fn upsert_whitelist(
        &self,
        target_type: TargetType,
        target: &str,
        models: &[String],
    ) -> TallyResult<()>;

    /// Fetch a whitelist row's model list.
    async fn get_whitelist(
        &self,
        target_type: TargetType,
        target: &str,
    ) -> TallyResult<Option<Vec<String>>>;

    /// Delete a whitelist row; returns whether one existed.
    async fn delete_whitelist(&self, target_type: TargetType, target: &str)
        -> TallyResult<bool>;

    // ── Effective permission cache ──────────────────────────────────────

    /// Cached effective model list for an employee.
    async fn get_effective_models(
        &self,
        employee: &EmployeeNumber,
    ) -> TallyResult<Option<Vec<String>>>;

    /// Insert or replace the cached effective list.
    async fn upsert_effective_models(
        &self,
        employee: &EmployeeNumber,
        models: &[String],
    ) -> TallyResult<()>;

    /// Drop the cached effective list.
    async fn delete_effective_models(&self, employee: &EmployeeNumber) -> TallyResult<()>;

    // ── Scalar settings (star-check / quota-check) ─────────────────────

    /// Insert or replace a scalar setting row.
    async fn upsert_setting(
        &self,
        kind: ScalarKind,
        target_type: TargetType,
        target: &str,
        enabled: bool,
    ) -> TallyResult<()>;

    /// Fetch a scalar setting.
    async fn get_setting(
        &self,
        kind: ScalarKind,
        target_type: TargetType,
        target: &str,
    ) -> TallyResult<Option<bool>>;

    /// Delete a scalar setting row; returns whether one existed.
    async fn delete_setting(
        &self,
        kind: ScalarKind,
        target_type: TargetType,
        target: &str,
    ) -> TallyResult<bool>;

    /// Cached effective scalar value for an employee.
    async fn get_effective_setting(
        &self,
        kind: ScalarKind,
        employee: &EmployeeNumber,
    ) -> TallyResult<Option<bool>>;

    /// Insert or replace the cached effective scalar value.
    async fn upsert_effective_setting(
        &self,
        kind: ScalarKind,
        employee: &EmployeeNumber,
        enabled: bool,
    ) -> TallyResult<()>;

    /// Drop the cached effective scalar value.
    async fn delete_effective_setting(
        &self,
        kind: ScalarKind,
        employee: &EmployeeNumber,
    ) -> TallyResult<()>;

    // ── Audit trail ─────────────────────────────────────────────────────

    /// Append an audit row.
    async fn insert_audit(&self, entry: &PermissionAudit) -> TallyResult<()>;

    /// Recent audit rows for an employee, newest first.
    async fn audits_for_employee(
        &self,
        employee: &EmployeeNumber,
        limit: i64,
    ) -> TallyResult<Vec<PermissionAudit>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct State {
    employees: HashMap<EmployeeNumber, EmployeeDepartment>,
    whitelists: HashMap<(TargetType, String), Vec<String>>,
    effective: HashMap<EmployeeNumber, Vec<String>>,
    settings: HashMap<(ScalarKind, TargetType, String), bool>,
    effective_settings: HashMap<(ScalarKind, EmployeeNumber), bool>,
    audits: Vec<PermissionAudit>,
}

/// Permission store backed by process memory, for tests.
#[derive(Default)]
pub struct MemoryPermissionStore {
    state: RwLock<State>,
}

impl MemoryPermissionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl PermissionStore for MemoryPermissionStore {
    async fn upsert_employee(&self, entry: &EmployeeDepartment) -> TallyResult<()> {
        self.write()
            .employees
            .insert(entry.employee_number.clone(), entry.clone());
        Ok(())
    }

    async fn get_employee(
        &self,
        employee: &EmployeeNumber,
    ) -> TallyResult<Option<EmployeeDepartment>> {
        Ok(self.read().employees.get(employee).cloned())
    }

    async fn delete_employee(&self, employee: &EmployeeNumber) -> TallyResult<()> {
        self.write().employees.remove(employee);
        Ok(())
    }

    async fn list_employees(&self) -> TallyResult<Vec<EmployeeDepartment>> {
        let mut employees: Vec<EmployeeDepartment> =
            self.read().employees.values().cloned().collect();
        employees.sort_by(|a, b| a.employee_number.cmp(&b.employee_number));
        Ok(employees)
    }

    async fn employees_in_department(
        &self,
        department: &str,
    ) -> TallyResult<Vec<EmployeeDepartment>> {
        let mut employees: Vec<EmployeeDepartment> = self
            .read()
            .employees
            .values()
            .filter(|e| e.in_department(department))
            .cloned()
            .collect();
        employees.sort_by(|a, b| a.employee_number.cmp(&b.employee_number));
        Ok(employees)
    }

    async fn department_exists(&self, department: &str) -> TallyResult<bool> {
        Ok(self
            .read()
            .employees
            .values()
            .any(|e| e.in_department(department)))
    }

    async fn upsert_whitelist(
        &self,
        target_type: TargetType,
        target: &str,
        models: &[String],
    ) -> TallyResult<()> {
        self.write()
            .whitelists
            .insert((target_type, target.to_string()), normalize_models(models));
        Ok(())
    }

    async fn get_whitelist(
        &self,
        target_type: TargetType,
        target: &str,
    ) -> TallyResult<Option<Vec<String>>> {
        Ok(self
            .read()
            .whitelists
            .get(&(target_type, target.to_string()))
            .cloned())
    }

    async fn delete_whitelist(
        &self,
        target_type: TargetType,
        target: &str,
    ) -> TallyResult<bool> {
        Ok(self
            .write()
            .whitelists
            .remove(&(target_type, target.to_string()))
            .is_some())
    }

    async fn get_effective_models(
        &self,
        employee: &EmployeeNumber,
    ) -> TallyResult<Option<Vec<String>>> {
        Ok(self.read().effective.get(employee).cloned())
    }

    async fn upsert_effective_models(
        &self,
        employee: &EmployeeNumber,
        models: &[String],
    ) -> TallyResult<()> {
        self.write()
            .effective
            .insert(employee.clone(), models.to_vec());
        Ok(())
    }

    async fn delete_effective_models(&self, employee: &EmployeeNumber) -> TallyResult<()> {
        self.write().effective.remove(employee);
        Ok(())
    }

    async fn upsert_setting(
        &self,
        kind: ScalarKind,
        target_type: TargetType,
        target: &str,
        enabled: bool,
    ) -> TallyResult<()> {
        self.write()
            .settings
            .insert((kind, target_type, target.to_string()), enabled);
        Ok(())
    }

    async fn get_setting(
        &self,
        kind: ScalarKind,
        target_type: TargetType,
        target: &str,
    ) -> TallyResult<Option<bool>> {
        Ok(self
            .read()
            .settings
            .get(&(kind, target_type, target.to_string()))
            .copied())
    }

    async fn delete_setting(
        &self,
        kind: ScalarKind,
        target_type: TargetType,
        target: &str,
    ) -> TallyResult<bool> {
        Ok(self
            .write()
            .settings
            .remove(&(kind, target_type, target.to_string()))
            .is_some())
    }

    async fn get_effective_setting(
        &self,
        kind: ScalarKind,
        employee: &EmployeeNumber,
    ) -> TallyResult<Option<bool>> {
        Ok(self
            .read()
            .effective_settings
            .get(&(kind, employee.clone()))
            .copied())
    }

    async fn upsert_effective_setting(
        &self,
        kind: ScalarKind,
        employee: &EmployeeNumber,
        enabled: bool,
    ) -> TallyResult<()> {
        self.write()
            .effective_settings
            .insert((kind, employee.clone()), enabled);
        Ok(())
    }

    async fn delete_effective_setting(
        &self,
        kind: ScalarKind,
        employee: &EmployeeNumber,
    ) -> TallyResult<()> {
        self.write()
            .effective_settings
            .remove(&(kind, employee.clone()));
        Ok(())
    }

    async fn insert_audit(&self, entry: &PermissionAudit) -> TallyResult<()> {
        self.write().audits.push(entry.clone());
        Ok(())
    }

    async fn audits_for_employee(
        &self,
        employee: &EmployeeNumber,
        limit: i64,
    ) -> TallyResult<Vec<PermissionAudit>> {
        let mut audits: Vec<PermissionAudit> = self
            .read()
            .audits
            .iter()
            .filter(|a| &a.employee_number == employee)
            .cloned()
            .collect();
        audits.sort_by(|a, b| b.create_time.cmp(&a.create_time));
        audits.truncate(limit.max(0) as usize);
        Ok(audits)
    }
}
