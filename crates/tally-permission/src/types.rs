//! Permission, whitelist, and HR directory types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tally_common::EmployeeNumber;

/// Separator used to persist a department path in one text column.
const PATH_SEPARATOR: &str = "/";

/// An employee and their ordered department path, root to leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeDepartment {
    /// HR primary key.
    pub employee_number: EmployeeNumber,

    /// Display name from the HR feed.
    pub username: String,

    /// Department names from root to leaf.
    pub dept_path: Vec<String>,

    /// Last sync touch.
    pub update_time: DateTime<Utc>,
}

impl EmployeeDepartment {
    /// Create an entry stamped now.
    pub fn new(
        employee_number: EmployeeNumber,
        username: impl Into<String>,
        dept_path: Vec<String>,
    ) -> Self {
        Self {
            employee_number,
            username: username.into(),
            dept_path,
            update_time: Utc::now(),
        }
    }

    /// Whether the employee's path contains the department.
    pub fn in_department(&self, department: &str) -> bool {
        self.dept_path.iter().any(|d| d == department)
    }

    /// Encode the path for the `dept_full_level_names` column.
    pub fn path_to_db(&self) -> String {
        self.dept_path.join(PATH_SEPARATOR)
    }

    /// Decode a `dept_full_level_names` column value.
    pub fn path_from_db(raw: &str) -> Vec<String> {
        if raw.is_empty() {
            return Vec::new();
        }
        raw.split(PATH_SEPARATOR).map(str::to_string).collect()
    }
}

/// Whitelist target tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// A single employee.
    User,
    /// Every employee whose path contains the department.
    Department,
}

impl TargetType {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TargetType::User => "user",
            TargetType::Department => "department",
        }
    }

    /// Parse from database string.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(TargetType::User),
            "department" => Some(TargetType::Department),
            _ => None,
        }
    }
}

/// Canonical model-access rule for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelWhitelist {
    pub id: Uuid,
    pub target_type: TargetType,
    pub target_identifier: String,
    pub allowed_models: Vec<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// Cached resolver output for one employee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectivePermission {
    pub id: Uuid,
    pub employee_number: EmployeeNumber,
    pub effective_models: Vec<String>,
    pub update_time: DateTime<Utc>,
}

/// Scalar setting kinds sharing the resolver shape with the model
/// whitelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    /// Require a repository star before model access.
    StarCheck,
    /// Enforce quota at the gateway.
    QuotaCheck,
}

impl ScalarKind {
    /// Setting table for this kind.
    pub fn setting_table(&self) -> &'static str {
        match self {
            ScalarKind::StarCheck => "star_check_setting",
            ScalarKind::QuotaCheck => "quota_check_setting",
        }
    }

    /// Effective-value table for this kind.
    pub fn effective_table(&self) -> &'static str {
        match self {
            ScalarKind::StarCheck => "effective_star_check_setting",
            ScalarKind::QuotaCheck => "effective_quota_check_setting",
        }
    }

    /// Value applied when no tier defines one.
    pub fn default_value(&self) -> bool {
        false
    }
}

/// Operations recorded in the permission audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOperation {
    /// An operator edited a user-level whitelist.
    UserWhitelistSet,
    /// An operator edited a department whitelist.
    DepartmentWhitelistSet,
    /// The resolver pushed a new effective list to the gateway.
    EffectiveUpdated,
    /// HR sync removed the employee.
    EmployeeRemoved,
    /// HR sync cleared a personal whitelist on department change.
    PersonalWhitelistCleared,
}

impl PermissionOperation {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            PermissionOperation::UserWhitelistSet => "user_whitelist_set",
            PermissionOperation::DepartmentWhitelistSet => "department_whitelist_set",
            PermissionOperation::EffectiveUpdated => "effective_updated",
            PermissionOperation::EmployeeRemoved => "employee_removed",
            PermissionOperation::PersonalWhitelistCleared => "personal_whitelist_cleared",
        }
    }

    /// Parse from database string.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "user_whitelist_set" => Some(PermissionOperation::UserWhitelistSet),
            "department_whitelist_set" => Some(PermissionOperation::DepartmentWhitelistSet),
            "effective_updated" => Some(PermissionOperation::EffectiveUpdated),
            "employee_removed" => Some(PermissionOperation::EmployeeRemoved),
            "personal_whitelist_cleared" => Some(PermissionOperation::PersonalWhitelistCleared),
            _ => None,
        }
    }
}

/// One row of the permission audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionAudit {
    pub id: Uuid,
    pub employee_number: EmployeeNumber,
    pub operation: PermissionOperation,
    /// Human-readable detail, e.g. the written list.
    pub detail: String,
    pub create_time: DateTime<Utc>,
}

impl PermissionAudit {
    /// Create an audit row stamped now.
    pub fn new(
        employee_number: EmployeeNumber,
        operation: PermissionOperation,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            employee_number,
            operation,
            detail: detail.into(),
            create_time: Utc::now(),
        }
    }
}

/// Normalize a model list to set semantics: sorted, deduplicated.
pub fn normalize_models(models: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = models
        .iter()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_roundtrip() {
        let entry = EmployeeDepartment::new(
            EmployeeNumber::from("E1"),
            "ada",
            vec!["Company".to_string(), "R&D".to_string(), "Platform".to_string()],
        );
        let encoded = entry.path_to_db();
        assert_eq!(encoded, "Company/R&D/Platform");
        assert_eq!(EmployeeDepartment::path_from_db(&encoded), entry.dept_path);
        assert!(EmployeeDepartment::path_from_db("").is_empty());
    }

    #[test]
    fn test_in_department() {
        let entry = EmployeeDepartment::new(
            EmployeeNumber::from("E1"),
            "ada",
            vec!["Company".to_string(), "R&D".to_string()],
        );
        assert!(entry.in_department("R&D"));
        assert!(!entry.in_department("Sales"));
    }

    #[test]
    fn test_normalize_models() {
        let models = vec![
            " gpt-4o ".to_string(),
            "claude-3".to_string(),
            "gpt-4o".to_string(),
            String::new(),
        ];
        assert_eq!(normalize_models(&models), vec!["claude-3", "gpt-4o"]);
    }

    #[test]
    fn test_scalar_kind_tables() {
        assert_eq!(ScalarKind::StarCheck.setting_table(), "star_check_setting");
        assert_eq!(
            ScalarKind::QuotaCheck.effective_table(),
            "effective_quota_check_setting"
        );
        assert!(!ScalarKind::StarCheck.default_value());
    }
}
