//! Identity types for users and employees.
//!
//! User identity comes from the external identity provider as an opaque
//! UUID; employees are correlated through the HR directory's employee
//! number.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a platform user.
///
/// # Example
/// ```
/// use tally_common::UserId;
///
/// let user = UserId::new();
/// println!("User ID: {}", user);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    /// Create a new random user ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create a user ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user:{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid_str = s.strip_prefix("user:").unwrap_or(s);
        Ok(Self(Uuid::parse_str(uuid_str)?))
    }
}

/// Employee number from the HR directory.
///
/// Opaque to the core; used as the correlation key between users, the
/// HR feed, and the gateway's model ACL surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmployeeNumber(String);

impl EmployeeNumber {
    /// Wrap an employee number string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the raw employee number.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the employee number is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for EmployeeNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EmployeeNumber {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EmployeeNumber {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_user_id_display_roundtrip() {
        let id = UserId::new();
        let displayed = id.to_string();
        assert!(displayed.starts_with("user:"));
        assert_eq!(UserId::from_str(&displayed).unwrap(), id);
    }

    #[test]
    fn test_user_id_parse_bare_uuid() {
        let id = UserId::new();
        let bare = id.as_uuid().to_string();
        assert_eq!(UserId::from_str(&bare).unwrap(), id);
    }

    #[test]
    fn test_employee_number() {
        let emp = EmployeeNumber::from("E1001");
        assert_eq!(emp.as_str(), "E1001");
        assert!(!emp.is_empty());
        assert!(EmployeeNumber::new("").is_empty());
    }
}
