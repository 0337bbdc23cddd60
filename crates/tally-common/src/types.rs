//! Common value types used across the Tally quota layer.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::identity::{EmployeeNumber, UserId};

/// Truncate a timestamp to whole seconds.
///
/// All persisted expiry timestamps go through this on input; equality and
/// ordering comparisons on expiries operate at second precision.
pub fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(0)
}

/// A user record as consumed by the core.
///
/// Immutable from the core's perspective; sourced from the external
/// identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    /// Opaque user id.
    pub id: UserId,

    /// HR correlation key, when the user is an employee.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employee_number: Option<EmployeeNumber>,

    /// VIP rank, non-negative.
    pub vip_level: u32,

    /// Company / organisation label.
    pub company: String,

    /// Starred repository identifiers.
    #[serde(default)]
    pub github_stars: BTreeSet<String>,

    /// Inviter, when the user was referred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inviter_id: Option<UserId>,

    /// Registration timestamp.
    pub registered_at: DateTime<Utc>,

    /// Last access timestamp.
    pub last_access_at: DateTime<Utc>,
}

impl UserProfile {
    /// Minimal profile for a bare user id.
    pub fn bare(id: UserId) -> Self {
        let now = Utc::now();
        Self {
            id,
            employee_number: None,
            vip_level: 0,
            company: String::new(),
            github_stars: BTreeSet::new(),
            inviter_id: None,
            registered_at: now,
            last_access_at: now,
        }
    }

    /// Whether the user has starred the given repository.
    pub fn has_starred(&self, repo: &str) -> bool {
        self.github_stars.contains(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_truncate_to_seconds() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 31, 23, 59, 59).unwrap()
            + chrono::Duration::milliseconds(750);
        let truncated = truncate_to_seconds(ts);
        assert_eq!(truncated.timestamp_subsec_millis(), 0);
        assert_eq!(
            truncated,
            Utc.with_ymd_and_hms(2024, 5, 31, 23, 59, 59).unwrap()
        );
    }

    #[test]
    fn test_profile_stars() {
        let mut profile = UserProfile::bare(UserId::new());
        profile.github_stars.insert("zgsm".to_string());
        assert!(profile.has_starred("zgsm"));
        assert!(!profile.has_starred("other"));
    }
}
