//! Batch keys: at-most-once execution per strategy / user / firing.
//!
//! For periodic strategies the key is the most recent cron firing time
//! at hour resolution; two firings within one hour share a batch on
//! purpose. One-shot strategies use a constant key.

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;

use tally_common::{TallyError, TallyResult};

use crate::types::{QuotaStrategy, StrategyKind};

/// Batch key for one-shot strategies.
pub const SINGLE_BATCH: &str = "SINGLE";

/// Parse a six-field (seconds-precision) periodic expression.
pub fn parse_periodic_expr(expr: &str) -> TallyResult<Schedule> {
    Schedule::from_str(expr.trim())
        .map_err(|e| TallyError::InvalidPeriodicExpr(format!("{expr}: {e}")))
}

/// Most recent firing time of `schedule` at or before `now`.
///
/// The cron iterator only walks forward, so scan from the smallest
/// lookback window that contains a firing; `None` when the schedule has
/// not fired within the last ~400 days.
pub fn most_recent_firing(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lookbacks = [
        Duration::minutes(2),
        Duration::hours(2),
        Duration::days(2),
        Duration::days(40),
        Duration::days(400),
    ];

    for lookback in lookbacks {
        let start = now - lookback;
        let mut last = None;
        for firing in schedule.after(&start) {
            if firing > now {
                break;
            }
            last = Some(firing);
        }
        if last.is_some() {
            return last;
        }
    }
    None
}

/// Batch key for a strategy at `now`.
///
/// Returns `None` for a periodic strategy whose schedule has not fired
/// yet; such a strategy is not due.
pub fn batch_key(strategy: &QuotaStrategy, now: DateTime<Utc>) -> TallyResult<Option<String>> {
    match strategy.kind {
        StrategyKind::OneShot => Ok(Some(SINGLE_BATCH.to_string())),
        StrategyKind::Periodic => {
            let expr = strategy.periodic_expr.as_deref().ok_or_else(|| {
                TallyError::InvalidPeriodicExpr(format!(
                    "strategy {} has no periodic expression",
                    strategy.name
                ))
            })?;
            let schedule = parse_periodic_expr(expr)?;
            Ok(most_recent_firing(&schedule, now).map(|t| t.format("%Y%m%d%H").to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn periodic(expr: &str) -> QuotaStrategy {
        QuotaStrategy {
            id: Uuid::now_v7(),
            name: "test".to_string(),
            title: "Test".to_string(),
            kind: StrategyKind::Periodic,
            amount: 10,
            model: "default".to_string(),
            periodic_expr: Some(expr.to_string()),
            condition: String::new(),
            status: true,
            max_exec_per_user: 0,
            create_time: Utc::now(),
            update_time: Utc::now(),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_periodic_expr("not a cron").is_err());
        assert!(parse_periodic_expr("0 0 2 * * *").is_ok());
    }

    #[test]
    fn test_most_recent_firing_daily() {
        // Daily at 02:00:00; at 10:30 the most recent firing is 02:00 today.
        let schedule = parse_periodic_expr("0 0 2 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap();
        assert_eq!(
            most_recent_firing(&schedule, now),
            Some(Utc.with_ymd_and_hms(2024, 6, 15, 2, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_most_recent_firing_before_todays_slot() {
        // At 01:00 the most recent daily-02:00 firing was yesterday.
        let schedule = parse_periodic_expr("0 0 2 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 1, 0, 0).unwrap();
        assert_eq!(
            most_recent_firing(&schedule, now),
            Some(Utc.with_ymd_and_hms(2024, 6, 14, 2, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_most_recent_firing_monthly() {
        // Monthly on the 1st at 00:00:30.
        let schedule = parse_periodic_expr("30 0 0 1 * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 20, 12, 0, 0).unwrap();
        assert_eq!(
            most_recent_firing(&schedule, now),
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 30).unwrap())
        );
    }

    #[test]
    fn test_batch_key_formats() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap();
        let key = batch_key(&periodic("0 0 2 * * *"), now).unwrap();
        assert_eq!(key.as_deref(), Some("2024061502"));

        let mut one_shot = periodic("0 0 2 * * *");
        one_shot.kind = StrategyKind::OneShot;
        one_shot.periodic_expr = None;
        assert_eq!(
            batch_key(&one_shot, now).unwrap().as_deref(),
            Some(SINGLE_BATCH)
        );
    }

    #[test]
    fn test_batch_key_stable_within_slot() {
        // Two ticks in the same batch window agree on the key.
        let schedule_expr = "0 0 2 * * *";
        let first = Utc.with_ymd_and_hms(2024, 6, 15, 2, 1, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 6, 15, 23, 59, 0).unwrap();
        assert_eq!(
            batch_key(&periodic(schedule_expr), first).unwrap(),
            batch_key(&periodic(schedule_expr), later).unwrap()
        );
    }
}
