//! Connected bank account model and its learned availability schedule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Account status. Accounts are never deleted, only deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Deactivated,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Deactivated => "deactivated",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "deactivated" => AccountStatus::Deactivated,
            _ => AccountStatus::Active,
        }
    }
}

/// Observed statement-availability pattern for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePattern {
    Monthly,
    Irregular,
}

/// Persisted statistical model of when this account's statement
/// typically becomes available. Stored as JSONB on the account row and
/// rewritten by the learning service after each confirmed statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedSchedule {
    pub pattern: SchedulePattern,
    /// Inclusive day-of-month range in which the statement is expected.
    pub expected_day_range: [u32; 2],
    /// "HH:MM" bounds for the time of day statements have appeared.
    pub expected_time_range: [String; 2],
    pub timezone: String,
    /// Confidence in [0, 1]; 0 means pure guesswork.
    pub confidence: f64,
    /// Number of monthly cycles with a confirmed statement.
    pub cycles_confirmed: u32,
    pub last_updated: DateTime<Utc>,
}

/// A connected bank account.
#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub account_id: Uuid,
    pub institution_id: String,
    pub connection_id: String,
    pub timezone: String,
    pub status: String,
    pub learned_schedule: Option<serde_json::Value>,
    pub connected_utc: DateTime<Utc>,
    pub last_poll_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Account {
    pub fn schedule(&self) -> Option<LearnedSchedule> {
        self.learned_schedule
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Age of the account in whole days, used to decide whether it is
    /// still inside the learning period.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.connected_utc).num_days()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_round_trips_through_json() {
        let schedule = LearnedSchedule {
            pattern: SchedulePattern::Monthly,
            expected_day_range: [13, 17],
            expected_time_range: ["06:00".to_string(), "09:30".to_string()],
            timezone: "America/New_York".to_string(),
            confidence: 0.85,
            cycles_confirmed: 6,
            last_updated: Utc::now(),
        };

        let value = serde_json::to_value(&schedule).unwrap();
        let parsed: LearnedSchedule = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.pattern, SchedulePattern::Monthly);
        assert_eq!(parsed.expected_day_range, [13, 17]);
        assert_eq!(parsed.cycles_confirmed, 6);
    }

    #[test]
    fn status_round_trip() {
        assert_eq!(AccountStatus::from_string("active"), AccountStatus::Active);
        assert_eq!(
            AccountStatus::from_string("deactivated"),
            AccountStatus::Deactivated
        );
        assert_eq!(AccountStatus::Active.as_str(), "active");
    }
}
