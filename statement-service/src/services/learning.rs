//! Availability learning service.
//!
//! Maintains a per-account statistical model of when statements become
//! available and decides which accounts each scheduler tick should
//! poll. Any internal failure degrades to "check the account anyway";
//! the learning layer is an optimization and must never silently drop
//! an account from polling.

use crate::models::{Account, LearnedSchedule, SchedulePattern};
use crate::services::database::Database;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use pipeline_core::error::AppError;
use serde::Serialize;
use uuid::Uuid;

/// Days of history before prediction-driven polling takes over.
pub const LEARNING_PERIOD_DAYS: i64 = 45;

/// A standard deviation of 15 days is treated as maximal uncertainty.
const MAX_STDDEV_DAYS: f64 = 15.0;

/// How many days of early-checking slack a fully unconfident account
/// gets ahead of its expected date.
const MAX_EARLY_SHIFT_DAYS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckFrequency {
    /// Inside the learning period: poll once a day regardless of model.
    Daily,
    /// Prediction-driven: skip until `check_after`.
    Smart,
}

#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    pub expected_date: NaiveDate,
    pub confidence: f64,
    /// First date the scheduler should start checking. Shifted earlier
    /// than `expected_date` in proportion to uncertainty.
    pub check_after: NaiveDate,
}

/// Mean and population standard deviation of observed days-of-month.
fn day_stats(observed: &[DateTime<Utc>]) -> Option<(f64, f64)> {
    if observed.is_empty() {
        return None;
    }
    let days: Vec<f64> = observed.iter().map(|d| d.day() as f64).collect();
    let mean = days.iter().sum::<f64>() / days.len() as f64;
    let variance = days.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / days.len() as f64;
    Some((mean, variance.sqrt()))
}

/// Confidence score in [0, 1] from the day-of-month spread.
pub fn confidence_from_stddev(stddev: f64) -> f64 {
    (1.0 - stddev / MAX_STDDEV_DAYS).clamp(0.0, 1.0)
}

/// Predict the next availability date from historical observations.
///
/// Returns `None` when there is no history at all; the caller treats
/// that as "check anyway".
pub fn predict_from_samples(observed: &[DateTime<Utc>], today: NaiveDate) -> Option<Prediction> {
    let (mean, stddev) = day_stats(observed)?;
    let confidence = confidence_from_stddev(stddev);

    let expected_day = (mean.round() as u32).clamp(1, 28);
    let this_month = NaiveDate::from_ymd_opt(today.year(), today.month(), expected_day)?;
    let expected_date = if this_month >= today {
        this_month
    } else {
        let (year, month) = if today.month() == 12 {
            (today.year() + 1, 1)
        } else {
            (today.year(), today.month() + 1)
        };
        NaiveDate::from_ymd_opt(year, month, expected_day)?
    };

    let early_shift = ((1.0 - confidence) * MAX_EARLY_SHIFT_DAYS).round() as i64;
    let check_after = expected_date - Duration::days(early_shift);

    Some(Prediction {
        expected_date,
        confidence,
        check_after,
    })
}

/// Build the persisted schedule snapshot from observations.
pub fn schedule_from_samples(
    observed: &[DateTime<Utc>],
    timezone: &str,
) -> Option<LearnedSchedule> {
    let (mean, stddev) = day_stats(observed)?;
    let confidence = confidence_from_stddev(stddev);

    let day_lo = ((mean - stddev).floor() as i64).clamp(1, 31) as u32;
    let day_hi = ((mean + stddev).ceil() as i64).clamp(1, 31) as u32;

    let mut times: Vec<(u32, u32)> = observed.iter().map(|d| (d.hour(), d.minute())).collect();
    times.sort_unstable();
    let (lo_h, lo_m) = *times.first()?;
    let (hi_h, hi_m) = *times.last()?;

    Some(LearnedSchedule {
        pattern: if confidence >= 0.5 {
            SchedulePattern::Monthly
        } else {
            SchedulePattern::Irregular
        },
        expected_day_range: [day_lo, day_hi],
        expected_time_range: [
            format!("{:02}:{:02}", lo_h, lo_m),
            format!("{:02}:{:02}", hi_h, hi_m),
        ],
        timezone: timezone.to_string(),
        confidence,
        cycles_confirmed: observed.len() as u32,
        last_updated: Utc::now(),
    })
}

#[derive(Clone)]
pub struct LearningService {
    db: Database,
}

impl LearningService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an availability observation for one statement cycle.
    /// Idempotent per (account, year, month).
    pub async fn record_availability(
        &self,
        institution_id: &str,
        account_id: Uuid,
        month: u32,
        year: i32,
        observed: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.db
            .upsert_availability_sample(account_id, institution_id, year, month, observed)
            .await?;

        // Refresh the persisted schedule snapshot from the full history.
        let samples = self.db.list_availability_samples(account_id).await?;
        let account = self.db.get_account(account_id).await?;
        if let Some(schedule) = schedule_from_samples(&samples, &account.timezone) {
            let value = serde_json::to_value(&schedule)
                .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;
            self.db.update_learned_schedule(account_id, &value).await?;
            tracing::info!(
                account_id = %account_id,
                confidence = schedule.confidence,
                cycles_confirmed = schedule.cycles_confirmed,
                "Learned schedule updated"
            );
        }
        Ok(())
    }

    pub async fn predict_next(&self, account_id: Uuid) -> Result<Option<Prediction>, AppError> {
        let samples = self.db.list_availability_samples(account_id).await?;
        Ok(predict_from_samples(&samples, Utc::now().date_naive()))
    }

    pub fn check_frequency(&self, account: &Account, now: DateTime<Utc>) -> CheckFrequency {
        if account.age_days(now) < LEARNING_PERIOD_DAYS {
            CheckFrequency::Daily
        } else {
            CheckFrequency::Smart
        }
    }

    /// Accounts the current scheduler tick should poll.
    ///
    /// Learning-period accounts are due once a day. Smart accounts are
    /// due once their predicted `check_after` has arrived. A failed or
    /// absent prediction fails open: the account is checked anyway.
    pub async fn accounts_to_check(&self, now: DateTime<Utc>) -> Result<Vec<Account>, AppError> {
        let accounts = self.db.list_active_accounts().await?;
        let today = now.date_naive();
        let mut due = Vec::new();

        for account in accounts {
            let polled_recently = account
                .last_poll_utc
                .map(|t| now - t < Duration::hours(24))
                .unwrap_or(false);
            if polled_recently {
                continue;
            }

            match self.check_frequency(&account, now) {
                CheckFrequency::Daily => due.push(account),
                CheckFrequency::Smart => {
                    match self.db.list_availability_samples(account.account_id).await {
                        Ok(samples) => match predict_from_samples(&samples, today) {
                            Some(prediction) if today < prediction.check_after => {
                                tracing::debug!(
                                    account_id = %account.account_id,
                                    check_after = %prediction.check_after,
                                    "Skipping account until predicted window"
                                );
                            }
                            _ => due.push(account),
                        },
                        Err(e) => {
                            tracing::warn!(
                                account_id = %account.account_id,
                                error = %e,
                                "Prediction failed, checking account anyway"
                            );
                            due.push(account);
                        }
                    }
                }
            }
        }

        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 8, 30, 0).unwrap()
    }

    #[test]
    fn identical_days_give_full_confidence() {
        let samples = vec![
            sample(2024, 1, 15),
            sample(2024, 2, 15),
            sample(2024, 3, 15),
            sample(2024, 4, 15),
        ];
        let prediction =
            predict_from_samples(&samples, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()).unwrap();
        assert_eq!(prediction.confidence, 1.0);
        assert_eq!(
            prediction.expected_date,
            NaiveDate::from_ymd_opt(2024, 5, 15).unwrap()
        );
        // Full confidence: no early shift.
        assert_eq!(prediction.check_after, prediction.expected_date);
    }

    #[test]
    fn scattered_days_give_strictly_lower_confidence() {
        let tight = vec![
            sample(2024, 1, 15),
            sample(2024, 2, 15),
            sample(2024, 3, 15),
            sample(2024, 4, 15),
        ];
        let scattered = vec![
            sample(2024, 1, 1),
            sample(2024, 2, 15),
            sample(2024, 3, 30),
            sample(2024, 4, 8),
        ];
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let tight_conf = predict_from_samples(&tight, today).unwrap().confidence;
        let scattered_conf = predict_from_samples(&scattered, today).unwrap().confidence;
        assert!(scattered_conf < tight_conf);
    }

    #[test]
    fn low_confidence_shifts_check_after_earlier() {
        let samples = vec![
            sample(2024, 1, 5),
            sample(2024, 2, 15),
            sample(2024, 3, 25),
        ];
        let today = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        let prediction = predict_from_samples(&samples, today).unwrap();
        assert!(prediction.check_after < prediction.expected_date);
        let shift = (prediction.expected_date - prediction.check_after).num_days();
        assert!(shift >= 1 && shift <= 5);
    }

    #[test]
    fn expected_date_rolls_to_next_month_when_passed() {
        let samples = vec![sample(2024, 1, 5), sample(2024, 2, 5)];
        let today = NaiveDate::from_ymd_opt(2024, 3, 20).unwrap();
        let prediction = predict_from_samples(&samples, today).unwrap();
        assert_eq!(
            prediction.expected_date,
            NaiveDate::from_ymd_opt(2024, 4, 5).unwrap()
        );
    }

    #[test]
    fn december_rolls_into_january() {
        let samples = vec![sample(2024, 10, 5), sample(2024, 11, 5)];
        let today = NaiveDate::from_ymd_opt(2024, 12, 20).unwrap();
        let prediction = predict_from_samples(&samples, today).unwrap();
        assert_eq!(
            prediction.expected_date,
            NaiveDate::from_ymd_opt(2025, 1, 5).unwrap()
        );
    }

    #[test]
    fn no_history_yields_no_prediction() {
        assert!(predict_from_samples(&[], NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()).is_none());
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(confidence_from_stddev(0.0), 1.0);
        assert_eq!(confidence_from_stddev(15.0), 0.0);
        assert_eq!(confidence_from_stddev(40.0), 0.0);
    }

    #[test]
    fn schedule_snapshot_reflects_history() {
        let samples = vec![
            sample(2024, 1, 14),
            sample(2024, 2, 15),
            sample(2024, 3, 16),
        ];
        let schedule = schedule_from_samples(&samples, "America/New_York").unwrap();
        assert_eq!(schedule.pattern, SchedulePattern::Monthly);
        assert_eq!(schedule.cycles_confirmed, 3);
        assert!(schedule.expected_day_range[0] >= 13);
        assert!(schedule.expected_day_range[1] <= 17);
        assert_eq!(schedule.expected_time_range[0], "08:30");
        assert_eq!(schedule.timezone, "America/New_York");
    }

    #[test]
    fn irregular_history_marks_pattern_irregular() {
        let samples = vec![
            sample(2024, 1, 1),
            sample(2024, 2, 28),
            sample(2024, 3, 14),
            sample(2024, 4, 27),
        ];
        let schedule = schedule_from_samples(&samples, "UTC").unwrap();
        assert_eq!(schedule.pattern, SchedulePattern::Irregular);
        assert!(schedule.confidence < 0.5);
    }
}
