//! Statement ledger records and the upstream listing shape.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A statement as recorded in the ledger. The dedup key is
/// (account_id, period_end, file_type); a re-discovery of the same key
/// increments `version` rather than inserting a second row.
#[derive(Debug, Clone, FromRow)]
pub struct StatementRecord {
    pub statement_id: Uuid,
    pub account_id: Uuid,
    /// Aggregator-side identifier, needed to download the file later.
    pub upstream_ref: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub statement_date: NaiveDate,
    pub file_type: String,
    pub checksum: Option<String>,
    pub version: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl StatementRecord {
    /// Whether this upsert saw the statement for the first time.
    pub fn is_first_sighting(&self) -> bool {
        self.version == 1
    }

    /// File name used at the destination, e.g.
    /// `statement_2024-01-31.pdf`.
    pub fn file_name(&self) -> String {
        format!("statement_{}.{}", self.period_end, self.file_type)
    }

    pub fn mime_type(&self) -> &'static str {
        match self.file_type.as_str() {
            "pdf" => "application/pdf",
            "csv" => "text/csv",
            "ofx" => "application/x-ofx",
            _ => "application/octet-stream",
        }
    }
}

/// One entry from the aggregator's "list statements for account" API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamStatement {
    /// Aggregator-side statement identifier, used for download.
    pub statement_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub statement_date: NaiveDate,
    pub file_type: String,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: i32, file_type: &str) -> StatementRecord {
        StatementRecord {
            statement_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            upstream_ref: "agg-stmt-1".to_string(),
            period_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            statement_date: NaiveDate::from_ymd_opt(2024, 2, 3).unwrap(),
            file_type: file_type.to_string(),
            checksum: None,
            version,
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        }
    }

    #[test]
    fn first_sighting_is_version_one() {
        assert!(record(1, "pdf").is_first_sighting());
        assert!(!record(2, "pdf").is_first_sighting());
    }

    #[test]
    fn file_name_carries_period_end() {
        assert_eq!(record(1, "pdf").file_name(), "statement_2024-01-31.pdf");
    }

    #[test]
    fn mime_type_mapping() {
        assert_eq!(record(1, "pdf").mime_type(), "application/pdf");
        assert_eq!(record(1, "csv").mime_type(), "text/csv");
        assert_eq!(record(1, "qfx").mime_type(), "application/octet-stream");
    }
}
