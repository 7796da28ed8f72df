//! Accounting and usage aggregate models.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One raw RADIUS accounting row (a session, open or closed).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccountingRecord {
    /// Accounting unique id; the idempotency key for folding.
    pub unique_id: String,
    pub session_id: String,
    pub username: String,
    pub nas_address: String,
    pub framed_ip: Option<String>,
    pub start_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
    pub input_octets: i64,
    pub output_octets: i64,
    pub session_time: i64,
}

impl AccountingRecord {
    pub fn total_octets(&self) -> i64 {
        self.input_octets.saturating_add(self.output_octets)
    }

    /// Calendar date the usage is attributed to.
    pub fn usage_date(&self) -> NaiveDate {
        self.start_time.date_naive()
    }
}

/// Per-subscription, per-day usage totals.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageAggregate {
    pub subscription_id: Uuid,
    pub usage_date: NaiveDate,
    pub input_octets: i64,
    pub output_octets: i64,
    pub session_time: i64,
    pub session_count: i32,
    pub updated_utc: DateTime<Utc>,
}

impl UsageAggregate {
    pub fn total_octets(&self) -> i64 {
        self.input_octets.saturating_add(self.output_octets)
    }
}

/// Result of folding a group of accounting rows into one aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldResult {
    /// Rows newly folded in this call.
    pub folded_rows: u32,
    /// Rows discarded because their unique id was folded before.
    pub duplicate_rows: u32,
    /// Bytes added to the subscription's used quota.
    pub added_octets: i64,
}

/// Filter for reading usage aggregates.
#[derive(Debug, Clone, Default)]
pub struct UsageRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}
