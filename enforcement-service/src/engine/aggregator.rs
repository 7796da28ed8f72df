//! Usage aggregation: folds completed accounting sessions into per-day
//! aggregates and the subscription's used quota.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::Engine;
use crate::models::{AccountingRecord, BatchSummary, ItemOutcome, Operation, Subscription};
use crate::services::metrics::record_batch_item;
use service_core::error::AppError;

/// Watermark key for the aggregation pass.
pub const USAGE_WATERMARK: &str = "usage_aggregate";

#[derive(Debug, Clone)]
pub struct AggregateReport {
    pub summary: BatchSummary,
    /// Aggregate rows that received new usage.
    pub updated: u32,
    pub watermark: Option<DateTime<Utc>>,
}

impl Engine {
    /// Aggregate from the persisted watermark and persist the new one.
    pub async fn aggregate(&self, cancel: &CancellationToken) -> Result<AggregateReport, AppError> {
        let since = match self.store.get_watermark(USAGE_WATERMARK).await? {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map(|ts| ts.with_timezone(&Utc))
                    .map_err(|e| {
                        AppError::ConfigError(anyhow::anyhow!(
                            "Invalid usage watermark {:?}: {}",
                            raw,
                            e
                        ))
                    })?,
            ),
            None => None,
        };

        let report = self.aggregate_since(since, cancel).await?;

        if report.watermark != since {
            if let Some(mark) = report.watermark {
                self.store
                    .set_watermark(USAGE_WATERMARK, &mark.to_rfc3339())
                    .await?;
            }
        }
        Ok(report)
    }

    /// Fold completed sessions observed after `since`.
    ///
    /// The returned watermark never passes a session that failed to fold or
    /// was left unprocessed by cancellation, so the next pass reads it again.
    /// Already folded sessions are discarded by the store.
    #[instrument(skip(self, cancel))]
    pub async fn aggregate_since(
        &self,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<AggregateReport, AppError> {
        let operation = Operation::Aggregate;
        let mut summary = BatchSummary::new(operation);
        let records = self.accounting.completed_sessions_since(since).await?;

        let mut groups: BTreeMap<(String, NaiveDate), Vec<AccountingRecord>> = BTreeMap::new();
        let mut newest: Option<DateTime<Utc>> = None;
        for record in records {
            newest = newest.max(record.stop_time);
            groups
                .entry((record.username.clone(), record.usage_date()))
                .or_default()
                .push(record);
        }

        let mut owners: HashMap<String, Option<Subscription>> = HashMap::new();
        let mut held_back: Option<DateTime<Utc>> = None;
        let mut updated = 0u32;

        for ((username, usage_date), rows) in groups {
            let item = format!("{}@{}", username, usage_date);
            let earliest_stop = rows.iter().filter_map(|r| r.stop_time).min();

            if cancel.is_cancelled() {
                summary.cancelled = true;
                held_back = earliest_of(held_back, earliest_stop);
                continue;
            }

            let owner = match owners.get(&username) {
                Some(owner) => owner.clone(),
                None => {
                    let lookup = self
                        .with_retry(&item, || self.store.find_subscription_by_username(&username))
                        .await;
                    match lookup {
                        Ok(owner) => {
                            owners.insert(username.clone(), owner.clone());
                            owner
                        }
                        Err(e) => {
                            tracing::error!(username = %username, error = %e, "Subscription lookup failed");
                            held_back = earliest_of(held_back, earliest_stop);
                            record_batch_item(operation.as_str(), "failed");
                            summary.record(&item, ItemOutcome::Failed(e.to_string()));
                            continue;
                        }
                    }
                }
            };

            let Some(subscription) = owner else {
                tracing::warn!(
                    username = %username,
                    sessions = rows.len(),
                    "No subscription for accounting username, skipping"
                );
                record_batch_item(operation.as_str(), "skipped");
                summary.record(&item, ItemOutcome::Skipped("unknown username".to_string()));
                continue;
            };

            let folded = self
                .with_retry(&item, || {
                    self.store
                        .fold_usage(subscription.subscription_id, usage_date, &rows)
                })
                .await;

            let outcome = match folded {
                Ok(result) if result.folded_rows > 0 => {
                    updated += 1;
                    tracing::debug!(
                        subscription_id = %subscription.subscription_id,
                        usage_date = %usage_date,
                        folded_rows = result.folded_rows,
                        duplicate_rows = result.duplicate_rows,
                        added_octets = result.added_octets,
                        "Usage folded"
                    );
                    ItemOutcome::Success
                }
                Ok(_) => ItemOutcome::Skipped("already folded".to_string()),
                Err(e) => {
                    tracing::error!(
                        subscription_id = %subscription.subscription_id,
                        usage_date = %usage_date,
                        error = %e,
                        "Failed to fold usage"
                    );
                    held_back = earliest_of(held_back, earliest_stop);
                    ItemOutcome::Failed(e.to_string())
                }
            };
            record_batch_item(operation.as_str(), outcome.label());
            summary.record(&item, outcome);
        }

        let watermark = match held_back {
            // Just before the oldest unfolded session so it is read again.
            Some(stop) => {
                let mark = stop - Duration::microseconds(1);
                Some(since.map_or(mark, |since| mark.max(since)))
            }
            None => newest.max(since),
        };

        Ok(AggregateReport {
            summary: summary.finish(),
            updated,
            watermark,
        })
    }
}

fn earliest_of(
    current: Option<DateTime<Utc>>,
    candidate: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
