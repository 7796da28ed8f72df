//! Batch pass results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::coa::CoaResult;

/// Scheduled enforcement operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Aggregate,
    EvaluateQuotas,
    GenerateInvoices,
    SendReminders,
    ProcessOverdue,
    ResetQuotas,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Aggregate,
        Operation::EvaluateQuotas,
        Operation::GenerateInvoices,
        Operation::SendReminders,
        Operation::ProcessOverdue,
        Operation::ResetQuotas,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Aggregate => "aggregate",
            Operation::EvaluateQuotas => "evaluate_quotas",
            Operation::GenerateInvoices => "generate_invoices",
            Operation::SendReminders => "send_reminders",
            Operation::ProcessOverdue => "process_overdue",
            Operation::ResetQuotas => "reset_quotas",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        Operation::ALL.into_iter().find(|op| op.as_str() == s)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one entity's unit of work inside a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,
    Skipped(String),
    Failed(String),
}

impl ItemOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ItemOutcome::Success => "success",
            ItemOutcome::Skipped(_) => "skipped",
            ItemOutcome::Failed(_) => "failed",
        }
    }
}

/// A non-successful item, kept with enough context to reprocess it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReport {
    pub item: String,
    pub reason: String,
}

/// Network control results collected during a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoaTally {
    pub success: u32,
    pub no_active_session: u32,
    pub device_unreachable: u32,
    pub rejected: u32,
}

impl CoaTally {
    pub fn record(&mut self, result: CoaResult) {
        match result {
            CoaResult::Success => self.success += 1,
            CoaResult::NoActiveSession => self.no_active_session += 1,
            CoaResult::DeviceUnreachable => self.device_unreachable += 1,
            CoaResult::Rejected => self.rejected += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.success + self.no_active_session + self.device_unreachable + self.rejected
    }
}

/// Counts of successes, skips and failures for one pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub operation: Operation,
    pub succeeded: u32,
    pub skipped: u32,
    pub failed: u32,
    pub skips: Vec<ItemReport>,
    pub failures: Vec<ItemReport>,
    /// Subscriptions whose lifecycle state changed during the pass.
    pub transitions: u32,
    pub coa: CoaTally,
    /// Set when the pass stopped early at a cancellation checkpoint.
    pub cancelled: bool,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
}

impl BatchSummary {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            skips: Vec::new(),
            failures: Vec::new(),
            transitions: 0,
            coa: CoaTally::default(),
            cancelled: false,
            started_utc: Utc::now(),
            completed_utc: None,
        }
    }

    pub fn record(&mut self, item: impl fmt::Display, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Success => self.succeeded += 1,
            ItemOutcome::Skipped(reason) => {
                self.skipped += 1;
                self.skips.push(ItemReport {
                    item: item.to_string(),
                    reason,
                });
            }
            ItemOutcome::Failed(reason) => {
                self.failed += 1;
                self.failures.push(ItemReport {
                    item: item.to_string(),
                    reason,
                });
            }
        }
    }

    pub fn processed(&self) -> u32 {
        self.succeeded + self.skipped + self.failed
    }

    pub fn finish(mut self) -> Self {
        self.completed_utc = Some(Utc::now());
        self
    }

    /// Status label used for logs and metrics.
    pub fn status(&self) -> &'static str {
        if self.cancelled {
            "cancelled"
        } else if self.failed > 0 {
            "completed_with_failures"
        } else {
            "completed"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_each_outcome() {
        let mut summary = BatchSummary::new(Operation::EvaluateQuotas);
        summary.record("a", ItemOutcome::Success);
        summary.record("b", ItemOutcome::Skipped("no quota".into()));
        summary.record("c", ItemOutcome::Failed("db down".into()));
        summary.record("d", ItemOutcome::Success);

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.processed(), 4);
        assert_eq!(summary.failures[0].item, "c");
        assert_eq!(summary.status(), "completed_with_failures");
    }

    #[test]
    fn operation_names_parse_back() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_string(op.as_str()), Some(op));
        }
        assert_eq!(Operation::from_string("nope"), None);
    }
}
