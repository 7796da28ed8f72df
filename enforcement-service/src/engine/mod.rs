//! Enforcement passes: aggregation, quota policy, billing, dunning and
//! payment application.
//!
//! Every batch pass isolates failures per item and reports them in a
//! [`BatchSummary`]. A subscriber's unit of work (re-read, decide, persist)
//! is retried on transient store errors; network control and notifications
//! are issued only after the unit committed.

pub mod aggregator;
pub mod billing;
pub mod dunning;
pub mod payments;
pub mod quota;

use chrono::NaiveDate;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::coa::{CoaAction, CoaQueue, CoaResult};
use crate::config::PolicyConfig;
use crate::models::{BatchSummary, CoaTally, Operation, Subscription, SubscriptionState};
use crate::notify::{NotificationDispatcher, NotificationTemplate, Recipient, TemplateContext};
use crate::services::metrics::{record_batch_run, record_error, record_transition};
use crate::services::{AccountingSource, Store};
use service_core::error::AppError;

pub use aggregator::{AggregateReport, USAGE_WATERMARK};
pub use payments::{AppliedPayment, ApplyPayment};
pub use quota::{evaluate, QuotaDecision, QUOTA_RESET_MARKER};

/// Shared context for all enforcement passes.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    accounting: Arc<dyn AccountingSource>,
    coa: CoaQueue,
    notifications: NotificationDispatcher,
    policy: PolicyConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        accounting: Arc<dyn AccountingSource>,
        coa: CoaQueue,
        notifications: NotificationDispatcher,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            store,
            accounting,
            coa,
            notifications,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn notifications(&self) -> &NotificationDispatcher {
        &self.notifications
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Run one scheduled operation to completion (or cancellation).
    pub async fn run(
        &self,
        operation: Operation,
        as_of: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, AppError> {
        let start = Instant::now();
        tracing::info!(operation = %operation, as_of = %as_of, "Starting batch pass");

        let result = match operation {
            Operation::Aggregate => self.aggregate(cancel).await.map(|r| r.summary),
            Operation::EvaluateQuotas => self.evaluate_all(cancel).await,
            Operation::GenerateInvoices => self.generate_invoices(as_of, cancel).await,
            Operation::SendReminders => self.send_reminders(as_of, cancel).await,
            Operation::ProcessOverdue => self.process_overdue(as_of, cancel).await,
            Operation::ResetQuotas => self.reset_quotas(as_of, cancel).await,
        };

        let elapsed = start.elapsed().as_secs_f64();
        match &result {
            Ok(summary) => {
                record_batch_run(operation.as_str(), summary.status(), elapsed);
                tracing::info!(
                    operation = %operation,
                    succeeded = summary.succeeded,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    transitions = summary.transitions,
                    coa_sent = summary.coa.total(),
                    coa_unreachable = summary.coa.device_unreachable,
                    cancelled = summary.cancelled,
                    duration_secs = elapsed,
                    "Batch pass finished"
                );
            }
            Err(e) => {
                record_batch_run(operation.as_str(), "error", elapsed);
                record_error(e.kind(), operation.as_str());
                tracing::error!(operation = %operation, error = %e, "Batch pass aborted");
            }
        }
        result
    }

    /// Run a unit of work, retrying transient store errors up to the
    /// configured number of attempts.
    pub(crate) async fn with_retry<T, F, Fut>(&self, unit: &str, mut work: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match work().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    tracing::warn!(
                        unit = %unit,
                        attempt = attempt,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) async fn recipient(&self, customer_id: Uuid) -> Option<Recipient> {
        match self.store.get_customer(customer_id).await {
            Ok(Some(customer)) => Some(Recipient {
                name: customer.display_name,
                email: customer.email,
                phone: customer.phone,
            }),
            Ok(None) => {
                tracing::warn!(customer_id = %customer_id, "Customer not found, notification dropped");
                None
            }
            Err(e) => {
                tracing::warn!(
                    customer_id = %customer_id,
                    error = %e,
                    "Customer lookup failed, notification dropped"
                );
                None
            }
        }
    }

    pub(crate) async fn notify_customer(
        &self,
        customer_id: Uuid,
        template: NotificationTemplate,
        context: TemplateContext,
    ) {
        if let Some(recipient) = self.recipient(customer_id).await {
            self.notifications.notify(recipient, template, context);
        }
    }

    /// Queue a network control action for a subscription.
    pub(crate) async fn enqueue_coa(
        &self,
        subscription: &Subscription,
        action: CoaAction,
    ) -> PendingCoa {
        match self
            .coa
            .request(subscription.subscription_id, &subscription.nas_username, action)
            .await
        {
            Ok(rx) => PendingCoa::Queued(rx),
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription.subscription_id,
                    username = %subscription.nas_username,
                    error = %e,
                    "Failed to queue CoA request"
                );
                PendingCoa::Failed
            }
        }
    }

    /// Fire a network control action without waiting for its result.
    pub(crate) async fn send_coa(&self, subscription: &Subscription, action: CoaAction) {
        // Dropping the receiver leaves the worker's outcome bookkeeping intact.
        let _ = self.enqueue_coa(subscription, action).await;
    }
}

/// A queued control action whose result is tallied later.
pub(crate) enum PendingCoa {
    Queued(oneshot::Receiver<CoaResult>),
    Failed,
}

impl PendingCoa {
    /// A dropped reply means the worker never reached the device.
    pub(crate) async fn wait(self) -> CoaResult {
        match self {
            PendingCoa::Queued(rx) => rx.await.unwrap_or(CoaResult::DeviceUnreachable),
            PendingCoa::Failed => CoaResult::DeviceUnreachable,
        }
    }
}

/// Wait for every queued action and count the results.
pub(crate) async fn collect_coa(tally: &mut CoaTally, pending: Vec<PendingCoa>) {
    for item in pending {
        tally.record(item.wait().await);
    }
}

pub(crate) fn note_transition(
    summary: &mut BatchSummary,
    subscription_id: Uuid,
    from: SubscriptionState,
    to: SubscriptionState,
) {
    summary.transitions += 1;
    log_transition(subscription_id, from, to);
}

pub(crate) fn log_transition(subscription_id: Uuid, from: SubscriptionState, to: SubscriptionState) {
    let reason = to.reason().map(|r| r.as_str()).unwrap_or("none");
    record_transition(to.status().as_str(), reason);
    tracing::info!(
        subscription_id = %subscription_id,
        from = from.status().as_str(),
        to = to.status().as_str(),
        reason = reason,
        "Subscription state changed"
    );
}
