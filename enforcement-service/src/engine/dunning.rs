//! Dunning: payment reminders and suspension of overdue accounts.

use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use super::{collect_coa, note_transition, Engine, PendingCoa};
use crate::coa::CoaAction;
use crate::context;
use crate::models::{
    BatchSummary, Invoice, InvoiceStatus, ItemOutcome, LifecycleUpdate, Operation, Subscription,
    SubscriptionState, SuspensionReason,
};
use crate::notify::NotificationTemplate;
use crate::services::metrics::record_batch_item;
use service_core::error::AppError;

impl Engine {
    /// Remind customers of invoices falling due at each configured offset.
    ///
    /// Reminders are matched on the exact due date, so a rerun on the same
    /// day may send a reminder twice.
    #[instrument(skip(self, cancel))]
    pub async fn send_reminders(
        &self,
        as_of: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, AppError> {
        let operation = Operation::SendReminders;
        let mut summary = BatchSummary::new(operation);

        'offsets: for &offset in &self.policy.reminder_days {
            let Some(due_date) = u64::try_from(offset)
                .ok()
                .and_then(|days| as_of.checked_add_days(Days::new(days)))
            else {
                continue;
            };
            let invoices = self.store.list_invoices_due_on(due_date).await?;
            tracing::debug!(offset, due_date = %due_date, count = invoices.len(), "Reminder candidates");

            for invoice in invoices {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    break 'offsets;
                }

                let outcome = self.remind(&invoice, offset).await;
                record_batch_item(operation.as_str(), outcome.label());
                summary.record(&invoice.invoice_number, outcome);
            }
        }

        Ok(summary.finish())
    }

    async fn remind(&self, invoice: &Invoice, days_until_due: i64) -> ItemOutcome {
        if invoice.status() != InvoiceStatus::Sent || invoice.balance() <= Decimal::ZERO {
            return ItemOutcome::Skipped("nothing to collect".to_string());
        }
        let Some(recipient) = self.recipient(invoice.customer_id).await else {
            return ItemOutcome::Skipped("customer not found".to_string());
        };

        tracing::info!(
            invoice_number = %invoice.invoice_number,
            days_until_due,
            "Sending payment reminder"
        );
        let context = context! {
            "customer_name" => recipient.name.clone(),
            "invoice_number" => invoice.invoice_number.clone(),
            "amount" => invoice.balance().to_string(),
            "currency" => invoice.currency.clone(),
            "due_date" => invoice.due_date.to_string(),
            "days_until_due" => days_until_due,
        };
        self.notifications
            .notify(recipient, NotificationTemplate::PaymentReminder, context);
        ItemOutcome::Success
    }

    /// Mark past-due invoices overdue and, past the grace period, suspend
    /// every active subscription of the customer.
    ///
    /// Subscriptions already suspended (for any reason) are left as they
    /// are, so a customer with several overdue invoices is acted on once.
    /// The pass ends by lifting overdue suspensions of customers that no
    /// longer owe anything past the grace period.
    #[instrument(skip(self, cancel))]
    pub async fn process_overdue(
        &self,
        as_of: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, AppError> {
        let operation = Operation::ProcessOverdue;
        let mut summary = BatchSummary::new(operation);
        let mut pending = Vec::new();

        let invoices = self.store.list_past_due_invoices(as_of).await?;
        tracing::info!(count = invoices.len(), as_of = %as_of, "Processing overdue invoices");

        for invoice in invoices {
            if cancel.is_cancelled() {
                tracing::info!("Overdue processing cancelled");
                summary.cancelled = true;
                break;
            }

            let outcome = match self
                .overdue_invoice(&invoice, as_of, &mut summary, &mut pending)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        invoice_number = %invoice.invoice_number,
                        customer_id = %invoice.customer_id,
                        error = %e,
                        "Failed to process overdue invoice"
                    );
                    ItemOutcome::Failed(e.to_string())
                }
            };
            record_batch_item(operation.as_str(), outcome.label());
            summary.record(&invoice.invoice_number, outcome);
        }

        if !summary.cancelled {
            self.lift_settled_suspensions(as_of, cancel, &mut summary, &mut pending)
                .await;
        }

        collect_coa(&mut summary.coa, pending).await;
        Ok(summary.finish())
    }

    async fn overdue_invoice(
        &self,
        invoice: &Invoice,
        as_of: NaiveDate,
        summary: &mut BatchSummary,
        pending: &mut Vec<PendingCoa>,
    ) -> Result<ItemOutcome, AppError> {
        // Re-checked at write time: a payment may have settled it since listing.
        let Some(current) = self
            .with_retry(&invoice.invoice_number, || {
                self.store.mark_invoice_overdue(invoice.invoice_id)
            })
            .await?
        else {
            return Ok(ItemOutcome::Skipped(
                "settled since it was listed".to_string(),
            ));
        };
        let invoice = &current;

        let days_overdue = (as_of - invoice.due_date).num_days();
        if days_overdue < self.policy.overdue_grace_days {
            return Ok(ItemOutcome::Skipped(format!(
                "{} days overdue, within grace period",
                days_overdue
            )));
        }

        let subscriptions = self
            .store
            .list_customer_subscriptions(invoice.customer_id)
            .await?;
        let mut suspended = Vec::new();
        for subscription in subscriptions {
            if subscription.state() != SubscriptionState::Active {
                continue;
            }
            let id = subscription.subscription_id;
            if let Some(updated) = self
                .with_retry(&id.to_string(), || self.suspend_for_overdue(id))
                .await?
            {
                note_transition(
                    summary,
                    id,
                    SubscriptionState::Active,
                    updated.state(),
                );
                pending.push(self.enqueue_coa(&updated, CoaAction::Disconnect).await);
                suspended.push(updated);
            }
        }

        if suspended.is_empty() {
            return Ok(ItemOutcome::Skipped("no active subscriptions".to_string()));
        }

        tracing::info!(
            invoice_number = %invoice.invoice_number,
            customer_id = %invoice.customer_id,
            days_overdue,
            suspended = suspended.len(),
            "Suspended subscriptions for overdue invoice"
        );
        if let Some(recipient) = self.recipient(invoice.customer_id).await {
            let context = context! {
                "customer_name" => recipient.name.clone(),
                "invoice_number" => invoice.invoice_number.clone(),
                "amount" => invoice.balance().to_string(),
                "currency" => invoice.currency.clone(),
                "days_overdue" => days_overdue,
            };
            self.notifications
                .notify(recipient, NotificationTemplate::ServiceSuspended, context);
        }
        Ok(ItemOutcome::Success)
    }

    /// Reactivate overdue suspensions of customers with nothing past the
    /// grace period left to pay. Covers payments that landed while the
    /// customer was being suspended and reactivations that failed.
    async fn lift_settled_suspensions(
        &self,
        as_of: NaiveDate,
        cancel: &CancellationToken,
        summary: &mut BatchSummary,
        pending: &mut Vec<PendingCoa>,
    ) {
        let suspended = SubscriptionState::Suspended(SuspensionReason::Overdue);
        let mut customers: Vec<Uuid> = match self.store.list_open_subscriptions().await {
            Ok(subscriptions) => subscriptions
                .into_iter()
                .filter(|s| s.state() == suspended)
                .map(|s| s.customer_id)
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to list suspended subscriptions");
                return;
            }
        };
        customers.sort_unstable();
        customers.dedup();

        for customer_id in customers {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let outcome = match self.in_arrears(customer_id, as_of).await {
                Ok(true) => continue,
                Ok(false) => {
                    let lifted = self.lift_overdue_suspensions(customer_id, pending).await;
                    for &id in &lifted.reactivated {
                        note_transition(summary, id, suspended, SubscriptionState::Active);
                    }
                    if lifted.reactivated.is_empty() && lifted.failed == 0 {
                        continue;
                    }
                    tracing::info!(
                        customer_id = %customer_id,
                        reactivated = lifted.reactivated.len(),
                        failed = lifted.failed,
                        "Lifted overdue suspensions of settled customer"
                    );
                    if lifted.failed > 0 {
                        ItemOutcome::Failed(format!(
                            "{} subscriptions could not be reactivated",
                            lifted.failed
                        ))
                    } else {
                        ItemOutcome::Success
                    }
                }
                Err(e) => {
                    tracing::error!(customer_id = %customer_id, error = %e, "Arrears check failed");
                    ItemOutcome::Failed(e.to_string())
                }
            };
            record_batch_item(Operation::ProcessOverdue.as_str(), outcome.label());
            summary.record(customer_id, outcome);
        }
    }

    /// Whether the customer has an unpaid invoice past the grace period.
    async fn in_arrears(&self, customer_id: Uuid, as_of: NaiveDate) -> Result<bool, AppError> {
        let invoices = self.store.list_customer_invoices(customer_id).await?;
        Ok(invoices.iter().any(|i| {
            i.status().is_collectible()
                && i.balance() > Decimal::ZERO
                && (as_of - i.due_date).num_days() >= self.policy.overdue_grace_days
        }))
    }

    /// Suspend one subscription if it is still active.
    async fn suspend_for_overdue(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            return Ok(None);
        };
        if subscription.state() != SubscriptionState::Active {
            return Ok(None);
        }
        let mut update = LifecycleUpdate::from_current(&subscription);
        update.state = SubscriptionState::Suspended(SuspensionReason::Overdue);
        self.store
            .update_lifecycle(subscription_id, subscription.version, update)
            .await
            .map(Some)
    }
}
