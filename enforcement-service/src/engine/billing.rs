//! Recurring invoice generation.

use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use super::Engine;
use crate::context;
use crate::models::{
    first_of_month, first_of_next_month, period_prefix, BatchSummary, Invoice, IssueInvoice,
    ItemOutcome, Operation, ServicePlan, SubscriptionState,
};
use crate::notify::NotificationTemplate;
use crate::services::metrics::record_batch_item;
use service_core::error::AppError;

enum BillingStep {
    Issued(Invoice, ServicePlan),
    Skip(String),
}

impl Engine {
    /// Invoice every active subscription whose billing date has arrived.
    ///
    /// Numbers come from the store's per-period counter, so concurrent runs
    /// cannot hand out the same number. A subscription whose invoice fails
    /// keeps its billing date and is picked up by the next run.
    #[instrument(skip(self, cancel))]
    pub async fn generate_invoices(
        &self,
        as_of: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, AppError> {
        let operation = Operation::GenerateInvoices;
        let mut summary = BatchSummary::new(operation);

        let due = self.store.list_due_subscriptions(as_of).await?;
        tracing::info!(count = due.len(), as_of = %as_of, "Generating invoices");

        for candidate in due {
            if cancel.is_cancelled() {
                tracing::info!("Invoice generation cancelled");
                summary.cancelled = true;
                break;
            }

            let id = candidate.subscription_id;
            let step = self
                .with_retry(&id.to_string(), || self.billing_step(id, as_of))
                .await;

            let outcome = match step {
                Ok(BillingStep::Issued(invoice, plan)) => {
                    tracing::info!(
                        subscription_id = %id,
                        invoice_number = %invoice.invoice_number,
                        amount = %invoice.total_amount,
                        "Invoice generated"
                    );
                    let customer_name = self
                        .recipient(invoice.customer_id)
                        .await
                        .map(|r| r.name)
                        .unwrap_or_default();
                    let context = context! {
                        "customer_name" => customer_name,
                        "invoice_id" => invoice.invoice_id.to_string(),
                        "invoice_number" => invoice.invoice_number.clone(),
                        "plan_name" => plan.name,
                        "amount" => invoice.total_amount.to_string(),
                        "currency" => invoice.currency.clone(),
                        "due_date" => invoice.due_date.to_string(),
                    };
                    self.notify_customer(
                        invoice.customer_id,
                        NotificationTemplate::InvoiceGenerated,
                        context,
                    )
                    .await;
                    ItemOutcome::Success
                }
                Ok(BillingStep::Skip(reason)) => ItemOutcome::Skipped(reason),
                Err(e) => {
                    tracing::error!(
                        subscription_id = %id,
                        error = %e,
                        "Failed to generate invoice"
                    );
                    ItemOutcome::Failed(e.to_string())
                }
            };
            record_batch_item(operation.as_str(), outcome.label());
            summary.record(id, outcome);
        }

        Ok(summary.finish())
    }

    async fn billing_step(
        &self,
        subscription_id: Uuid,
        as_of: NaiveDate,
    ) -> Result<BillingStep, AppError> {
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            return Ok(BillingStep::Skip("subscription not found".to_string()));
        };
        if subscription.state() != SubscriptionState::Active {
            return Ok(BillingStep::Skip(format!(
                "subscription is {}",
                subscription.state().status().as_str()
            )));
        }
        if subscription.next_billing_date > as_of {
            return Ok(BillingStep::Skip("already billed".to_string()));
        }

        let Some(plan) = self.store.get_plan(subscription.plan_id).await? else {
            tracing::warn!(
                subscription_id = %subscription_id,
                plan_id = %subscription.plan_id,
                "Plan not found, subscription needs attention"
            );
            return Ok(BillingStep::Skip("plan not found".to_string()));
        };
        if plan.monthly_fee <= Decimal::ZERO {
            return Ok(BillingStep::Skip("plan has no monthly fee".to_string()));
        }

        let input = self.invoice_for(&subscription.customer_id, subscription_id, &plan, as_of);
        let invoice = self.store.issue_invoice(&input).await?;
        Ok(BillingStep::Issued(invoice, plan))
    }

    fn invoice_for(
        &self,
        customer_id: &Uuid,
        subscription_id: Uuid,
        plan: &ServicePlan,
        issue_date: NaiveDate,
    ) -> IssueInvoice {
        let next_period = first_of_next_month(issue_date);
        let currency = if plan.currency.is_empty() {
            self.policy.default_currency.clone()
        } else {
            plan.currency.clone()
        };
        let due_days = u64::try_from(self.policy.invoice_due_days).unwrap_or(0);

        IssueInvoice {
            number_prefix: period_prefix(&self.policy.invoice_prefix, issue_date),
            customer_id: *customer_id,
            subscription_id,
            currency,
            issue_date,
            due_date: issue_date
                .checked_add_days(Days::new(due_days))
                .unwrap_or(issue_date),
            description: format!("{} - Monthly Service", plan.name),
            amount: plan.monthly_fee,
            period_start: first_of_month(issue_date),
            period_end: next_period.pred_opt().unwrap_or(next_period),
            next_billing_date: next_period,
        }
    }
}
