//! Payment application and manual lifecycle overrides.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use super::{collect_coa, log_transition, Engine, PendingCoa};
use crate::coa::{CoaAction, CoaResult};
use crate::context;
use crate::models::{
    period_prefix, CoaTally, Invoice, InvoiceStatus, LifecycleUpdate, Payment, PaymentMethod,
    RecordPayment, Subscription, SubscriptionState, SuspensionReason,
};
use crate::notify::NotificationTemplate;
use crate::services::metrics::record_error;
use service_core::error::AppError;

#[derive(Debug, Clone)]
pub struct ApplyPayment {
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub payment_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedPayment {
    pub payment: Payment,
    pub invoice: Invoice,
    pub new_balance: Decimal,
    pub new_status: InvoiceStatus,
    /// Subscriptions brought back from an overdue suspension.
    pub reactivated: Vec<Uuid>,
    /// Overdue suspensions that could not be lifted. The payment stands;
    /// the next overdue pass lifts them.
    pub reactivation_failures: u32,
    pub coa: CoaTally,
}

/// Result of lifting a customer's overdue suspensions.
#[derive(Debug, Default)]
pub(crate) struct Reactivation {
    pub reactivated: Vec<Uuid>,
    pub failed: u32,
}

impl Engine {
    /// Record a payment against an invoice.
    ///
    /// When the invoice becomes paid, the customer's overdue suspensions are
    /// lifted. Quota and manual suspensions are not touched.
    #[instrument(skip(self, input), fields(invoice_id = %input.invoice_id, amount = %input.amount))]
    pub async fn apply_payment(&self, input: ApplyPayment) -> Result<AppliedPayment, AppError> {
        if self.store.get_invoice(input.invoice_id).await?.is_none() {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Invoice {} not found",
                input.invoice_id
            )));
        }

        // Not retried: a lost reply after commit would record the payment twice.
        let recorded = self
            .store
            .record_payment(&RecordPayment {
                number_prefix: period_prefix(&self.policy.payment_prefix, input.payment_date),
                invoice_id: input.invoice_id,
                amount: input.amount,
                method: input.method,
                reference: input.reference.clone(),
                payment_date: input.payment_date,
            })
            .await?;

        let invoice = recorded.invoice;
        let new_status = invoice.status();
        tracing::info!(
            invoice_number = %invoice.invoice_number,
            payment_number = %recorded.payment.payment_number,
            new_status = new_status.as_str(),
            balance = %invoice.balance(),
            "Payment applied"
        );

        // The payment has committed: nothing below may fail the call.
        let mut coa = CoaTally::default();
        let mut lifted = Reactivation::default();
        if new_status == InvoiceStatus::Paid {
            let mut pending = Vec::new();
            lifted = self
                .lift_overdue_suspensions(invoice.customer_id, &mut pending)
                .await;
            collect_coa(&mut coa, pending).await;

            if !lifted.reactivated.is_empty() {
                let customer_name = self
                    .recipient(invoice.customer_id)
                    .await
                    .map(|r| r.name)
                    .unwrap_or_default();
                let plan_name = self
                    .plan_name_for(lifted.reactivated.first().copied())
                    .await;
                let context = context! {
                    "customer_name" => customer_name,
                    "invoice_number" => invoice.invoice_number.clone(),
                    "amount" => recorded.payment.amount.to_string(),
                    "currency" => invoice.currency.clone(),
                    "plan_name" => plan_name,
                };
                self.notify_customer(
                    invoice.customer_id,
                    NotificationTemplate::ServiceReactivated,
                    context,
                )
                .await;
            }
        }

        Ok(AppliedPayment {
            new_balance: invoice.balance(),
            new_status,
            payment: recorded.payment,
            invoice,
            reactivated: lifted.reactivated,
            reactivation_failures: lifted.failed,
            coa,
        })
    }

    /// Bring every overdue-suspended subscription of a customer back to
    /// active. Each subscription is its own unit; failures are counted and
    /// logged, never propagated.
    pub(crate) async fn lift_overdue_suspensions(
        &self,
        customer_id: Uuid,
        pending: &mut Vec<PendingCoa>,
    ) -> Reactivation {
        let suspended = SubscriptionState::Suspended(SuspensionReason::Overdue);
        let mut lifted = Reactivation::default();

        let subscriptions = match self.store.list_customer_subscriptions(customer_id).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                tracing::error!(
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to list subscriptions for reactivation"
                );
                lifted.failed += 1;
                return lifted;
            }
        };

        for subscription in subscriptions {
            if subscription.state() != suspended {
                continue;
            }
            let id = subscription.subscription_id;
            let updated = match self
                .with_retry(&id.to_string(), || self.reactivate(id, suspended))
                .await
            {
                Ok(Some(updated)) => updated,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %id,
                        customer_id = %customer_id,
                        error = %e,
                        "Failed to lift overdue suspension"
                    );
                    record_error(e.kind(), "reactivate");
                    lifted.failed += 1;
                    continue;
                }
            };
            log_transition(id, suspended, SubscriptionState::Active);

            if updated.throttled {
                if let Some(rate) = self.fair_use_rate(&updated).await {
                    pending.push(
                        self.enqueue_coa(&updated, CoaAction::SetRateLimit(rate))
                            .await,
                    );
                }
            }
            lifted.reactivated.push(id);
        }
        lifted
    }

    /// Move a subscription from `from` back to active if it is still there.
    async fn reactivate(
        &self,
        subscription_id: Uuid,
        from: SubscriptionState,
    ) -> Result<Option<Subscription>, AppError> {
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            return Ok(None);
        };
        if subscription.state() != from {
            return Ok(None);
        }
        let mut update = LifecycleUpdate::from_current(&subscription);
        update.state = SubscriptionState::Active;
        self.store
            .update_lifecycle(subscription_id, subscription.version, update)
            .await
            .map(Some)
    }

    async fn fair_use_rate(&self, subscription: &Subscription) -> Option<String> {
        match self.store.get_plan(subscription.plan_id).await {
            Ok(Some(plan)) => plan.throttle_rate().map(str::to_string),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription.subscription_id,
                    error = %e,
                    "Plan lookup failed, fair use rate not restored"
                );
                None
            }
        }
    }

    async fn plan_name_for(&self, subscription_id: Option<Uuid>) -> String {
        let Some(id) = subscription_id else {
            return String::new();
        };
        match self.store.get_subscription(id).await {
            Ok(Some(subscription)) => match self.store.get_plan(subscription.plan_id).await {
                Ok(Some(plan)) => plan.name,
                _ => String::new(),
            },
            _ => String::new(),
        }
    }

    /// Operator override of a subscription's lifecycle state.
    ///
    /// Bypasses quota and dunning policy but keeps the state invariant:
    /// a terminated subscription cannot change. Leaving the active state
    /// disconnects the live session.
    #[instrument(skip(self))]
    pub async fn set_status(
        &self,
        subscription_id: Uuid,
        target: SubscriptionState,
    ) -> Result<(Subscription, Option<CoaResult>), AppError> {
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Subscription {} not found",
                    subscription_id
                ))
            })?;

        let current = subscription.state();
        if current.is_terminated() {
            return Err(AppError::PolicyViolation(anyhow::anyhow!(
                "Subscription {} is terminated",
                subscription_id
            )));
        }
        if current == target {
            return Ok((subscription, None));
        }

        let mut update = LifecycleUpdate::from_current(&subscription);
        update.state = target;
        let updated = self
            .store
            .update_lifecycle(subscription_id, subscription.version, update)
            .await?;
        log_transition(subscription_id, current, target);

        let leaves_service = current == SubscriptionState::Active
            && matches!(
                target,
                SubscriptionState::Suspended(_) | SubscriptionState::Terminated
            );
        let coa = if leaves_service {
            Some(
                self.enqueue_coa(&updated, CoaAction::Disconnect)
                    .await
                    .wait()
                    .await,
            )
        } else {
            None
        };

        Ok((updated, coa))
    }
}
