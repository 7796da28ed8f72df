//! Persistence seams used by the engine.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{
    AccountingRecord, ActiveSession, CreateCustomer, CreatePlan, CreateSubscription, Customer,
    FoldResult, Invoice, InvoiceItem, InvoiceStatus, IssueInvoice, LifecycleUpdate, NasDevice,
    RecordPayment, RecordedPayment, ServicePlan, Subscription, UsageAggregate, UsageRange,
};

/// Engine state store.
///
/// Lifecycle writes are version-checked: `update_lifecycle` and `reset_quota`
/// fail with [`AppError::Conflict`] when the row moved since it was read.
/// Usage folding never touches lifecycle columns or the version.
#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // Provisioning
    async fn create_customer(&self, input: &CreateCustomer) -> Result<Customer, AppError>;
    async fn create_plan(&self, input: &CreatePlan) -> Result<ServicePlan, AppError>;
    async fn create_subscription(
        &self,
        input: &CreateSubscription,
    ) -> Result<Subscription, AppError>;

    // Reads
    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError>;
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<ServicePlan>, AppError>;
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError>;
    /// Non-terminated subscription owning a NAS username.
    async fn find_subscription_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Subscription>, AppError>;
    /// Active subscriptions with a quota set.
    async fn list_quota_subscriptions(&self) -> Result<Vec<Subscription>, AppError>;
    /// Active subscriptions with `next_billing_date <= as_of`.
    async fn list_due_subscriptions(&self, as_of: NaiveDate)
        -> Result<Vec<Subscription>, AppError>;
    /// Every non-terminated subscription.
    async fn list_open_subscriptions(&self) -> Result<Vec<Subscription>, AppError>;
    async fn list_customer_subscriptions(
        &self,
        customer_id: Uuid,
    ) -> Result<Vec<Subscription>, AppError>;

    // Lifecycle
    async fn update_lifecycle(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        update: LifecycleUpdate,
    ) -> Result<Subscription, AppError>;
    /// Zero the used quota together with a lifecycle update.
    async fn reset_quota(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        update: LifecycleUpdate,
    ) -> Result<Subscription, AppError>;
    async fn record_coa_outcome(
        &self,
        subscription_id: Uuid,
        result: &str,
        failed: bool,
    ) -> Result<(), AppError>;

    // Usage
    /// Fold accounting rows into the day's aggregate and the used quota.
    /// Rows whose unique id was folded before are discarded.
    async fn fold_usage(
        &self,
        subscription_id: Uuid,
        usage_date: NaiveDate,
        records: &[AccountingRecord],
    ) -> Result<FoldResult, AppError>;
    async fn list_usage(
        &self,
        subscription_id: Uuid,
        range: &UsageRange,
    ) -> Result<Vec<UsageAggregate>, AppError>;
    async fn get_watermark(&self, name: &str) -> Result<Option<String>, AppError>;
    async fn set_watermark(&self, name: &str, value: &str) -> Result<(), AppError>;

    // Invoices and payments
    /// Number, insert and advance billing in one unit.
    async fn issue_invoice(&self, input: &IssueInvoice) -> Result<Invoice, AppError>;
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;
    async fn list_invoice_items(&self, invoice_id: Uuid) -> Result<Vec<InvoiceItem>, AppError>;
    async fn list_customer_invoices(&self, customer_id: Uuid) -> Result<Vec<Invoice>, AppError>;
    /// Sent, unpaid invoices due on `due_date`.
    async fn list_invoices_due_on(&self, due_date: NaiveDate) -> Result<Vec<Invoice>, AppError>;
    /// Collectible invoices with a positive balance due before `as_of`.
    async fn list_past_due_invoices(&self, as_of: NaiveDate) -> Result<Vec<Invoice>, AppError>;
    /// Mark an invoice overdue while it still has a balance to collect.
    /// `None` when it was settled, cancelled or removed since it was listed.
    async fn mark_invoice_overdue(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;
    /// Insert the payment and apply it to the invoice atomically.
    async fn record_payment(&self, input: &RecordPayment) -> Result<RecordedPayment, AppError>;

    // Job leases
    async fn try_acquire_lease(
        &self,
        job: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, AppError>;
    async fn release_lease(&self, job: &str, holder: &str) -> Result<(), AppError>;
}

/// Raw accounting rows.
#[async_trait]
pub trait AccountingSource: Send + Sync {
    /// Completed sessions that started or stopped after the watermark.
    async fn completed_sessions_since(
        &self,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Vec<AccountingRecord>, AppError>;
}

/// Live session and device lookups.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn find_active_session(&self, username: &str)
        -> Result<Option<ActiveSession>, AppError>;
    async fn find_nas(&self, nas_address: &str) -> Result<Option<NasDevice>, AppError>;
}

/// Validation shared by both store implementations when applying a payment.
pub(crate) fn check_payment(
    invoice: &Invoice,
    amount: Decimal,
) -> Result<(), AppError> {
    if amount <= Decimal::ZERO {
        return Err(AppError::PolicyViolation(anyhow::anyhow!(
            "Payment amount must be positive"
        )));
    }
    match invoice.status() {
        InvoiceStatus::Paid | InvoiceStatus::Cancelled | InvoiceStatus::Draft => {
            return Err(AppError::PolicyViolation(anyhow::anyhow!(
                "Invoice {} is {} and cannot take payments",
                invoice.invoice_number,
                invoice.status
            )));
        }
        _ => {}
    }
    if amount > invoice.balance() {
        return Err(AppError::PolicyViolation(anyhow::anyhow!(
            "Payment of {} exceeds outstanding balance {} on invoice {}",
            amount,
            invoice.balance(),
            invoice.invoice_number
        )));
    }
    Ok(())
}
