//! In-process store and RADIUS directory.
//!
//! Backs `DRY_RUN` deployments and the test harness. Inherent methods
//! outside the trait impls are fixture hooks for seeding state. State lives
//! behind a single mutex, so every trait call is atomic with respect to the
//! others, which gives the same guarantees as the transactional Postgres
//! implementation.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::models::{
    format_document_number, AccountingRecord, ActiveSession, CreateCustomer, CreatePlan,
    CreateSubscription, Customer, FoldResult, Invoice, InvoiceItem, InvoiceStatus, IssueInvoice,
    LifecycleUpdate, NasDevice, Payment, RecordPayment, RecordedPayment, ServicePlan,
    Subscription, SubscriptionState, UsageAggregate, UsageRange,
};
use crate::services::store::{check_payment, AccountingSource, SessionDirectory, Store};

#[derive(Default)]
struct State {
    customers: HashMap<Uuid, Customer>,
    plans: HashMap<Uuid, ServicePlan>,
    subscriptions: HashMap<Uuid, Subscription>,
    aggregates: HashMap<(Uuid, NaiveDate), UsageAggregate>,
    folded: HashSet<String>,
    watermarks: HashMap<String, String>,
    invoices: HashMap<Uuid, Invoice>,
    items: Vec<InvoiceItem>,
    sequences: HashMap<String, i64>,
    payments: Vec<Payment>,
    leases: HashMap<String, (String, DateTime<Utc>)>,
    failing_invoices: HashSet<Uuid>,
}

impl State {
    fn sorted_subscriptions<F>(&self, filter: F) -> Vec<Subscription>
    where
        F: Fn(&Subscription) -> bool,
    {
        let mut rows: Vec<Subscription> = self
            .subscriptions
            .values()
            .filter(|s| filter(s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.created_utc
                .cmp(&b.created_utc)
                .then(a.subscription_id.cmp(&b.subscription_id))
        });
        rows
    }

    fn next_sequence(&mut self, prefix: &str, existing: usize) -> i64 {
        let value = self
            .sequences
            .entry(prefix.to_string())
            .and_modify(|v| *v += 1)
            .or_insert(existing as i64 + 1);
        *value
    }

    fn versioned(
        &mut self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> Result<&mut Subscription, AppError> {
        let subscription = self.subscriptions.get_mut(&subscription_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Subscription {} not found",
                subscription_id
            ))
        })?;
        if subscription.version != expected_version {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Subscription {} was modified concurrently",
                subscription_id
            )));
        }
        Ok(subscription)
    }
}

fn apply_lifecycle(subscription: &mut Subscription, update: LifecycleUpdate) {
    let (status, reason) = update.state.to_columns();
    subscription.status = status.to_string();
    subscription.suspension_reason = reason.map(str::to_string);
    subscription.quota_warned = update.quota_warned;
    subscription.throttled = update.throttled;
    subscription.version += 1;
    subscription.updated_utc = Utc::now();
}

/// In-memory [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrite the used quota, bypassing aggregation.
    pub fn set_used_quota(&self, subscription_id: Uuid, used_quota_bytes: i64) {
        if let Some(s) = self.lock().subscriptions.get_mut(&subscription_id) {
            s.used_quota_bytes = used_quota_bytes;
        }
    }

    /// Overwrite lifecycle columns as a concurrent writer would, bumping the version.
    pub fn force_lifecycle(&self, subscription_id: Uuid, update: LifecycleUpdate) {
        if let Some(s) = self.lock().subscriptions.get_mut(&subscription_id) {
            apply_lifecycle(s, update);
        }
    }

    /// Make `issue_invoice` fail for a subscription.
    pub fn fail_invoices_for(&self, subscription_id: Uuid) {
        self.lock().failing_invoices.insert(subscription_id);
    }

    pub fn payments(&self) -> Vec<Payment> {
        self.lock().payments.clone()
    }

    pub fn invoice_items(&self) -> Vec<InvoiceItem> {
        self.lock().items.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn create_customer(&self, input: &CreateCustomer) -> Result<Customer, AppError> {
        let customer = Customer {
            customer_id: Uuid::new_v4(),
            display_name: input.display_name.clone(),
            email: input.email.clone(),
            phone: input.phone.clone(),
            created_utc: Utc::now(),
        };
        self.lock()
            .customers
            .insert(customer.customer_id, customer.clone());
        Ok(customer)
    }

    async fn create_plan(&self, input: &CreatePlan) -> Result<ServicePlan, AppError> {
        let plan = ServicePlan {
            plan_id: Uuid::new_v4(),
            name: input.name.clone(),
            monthly_fee: input.monthly_fee,
            currency: input.currency.clone(),
            rate_limit: input.rate_limit.clone(),
            fup_enabled: input.fup_enabled,
            fup_rate_limit: input.fup_rate_limit.clone(),
            is_active: true,
            created_utc: Utc::now(),
        };
        self.lock().plans.insert(plan.plan_id, plan.clone());
        Ok(plan)
    }

    async fn create_subscription(
        &self,
        input: &CreateSubscription,
    ) -> Result<Subscription, AppError> {
        let mut state = self.lock();
        let taken = state
            .subscriptions
            .values()
            .any(|s| s.nas_username == input.nas_username && !s.state().is_terminated());
        if taken {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Username {} already in use",
                input.nas_username
            )));
        }

        let (status, reason) = input.state.to_columns();
        let now = Utc::now();
        let subscription = Subscription {
            subscription_id: Uuid::new_v4(),
            customer_id: input.customer_id,
            plan_id: input.plan_id,
            status: status.to_string(),
            suspension_reason: reason.map(str::to_string),
            monthly_quota_bytes: input.monthly_quota_bytes,
            used_quota_bytes: 0,
            quota_warned: false,
            throttled: false,
            next_billing_date: input.next_billing_date,
            nas_username: input.nas_username.clone(),
            coa_failures: 0,
            last_coa_result: None,
            last_coa_utc: None,
            version: 1,
            created_utc: now,
            updated_utc: now,
        };
        state
            .subscriptions
            .insert(subscription.subscription_id, subscription.clone());
        Ok(subscription)
    }

    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError> {
        Ok(self.lock().customers.get(&customer_id).cloned())
    }

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<ServicePlan>, AppError> {
        Ok(self.lock().plans.get(&plan_id).cloned())
    }

    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self.lock().subscriptions.get(&subscription_id).cloned())
    }

    async fn find_subscription_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Subscription>, AppError> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .find(|s| s.nas_username == username && !s.state().is_terminated())
            .cloned())
    }

    async fn list_quota_subscriptions(&self) -> Result<Vec<Subscription>, AppError> {
        Ok(self
            .lock()
            .sorted_subscriptions(|s| s.state() == SubscriptionState::Active && s.has_quota()))
    }

    async fn list_due_subscriptions(
        &self,
        as_of: NaiveDate,
    ) -> Result<Vec<Subscription>, AppError> {
        Ok(self.lock().sorted_subscriptions(|s| {
            s.state() == SubscriptionState::Active && s.next_billing_date <= as_of
        }))
    }

    async fn list_open_subscriptions(&self) -> Result<Vec<Subscription>, AppError> {
        Ok(self
            .lock()
            .sorted_subscriptions(|s| !s.state().is_terminated()))
    }

    async fn list_customer_subscriptions(
        &self,
        customer_id: Uuid,
    ) -> Result<Vec<Subscription>, AppError> {
        Ok(self
            .lock()
            .sorted_subscriptions(|s| s.customer_id == customer_id))
    }

    async fn update_lifecycle(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        update: LifecycleUpdate,
    ) -> Result<Subscription, AppError> {
        let mut state = self.lock();
        let subscription = state.versioned(subscription_id, expected_version)?;
        apply_lifecycle(subscription, update);
        Ok(subscription.clone())
    }

    async fn reset_quota(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
        update: LifecycleUpdate,
    ) -> Result<Subscription, AppError> {
        let mut state = self.lock();
        let subscription = state.versioned(subscription_id, expected_version)?;
        subscription.used_quota_bytes = 0;
        apply_lifecycle(subscription, update);
        Ok(subscription.clone())
    }

    async fn record_coa_outcome(
        &self,
        subscription_id: Uuid,
        result: &str,
        failed: bool,
    ) -> Result<(), AppError> {
        if let Some(s) = self.lock().subscriptions.get_mut(&subscription_id) {
            s.last_coa_result = Some(result.to_string());
            s.last_coa_utc = Some(Utc::now());
            s.coa_failures = if failed { s.coa_failures + 1 } else { 0 };
        }
        Ok(())
    }

    async fn fold_usage(
        &self,
        subscription_id: Uuid,
        usage_date: NaiveDate,
        records: &[AccountingRecord],
    ) -> Result<FoldResult, AppError> {
        let mut state = self.lock();
        if !state.subscriptions.contains_key(&subscription_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Subscription {} not found",
                subscription_id
            )));
        }

        let mut result = FoldResult::default();
        let (mut input_octets, mut output_octets, mut session_time) = (0i64, 0i64, 0i64);
        for record in records {
            if !state.folded.insert(record.unique_id.clone()) {
                result.duplicate_rows += 1;
                continue;
            }
            result.folded_rows += 1;
            input_octets = input_octets.saturating_add(record.input_octets);
            output_octets = output_octets.saturating_add(record.output_octets);
            session_time = session_time.saturating_add(record.session_time);
        }

        if result.folded_rows > 0 {
            let aggregate = state
                .aggregates
                .entry((subscription_id, usage_date))
                .or_insert_with(|| UsageAggregate {
                    subscription_id,
                    usage_date,
                    input_octets: 0,
                    output_octets: 0,
                    session_time: 0,
                    session_count: 0,
                    updated_utc: Utc::now(),
                });
            aggregate.input_octets += input_octets;
            aggregate.output_octets += output_octets;
            aggregate.session_time += session_time;
            aggregate.session_count += result.folded_rows as i32;
            aggregate.updated_utc = Utc::now();

            result.added_octets = input_octets.saturating_add(output_octets);
            if let Some(s) = state.subscriptions.get_mut(&subscription_id) {
                s.used_quota_bytes = s.used_quota_bytes.saturating_add(result.added_octets);
                s.updated_utc = Utc::now();
            }
        }

        Ok(result)
    }

    async fn list_usage(
        &self,
        subscription_id: Uuid,
        range: &UsageRange,
    ) -> Result<Vec<UsageAggregate>, AppError> {
        let mut rows: Vec<UsageAggregate> = self
            .lock()
            .aggregates
            .values()
            .filter(|a| a.subscription_id == subscription_id)
            .filter(|a| range.from.map_or(true, |from| a.usage_date >= from))
            .filter(|a| range.to.map_or(true, |to| a.usage_date <= to))
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.usage_date);
        Ok(rows)
    }

    async fn get_watermark(&self, name: &str) -> Result<Option<String>, AppError> {
        Ok(self.lock().watermarks.get(name).cloned())
    }

    async fn set_watermark(&self, name: &str, value: &str) -> Result<(), AppError> {
        self.lock()
            .watermarks
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn issue_invoice(&self, input: &IssueInvoice) -> Result<Invoice, AppError> {
        let mut state = self.lock();

        if state.failing_invoices.contains(&input.subscription_id) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to create invoice for subscription {}",
                input.subscription_id
            )));
        }

        let due = match state.subscriptions.get(&input.subscription_id) {
            None => {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "Subscription {} not found",
                    input.subscription_id
                )))
            }
            Some(s) => {
                s.state() == SubscriptionState::Active && s.next_billing_date <= input.issue_date
            }
        };
        if !due {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Subscription {} is no longer due for billing",
                input.subscription_id
            )));
        }

        let existing = state
            .invoices
            .values()
            .filter(|i| i.invoice_number.starts_with(&input.number_prefix))
            .count();
        let seq = state.next_sequence(&input.number_prefix, existing);

        let now = Utc::now();
        let invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            invoice_number: format_document_number(&input.number_prefix, seq),
            customer_id: input.customer_id,
            subscription_id: input.subscription_id,
            status: InvoiceStatus::Sent.as_str().to_string(),
            currency: input.currency.clone(),
            issue_date: input.issue_date,
            due_date: input.due_date,
            total_amount: input.amount,
            paid_amount: Decimal::ZERO,
            created_utc: now,
            updated_utc: now,
        };
        state.items.push(InvoiceItem {
            item_id: Uuid::new_v4(),
            invoice_id: invoice.invoice_id,
            subscription_id: input.subscription_id,
            description: input.description.clone(),
            quantity: Decimal::ONE,
            unit_price: input.amount,
            line_total: input.amount,
            period_start: input.period_start,
            period_end: input.period_end,
        });
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        if let Some(s) = state.subscriptions.get_mut(&input.subscription_id) {
            s.next_billing_date = input.next_billing_date;
            s.updated_utc = now;
        }

        Ok(invoice)
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        Ok(self.lock().invoices.get(&invoice_id).cloned())
    }

    async fn list_invoice_items(&self, invoice_id: Uuid) -> Result<Vec<InvoiceItem>, AppError> {
        Ok(self
            .lock()
            .items
            .iter()
            .filter(|i| i.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    async fn list_customer_invoices(&self, customer_id: Uuid) -> Result<Vec<Invoice>, AppError> {
        let mut rows: Vec<Invoice> = self
            .lock()
            .invoices
            .values()
            .filter(|i| i.customer_id == customer_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.issue_date
                .cmp(&a.issue_date)
                .then(b.invoice_number.cmp(&a.invoice_number))
        });
        Ok(rows)
    }

    async fn list_invoices_due_on(&self, due_date: NaiveDate) -> Result<Vec<Invoice>, AppError> {
        let mut rows: Vec<Invoice> = self
            .lock()
            .invoices
            .values()
            .filter(|i| {
                i.status() == InvoiceStatus::Sent
                    && i.due_date == due_date
                    && i.balance() > Decimal::ZERO
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.invoice_number.cmp(&b.invoice_number));
        Ok(rows)
    }

    async fn list_past_due_invoices(&self, as_of: NaiveDate) -> Result<Vec<Invoice>, AppError> {
        let mut rows: Vec<Invoice> = self
            .lock()
            .invoices
            .values()
            .filter(|i| {
                i.status().is_collectible() && i.due_date < as_of && i.balance() > Decimal::ZERO
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.due_date
                .cmp(&b.due_date)
                .then(a.invoice_number.cmp(&b.invoice_number))
        });
        Ok(rows)
    }

    async fn mark_invoice_overdue(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let mut state = self.lock();
        let Some(invoice) = state.invoices.get_mut(&invoice_id) else {
            return Ok(None);
        };
        if !invoice.status().is_collectible() || invoice.balance() <= Decimal::ZERO {
            return Ok(None);
        }
        invoice.status = InvoiceStatus::Overdue.as_str().to_string();
        invoice.updated_utc = Utc::now();
        Ok(Some(invoice.clone()))
    }

    async fn record_payment(&self, input: &RecordPayment) -> Result<RecordedPayment, AppError> {
        let mut state = self.lock();
        let current = state.invoices.get(&input.invoice_id).cloned().ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Invoice {} not found", input.invoice_id))
        })?;

        check_payment(&current, input.amount)?;

        let existing = state
            .payments
            .iter()
            .filter(|p| p.payment_number.starts_with(&input.number_prefix))
            .count();
        let seq = state.next_sequence(&input.number_prefix, existing);

        let payment = Payment {
            payment_id: Uuid::new_v4(),
            payment_number: format_document_number(&input.number_prefix, seq),
            invoice_id: current.invoice_id,
            customer_id: current.customer_id,
            amount: input.amount,
            currency: current.currency.clone(),
            method: input.method.as_str().to_string(),
            status: "completed".to_string(),
            reference: input.reference.clone(),
            payment_date: input.payment_date,
            created_utc: Utc::now(),
        };
        state.payments.push(payment.clone());

        let paid_amount = current.paid_amount + input.amount;
        let status = InvoiceStatus::derive(
            paid_amount,
            current.total_amount,
            current.due_date,
            input.payment_date,
        );
        let invoice = match state.invoices.get_mut(&input.invoice_id) {
            Some(invoice) => {
                invoice.paid_amount = paid_amount;
                invoice.status = status.as_str().to_string();
                invoice.updated_utc = Utc::now();
                invoice.clone()
            }
            None => {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "Invoice {} not found",
                    input.invoice_id
                )))
            }
        };

        Ok(RecordedPayment { payment, invoice })
    }

    async fn try_acquire_lease(
        &self,
        job: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut state = self.lock();
        let free = match state.leases.get(job) {
            Some((current, expires)) => current == holder || *expires < now,
            None => true,
        };
        if free {
            state
                .leases
                .insert(job.to_string(), (holder.to_string(), now + ttl));
        }
        Ok(free)
    }

    async fn release_lease(&self, job: &str, holder: &str) -> Result<(), AppError> {
        let mut state = self.lock();
        if matches!(state.leases.get(job), Some((current, _)) if current == holder) {
            state.leases.remove(job);
        }
        Ok(())
    }
}

#[derive(Default)]
struct RadiusState {
    accounting: Vec<AccountingRecord>,
    sessions: HashMap<String, ActiveSession>,
    devices: HashMap<String, NasDevice>,
}

/// In-memory [`AccountingSource`] and [`SessionDirectory`].
#[derive(Default)]
pub struct MemoryRadius {
    state: Mutex<RadiusState>,
}

impl MemoryRadius {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RadiusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_accounting(&self, record: AccountingRecord) {
        self.lock().accounting.push(record);
    }

    pub fn open_session(&self, username: &str, session: ActiveSession) {
        self.lock().sessions.insert(username.to_string(), session);
    }

    pub fn close_session(&self, username: &str) {
        self.lock().sessions.remove(username);
    }

    pub fn register_nas(&self, device: NasDevice) {
        self.lock()
            .devices
            .insert(device.nas_address.clone(), device);
    }
}

#[async_trait]
impl AccountingSource for MemoryRadius {
    async fn completed_sessions_since(
        &self,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<Vec<AccountingRecord>, AppError> {
        let mut rows: Vec<AccountingRecord> = self
            .lock()
            .accounting
            .iter()
            .filter(|r| match (r.stop_time, watermark) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(stop), Some(mark)) => r.start_time > mark || stop > mark,
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.stop_time);
        Ok(rows)
    }
}

#[async_trait]
impl SessionDirectory for MemoryRadius {
    async fn find_active_session(
        &self,
        username: &str,
    ) -> Result<Option<ActiveSession>, AppError> {
        Ok(self.lock().sessions.get(username).cloned())
    }

    async fn find_nas(&self, nas_address: &str) -> Result<Option<NasDevice>, AppError> {
        Ok(self.lock().devices.get(nas_address).cloned())
    }
}
