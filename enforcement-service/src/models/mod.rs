//! Domain models for enforcement-service.

mod batch;
mod invoice;
mod payment;
mod plan;
mod session;
mod subscription;
mod usage;

pub use batch::{BatchSummary, CoaTally, ItemOutcome, ItemReport, Operation};
pub use invoice::{
    first_of_month, first_of_next_month, format_document_number, period_prefix, Invoice,
    InvoiceItem, InvoiceStatus, IssueInvoice,
};
pub use payment::{Payment, PaymentMethod, RecordPayment, RecordedPayment};
pub use plan::{CreateCustomer, CreatePlan, Customer, ServicePlan};
pub use session::{ActiveSession, NasDevice};
pub use subscription::{
    CreateSubscription, LifecycleUpdate, Subscription, SubscriptionState, SubscriptionStatus,
    SuspensionReason,
};
pub use usage::{AccountingRecord, FoldResult, UsageAggregate, UsageRange};
