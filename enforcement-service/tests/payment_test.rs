//! Payment application and manual override integration tests.

mod common;

use common::{date, Harness};
use enforcement_service::coa::{CoaAction, CoaResult};
use enforcement_service::engine::ApplyPayment;
use enforcement_service::models::{
    Invoice, InvoiceStatus, LifecycleUpdate, PaymentMethod, Subscription, SubscriptionState,
    SuspensionReason,
};
use enforcement_service::notify::NotificationTemplate;
use enforcement_service::services::Store;
use rust_decimal::Decimal;
use service_core::error::AppError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

async fn invoiced(h: &Harness) -> (Subscription, Subscription, Invoice) {
    let plan = h.plan("Fiber 100", Decimal::new(4999, 2), None).await;
    let customer = h.customer("Pia").await;
    let billed = h.subscribe(&customer, &plan, None, date(2026, 9, 1)).await;
    let other = h.subscribe(&customer, &plan, None, date(2026, 12, 1)).await;
    h.engine
        .generate_invoices(date(2026, 9, 1), &CancellationToken::new())
        .await
        .unwrap();
    let invoice = h
        .store
        .list_customer_invoices(customer.customer_id)
        .await
        .unwrap()
        .remove(0);
    (billed, other, invoice)
}

fn payment(invoice: &Invoice, amount: Decimal, on: chrono::NaiveDate) -> ApplyPayment {
    ApplyPayment {
        invoice_id: invoice.invoice_id,
        amount,
        method: PaymentMethod::from_string("bank_transfer"),
        reference: Some("TRX-1".to_string()),
        payment_date: on,
    }
}

#[tokio::test]
async fn full_payment_reactivates_overdue_suspensions() {
    let h = Harness::new();
    let (billed, other, invoice) = invoiced(&h).await;
    h.engine
        .process_overdue(date(2026, 10, 12), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        h.reload(billed.subscription_id).await.state(),
        SubscriptionState::Suspended(SuspensionReason::Overdue)
    );

    let applied = h
        .engine
        .apply_payment(payment(&invoice, Decimal::new(4999, 2), date(2026, 10, 13)))
        .await
        .unwrap();

    assert_eq!(applied.new_status, InvoiceStatus::Paid);
    assert_eq!(applied.new_balance, Decimal::ZERO);
    assert!(applied.payment.payment_number.starts_with("PAY-202610-"));
    assert_eq!(applied.reactivated.len(), 2);
    for sub in [&billed, &other] {
        assert_eq!(
            h.reload(sub.subscription_id).await.state(),
            SubscriptionState::Active
        );
    }

    h.settle().await;
    let restored = h.notifier.of(NotificationTemplate::ServiceReactivated);
    assert_eq!(restored.len(), 1);
    assert!(restored[0].message.body_text.contains(&invoice.invoice_number));
    h.stop().await;
}

#[tokio::test]
async fn partial_payment_keeps_suspension() {
    let h = Harness::new();
    let (billed, _, invoice) = invoiced(&h).await;
    h.engine
        .process_overdue(date(2026, 10, 12), &CancellationToken::new())
        .await
        .unwrap();

    let applied = h
        .engine
        .apply_payment(payment(&invoice, Decimal::new(2000, 2), date(2026, 10, 13)))
        .await
        .unwrap();

    assert_eq!(applied.new_status, InvoiceStatus::Overdue);
    assert_eq!(applied.new_balance, Decimal::new(2999, 2));
    assert!(applied.reactivated.is_empty());
    assert_eq!(
        h.reload(billed.subscription_id).await.state(),
        SubscriptionState::Suspended(SuspensionReason::Overdue)
    );
    h.stop().await;
}

#[tokio::test]
async fn partial_payment_before_due_date_is_partially_paid() {
    let h = Harness::new();
    let (_, _, invoice) = invoiced(&h).await;

    let applied = h
        .engine
        .apply_payment(payment(&invoice, Decimal::new(1000, 2), date(2026, 9, 10)))
        .await
        .unwrap();

    assert_eq!(applied.new_status, InvoiceStatus::PartiallyPaid);
    assert_eq!(applied.invoice.paid_amount, Decimal::new(1000, 2));
    h.stop().await;
}

#[tokio::test]
async fn payment_does_not_lift_quota_suspension() {
    let h = Harness::new();
    let (billed, _, invoice) = invoiced(&h).await;
    h.store.force_lifecycle(
        billed.subscription_id,
        LifecycleUpdate {
            state: SubscriptionState::Suspended(SuspensionReason::QuotaExceeded),
            quota_warned: true,
            throttled: false,
        },
    );

    let applied = h
        .engine
        .apply_payment(payment(&invoice, Decimal::new(4999, 2), date(2026, 9, 15)))
        .await
        .unwrap();

    assert_eq!(applied.new_status, InvoiceStatus::Paid);
    assert!(applied.reactivated.is_empty());
    assert_eq!(
        h.reload(billed.subscription_id).await.state(),
        SubscriptionState::Suspended(SuspensionReason::QuotaExceeded)
    );
    h.stop().await;
}

#[tokio::test]
async fn reactivated_throttled_subscription_gets_fair_use_rate_again() {
    let h = Harness::new();
    let plan = h
        .plan("Unlimited FUP", Decimal::new(7999, 2), Some("2M/2M"))
        .await;
    let customer = h.customer("Quin").await;
    let sub = h.subscribe(&customer, &plan, None, date(2026, 9, 1)).await;
    h.engine
        .generate_invoices(date(2026, 9, 1), &CancellationToken::new())
        .await
        .unwrap();
    let invoice = h
        .store
        .list_customer_invoices(customer.customer_id)
        .await
        .unwrap()
        .remove(0);
    h.store.force_lifecycle(
        sub.subscription_id,
        LifecycleUpdate {
            state: SubscriptionState::Suspended(SuspensionReason::Overdue),
            quota_warned: true,
            throttled: true,
        },
    );

    let applied = h
        .engine
        .apply_payment(payment(&invoice, Decimal::new(7999, 2), date(2026, 10, 20)))
        .await
        .unwrap();

    assert_eq!(applied.reactivated, vec![sub.subscription_id]);
    assert_eq!(applied.coa.success, 1);
    assert_eq!(
        h.transport.sent_to(&sub.nas_username),
        vec![CoaAction::SetRateLimit("2M/2M".to_string())]
    );
    h.stop().await;
}

#[tokio::test]
async fn unknown_invoice_is_not_found() {
    let h = Harness::new();
    let result = h
        .engine
        .apply_payment(ApplyPayment {
            invoice_id: Uuid::new_v4(),
            amount: Decimal::ONE,
            method: PaymentMethod::from_string("cash"),
            reference: None,
            payment_date: date(2026, 10, 1),
        })
        .await;

    assert!(matches!(result, Err(AppError::NotFound(_))));
    assert!(h.store.payments().is_empty());
    h.stop().await;
}

#[tokio::test]
async fn overpayment_is_rejected_without_recording() {
    let h = Harness::new();
    let (_, _, invoice) = invoiced(&h).await;

    let result = h
        .engine
        .apply_payment(payment(&invoice, Decimal::new(5000, 2), date(2026, 9, 5)))
        .await;

    assert!(matches!(result, Err(AppError::PolicyViolation(_))));
    assert!(h.store.payments().is_empty());
    let stored = h.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.paid_amount, Decimal::ZERO);
    h.stop().await;
}

#[tokio::test]
async fn manual_suspension_disconnects_and_termination_is_final() {
    let h = Harness::new();
    let plan = h.plan("Fiber 100", Decimal::new(4999, 2), None).await;
    let customer = h.customer("Rae").await;
    let sub = h.subscribe(&customer, &plan, None, date(2026, 11, 1)).await;

    let (updated, coa) = h
        .engine
        .set_status(
            sub.subscription_id,
            SubscriptionState::Suspended(SuspensionReason::Manual),
        )
        .await
        .unwrap();
    assert_eq!(
        updated.state(),
        SubscriptionState::Suspended(SuspensionReason::Manual)
    );
    assert_eq!(coa, Some(CoaResult::Success));

    let (_, coa) = h
        .engine
        .set_status(sub.subscription_id, SubscriptionState::Active)
        .await
        .unwrap();
    assert_eq!(coa, None);

    h.engine
        .set_status(sub.subscription_id, SubscriptionState::Terminated)
        .await
        .unwrap();
    let result = h
        .engine
        .set_status(sub.subscription_id, SubscriptionState::Active)
        .await;
    assert!(matches!(result, Err(AppError::PolicyViolation(_))));

    assert_eq!(
        h.transport.sent_to(&sub.nas_username),
        vec![CoaAction::Disconnect, CoaAction::Disconnect]
    );
    h.stop().await;
}

#[tokio::test]
async fn failed_reactivation_does_not_fail_the_payment() {
    let h = Harness::new();
    let (billed, other, invoice) = invoiced(&h).await;
    h.engine
        .process_overdue(date(2026, 10, 12), &CancellationToken::new())
        .await
        .unwrap();
    h.faults.conflict_lifecycle_writes(100);

    let applied = h
        .engine
        .apply_payment(payment(&invoice, Decimal::new(4999, 2), date(2026, 10, 13)))
        .await
        .unwrap();

    assert_eq!(applied.new_status, InvoiceStatus::Paid);
    assert!(applied.reactivated.is_empty());
    assert_eq!(applied.reactivation_failures, 2);
    assert_eq!(h.store.payments().len(), 1);

    // The next overdue pass lifts what the payment could not.
    h.faults.clear();
    let summary = h
        .engine
        .process_overdue(date(2026, 10, 14), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.transitions, 2);
    for sub in [&billed, &other] {
        assert_eq!(
            h.reload(sub.subscription_id).await.state(),
            SubscriptionState::Active
        );
    }
    h.stop().await;
}
