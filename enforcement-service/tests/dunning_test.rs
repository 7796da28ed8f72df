//! Payment reminder and overdue suspension integration tests.

mod common;

use common::{date, Harness};
use enforcement_service::coa::CoaAction;
use enforcement_service::models::{
    Customer, Invoice, InvoiceStatus, LifecycleUpdate, PaymentMethod, RecordPayment,
    Subscription, SubscriptionState, SuspensionReason,
};
use enforcement_service::notify::NotificationTemplate;
use enforcement_service::services::Store;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

/// A customer with two active subscriptions and one invoice due 2026-10-01.
async fn billed_customer(h: &Harness) -> (Customer, Vec<Subscription>, Invoice) {
    let plan = h.plan("Fiber 100", Decimal::new(4999, 2), None).await;
    let customer = h.customer("Omar").await;
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
    assert_eq!(invoice.due_date, date(2026, 10, 1));

    (customer, vec![billed, other], invoice)
}

#[tokio::test]
async fn overdue_past_grace_suspends_every_active_subscription() {
    let h = Harness::new();
    let (_, subs, invoice) = billed_customer(&h).await;

    let summary = h
        .engine
        .process_overdue(date(2026, 10, 11), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.transitions, 2);
    assert_eq!(summary.coa.success, 2);
    for sub in &subs {
        assert_eq!(
            h.reload(sub.subscription_id).await.state(),
            SubscriptionState::Suspended(SuspensionReason::Overdue)
        );
        assert_eq!(
            h.transport.sent_to(&sub.nas_username),
            vec![CoaAction::Disconnect]
        );
    }

    let stored = h.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status(), InvoiceStatus::Overdue);

    h.settle().await;
    let notices = h.notifier.of(NotificationTemplate::ServiceSuspended);
    assert_eq!(notices.len(), 1);
    assert!(notices[0].message.body_text.contains("Days Overdue: 10"));
    assert!(notices[0].message.sms.is_some());
    h.stop().await;
}

#[tokio::test]
async fn within_grace_only_marks_the_invoice() {
    let h = Harness::new();
    let (_, subs, invoice) = billed_customer(&h).await;

    let summary = h
        .engine
        .process_overdue(date(2026, 10, 5), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.transitions, 0);
    for sub in &subs {
        assert_eq!(
            h.reload(sub.subscription_id).await.state(),
            SubscriptionState::Active
        );
    }
    assert!(h.transport.sent().is_empty());

    let stored = h.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status(), InvoiceStatus::Overdue);
    h.stop().await;
}

#[tokio::test]
async fn existing_suspension_reason_is_not_overwritten() {
    let h = Harness::new();
    let (_, subs, _) = billed_customer(&h).await;
    h.store.force_lifecycle(
        subs[0].subscription_id,
        LifecycleUpdate {
            state: SubscriptionState::Suspended(SuspensionReason::QuotaExceeded),
            quota_warned: true,
            throttled: false,
        },
    );

    let summary = h
        .engine
        .process_overdue(date(2026, 10, 20), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.transitions, 1);
    assert_eq!(
        h.reload(subs[0].subscription_id).await.state(),
        SubscriptionState::Suspended(SuspensionReason::QuotaExceeded)
    );
    assert_eq!(
        h.reload(subs[1].subscription_id).await.state(),
        SubscriptionState::Suspended(SuspensionReason::Overdue)
    );
    assert!(h.transport.sent_to(&subs[0].nas_username).is_empty());

    // A second pass finds nothing left to suspend.
    let rerun = h
        .engine
        .process_overdue(date(2026, 10, 21), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(rerun.transitions, 0);
    assert_eq!(rerun.skipped, 1);
    h.stop().await;
}

#[tokio::test]
async fn reminders_go_out_on_configured_offsets() {
    let h = Harness::new();
    let (customer, _, invoice) = billed_customer(&h).await;

    let cancel = CancellationToken::new();
    let seven_days_before = h
        .engine
        .send_reminders(date(2026, 9, 24), &cancel)
        .await
        .unwrap();
    assert_eq!(seven_days_before.succeeded, 1);

    let off_schedule = h
        .engine
        .send_reminders(date(2026, 9, 25), &cancel)
        .await
        .unwrap();
    assert_eq!(off_schedule.processed(), 0);

    h.settle().await;
    let reminders = h.notifier.of(NotificationTemplate::PaymentReminder);
    assert_eq!(reminders.len(), 1);
    assert_eq!(reminders[0].recipient.email, customer.email);
    assert!(reminders[0]
        .message
        .subject
        .contains(&invoice.invoice_number));
    assert!(reminders[0].message.body_text.contains("due in 7 days"));
    h.stop().await;
}

#[tokio::test]
async fn payment_racing_the_overdue_pass_wins() {
    let h = Harness::new();
    let (_, subs, invoice) = billed_customer(&h).await;
    h.faults.settle_listed_invoices();

    let summary = h
        .engine
        .process_overdue(date(2026, 10, 11), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.transitions, 0);
    let stored = h.store.get_invoice(invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(stored.status(), InvoiceStatus::Paid);
    assert_eq!(stored.paid_amount, stored.total_amount);
    for sub in &subs {
        assert_eq!(
            h.reload(sub.subscription_id).await.state(),
            SubscriptionState::Active
        );
    }
    assert!(h.transport.sent().is_empty());

    h.settle().await;
    assert!(h.notifier.of(NotificationTemplate::ServiceSuspended).is_empty());
    h.stop().await;
}

#[tokio::test]
async fn settled_customers_are_reactivated_by_the_next_pass() {
    let h = Harness::new();
    let (_, subs, invoice) = billed_customer(&h).await;
    h.engine
        .process_overdue(date(2026, 10, 11), &CancellationToken::new())
        .await
        .unwrap();

    // Paid without going through payment application.
    h.store
        .record_payment(&RecordPayment {
            number_prefix: "PAY-202610-".to_string(),
            invoice_id: invoice.invoice_id,
            amount: invoice.total_amount,
            method: PaymentMethod::Cash,
            reference: None,
            payment_date: date(2026, 10, 12),
        })
        .await
        .unwrap();

    let summary = h
        .engine
        .process_overdue(date(2026, 10, 13), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.transitions, 2);
    for sub in &subs {
        assert_eq!(
            h.reload(sub.subscription_id).await.state(),
            SubscriptionState::Active
        );
    }
    h.stop().await;
}

#[tokio::test]
async fn reminders_skip_partially_paid_invoices() {
    let h = Harness::new();
    let (_, _, invoice) = billed_customer(&h).await;
    h.store
        .record_payment(&RecordPayment {
            number_prefix: "PAY-202609-".to_string(),
            invoice_id: invoice.invoice_id,
            amount: Decimal::new(1000, 2),
            method: PaymentMethod::Cash,
            reference: None,
            payment_date: date(2026, 9, 20),
        })
        .await
        .unwrap();

    let summary = h
        .engine
        .send_reminders(date(2026, 9, 24), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.processed(), 0);
    h.stop().await;
}
