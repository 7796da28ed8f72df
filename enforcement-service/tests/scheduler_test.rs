//! Job runner and scheduler integration tests.

mod common;

use common::{date, Harness, GB};
use enforcement_service::config::SchedulerConfig;
use enforcement_service::engine::QUOTA_RESET_MARKER;
use enforcement_service::models::Operation;
use enforcement_service::scheduler::{JobOutcome, JobRunner, Scheduler, Trigger};
use enforcement_service::services::Store;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn runner(h: &Harness) -> JobRunner {
    JobRunner::new(
        h.engine.clone(),
        Duration::from_secs(60),
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn overlapping_triggers_are_coalesced() {
    let h = Harness::new();
    let plan = h.plan("Home 50", Decimal::new(4999, 2), None).await;
    let customer = h.customer("Abe").await;
    let sub = h
        .subscribe(&customer, &plan, Some(10 * GB), date(2026, 11, 1))
        .await;
    h.store.set_used_quota(sub.subscription_id, 11 * GB);
    // Keeps the first pass busy waiting for the device.
    h.transport.delay_replies(Duration::from_millis(300));

    let runner = runner(&h);
    let (first, second) = tokio::join!(
        runner.trigger(Operation::EvaluateQuotas, Trigger::Scheduled),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            runner
                .trigger(Operation::EvaluateQuotas, Trigger::Manual)
                .await
        }
    );

    assert!(matches!(first.unwrap(), JobOutcome::Completed { .. }));
    assert!(matches!(second.unwrap(), JobOutcome::Coalesced));
    assert_eq!(h.transport.sent().len(), 1);

    // Once the first run finished the operation can run again.
    let third = runner
        .trigger(Operation::EvaluateQuotas, Trigger::Manual)
        .await
        .unwrap();
    assert!(matches!(third, JobOutcome::Completed { .. }));
    h.stop().await;
}

#[tokio::test]
async fn lease_held_by_another_instance_coalesces() {
    let h = Harness::new();
    let runner = runner(&h);
    assert!(h
        .store
        .try_acquire_lease("generate_invoices", "other-instance", Duration::from_secs(60))
        .await
        .unwrap());

    let outcome = runner
        .trigger(Operation::GenerateInvoices, Trigger::Manual)
        .await
        .unwrap();
    assert!(matches!(outcome, JobOutcome::Coalesced));

    h.store
        .release_lease("generate_invoices", "other-instance")
        .await
        .unwrap();
    let outcome = runner
        .trigger(Operation::GenerateInvoices, Trigger::Manual)
        .await
        .unwrap();
    assert!(matches!(outcome, JobOutcome::Completed { .. }));
    h.stop().await;
}

#[tokio::test]
async fn scheduled_reset_runs_once_per_month() {
    let h = Harness::new();
    let runner = runner(&h);

    let first = runner
        .trigger(Operation::ResetQuotas, Trigger::Scheduled)
        .await
        .unwrap();
    assert!(matches!(first, JobOutcome::Completed { .. }));

    let second = runner
        .trigger(Operation::ResetQuotas, Trigger::Scheduled)
        .await
        .unwrap();
    assert!(matches!(second, JobOutcome::NotDue));

    // An operator can always force it.
    let forced = runner
        .trigger(Operation::ResetQuotas, Trigger::Manual)
        .await
        .unwrap();
    assert!(matches!(forced, JobOutcome::Completed { .. }));
    h.stop().await;
}

#[tokio::test]
async fn scheduler_runs_jobs_and_stops_on_shutdown() {
    let h = Harness::new();
    let shutdown = CancellationToken::new();
    let runner = Arc::new(JobRunner::new(
        h.engine.clone(),
        Duration::from_secs(60),
        shutdown.child_token(),
    ));
    let hour = Duration::from_secs(3600);
    let config = SchedulerConfig {
        enabled: true,
        aggregate_interval: hour,
        quota_interval: hour,
        billing_interval: hour,
        reminder_interval: hour,
        overdue_interval: hour,
        reset_check_interval: hour,
        lease_ttl: Duration::from_secs(60),
    };
    let handle = Scheduler::new(runner, config, shutdown.clone()).start();

    // The first tick fires immediately.
    let mut marker = None;
    for _ in 0..50 {
        marker = h.store.get_watermark(QUOTA_RESET_MARKER).await.unwrap();
        if marker.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(marker.is_some());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("Scheduler did not stop")
        .unwrap();
    h.stop().await;
}
