//! Network control dispatch integration tests.

mod common;

use common::{date, Harness, ScriptedTransport, DEFAULT_SECRET, NAS_ADDRESS, NAS_SECRET};
use enforcement_service::coa::{CoaAction, CoaDispatcher, CoaResult, DeviceReply};
use enforcement_service::models::{ActiveSession, NasDevice, SubscriptionState, SuspensionReason};
use enforcement_service::services::MemoryRadius;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn session_on(nas_address: &str) -> ActiveSession {
    ActiveSession {
        nas_address: nas_address.to_string(),
        session_id: "acct-42".to_string(),
        framed_ip: Some("100.64.0.42".to_string()),
    }
}

#[tokio::test]
async fn no_session_means_nothing_is_sent() {
    let h = Harness::new();

    let result = h.dispatcher.disconnect("nobody").await;

    assert_eq!(result, CoaResult::NoActiveSession);
    assert!(h.transport.sent().is_empty());
    h.stop().await;
}

#[tokio::test]
async fn registered_device_uses_its_secret_and_port() {
    let h = Harness::new();
    h.radius.register_nas(NasDevice {
        nas_address: "10.0.0.9".to_string(),
        secret: "edge-secret".to_string(),
        coa_port: Some(1700),
    });
    h.radius.open_session("sam", session_on("10.0.0.9"));
    h.radius.open_session("tia", session_on(NAS_ADDRESS));

    assert_eq!(
        h.dispatcher.set_rate_limit("sam", "5M/5M").await,
        CoaResult::Success
    );
    assert_eq!(h.dispatcher.disconnect("tia").await, CoaResult::Success);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].secret, "edge-secret");
    assert_eq!(sent[0].port, 1700);
    assert_eq!(sent[0].action, CoaAction::SetRateLimit("5M/5M".to_string()));
    assert_eq!(sent[1].secret, NAS_SECRET);
    assert_eq!(sent[1].port, 3799);
    h.stop().await;
}

#[tokio::test]
async fn unknown_device_falls_back_to_default_secret() {
    let h = Harness::new();
    h.radius.open_session("uma", session_on("192.0.2.1"));

    assert_eq!(h.dispatcher.disconnect("uma").await, CoaResult::Success);
    assert_eq!(h.transport.sent()[0].secret, DEFAULT_SECRET);
    h.stop().await;
}

#[tokio::test]
async fn unknown_device_without_default_secret_is_unreachable() {
    let radius = Arc::new(MemoryRadius::new());
    radius.open_session("vic", session_on("192.0.2.1"));
    let transport = Arc::new(ScriptedTransport::new());
    let dispatcher = CoaDispatcher::new(
        radius,
        transport.clone(),
        3799,
        None,
        Duration::from_millis(200),
    );

    assert_eq!(
        dispatcher.disconnect("vic").await,
        CoaResult::DeviceUnreachable
    );
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn device_replies_are_classified() {
    let h = Harness::new();
    h.radius.open_session("wes", session_on(NAS_ADDRESS));
    h.radius.open_session("xan", session_on(NAS_ADDRESS));
    h.transport.reply_for(
        "wes",
        DeviceReply::Nak {
            error_cause: Some(503),
        },
    );
    h.transport.reply_for("xan", DeviceReply::NoResponse);

    assert_eq!(h.dispatcher.disconnect("wes").await, CoaResult::Rejected);
    assert_eq!(
        h.dispatcher.disconnect("xan").await,
        CoaResult::DeviceUnreachable
    );
    h.stop().await;
}

#[tokio::test]
async fn slow_device_times_out() {
    let radius = Arc::new(MemoryRadius::new());
    radius.open_session("yul", session_on("192.0.2.1"));
    let transport = Arc::new(ScriptedTransport::new());
    transport.delay_replies(Duration::from_secs(2));
    let dispatcher = CoaDispatcher::new(
        radius,
        transport,
        3799,
        Some(DEFAULT_SECRET.to_string()),
        Duration::from_millis(50),
    );

    let started = Instant::now();
    assert_eq!(
        dispatcher.disconnect("yul").await,
        CoaResult::DeviceUnreachable
    );
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn worker_records_failures_on_the_subscription() {
    let h = Harness::new();
    let plan = h.plan("Fiber 100", Decimal::new(4999, 2), None).await;
    let customer = h.customer("Zoe").await;
    let sub = h.subscribe(&customer, &plan, None, date(2026, 11, 1)).await;
    h.transport
        .reply_for(&sub.nas_username, DeviceReply::Nak { error_cause: None });

    let (updated, coa) = h
        .engine
        .set_status(
            sub.subscription_id,
            SubscriptionState::Suspended(SuspensionReason::Manual),
        )
        .await
        .unwrap();

    // The state change stands even though the device refused the disconnect.
    assert_eq!(
        updated.state(),
        SubscriptionState::Suspended(SuspensionReason::Manual)
    );
    assert_eq!(coa, Some(CoaResult::Rejected));

    let stored = h.reload(sub.subscription_id).await;
    assert_eq!(stored.last_coa_result.as_deref(), Some("rejected"));
    assert_eq!(stored.coa_failures, 1);
    assert!(stored.last_coa_utc.is_some());
    h.stop().await;
}
