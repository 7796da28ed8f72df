//! HTTP surface integration tests.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{date, Harness};
use enforcement_service::handlers::{router, AppState};
use enforcement_service::scheduler::JobRunner;
use enforcement_service::services::Store;
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

fn app(h: &Harness) -> Router {
    router(AppState {
        engine: h.engine.clone(),
        jobs: Arc::new(JobRunner::new(
            h.engine.clone(),
            Duration::from_secs(60),
            CancellationToken::new(),
        )),
    })
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.expect("Request failed");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_and_metrics_respond() {
    let h = Harness::new();

    let (status, body) = send(app(&h), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "enforcement-service");

    let (status, _) = send(app(&h), get("/ready")).await;
    assert_eq!(status, StatusCode::OK);

    let response = app(&h).oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .map(|v| v.to_str().unwrap_or("").contains("text/plain"))
        .unwrap_or(false));
    h.stop().await;
}

#[tokio::test]
async fn subscription_view_and_usage() {
    let h = Harness::new();
    let plan = h.plan("Fiber 100", Decimal::new(4999, 2), None).await;
    let customer = h.customer("Bea").await;
    let sub = h
        .subscribe(&customer, &plan, Some(5_000_000_000), date(2026, 11, 1))
        .await;

    let (status, body) = send(
        app(&h),
        get(&format!("/v1/subscriptions/{}", sub.subscription_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");
    assert_eq!(body["state"]["status"], "active");
    assert_eq!(body["nas_username"], sub.nas_username.as_str());

    let (status, body) = send(
        app(&h),
        get(&format!(
            "/v1/subscriptions/{}/usage?from=2026-10-01&to=2026-10-31",
            sub.subscription_id
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["monthly_quota_bytes"], 5_000_000_000i64);
    assert_eq!(body["days"], json!([]));

    let (status, body) = send(
        app(&h),
        get(&format!(
            "/v1/subscriptions/{}/usage?from=2026-10-31&to=2026-10-01",
            sub.subscription_id
        )),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Validation error");

    let (status, _) = send(
        app(&h),
        get(&format!("/v1/subscriptions/{}", Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    h.stop().await;
}

#[tokio::test]
async fn status_override_validates_reason() {
    let h = Harness::new();
    let plan = h.plan("Fiber 100", Decimal::new(4999, 2), None).await;
    let customer = h.customer("Cal").await;
    let sub = h.subscribe(&customer, &plan, None, date(2026, 11, 1)).await;
    let uri = format!("/v1/subscriptions/{}/status", sub.subscription_id);

    let (status, body) = send(app(&h), post_json(&uri, json!({ "status": "suspended" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Validation error");
    assert!(h.transport.sent().is_empty());

    let (status, body) = send(
        app(&h),
        post_json(&uri, json!({ "status": "suspended", "reason": "manual" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subscription"]["suspension_reason"], "manual");
    assert_eq!(body["coa_result"], "success");

    let (status, _) = send(app(&h), post_json(&uri, json!({ "status": "terminated" }))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(app(&h), post_json(&uri, json!({ "status": "active" }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    h.stop().await;
}

#[tokio::test]
async fn payments_and_invoice_listing() {
    let h = Harness::new();
    let plan = h.plan("Fiber 100", Decimal::new(4999, 2), None).await;
    let customer = h.customer("Dev").await;
    h.subscribe(&customer, &plan, None, date(2026, 9, 1)).await;
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

    let (status, body) = send(
        app(&h),
        get(&format!("/v1/customers/{}/invoices", customer.customer_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));

    let uri = format!("/v1/invoices/{}/payments", invoice.invoice_id);
    let (status, _) = send(
        app(&h),
        post_json(&uri, json!({ "amount": "60.00", "payment_date": "2026-09-10" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    for rejected in [
        json!({ "amount": "49.99", "method": "card" }),
        json!({ "amount": "0" }),
        json!({ "amount": "-5.00", "method": "cash" }),
    ] {
        let (status, body) = send(app(&h), post_json(&uri, rejected)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Validation error");
    }
    assert!(h.store.payments().is_empty());

    let (status, body) = send(
        app(&h),
        post_json(
            &uri,
            json!({ "amount": "49.99", "method": "credit_card", "payment_date": "2026-09-10" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["new_status"], "paid");
    assert_eq!(h.store.payments()[0].method, "credit_card");

    let (status, _) = send(
        app(&h),
        post_json(
            &format!("/v1/invoices/{}/payments", Uuid::new_v4()),
            json!({ "amount": "1.00" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        app(&h),
        get(&format!("/v1/customers/{}/invoices", Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    h.stop().await;
}

#[tokio::test]
async fn jobs_can_be_triggered_by_name() {
    let h = Harness::new();

    let (status, body) = send(app(&h), post_json("/v1/jobs/evaluate_quotas/run", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "completed");
    assert_eq!(body["summary"]["operation"], "evaluate_quotas");

    let (status, _) = send(app(&h), post_json("/v1/jobs/make_coffee/run", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    h.stop().await;
}
