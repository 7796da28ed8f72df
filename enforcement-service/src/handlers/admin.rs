//! Administrative endpoints: read views, payment entry, manual overrides
//! and manual job triggers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use super::AppState;
use crate::coa::CoaResult;
use crate::engine::{AppliedPayment, ApplyPayment};
use crate::models::{
    Invoice, Operation, PaymentMethod, Subscription, SubscriptionState, UsageAggregate, UsageRange,
};
use crate::scheduler::{JobOutcome, Trigger};

fn not_found(what: &str, id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("{} {} not found", what, id))
}

#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    #[serde(flatten)]
    pub subscription: Subscription,
    pub state: SubscriptionState,
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubscriptionView>, AppError> {
    let subscription = state
        .engine
        .store()
        .get_subscription(id)
        .await?
        .ok_or_else(|| not_found("Subscription", id))?;

    Ok(Json(SubscriptionView {
        state: subscription.state(),
        subscription,
    }))
}

#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_usage_range"))]
pub struct UsageQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

fn validate_usage_range(query: &UsageQuery) -> Result<(), ValidationError> {
    match (query.from, query.to) {
        (Some(from), Some(to)) if from > to => {
            Err(invalid("range", "from must not be after to"))
        }
        _ => Ok(()),
    }
}

fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

#[derive(Debug, Serialize)]
pub struct UsageView {
    pub subscription_id: Uuid,
    pub monthly_quota_bytes: Option<i64>,
    pub used_quota_bytes: i64,
    pub days: Vec<UsageAggregate>,
}

pub async fn get_usage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageView>, AppError> {
    query.validate()?;

    let store = state.engine.store();
    let subscription = store
        .get_subscription(id)
        .await?
        .ok_or_else(|| not_found("Subscription", id))?;
    let days = store
        .list_usage(
            id,
            &UsageRange {
                from: query.from,
                to: query.to,
            },
        )
        .await?;

    Ok(Json(UsageView {
        subscription_id: id,
        monthly_quota_bytes: subscription.monthly_quota_bytes,
        used_quota_bytes: subscription.used_quota_bytes,
        days,
    }))
}

pub async fn list_customer_invoices(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Invoice>>, AppError> {
    let store = state.engine.store();
    if store.get_customer(id).await?.is_none() {
        return Err(not_found("Customer", id));
    }
    Ok(Json(store.list_customer_invoices(id).await?))
}

#[derive(Debug, Deserialize, Validate)]
pub struct PaymentRequest {
    #[validate(custom(function = "validate_amount"))]
    pub amount: Decimal,
    #[serde(default)]
    #[validate(custom(function = "validate_method"))]
    pub method: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub payment_date: Option<NaiveDate>,
}

fn validate_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount <= Decimal::ZERO {
        return Err(invalid("positive", "Amount must be greater than zero"));
    }
    Ok(())
}

fn validate_method(method: &str) -> Result<(), ValidationError> {
    match PaymentMethod::parse(method) {
        Some(_) => Ok(()),
        None => Err(invalid("method", "Unknown payment method")),
    }
}

pub async fn apply_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PaymentRequest>,
) -> Result<(StatusCode, Json<AppliedPayment>), AppError> {
    req.validate()?;

    let applied = state
        .engine
        .apply_payment(ApplyPayment {
            invoice_id: id,
            amount: req.amount,
            method: req
                .method
                .as_deref()
                .and_then(PaymentMethod::parse)
                .unwrap_or(PaymentMethod::Other),
            reference: req.reference,
            payment_date: req.payment_date.unwrap_or_else(|| Utc::now().date_naive()),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(applied)))
}

#[derive(Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_status"))]
pub struct StatusRequest {
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

fn validate_status(req: &StatusRequest) -> Result<(), ValidationError> {
    match SubscriptionState::from_columns(&req.status, req.reason.as_deref()) {
        Some(_) => Ok(()),
        None => Err(invalid(
            "status",
            "suspended requires a reason, other states forbid one",
        )),
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub subscription: SubscriptionView,
    pub coa_result: Option<CoaResult>,
}

pub async fn set_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<StatusResponse>, AppError> {
    req.validate()?;
    let target = SubscriptionState::from_columns(&req.status, req.reason.as_deref())
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Invalid status {:?}", req.status)))?;

    let (subscription, coa_result) = state.engine.set_status(id, target).await?;
    Ok(Json(StatusResponse {
        subscription: SubscriptionView {
            state: subscription.state(),
            subscription,
        },
        coa_result,
    }))
}

pub async fn run_job(
    State(state): State<AppState>,
    Path(job): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let operation = Operation::from_string(&job)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Unknown job {:?}", job)))?;

    tracing::info!(operation = %operation, "Manual job trigger");
    let outcome = state.jobs.trigger(operation, Trigger::Manual).await?;
    let status = match outcome {
        JobOutcome::Coalesced => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}
