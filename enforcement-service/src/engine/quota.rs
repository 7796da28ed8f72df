//! Quota policy: warn, throttle or suspend against the monthly quota, and
//! the monthly cycle reset.

use chrono::{Datelike, NaiveDate};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use super::{collect_coa, note_transition, Engine, PendingCoa};
use crate::coa::CoaAction;
use crate::context;
use crate::models::{
    BatchSummary, ItemOutcome, LifecycleUpdate, Operation, ServicePlan, Subscription,
    SubscriptionState, SuspensionReason,
};
use crate::notify::{format_bytes, NotificationTemplate};
use crate::services::metrics::record_batch_item;
use service_core::error::AppError;

/// Marker holding the year-month of the last completed quota reset.
pub const QUOTA_RESET_MARKER: &str = "quota_reset_month";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    None,
    Warn,
    Throttle { rate: String },
    Suspend,
}

/// Decide what the quota policy requires for a subscription.
///
/// Depends only on the used bytes, the quota, the plan's fair-use settings
/// and the threshold. A plan with fair use enabled but no reduced rate is a
/// configuration error.
pub fn evaluate(
    subscription: &Subscription,
    plan: &ServicePlan,
    warning_threshold: f64,
) -> Result<QuotaDecision, AppError> {
    let quota = match subscription.monthly_quota_bytes {
        Some(quota) if quota > 0 => quota,
        _ => return Ok(QuotaDecision::None),
    };
    let used = subscription.used_quota_bytes;

    if used >= quota {
        if !plan.fup_enabled {
            return Ok(QuotaDecision::Suspend);
        }
        return match plan.throttle_rate() {
            Some(rate) => Ok(QuotaDecision::Throttle {
                rate: rate.to_string(),
            }),
            None => Err(AppError::ConfigError(anyhow::anyhow!(
                "Plan {} has fair use enabled but no reduced rate",
                plan.name
            ))),
        };
    }

    if used as f64 >= warning_threshold * quota as f64 {
        Ok(QuotaDecision::Warn)
    } else {
        Ok(QuotaDecision::None)
    }
}

/// What a committed quota step still has to send.
struct QuotaEffects {
    subscription: Subscription,
    plan: ServicePlan,
    transition: Option<(SubscriptionState, SubscriptionState)>,
    coa: Option<CoaAction>,
    notification: Option<NotificationTemplate>,
}

enum Step {
    Done(QuotaEffects),
    Skip(String),
}

fn usage_percentage(subscription: &Subscription) -> i64 {
    match subscription.monthly_quota_bytes {
        Some(quota) if quota > 0 => {
            ((subscription.used_quota_bytes as i128 * 100) / quota as i128) as i64
        }
        _ => 0,
    }
}

fn month_marker(date: NaiveDate) -> String {
    format!("{}-{:02}", date.year(), date.month())
}

impl Engine {
    /// Evaluate every active subscription with a quota.
    #[instrument(skip(self, cancel))]
    pub async fn evaluate_all(&self, cancel: &CancellationToken) -> Result<BatchSummary, AppError> {
        let operation = Operation::EvaluateQuotas;
        let mut summary = BatchSummary::new(operation);
        let mut pending = Vec::new();

        let candidates = self.store.list_quota_subscriptions().await?;
        tracing::info!(count = candidates.len(), "Evaluating quotas");

        for candidate in candidates {
            if cancel.is_cancelled() {
                tracing::info!("Quota evaluation cancelled");
                summary.cancelled = true;
                break;
            }

            let id = candidate.subscription_id;
            let step = self
                .with_retry(&id.to_string(), || self.quota_step(id))
                .await;

            let outcome = match step {
                Ok(Step::Done(effects)) => {
                    self.apply_quota_effects(&mut summary, &mut pending, effects)
                        .await;
                    ItemOutcome::Success
                }
                Ok(Step::Skip(reason)) => ItemOutcome::Skipped(reason),
                Err(AppError::ConfigError(e)) => {
                    tracing::warn!(subscription_id = %id, error = %e, "Quota check skipped");
                    ItemOutcome::Skipped(e.to_string())
                }
                Err(e) => {
                    tracing::error!(subscription_id = %id, error = %e, "Quota check failed");
                    ItemOutcome::Failed(e.to_string())
                }
            };
            record_batch_item(operation.as_str(), outcome.label());
            summary.record(id, outcome);
        }

        collect_coa(&mut summary.coa, pending).await;
        Ok(summary.finish())
    }

    /// Re-read, decide and persist one subscription's quota state.
    async fn quota_step(&self, subscription_id: Uuid) -> Result<Step, AppError> {
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            return Ok(Step::Skip("subscription not found".to_string()));
        };
        let current = subscription.state();
        if current != SubscriptionState::Active {
            return Ok(Step::Skip(format!(
                "subscription is {}",
                current.status().as_str()
            )));
        }
        let Some(plan) = self.store.get_plan(subscription.plan_id).await? else {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Plan {} not found",
                subscription.plan_id
            )));
        };

        let decision = evaluate(&subscription, &plan, self.policy.quota_warning_threshold)?;
        let mut update = LifecycleUpdate::from_current(&subscription);
        let (coa, notification) = match decision {
            QuotaDecision::None => (None, None),
            QuotaDecision::Warn if subscription.quota_warned => (None, None),
            QuotaDecision::Warn => {
                update.quota_warned = true;
                (None, Some(NotificationTemplate::QuotaWarning))
            }
            QuotaDecision::Throttle { .. } if subscription.throttled => (None, None),
            QuotaDecision::Throttle { rate } => {
                update.throttled = true;
                (
                    Some(CoaAction::SetRateLimit(rate)),
                    Some(NotificationTemplate::FupApplied),
                )
            }
            QuotaDecision::Suspend => {
                update.state = SubscriptionState::Suspended(SuspensionReason::QuotaExceeded);
                (
                    Some(CoaAction::Disconnect),
                    Some(NotificationTemplate::QuotaExceeded),
                )
            }
        };

        if update == LifecycleUpdate::from_current(&subscription) {
            return Ok(Step::Done(QuotaEffects {
                subscription,
                plan,
                transition: None,
                coa: None,
                notification: None,
            }));
        }

        let updated = self
            .store
            .update_lifecycle(subscription_id, subscription.version, update)
            .await?;
        let transition = (current != update.state).then_some((current, update.state));

        Ok(Step::Done(QuotaEffects {
            subscription: updated,
            plan,
            transition,
            coa,
            notification,
        }))
    }

    async fn apply_quota_effects(
        &self,
        summary: &mut BatchSummary,
        pending: &mut Vec<PendingCoa>,
        effects: QuotaEffects,
    ) {
        let QuotaEffects {
            subscription,
            plan,
            transition,
            coa,
            notification,
        } = effects;

        if let Some((from, to)) = transition {
            note_transition(summary, subscription.subscription_id, from, to);
        }

        let new_speed = match &coa {
            Some(CoaAction::SetRateLimit(rate)) => rate.clone(),
            _ => String::new(),
        };
        if let Some(action) = coa {
            pending.push(self.enqueue_coa(&subscription, action).await);
        }

        if let Some(template) = notification {
            let customer_name = self
                .recipient(subscription.customer_id)
                .await
                .map(|r| r.name)
                .unwrap_or_default();
            let context = context! {
                "customer_name" => customer_name,
                "plan_name" => plan.name,
                "percentage" => usage_percentage(&subscription),
                "used_quota" => format_bytes(subscription.used_quota_bytes),
                "total_quota" => format_bytes(subscription.monthly_quota_bytes.unwrap_or(0)),
                "new_speed" => new_speed,
            };
            self.notify_customer(subscription.customer_id, template, context)
                .await;
        }
    }

    /// Run the monthly reset unless it already ran for the month of `as_of`.
    pub async fn reset_quotas_if_due(
        &self,
        as_of: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Option<BatchSummary>, AppError> {
        let month = month_marker(as_of);
        if self.store.get_watermark(QUOTA_RESET_MARKER).await?.as_deref() == Some(month.as_str()) {
            return Ok(None);
        }
        self.reset_quotas(as_of, cancel).await.map(Some)
    }

    /// Start a new quota cycle for every open subscription.
    ///
    /// Clears used bytes and the warned and throttled flags. Subscriptions
    /// suspended for quota are reactivated; other suspensions stay. Throttled
    /// sessions get the plan's regular rate back.
    #[instrument(skip(self, cancel))]
    pub async fn reset_quotas(
        &self,
        as_of: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, AppError> {
        let operation = Operation::ResetQuotas;
        let mut summary = BatchSummary::new(operation);
        let mut pending = Vec::new();

        let subscriptions = self.store.list_open_subscriptions().await?;
        tracing::info!(count = subscriptions.len(), as_of = %as_of, "Resetting quotas");

        for candidate in subscriptions {
            if cancel.is_cancelled() {
                tracing::info!("Quota reset cancelled");
                summary.cancelled = true;
                break;
            }

            let id = candidate.subscription_id;
            let step = self.with_retry(&id.to_string(), || self.reset_step(id)).await;

            let outcome = match step {
                Ok(Some((before, after))) => {
                    let from = before.state();
                    let to = after.state();
                    if from != to {
                        note_transition(&mut summary, id, from, to);
                    }
                    if before.throttled && to == SubscriptionState::Active {
                        pending.push(self.restore_rate(&after).await);
                    }
                    ItemOutcome::Success
                }
                Ok(None) => ItemOutcome::Skipped("subscription not found".to_string()),
                Err(e) => {
                    tracing::error!(subscription_id = %id, error = %e, "Quota reset failed");
                    ItemOutcome::Failed(e.to_string())
                }
            };
            record_batch_item(operation.as_str(), outcome.label());
            summary.record(id, outcome);
        }

        collect_coa(&mut summary.coa, pending).await;

        if !summary.cancelled {
            self.store
                .set_watermark(QUOTA_RESET_MARKER, &month_marker(as_of))
                .await?;
        }
        Ok(summary.finish())
    }

    async fn reset_step(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<(Subscription, Subscription)>, AppError> {
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            return Ok(None);
        };
        if subscription.state().is_terminated() {
            return Ok(None);
        }

        let mut update = LifecycleUpdate::from_current(&subscription);
        update.quota_warned = false;
        update.throttled = false;
        if update.state == SubscriptionState::Suspended(SuspensionReason::QuotaExceeded) {
            update.state = SubscriptionState::Active;
        }

        let updated = self
            .store
            .reset_quota(subscription_id, subscription.version, update)
            .await?;
        Ok(Some((subscription, updated)))
    }

    /// Put a throttled session back on the plan's regular rate. Plans without
    /// a configured rate get a disconnect so the session re-authorizes.
    async fn restore_rate(&self, subscription: &Subscription) -> PendingCoa {
        let plan = match self.store.get_plan(subscription.plan_id).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription.subscription_id,
                    error = %e,
                    "Plan lookup failed while restoring rate"
                );
                None
            }
        };
        let action = match plan.and_then(|p| p.rate_limit).filter(|r| !r.is_empty()) {
            Some(rate) => CoaAction::SetRateLimit(rate),
            None => CoaAction::Disconnect,
        };
        self.enqueue_coa(subscription, action).await
    }
}
