//! Subscription model.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Suspended,
    Terminated,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Terminated => "terminated",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SubscriptionStatus::Pending),
            "active" => Some(SubscriptionStatus::Active),
            "suspended" => Some(SubscriptionStatus::Suspended),
            "terminated" => Some(SubscriptionStatus::Terminated),
            _ => None,
        }
    }
}

/// Why a subscription is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionReason {
    Overdue,
    QuotaExceeded,
    Manual,
}

impl SuspensionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspensionReason::Overdue => "overdue",
            SuspensionReason::QuotaExceeded => "quota_exceeded",
            SuspensionReason::Manual => "manual",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "overdue" => Some(SuspensionReason::Overdue),
            "quota_exceeded" => Some(SuspensionReason::QuotaExceeded),
            "manual" => Some(SuspensionReason::Manual),
            _ => None,
        }
    }
}

/// Lifecycle state with the suspension reason folded in, so a suspended
/// state without a reason (or an active one with a reason) cannot be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SubscriptionState {
    Pending,
    Active,
    Suspended(SuspensionReason),
    Terminated,
}

impl SubscriptionState {
    pub fn status(&self) -> SubscriptionStatus {
        match self {
            SubscriptionState::Pending => SubscriptionStatus::Pending,
            SubscriptionState::Active => SubscriptionStatus::Active,
            SubscriptionState::Suspended(_) => SubscriptionStatus::Suspended,
            SubscriptionState::Terminated => SubscriptionStatus::Terminated,
        }
    }

    pub fn reason(&self) -> Option<SuspensionReason> {
        match self {
            SubscriptionState::Suspended(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Rebuild the state from its two persisted columns.
    ///
    /// Returns `None` when the columns violate the status/reason invariant.
    pub fn from_columns(status: &str, reason: Option<&str>) -> Option<Self> {
        let status = SubscriptionStatus::from_string(status)?;
        match (status, reason) {
            (SubscriptionStatus::Pending, None) => Some(SubscriptionState::Pending),
            (SubscriptionStatus::Active, None) => Some(SubscriptionState::Active),
            (SubscriptionStatus::Terminated, None) => Some(SubscriptionState::Terminated),
            (SubscriptionStatus::Suspended, Some(r)) => {
                SuspensionReason::from_string(r).map(SubscriptionState::Suspended)
            }
            _ => None,
        }
    }

    /// Column values for persistence.
    pub fn to_columns(&self) -> (&'static str, Option<&'static str>) {
        (self.status().as_str(), self.reason().map(|r| r.as_str()))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, SubscriptionState::Terminated)
    }
}

/// Subscription (subscriber-to-plan binding).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub suspension_reason: Option<String>,
    pub monthly_quota_bytes: Option<i64>,
    pub used_quota_bytes: i64,
    pub quota_warned: bool,
    pub throttled: bool,
    pub next_billing_date: NaiveDate,
    pub nas_username: String,
    pub coa_failures: i32,
    pub last_coa_result: Option<String>,
    pub last_coa_utc: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    /// Current lifecycle state.
    ///
    /// Rows are written only through [`SubscriptionState::to_columns`] and the
    /// table carries a CHECK constraint, so an inconsistent row is treated as
    /// terminated: nothing will bill it or send network actions for it.
    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::from_columns(&self.status, self.suspension_reason.as_deref())
            .unwrap_or(SubscriptionState::Terminated)
    }

    pub fn has_quota(&self) -> bool {
        matches!(self.monthly_quota_bytes, Some(q) if q > 0)
    }
}

/// Lifecycle columns written together under a version check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleUpdate {
    pub state: SubscriptionState,
    pub quota_warned: bool,
    pub throttled: bool,
}

impl LifecycleUpdate {
    /// Start from the subscription's current lifecycle columns.
    pub fn from_current(subscription: &Subscription) -> Self {
        Self {
            state: subscription.state(),
            quota_warned: subscription.quota_warned,
            throttled: subscription.throttled,
        }
    }
}

/// Input for creating a subscription (provisioning / tests).
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub nas_username: String,
    pub state: SubscriptionState,
    pub monthly_quota_bytes: Option<i64>,
    pub next_billing_date: NaiveDate,
}
