//! Service plan and customer models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Service plan a subscription is bound to.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ServicePlan {
    pub plan_id: Uuid,
    pub name: String,
    pub monthly_fee: Decimal,
    pub currency: String,
    /// Nominal rate pushed to the NAS, e.g. `"20M/20M"`.
    pub rate_limit: Option<String>,
    pub fup_enabled: bool,
    /// Reduced rate applied once the quota is exhausted.
    pub fup_rate_limit: Option<String>,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

impl ServicePlan {
    /// The rate to apply when throttling, if fair-use throttling is usable.
    pub fn throttle_rate(&self) -> Option<&str> {
        if self.fup_enabled {
            self.fup_rate_limit.as_deref().filter(|r| !r.is_empty())
        } else {
            None
        }
    }
}

/// Input for creating a plan.
#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub name: String,
    pub monthly_fee: Decimal,
    pub currency: String,
    pub rate_limit: Option<String>,
    pub fup_enabled: bool,
    pub fup_rate_limit: Option<String>,
}

/// Customer contact data used for notifications.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Customer {
    pub customer_id: Uuid,
    pub display_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Input for creating a customer.
#[derive(Debug, Clone)]
pub struct CreateCustomer {
    pub display_name: String,
    pub email: String,
    pub phone: Option<String>,
}
