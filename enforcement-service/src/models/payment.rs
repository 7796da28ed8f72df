//! Payment model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Invoice;

/// How the customer paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    BankTransfer,
    CreditCard,
    DebitCard,
    MobileMoney,
    Check,
    Online,
    Other,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::CreditCard => "credit_card",
            PaymentMethod::DebitCard => "debit_card",
            PaymentMethod::MobileMoney => "mobile_money",
            PaymentMethod::Check => "check",
            PaymentMethod::Online => "online",
            PaymentMethod::Other => "other",
        }
    }

    /// Strict lookup for input from callers. `None` for unknown methods.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cash" => Some(PaymentMethod::Cash),
            "bank_transfer" => Some(PaymentMethod::BankTransfer),
            "credit_card" => Some(PaymentMethod::CreditCard),
            "debit_card" => Some(PaymentMethod::DebitCard),
            "mobile_money" => Some(PaymentMethod::MobileMoney),
            "check" => Some(PaymentMethod::Check),
            "online" => Some(PaymentMethod::Online),
            "other" => Some(PaymentMethod::Other),
            _ => None,
        }
    }

    /// Lenient lookup for stored rows.
    pub fn from_string(s: &str) -> Self {
        Self::parse(s).unwrap_or(PaymentMethod::Other)
    }
}

/// Payment record. Never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub payment_number: String,
    pub invoice_id: Uuid,
    pub customer_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub method: String,
    pub status: String,
    pub reference: Option<String>,
    pub payment_date: NaiveDate,
    pub created_utc: DateTime<Utc>,
}

impl Payment {
    pub fn method(&self) -> PaymentMethod {
        PaymentMethod::from_string(&self.method)
    }
}

/// Input for recording a payment against an invoice.
#[derive(Debug, Clone)]
pub struct RecordPayment {
    pub number_prefix: String,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub payment_date: NaiveDate,
}

/// Payment row together with the invoice as updated in the same transaction.
#[derive(Debug, Clone)]
pub struct RecordedPayment {
    pub payment: Payment,
    pub invoice: Invoice,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_unknown_methods() {
        assert_eq!(PaymentMethod::parse("credit_card"), Some(PaymentMethod::CreditCard));
        assert_eq!(PaymentMethod::parse("other"), Some(PaymentMethod::Other));
        assert_eq!(PaymentMethod::parse("card"), None);
        assert_eq!(PaymentMethod::from_string("card"), PaymentMethod::Other);
    }
}
