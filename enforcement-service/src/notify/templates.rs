//! Notification templates: typed identifiers, bundled defaults and overrides.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use service_core::error::AppError;
use std::collections::HashMap;
use std::path::Path;

/// Values substituted into `{{key}}` placeholders.
pub type TemplateContext = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTemplate {
    InvoiceGenerated,
    PaymentReminder,
    ServiceSuspended,
    QuotaWarning,
    QuotaExceeded,
    FupApplied,
    ServiceReactivated,
}

impl NotificationTemplate {
    pub const ALL: [NotificationTemplate; 7] = [
        NotificationTemplate::InvoiceGenerated,
        NotificationTemplate::PaymentReminder,
        NotificationTemplate::ServiceSuspended,
        NotificationTemplate::QuotaWarning,
        NotificationTemplate::QuotaExceeded,
        NotificationTemplate::FupApplied,
        NotificationTemplate::ServiceReactivated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationTemplate::InvoiceGenerated => "invoice_generated",
            NotificationTemplate::PaymentReminder => "payment_reminder",
            NotificationTemplate::ServiceSuspended => "service_suspended",
            NotificationTemplate::QuotaWarning => "quota_warning",
            NotificationTemplate::QuotaExceeded => "quota_exceeded",
            NotificationTemplate::FupApplied => "fup_applied",
            NotificationTemplate::ServiceReactivated => "service_reactivated",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        NotificationTemplate::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
    }
}

/// Subject, email body and optional SMS text for one template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub subject: String,
    pub body_text: String,
    #[serde(default)]
    pub sms: Option<String>,
}

/// Partial override read from the overrides file.
#[derive(Debug, Clone, Default, Deserialize)]
struct TemplateOverride {
    subject: Option<String>,
    body_text: Option<String>,
    sms: Option<String>,
}

/// A template rendered against a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedMessage {
    pub subject: String,
    pub body_text: String,
    pub sms: Option<String>,
}

/// Values merged into every context.
#[derive(Debug, Clone)]
pub struct CompanyInfo {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub currency: String,
}

fn bundled(template: NotificationTemplate) -> Template {
    let (subject, body_text, sms) = match template {
        NotificationTemplate::InvoiceGenerated => (
            "New Invoice - {{invoice_number}}",
            "Dear {{customer_name}},\n\n\
             A new invoice has been generated for your {{plan_name}} service.\n\n\
             Invoice: {{invoice_number}}\n\
             Amount: {{amount}} {{currency}}\n\
             Due Date: {{due_date}}\n\n\
             Please make payment before the due date to avoid service interruption.\n\n\
             Thank you for choosing {{company_name}}.\n\n\
             Best regards,\n\
             {{company_name}} Team",
            None,
        ),
        NotificationTemplate::PaymentReminder => (
            "Payment Reminder - Invoice {{invoice_number}}",
            "Dear {{customer_name}},\n\n\
             This is a friendly reminder that your invoice {{invoice_number}} is due in {{days_until_due}} days.\n\n\
             Amount: {{amount}} {{currency}}\n\
             Due Date: {{due_date}}\n\n\
             Please make payment to avoid service interruption.\n\n\
             Thank you,\n\
             {{company_name}} Team",
            Some(
                "Payment reminder: Invoice {{invoice_number}} due {{due_date}}. \
                 Amount: {{amount}}. Pay now to avoid suspension.",
            ),
        ),
        NotificationTemplate::ServiceSuspended => (
            "Service Suspended - Overdue Payment",
            "Dear {{customer_name}},\n\n\
             Your service has been suspended due to overdue payment.\n\n\
             Invoice: {{invoice_number}}\n\
             Amount: {{amount}} {{currency}}\n\
             Days Overdue: {{days_overdue}}\n\n\
             Please make payment immediately to restore your service.\n\n\
             Contact us for assistance: {{company_phone}}\n\n\
             {{company_name}} Team",
            Some(
                "Service suspended due to overdue payment. Invoice {{invoice_number}}: \
                 {{amount}}. Pay now to restore service.",
            ),
        ),
        NotificationTemplate::QuotaWarning => (
            "Data Usage Warning - {{percentage}}% Used",
            "Dear {{customer_name}},\n\n\
             You have used {{percentage}}% of your monthly data quota for {{plan_name}}.\n\n\
             Used: {{used_quota}}\n\
             Total: {{total_quota}}\n\n\
             Consider upgrading your plan to avoid speed reduction.\n\n\
             {{company_name}} Team",
            Some(
                "Data usage warning: {{percentage}}% used. Plan: {{plan_name}}. \
                 Upgrade to avoid speed reduction.",
            ),
        ),
        NotificationTemplate::QuotaExceeded => (
            "Data Quota Exceeded - Service Suspended",
            "Dear {{customer_name}},\n\n\
             Your monthly data quota has been exceeded and your service has been suspended.\n\n\
             Plan: {{plan_name}}\n\
             Used: {{used_quota}}\n\
             Quota: {{total_quota}}\n\n\
             Please upgrade your plan or wait for next month's reset.\n\n\
             {{company_name}} Team",
            Some(
                "Data quota exceeded. Service suspended. Plan: {{plan_name}}. \
                 Upgrade or wait for reset.",
            ),
        ),
        NotificationTemplate::FupApplied => (
            "Fair Usage Policy Applied",
            "Dear {{customer_name}},\n\n\
             You have exceeded your data quota for {{plan_name}}. Your speed has been reduced to \
             {{new_speed}} as per our Fair Usage Policy.\n\n\
             Your speed will be restored at the beginning of next month.\n\n\
             {{company_name}} Team",
            None,
        ),
        NotificationTemplate::ServiceReactivated => (
            "Service Restored",
            "Dear {{customer_name}},\n\n\
             Thank you for your payment of {{amount}} {{currency}} against invoice {{invoice_number}}.\n\n\
             Your {{plan_name}} service has been restored.\n\n\
             {{company_name}} Team",
            Some("Payment received for invoice {{invoice_number}}. Your service has been restored."),
        ),
    };
    Template {
        subject: subject.to_string(),
        body_text: body_text.to_string(),
        sms: sms.map(str::to_string),
    }
}

/// Resolves template identifiers to their text.
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    templates: HashMap<NotificationTemplate, Template>,
    company: CompanyInfo,
}

impl TemplateCatalog {
    /// Catalog holding only the compiled-in defaults.
    pub fn bundled(company: CompanyInfo) -> Self {
        let templates = NotificationTemplate::ALL
            .into_iter()
            .map(|t| (t, bundled(t)))
            .collect();
        Self { templates, company }
    }

    /// Apply overrides from a JSON object keyed by template name.
    /// Fields left out keep their bundled value.
    pub fn with_overrides(mut self, json: &str) -> Result<Self, AppError> {
        let overrides: HashMap<String, TemplateOverride> = serde_json::from_str(json)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid template overrides: {}", e)))?;

        for (name, entry) in overrides {
            let Some(template) = NotificationTemplate::from_string(&name) else {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown notification template {:?}",
                    name
                )));
            };
            let target = self
                .templates
                .entry(template)
                .or_insert_with(|| bundled(template));
            if let Some(subject) = entry.subject {
                target.subject = subject;
            }
            if let Some(body_text) = entry.body_text {
                target.body_text = body_text;
            }
            if entry.sms.is_some() {
                target.sms = entry.sms;
            }
        }
        Ok(self)
    }

    pub fn load(company: CompanyInfo, overrides_path: Option<&str>) -> Result<Self, AppError> {
        let catalog = Self::bundled(company);
        match overrides_path {
            Some(path) => {
                let json = std::fs::read_to_string(Path::new(path)).map_err(|e| {
                    AppError::ConfigError(anyhow::anyhow!(
                        "Failed to read templates from {}: {}",
                        path,
                        e
                    ))
                })?;
                tracing::info!(path = %path, "Loaded notification template overrides");
                catalog.with_overrides(&json)
            }
            None => Ok(catalog),
        }
    }

    pub fn get(&self, template: NotificationTemplate) -> Template {
        self.templates
            .get(&template)
            .cloned()
            .unwrap_or_else(|| bundled(template))
    }

    /// Render a template. Company details and currency are filled in
    /// unless the context already carries them.
    pub fn render(
        &self,
        template: NotificationTemplate,
        context: &TemplateContext,
    ) -> RenderedMessage {
        let mut merged = context.clone();
        for (key, value) in [
            ("company_name", &self.company.name),
            ("company_email", &self.company.email),
            ("company_phone", &self.company.phone),
            ("currency", &self.company.currency),
        ] {
            merged
                .entry(key.to_string())
                .or_insert_with(|| Value::String(value.clone()));
        }

        let template = self.get(template);
        RenderedMessage {
            subject: render_placeholders(&template.subject, &merged),
            body_text: render_placeholders(&template.body_text, &merged),
            sms: template
                .sms
                .as_deref()
                .map(|sms| render_placeholders(sms, &merged)),
        }
    }
}

/// Substitute `{{ key }}` placeholders. Unknown keys render as empty text.
pub fn render_placeholders(source: &str, context: &TemplateContext) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match context.get(key) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(Value::Null) | None => {}
                    Some(other) => out.push_str(&other.to_string()),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Human readable byte count, base 1024.
pub fn format_bytes(bytes: i64) -> String {
    if bytes <= 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{:.1} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1} PB", value)
}
