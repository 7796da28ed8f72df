//! Customer notifications. Delivery is fire-and-forget: failures are logged
//! and counted, never returned to the enforcement passes.

pub mod http;
pub mod templates;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::task::TaskTracker;

use crate::services::metrics::record_notification;

pub use http::{HttpNotifier, LogNotifier};
pub use templates::{
    format_bytes, CompanyInfo, NotificationTemplate, RenderedMessage, TemplateCatalog,
    TemplateContext,
};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    SendFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

/// Delivers an already rendered message.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(
        &self,
        recipient: &Recipient,
        template: NotificationTemplate,
        message: &RenderedMessage,
    ) -> Result<(), NotifyError>;
}

/// Renders templates and hands them to a [`Notifier`] on background tasks.
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    catalog: Arc<TemplateCatalog>,
    tasks: TaskTracker,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, catalog: TemplateCatalog) -> Self {
        Self {
            notifier,
            catalog: Arc::new(catalog),
            tasks: TaskTracker::new(),
        }
    }

    /// Queue one notification and return immediately.
    pub fn notify(
        &self,
        recipient: Recipient,
        template: NotificationTemplate,
        context: TemplateContext,
    ) {
        let message = self.catalog.render(template, &context);
        let notifier = self.notifier.clone();

        self.tasks.spawn(async move {
            match notifier.deliver(&recipient, template, &message).await {
                Ok(()) => {
                    tracing::debug!(
                        template = template.as_str(),
                        email = %recipient.email,
                        "Notification delivered"
                    );
                    record_notification(template.as_str(), "sent");
                }
                Err(e) => {
                    tracing::warn!(
                        template = template.as_str(),
                        email = %recipient.email,
                        error = %e,
                        "Notification delivery failed"
                    );
                    record_notification(template.as_str(), "failed");
                }
            }
        });
    }

    /// Wait for every queued notification to finish.
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }
}

/// Build a template context from `key => value` pairs.
#[macro_export]
macro_rules! context {
    ($($key:expr => $value:expr),* $(,)?) => {{
        let mut map = $crate::notify::TemplateContext::new();
        $(map.insert($key.to_string(), serde_json::json!($value));)*
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(String, RenderedMessage)>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn deliver(
            &self,
            recipient: &Recipient,
            _template: NotificationTemplate,
            message: &RenderedMessage,
        ) -> Result<(), NotifyError> {
            if recipient.email.is_empty() {
                return Err(NotifyError::InvalidRecipient("missing email".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((recipient.email.clone(), message.clone()));
            Ok(())
        }
    }

    fn company() -> CompanyInfo {
        CompanyInfo {
            name: "Acme Net".into(),
            email: "billing@acme.test".into(),
            phone: "+1-555-0199".into(),
            currency: "USD".into(),
        }
    }

    #[tokio::test]
    async fn settle_waits_for_queued_deliveries() {
        let recording = Arc::new(Recording::default());
        let dispatcher =
            NotificationDispatcher::new(recording.clone(), TemplateCatalog::bundled(company()));

        for email in ["a@test", "", "b@test"] {
            dispatcher.notify(
                Recipient {
                    name: "Sub".into(),
                    email: email.into(),
                    phone: None,
                },
                NotificationTemplate::FupApplied,
                context! { "plan_name" => "Fiber", "new_speed" => "1M/1M" },
            );
        }
        dispatcher.settle().await;

        let sent = recording.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1.body_text.contains("reduced to 1M/1M"));
        assert_eq!(dispatcher.in_flight(), 0);
    }
}
