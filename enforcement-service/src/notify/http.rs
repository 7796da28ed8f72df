//! Notifier transports.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{NotificationTemplate, Notifier, NotifyError, Recipient, RenderedMessage};

#[derive(Debug, Serialize)]
struct SendEmailRequest<'a> {
    to: &'a str,
    subject: &'a str,
    body_text: &'a str,
    metadata: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct SendSmsRequest<'a> {
    to: &'a str,
    body: &'a str,
    metadata: serde_json::Value,
}

/// Posts rendered messages to the notification service.
pub struct HttpNotifier {
    client: Client,
    base_url: String,
}

impl HttpNotifier {
    pub fn new(base_url: &str) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<(), NotifyError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to send POST request to {}: {}", url, e);
                NotifyError::Connection(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(NotifyError::SendFailed(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn deliver(
        &self,
        recipient: &Recipient,
        template: NotificationTemplate,
        message: &RenderedMessage,
    ) -> Result<(), NotifyError> {
        if recipient.email.is_empty() {
            return Err(NotifyError::InvalidRecipient(
                "recipient has no email address".to_string(),
            ));
        }
        let metadata = serde_json::json!({ "template": template.as_str() });

        self.post(
            "/v1/notifications/email",
            &SendEmailRequest {
                to: &recipient.email,
                subject: &message.subject,
                body_text: &message.body_text,
                metadata: metadata.clone(),
            },
        )
        .await?;

        if let (Some(phone), Some(sms)) = (recipient.phone.as_deref(), message.sms.as_deref()) {
            self.post(
                "/v1/notifications/sms",
                &SendSmsRequest {
                    to: phone,
                    body: sms,
                    metadata,
                },
            )
            .await?;
        }
        Ok(())
    }
}

/// Writes notifications to the log. Used when no notification service is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(
        &self,
        recipient: &Recipient,
        template: NotificationTemplate,
        message: &RenderedMessage,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            template = template.as_str(),
            to = %recipient.email,
            subject = %message.subject,
            "Notification (log only)"
        );
        Ok(())
    }
}
