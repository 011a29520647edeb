use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum MailError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Mail API error: {0}")]
    ApiError(String),

    #[error("Template rendering failed: {0}")]
    TemplateError(#[from] askama::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Email transport
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError>;
}

#[derive(Debug, Serialize)]
struct SendMailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

/// Sends mail through a JSON HTTP mail API (`POST {base}/messages`)
#[derive(Clone)]
pub struct HttpMailer {
    client: Client,
    api_base_url: String,
    api_token: Secret<String>,
    from: String,
}

impl HttpMailer {
    pub fn new(api_base_url: &str, api_token: Secret<String>, from: &str) -> Self {
        Self {
            client: Client::new(),
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            api_token,
            from: from.to_string(),
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    #[tracing::instrument(skip(self, message), fields(to = %message.to))]
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        let url = format!("{}/messages", self.api_base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_token.expose_secret())
            .timeout(SEND_TIMEOUT)
            .json(&SendMailRequest {
                from: &self.from,
                to: &message.to,
                subject: &message.subject,
                html: &message.html,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::warn!(
                status = %status,
                error = %error_text,
                "Mail API request failed"
            );
            return Err(MailError::ApiError(format!("Status {}: {}", status, error_text)));
        }

        tracing::debug!("Mail accepted by API");

        Ok(())
    }
}

/// Logs messages instead of sending them; used when no mail API is configured
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        tracing::info!(
            to = %message.to,
            subject = %message.subject,
            "Mail API not configured, email logged only"
        );
        Ok(())
    }
}
