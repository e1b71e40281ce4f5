//! `email.send` jobs

use async_trait::async_trait;
use job_worker::{HandlerError, Job, JobContext, JobHandler, types};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub html: bool,
}

impl EmailPayload {
    pub fn validate(&self) -> Result<(), HandlerError> {
        if self.to.trim().is_empty() {
            return Err(HandlerError::failed("email recipient is required"));
        }
        if self.subject.trim().is_empty() {
            return Err(HandlerError::failed("email subject is required"));
        }
        Ok(())
    }
}

/// Delivers an email
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &EmailPayload) -> eyre::Result<()>;

    /// Get sender name
    fn name(&self) -> &'static str;
}

/// Sender that only logs, for environments without a mail provider
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEmailSender;

#[async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send(&self, email: &EmailPayload) -> eyre::Result<()> {
        info!(
            to = %email.to,
            subject = %email.subject,
            html = email.html,
            body_len = email.body.len(),
            "Email delivered to log"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

pub struct EmailHandler {
    sender: Arc<dyn EmailSender>,
}

impl EmailHandler {
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl JobHandler for EmailHandler {
    fn job_type(&self) -> &str {
        types::EMAIL_SEND
    }

    async fn handle(&self, _ctx: &JobContext, job: &Job) -> Result<(), HandlerError> {
        let payload: EmailPayload = job.unmarshal_payload()?;
        payload.validate()?;

        info!(
            job_id = %job.id(),
            to = %payload.to,
            subject = %payload.subject,
            sender = self.sender.name(),
            "Sending email"
        );

        self.sender
            .send(&payload)
            .await
            .map_err(|e| HandlerError::failed(format!("Failed to send email: {e}")))?;

        info!(job_id = %job.id(), to = %payload.to, "Email sent");
        Ok(())
    }
}
