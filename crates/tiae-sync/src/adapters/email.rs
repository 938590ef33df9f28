//! Email delivery.

use async_trait::async_trait;
use tiae_core::models::email::OutboundEmail;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::AdapterError;

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AdapterError>;
}

/// Logs the envelope of each message. Bodies carry one-shot links and are
/// never logged.
#[derive(Debug, Default)]
pub struct TracingEmailSender;

#[async_trait]
impl EmailSender for TracingEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AdapterError> {
        info!(to, subject, body_len = body.len(), "Email handed to sender");
        Ok(())
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<OutboundEmail>>,
}

impl RecordingEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), AdapterError> {
        self.sent.lock().await.push(OutboundEmail {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
        });
        Ok(())
    }
}
