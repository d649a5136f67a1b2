//! Message types for the mail notification queue.
//!
//! Producers emit [`NotificationMessage`]; the consumer reads the same bytes
//! back as [`IncomingMail`], which is deliberately lenient about field
//! spelling so older producers keep working.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Queue name for mail notifications.
pub const MAIL_QUEUE: &str = "mail_queue";

/// Notification published when a business event should result in a mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationMessage {
    /// Client that triggered the notification, if any
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<i64>,
    /// Display name of the recipient
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Recipient email address
    #[serde(rename = "email")]
    pub recipient_email: String,
    /// Mail subject
    pub subject: String,
    /// Mail body
    pub body: String,
}

impl NotificationMessage {
    /// Create a notification for a recipient.
    pub fn new(
        recipient_email: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            client_id: None,
            name: None,
            recipient_email: recipient_email.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Attach the client that triggered the notification.
    pub fn with_client_id(mut self, client_id: i64) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Attach the recipient's display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// AMQP message id used to correlate publisher and consumer logs.
    ///
    /// Unique per call: `mail-<clientId>-<email>-<unix millis>-<sequence>`.
    /// Callers take one id per publish and reuse it across retries.
    pub fn message_id(&self) -> String {
        static SEQUENCE: AtomicU64 = AtomicU64::new(0);

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);

        format!(
            "mail-{}-{}-{}-{}",
            self.client_id.unwrap_or(0),
            self.recipient_email,
            millis,
            seq
        )
    }
}

/// Mail notification as read off the queue.
///
/// The recipient may arrive as `email` or `to_email`; every other field is
/// optional.
#[derive(Debug, Default, Deserialize)]
pub struct IncomingMail {
    #[serde(default, rename = "clientId")]
    pub client_id: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub to_email: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl IncomingMail {
    /// First non-blank recipient, preferring `email` over `to_email`.
    pub fn recipient(&self) -> Option<&str> {
        [self.email.as_deref(), self.to_email.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}
