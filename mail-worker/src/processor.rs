//! Per-message processing for the mail consumer.
//!
//! Turns a raw delivery body into a [`MailRecord`] and writes it. Every
//! error returned from here is permanent for that message: the consumer
//! rejects it without requeue.

use thiserror::Error;
use tracing::info;

use crate::queue::IncomingMail;
use crate::store::{MailRecord, MailStore, StoreError};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message has no recipient (email or to_email)")]
    MissingRecipient,

    #[error("failed to record mail: {0}")]
    Persistence(#[from] StoreError),
}

/// Decode a delivery body into the row to record.
///
/// A `clientId` of 0 is stored as NULL.
pub fn parse_mail(data: &[u8]) -> Result<MailRecord, ProcessError> {
    let mail: IncomingMail = serde_json::from_slice(data)?;
    let to_email = mail
        .recipient()
        .ok_or(ProcessError::MissingRecipient)?
        .to_string();

    Ok(MailRecord {
        client_id: mail.client_id.filter(|id| *id != 0),
        to_email,
        subject: mail.subject.unwrap_or_default(),
        body: mail.body.unwrap_or_default(),
    })
}

/// Decode and record one delivery, returning the stored row id.
pub async fn process_delivery<S>(store: &S, data: &[u8]) -> Result<u64, ProcessError>
where
    S: MailStore + ?Sized,
{
    let record = parse_mail(data)?;
    let id = store.record_delivery(&record).await?;

    info!(
        mail_id = id,
        to_email = %record.to_email,
        client_id = ?record.client_id,
        "mail_recorded"
    );

    Ok(id)
}
