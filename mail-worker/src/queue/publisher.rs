//! Reliable publisher for mail notifications.
//!
//! Every attempt goes through [`Broker::publish_confirmed`], which dials its
//! own connection and waits for the broker's confirmation. Failed attempts
//! are retried with doubling delays until `max_retries` is spent.

use std::sync::Arc;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::amqp::AmqpBroker;
use super::backoff::Backoff;
use super::broker::{Broker, BrokerError};
use super::types::NotificationMessage;
use crate::config::Config;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: BrokerError,
    },

    #[error("failed to serialize notification: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Publisher shared by request handlers.
pub type SharedPublisher = Arc<Publisher<Arc<dyn Broker>>>;

/// Publishes notifications to one durable queue.
#[derive(Debug, Clone)]
pub struct Publisher<B> {
    broker: B,
    queue: String,
    backoff: Backoff,
    max_retries: u32,
}

impl Publisher<Arc<dyn Broker>> {
    /// AMQP publisher configured from the environment.
    pub fn from_config(config: &Config) -> Self {
        let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::from_config(config));
        Publisher::new(broker, config.queue_name.clone(), config.publish_backoff())
            .with_max_retries(config.publish_max_retries)
    }
}

impl<B: Broker> Publisher<B> {
    pub fn new(broker: B, queue: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            broker,
            queue: queue.into(),
            backoff,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Retry ceiling used by [`Publisher::publish_or_report`].
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Publish `message`, making at most `max_retries + 1` attempts.
    ///
    /// Returns once the broker has confirmed the message. The recipient is
    /// not validated here.
    pub async fn publish(
        &self,
        message: &NotificationMessage,
        max_retries: u32,
    ) -> Result<(), PublishError> {
        let body = serde_json::to_vec(message)?;
        let message_id = message.message_id();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            info!(
                queue = %self.queue,
                message_id = %message_id,
                attempt = attempt,
                "mail_publish_attempt"
            );

            let err = match self
                .broker
                .publish_confirmed(&self.queue, &message_id, &body)
                .await
            {
                Ok(()) => {
                    info!(
                        queue = %self.queue,
                        message_id = %message_id,
                        attempt = attempt,
                        body_length = body.len(),
                        "mail_published"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            if attempt > max_retries {
                error!(
                    queue = %self.queue,
                    message_id = %message_id,
                    attempts = attempt,
                    error = %err,
                    "mail_publish_retries_exhausted"
                );
                return Err(PublishError::RetriesExhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.backoff.delay(attempt - 1);
            warn!(
                queue = %self.queue,
                message_id = %message_id,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "mail_publish_failed"
            );
            sleep(delay).await;
        }
    }

    /// Publish with the configured retry ceiling, logging instead of failing.
    ///
    /// For callers whose own operation must succeed regardless of whether
    /// the notification went out. Returns whether the broker confirmed it.
    pub async fn publish_or_report(&self, message: &NotificationMessage) -> bool {
        match self.publish(message, self.max_retries).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    recipient = %message.recipient_email,
                    error = %e,
                    "mail_notification_dropped"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;

    /// Fails the first `failures` calls, then confirms.
    struct FlakyBroker {
        failures: usize,
        calls: Mutex<Vec<(Instant, Vec<u8>)>>,
    }

    impl FlakyBroker {
        fn failing(failures: usize) -> Self {
            Self {
                failures,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn down() -> Self {
            Self::failing(usize::MAX)
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn gaps_ms(&self) -> Vec<u128> {
            let calls = self.calls.lock().unwrap();
            calls
                .windows(2)
                .map(|w| (w[1].0 - w[0].0).as_millis())
                .collect()
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn publish_confirmed(
            &self,
            _queue: &str,
            _message_id: &str,
            payload: &[u8],
        ) -> Result<(), BrokerError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push((Instant::now(), payload.to_vec()));
            if calls.len() <= self.failures {
                Err(BrokerError::ConnectTimeout(Duration::from_secs(10)))
            } else {
                Ok(())
            }
        }
    }

    fn message() -> NotificationMessage {
        NotificationMessage::new("a@e.com", "Hi", "Test").with_client_id(1)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_broker_gets_max_retries_plus_one_attempts() {
        for max_retries in 0..=4 {
            let publisher = Publisher::new(FlakyBroker::down(), "mail_queue", Backoff::PUBLISH);

            let err = publisher.publish(&message(), max_retries).await.unwrap_err();

            assert_eq!(publisher.broker.call_count(), max_retries as usize + 1);
            match err {
                PublishError::RetriesExhausted { attempts, last } => {
                    assert_eq!(attempts, max_retries + 1);
                    assert!(matches!(last, BrokerError::ConnectTimeout(_)));
                }
                other => panic!("expected RetriesExhausted, got {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_doubles_between_attempts() {
        let publisher = Publisher::new(FlakyBroker::down(), "mail_queue", Backoff::PUBLISH);

        let _ = publisher.publish(&message(), 3).await;

        assert_eq!(publisher.broker.gaps_ms(), vec![500, 1000, 2000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_publish_sends_once() {
        let publisher = Publisher::new(FlakyBroker::failing(0), "mail_queue", Backoff::PUBLISH);
        let started = Instant::now();

        publisher.publish(&message(), 3).await.unwrap();

        assert_eq!(publisher.broker.call_count(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);

        let calls = publisher.broker.calls.lock().unwrap();
        let sent: serde_json::Value = serde_json::from_slice(&calls[0].1).unwrap();
        assert_eq!(sent["email"], "a@e.com");
        assert_eq!(sent["clientId"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let publisher = Publisher::new(FlakyBroker::failing(2), "mail_queue", Backoff::PUBLISH);

        publisher.publish(&message(), 3).await.unwrap();

        assert_eq!(publisher.broker.call_count(), 3);
        assert_eq!(publisher.broker.gaps_ms(), vec![500, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_or_report_swallows_failure() {
        let publisher = Publisher::new(FlakyBroker::down(), "mail_queue", Backoff::PUBLISH)
            .with_max_retries(1);

        assert!(!publisher.publish_or_report(&message()).await);
        assert_eq!(publisher.broker.call_count(), 2);
    }

    #[tokio::test]
    async fn test_publish_or_report_confirms() {
        let publisher = Publisher::new(FlakyBroker::failing(0), "mail_queue", Backoff::PUBLISH);

        assert!(publisher.publish_or_report(&message()).await);
        assert_eq!(publisher.max_retries(), DEFAULT_MAX_RETRIES);
    }
}
