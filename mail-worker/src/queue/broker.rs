//! Broker abstraction for the mail queue.
//!
//! The publisher only needs [`Broker`]; the consumer needs a [`Connector`]
//! that hands out fully established [`Session`]s. The lapin-backed
//! implementations live in [`super::amqp`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Transient broker failures. All of them are worth retrying.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to RabbitMQ: {0}")]
    Connect(#[source] lapin::Error),

    #[error("RabbitMQ unreachable within {0:?}")]
    ConnectTimeout(Duration),

    #[error("failed to open channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to declare queue {queue}: {source}")]
    Declare {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to consume from {queue}: {source}")]
    Subscribe {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to publish to {queue}: {source}")]
    Publish {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("broker nacked message on {queue}")]
    Nacked { queue: String },

    #[error("no publish confirmation within {0:?}")]
    ConfirmTimeout(Duration),

    #[error("failed to settle delivery {delivery_tag}: {source}")]
    Settle {
        delivery_tag: u64,
        #[source]
        source: lapin::Error,
    },

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// A message handed to the consumer, pending ack or reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub data: Vec<u8>,
}

/// Confirmed, persistent publish to a durable queue.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Deliver `payload` to `queue` and wait until the broker has accepted it.
    ///
    /// Each call owns its connection; nothing is reused between calls.
    async fn publish_confirmed(
        &self,
        queue: &str,
        message_id: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError>;
}

#[async_trait]
impl<T: Broker + ?Sized> Broker for Arc<T> {
    async fn publish_confirmed(
        &self,
        queue: &str,
        message_id: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        (**self).publish_confirmed(queue, message_id, payload).await
    }
}

/// Opens consumer sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    /// Dial, open a channel, declare `queue` and subscribe with manual acks.
    ///
    /// Either returns a session with all of that in place, or an error with
    /// everything already released.
    async fn connect(&self, queue: &str) -> Result<Self::Session, BrokerError>;
}

/// One live subscription: connection, channel and consumer stream.
#[async_trait]
pub trait Session: Send {
    /// Wait for the next delivery. Any error means the session is gone.
    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Negative-acknowledge without requeue.
    async fn reject(&mut self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Release the channel and connection. Errors are logged, not returned.
    async fn close(&mut self);
}
