//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - The notification message contract
//! - Broker traits and their lapin implementations
//! - The confirmed, retrying publisher
//!
//! ## Architecture
//!
//! ```text
//! Publisher → mail_queue (durable) → Consumer → mails table
//! ```

pub mod amqp;
pub mod backoff;
pub mod broker;
pub mod publisher;
pub mod types;

pub use amqp::{AmqpBroker, AmqpConnector, AmqpSession};
pub use backoff::Backoff;
pub use broker::{Broker, BrokerError, Connector, Delivery, Session};
pub use publisher::{PublishError, Publisher, SharedPublisher, DEFAULT_MAX_RETRIES};
pub use types::{IncomingMail, NotificationMessage, MAIL_QUEUE};
