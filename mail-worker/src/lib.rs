//! Mailpipe - reliable mail notification pipeline over RabbitMQ.
//!
//! This library provides shared modules for the two binaries:
//! - `mail-web`: Thin web server that publishes notifications
//! - `mail-consumer`: Long-lived consumer that records them in MySQL
//!
//! ## Architecture
//!
//! ```text
//! Business event → Publisher → mail_queue → Consumer → mails table
//! ```
//!
//! Publishing is confirmed and retried with exponential backoff; consuming
//! uses manual acknowledgments and reconnects with its own backoff.

pub mod config;
pub mod consumer;
pub mod processor;
pub mod queue;
pub mod store;
pub mod util;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use consumer::{Consumer, ConsumerStats, Phase};
pub use processor::{process_delivery, ProcessError};
pub use queue::{
    AmqpBroker, AmqpConnector, Backoff, Broker, BrokerError, Connector, NotificationMessage,
    PublishError, Publisher, SharedPublisher, MAIL_QUEUE,
};
pub use store::{MailRecord, MailStore, MySqlMailStore, StoreError};
pub use web::AppState;
