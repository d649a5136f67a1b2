//! Web server module for triggering mail notifications.
//!
//! This module provides a thin web server that:
//! - Accepts notification requests
//! - Publishes them to the durable mail queue with confirmation and retries
//! - Answers successfully even when the broker is down
//!
//! Recording the mail happens later, in the consumer.

pub mod handlers;

pub use handlers::{health, notify, AppState, HealthResponse, NotifyRequest, NotifyResponse};
