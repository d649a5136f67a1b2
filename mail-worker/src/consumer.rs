//! Long-lived mail consumer.
//!
//! The consumer is an explicit state machine:
//!
//! ```text
//!              dial failed (backoff grows)
//!        ┌─────────────────────────────────────┐
//!        v                                     │
//! ┌──────────────┐  backoff  ┌────────────┐    │   ┌────────────┐
//! │ Disconnected │ ────────> │ Connecting │ ───┴─> │ Subscribed │ ──┐ one delivery:
//! └──────────────┘           └────────────┘        └────────────┘ <─┘ record, ack/nack
//!        ^                                               │
//!        └──────── session lost (backoff from base) ─────┘
//! ```
//!
//! Each call to [`Consumer::step`] performs exactly one transition, which
//! keeps every suspension point and every resource release visible.
//! [`Consumer::run`] just steps forever.

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::processor::process_delivery;
use crate::queue::{Backoff, BrokerError, Connector, Delivery, Session};
use crate::store::MailStore;

/// Where the consumer currently is, with the resources it owns there.
pub enum ConsumerState<S> {
    /// No session. `failures` counts consecutive failed dials, plus one
    /// when the previous session was lost. Zero only before the first dial.
    Disconnected { failures: u32 },
    /// About to dial.
    Connecting { failures: u32 },
    /// Fully established session.
    Subscribed(S),
}

/// Resource-free view of [`ConsumerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Subscribed,
}

/// Running totals, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Sessions successfully established
    pub sessions: u64,
    /// Failed dial attempts
    pub dial_failures: u64,
    /// Messages recorded and acknowledged
    pub recorded: u64,
    /// Messages rejected without requeue
    pub rejected: u64,
}

pub struct Consumer<C: Connector, S> {
    connector: C,
    store: S,
    queue: String,
    backoff: Backoff,
    state: ConsumerState<C::Session>,
    stats: ConsumerStats,
}

impl<C, S> Consumer<C, S>
where
    C: Connector,
    S: MailStore,
{
    pub fn new(connector: C, store: S, queue: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            connector,
            store,
            queue: queue.into(),
            backoff,
            state: ConsumerState::Disconnected { failures: 0 },
            stats: ConsumerStats::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            ConsumerState::Disconnected { .. } => Phase::Disconnected,
            ConsumerState::Connecting { .. } => Phase::Connecting,
            ConsumerState::Subscribed(_) => Phase::Subscribed,
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Consume until the process ends. Never returns.
    pub async fn run(&mut self) {
        info!(queue = %self.queue, "mail_consumer_running");
        loop {
            self.step().await;
        }
    }

    /// Perform one state transition.
    pub async fn step(&mut self) {
        let state = std::mem::replace(
            &mut self.state,
            ConsumerState::Disconnected { failures: 0 },
        );

        self.state = match state {
            ConsumerState::Disconnected { failures } => {
                if failures > 0 {
                    let delay = self.backoff.delay(failures - 1);
                    info!(
                        queue = %self.queue,
                        attempt = failures + 1,
                        delay_ms = delay.as_millis() as u64,
                        "rabbitmq_reconnect_scheduled"
                    );
                    sleep(delay).await;
                }
                ConsumerState::Connecting { failures }
            }

            ConsumerState::Connecting { failures } => {
                match self.connector.connect(&self.queue).await {
                    Ok(session) => {
                        self.stats.sessions += 1;
                        info!(
                            queue = %self.queue,
                            attempt = failures + 1,
                            "mail_consumer_subscribed"
                        );
                        ConsumerState::Subscribed(session)
                    }
                    Err(e) => {
                        self.stats.dial_failures += 1;
                        error!(
                            queue = %self.queue,
                            attempt = failures + 1,
                            error = %e,
                            "rabbitmq_connect_failed"
                        );
                        ConsumerState::Disconnected {
                            failures: failures.saturating_add(1),
                        }
                    }
                }
            }

            ConsumerState::Subscribed(mut session) => match self.consume_one(&mut session).await {
                Ok(()) => ConsumerState::Subscribed(session),
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "rabbitmq_session_lost");
                    session.close().await;
                    // Wait the base delay before redialing, then double on dial failures.
                    ConsumerState::Disconnected { failures: 1 }
                }
            },
        };
    }

    /// Receive one delivery and settle it. An error means the session is
    /// unusable and must be torn down.
    async fn consume_one(&mut self, session: &mut C::Session) -> Result<(), BrokerError> {
        let Delivery {
            delivery_tag,
            message_id,
            data,
        } = session.next_delivery().await?;
        let message_id = message_id.as_deref().unwrap_or("unknown");

        info!(
            queue = %self.queue,
            message_id = %message_id,
            delivery_tag = delivery_tag,
            body_length = data.len(),
            "mail_message_received"
        );

        match process_delivery(&self.store, &data).await {
            Ok(_) => {
                session.ack(delivery_tag).await?;
                self.stats.recorded += 1;
            }
            Err(e) => {
                error!(
                    queue = %self.queue,
                    message_id = %message_id,
                    delivery_tag = delivery_tag,
                    error = %e,
                    body_preview = %String::from_utf8_lossy(&data[..data.len().min(500)]),
                    "mail_message_rejected"
                );
                session.reject(delivery_tag).await?;
                self.stats.rejected += 1;
            }
        }

        Ok(())
    }
}
