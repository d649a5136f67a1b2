//! lapin-backed [`Broker`] and [`Connector`].
//!
//! Publishing dials a fresh connection per call and closes it before
//! returning, whatever the outcome. Consumer sessions own one connection and
//! one channel each.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::broker::{Broker, BrokerError, Connector, Delivery, Session};
use crate::config::Config;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Confirm-mode publisher transport.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    url: String,
    connect_timeout: Duration,
    confirm_timeout: Duration,
}

impl AmqpBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_TIMEOUT,
            confirm_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.rabbitmq_url.clone())
            .with_connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .with_confirm_timeout(Duration::from_millis(config.confirm_timeout_ms))
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_confirm_timeout(mut self, confirm_timeout: Duration) -> Self {
        self.confirm_timeout = confirm_timeout;
        self
    }

    async fn publish_on(
        &self,
        conn: &Connection,
        queue: &str,
        message_id: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let channel = conn.create_channel().await.map_err(BrokerError::Channel)?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(BrokerError::Channel)?;

        declare_durable(&channel, queue).await?;

        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(message_id.into()),
            )
            .await
            .map_err(|source| BrokerError::Publish {
                queue: queue.to_string(),
                source,
            })?;

        let confirmation = timeout(self.confirm_timeout, confirm)
            .await
            .map_err(|_| BrokerError::ConfirmTimeout(self.confirm_timeout))?
            .map_err(|source| BrokerError::Publish {
                queue: queue.to_string(),
                source,
            })?;

        if !confirmation.is_ack() {
            return Err(BrokerError::Nacked {
                queue: queue.to_string(),
            });
        }

        if let Err(e) = channel.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_channel_close_error");
        }

        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish_confirmed(
        &self,
        queue: &str,
        message_id: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let conn = dial(&self.url, self.connect_timeout).await?;
        let result = self.publish_on(&conn, queue, message_id, payload).await;
        close_connection(&conn).await;
        result
    }
}

/// Opens manual-ack consumer sessions.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
    connect_timeout: Duration,
    prefetch: u16,
    consumer_tag: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_TIMEOUT,
            prefetch: 1,
            consumer_tag: "mail-consumer".to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.rabbitmq_url.clone())
            .with_connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .with_prefetch(config.consumer_prefetch)
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Zero is raised to one; AMQP reads a zero prefetch as unlimited.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    async fn subscribe(
        &self,
        conn: &Connection,
        queue: &str,
    ) -> Result<(Channel, Consumer), BrokerError> {
        let channel = conn.create_channel().await.map_err(BrokerError::Channel)?;

        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(BrokerError::Channel)?;

        declare_durable(&channel, queue).await?;

        // no_ack stays false: every delivery is settled explicitly
        let consumer = channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| BrokerError::Subscribe {
                queue: queue.to_string(),
                source,
            })?;

        info!(
            queue = queue,
            prefetch_count = self.prefetch,
            "rabbitmq_consumer_started"
        );

        Ok((channel, consumer))
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Session = AmqpSession;

    async fn connect(&self, queue: &str) -> Result<AmqpSession, BrokerError> {
        let connection = dial(&self.url, self.connect_timeout).await?;

        let (lost_tx, lost) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = lost_tx.send(err);
        });

        match self.subscribe(&connection, queue).await {
            Ok((channel, consumer)) => Ok(AmqpSession {
                connection,
                channel,
                consumer,
                lost,
            }),
            Err(e) => {
                close_connection(&connection).await;
                Err(e)
            }
        }
    }
}

/// Live consumer session.
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
    lost: mpsc::UnboundedReceiver<lapin::Error>,
}

#[async_trait]
impl Session for AmqpSession {
    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError> {
        tokio::select! {
            Some(err) = self.lost.recv() => Err(BrokerError::ConnectionLost(err.to_string())),
            delivery = self.consumer.next() => match delivery {
                Some(Ok(delivery)) => Ok(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    message_id: delivery
                        .properties
                        .message_id()
                        .as_ref()
                        .map(|s| s.to_string()),
                    data: delivery.data,
                }),
                Some(Err(e)) => Err(BrokerError::ConnectionLost(e.to_string())),
                None => Err(BrokerError::ConnectionLost(
                    "consumer stream closed".to_string(),
                )),
            },
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|source| BrokerError::Settle {
                delivery_tag,
                source,
            })
    }

    async fn reject(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                },
            )
            .await
            .map_err(|source| BrokerError::Settle {
                delivery_tag,
                source,
            })
    }

    async fn close(&mut self) {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "Normal shutdown").await {
                debug!(error = %e, "rabbitmq_channel_close_error");
            }
        }
        close_connection(&self.connection).await;
    }
}

async fn dial(url: &str, connect_timeout: Duration) -> Result<Connection, BrokerError> {
    info!(url_length = url.len(), "rabbitmq_connecting");

    let conn = timeout(
        connect_timeout,
        Connection::connect(url, ConnectionProperties::default()),
    )
    .await
    .map_err(|_| BrokerError::ConnectTimeout(connect_timeout))?
    .map_err(BrokerError::Connect)?;

    info!("rabbitmq_connected");
    Ok(conn)
}

async fn declare_durable(channel: &Channel, queue: &str) -> Result<(), BrokerError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|source| BrokerError::Declare {
            queue: queue.to_string(),
            source,
        })?;

    debug!(queue = queue, "rabbitmq_queue_declared");
    Ok(())
}

async fn close_connection(conn: &Connection) {
    if !conn.status().connected() {
        return;
    }
    if let Err(e) = conn.close(200, "Normal shutdown").await {
        warn!(error = %e, "rabbitmq_connection_close_error");
    }
}
