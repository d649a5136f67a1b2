//! Mail Consumer - long-lived RabbitMQ consumer that records mail notifications.
//!
//! Consumes the durable mail queue with manual acknowledgments, writes each
//! notification to the `mails` table, and reconnects with backoff whenever
//! the broker goes away.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailpipe::store::create_pool;
use mailpipe::util::shutdown_signal;
use mailpipe::{AmqpConnector, Config, Consumer, MySqlMailStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("mail_consumer_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        rabbitmq_url_set = !config.rabbitmq_url.is_empty(),
        queue = %config.queue_name,
        prefetch = config.consumer_prefetch,
        reconnect_backoff_ms = ?config.reconnect_backoff_ms,
        "config_loaded"
    );

    let pool = create_pool(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to MySQL")?;

    let store = MySqlMailStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("Failed to prepare mails table")?;

    let connector = AmqpConnector::from_config(&config);
    let mut consumer = Consumer::new(
        connector,
        store,
        config.queue_name.clone(),
        config.reconnect_backoff(),
    );

    tokio::select! {
        _ = consumer.run() => {}
        _ = shutdown_signal() => info!("mail_consumer_stopping"),
    }

    let stats = consumer.stats();
    info!(
        sessions = stats.sessions,
        recorded = stats.recorded,
        rejected = stats.rejected,
        "mail_consumer_shutdown_complete"
    );

    Ok(())
}
