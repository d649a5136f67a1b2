//! Persistence for recorded mails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One row of the `mails` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailRecord {
    pub client_id: Option<i64>,
    pub to_email: String,
    pub subject: String,
    pub body: String,
}

/// Records processed mail notifications.
///
/// Implementations must tolerate concurrent calls.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Insert `record`, returning the generated id.
    async fn record_delivery(&self, record: &MailRecord) -> Result<u64, StoreError>;
}

#[async_trait]
impl<T: MailStore + ?Sized> MailStore for Arc<T> {
    async fn record_delivery(&self, record: &MailRecord) -> Result<u64, StoreError> {
        (**self).record_delivery(record).await
    }
}

/// Create a MySQL connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<MySqlPool> {
    let pool = MySqlPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!(max_connections, "mysql_connected");
    Ok(pool)
}

/// [`MailStore`] backed by the MySQL `mails` table.
#[derive(Debug, Clone)]
pub struct MySqlMailStore {
    pool: MySqlPool,
}

impl MySqlMailStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Create the `mails` table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mails (
                id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
                client_id BIGINT NULL,
                to_email VARCHAR(255) NOT NULL,
                subject VARCHAR(255) NOT NULL,
                body TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MailStore for MySqlMailStore {
    async fn record_delivery(&self, record: &MailRecord) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO mails (client_id, to_email, subject, body) VALUES (?, ?, ?, ?)",
        )
        .bind(record.client_id)
        .bind(&record.to_email)
        .bind(&record.subject)
        .bind(&record.body)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_id())
    }
}
