//! Connection pool, transaction scope, and identifier prefixing (§4.1).
//!
//! Centralising escaping and prefixing here concentrates injection risk into
//! one boundary, and transaction scoping guarantees atomic schema changes.

use futures_util::future::BoxFuture;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::RwLock;

use crate::config::{validate_identifier, ConnectionOptions, PoolSource};
use crate::error::{HortonError, Result};

/// Quotes a validated identifier as a double-quoted SQL identifier.
///
/// Every identifier reaching this function has already passed
/// [`validate_identifier`] (restricted to `^[a-z_-]+$`), so no embedded quote
/// or backslash can occur; the quoting is still applied so the identifier is
/// never interpolated bare.
pub fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

/// Quotes a string as a SQL string literal, doubling any embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Wraps the driver's connection pool (§4.1).
pub struct DatabaseGateway {
    options: ConnectionOptions,
    pool: RwLock<Option<PgPool>>,
}

impl DatabaseGateway {
    pub fn new(options: ConnectionOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            pool: RwLock::new(None),
        })
    }

    /// Idempotent: a second call while already connected is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let pool = match &self.options.pool_source {
            PoolSource::Existing(pool) => pool.clone(),
            PoolSource::ConnectionString(url) => PgPoolOptions::new()
                .max_connections(self.options.max_connections)
                .acquire_timeout(self.options.acquire_timeout)
                .idle_timeout(self.options.idle_timeout)
                .max_lifetime(self.options.max_lifetime)
                .connect(url)
                .await
                .map_err(|e| HortonError::pool(e.to_string()))?,
        };

        tracing::info!(
            max_connections = self.options.max_connections,
            prefix = %self.options.prefix,
            "database gateway connected"
        );

        *guard = Some(pool);
        Ok(())
    }

    /// Idempotent: drains in-flight transactions and closes every borrowed
    /// connection. A second call while already disconnected is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.take() {
            pool.close().await;
            tracing::info!("database gateway disconnected");
        }
        Ok(())
    }

    pub async fn check_health(&self) -> Result<()> {
        let pool = self.pool().await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    async fn pool(&self) -> Result<PgPool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| HortonError::pool("gateway is not connected"))
    }

    /// Borrows one connection, runs `BEGIN`, passes it to `f`, and commits on
    /// `Ok` or rolls back on `Err`; always releases the connection.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut Transaction<'_, Postgres>) -> BoxFuture<'c, Result<T>> + Send,
        T: Send,
    {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await?;

        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                // Rolling back is best-effort: the connection is dropped
                // either way, which itself aborts the transaction.
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    /// Borrows a dedicated, long-lived connection for the asynchronous
    /// notification channel (§4.1). The caller owns the returned listener
    /// for as long as it needs it.
    pub async fn create_listener(&self) -> Result<PgListener> {
        let pool = self.pool().await?;
        let listener = PgListener::connect_with(&pool).await?;
        Ok(listener)
    }

    /// Returns `"<prefix>__<logicalName>"`, validating both halves against
    /// the conservative identifier grammar and optionally passing the
    /// result through an identifier/literal escaper.
    pub fn prefix_name(&self, logical_name: &str, escaper: Option<fn(&str) -> String>) -> Result<String> {
        validate_identifier(logical_name)?;
        let prefixed = format!("{}__{}", self.options.prefix, logical_name);
        Ok(match escaper {
            Some(escape) => escape(&prefixed),
            None => prefixed,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.options.prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_name_joins_with_double_underscore() {
        let gateway = DatabaseGateway::new(ConnectionOptions::new("postgres://x")).unwrap();
        assert_eq!(
            gateway.prefix_name("event_queue", None).unwrap(),
            "horton-meta__event_queue"
        );
    }

    #[test]
    fn prefix_name_applies_escaper() {
        let gateway = DatabaseGateway::new(ConnectionOptions::new("postgres://x")).unwrap();
        let escaped = gateway.prefix_name("event_queue", Some(quote_ident)).unwrap();
        assert_eq!(escaped, "\"horton-meta__event_queue\"");
    }

    #[test]
    fn prefix_name_rejects_invalid_logical_name() {
        let gateway = DatabaseGateway::new(ConnectionOptions::new("postgres://x")).unwrap();
        assert!(gateway.prefix_name("Bad Name", None).is_err());
    }

    #[test]
    fn quote_literal_doubles_embedded_quotes() {
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }
}
