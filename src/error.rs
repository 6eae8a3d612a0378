//! Error types for the crate

use thiserror::Error;

/// Result type alias using [`HortonError`]
pub type Result<T> = std::result::Result<T, HortonError>;

/// Crate-wide error type
///
/// Every public async function in this crate returns `horton::Result<T>`. Internal
/// helpers may reach for `anyhow::Result` only inside test harnesses.
#[derive(Debug, Error)]
pub enum HortonError {
    /// A connection-pool or live-connection failure surfaced by the driver
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The pool itself could not be built, or a dedicated listener connection
    /// could not be acquired
    #[error("connection pool error: {0}")]
    Pool(String),

    /// An invalid prefix, table name, column name, or operation was supplied
    /// at construction/connect time
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The queue table pre-exists with a column signature that does not
    /// match what this crate expects
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A spawned background task (listener, reconciler, pulse timer) panicked
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Miscellaneous I/O failure (e.g. building a connection string)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HortonError {
    /// Build a [`HortonError::Configuration`]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Build a [`HortonError::SchemaMismatch`]
    pub fn schema_mismatch(msg: impl Into<String>) -> Self {
        Self::SchemaMismatch(msg.into())
    }

    /// Build a [`HortonError::Pool`]
    pub fn pool(msg: impl Into<String>) -> Self {
        Self::Pool(msg.into())
    }
}
