//! Configuration types accepted by [`crate::Dispatcher`]
//!
//! Mirrors the environment-backed `Config` pattern this codebase uses elsewhere,
//! but as a plain `serde`-deserializable struct: this crate is a library, not a
//! process, so it never reads the environment itself unless the host asks it to
//! via [`ConnectionOptions::from_env`].

use std::collections::{HashMap, HashSet};
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::{HortonError, Result};

/// Characters allowed in the object-name prefix and source-table names.
///
/// Open question (see SPEC_FULL.md §9): the server permits digits and
/// uppercase in identifiers, but this crate preserves the stricter grammar
/// for bug-compatibility with the upstream design.
const PREFIX_GRAMMAR: &str = r"^[a-z_-]+$";

/// Characters allowed in projected column names. Slightly wider than the
/// prefix grammar since columns are real, pre-existing identifiers rather
/// than names this crate invents.
const COLUMN_GRAMMAR: &str = r"^[a-z_][a-z0-9_]*$";

fn matches(pattern: &str, value: &str) -> bool {
    regex::Regex::new(pattern)
        .expect("static grammar is a valid regex")
        .is_match(value)
}

/// A single trigger operation a host can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = HortonError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(HortonError::configuration(format!(
                "unknown trigger operation: {other}"
            ))),
        }
    }
}

/// The internal operation used for liveness pulses. Kept distinct from
/// [`Operation`] because it never flows through a real source-table trigger.
pub const LIVENESS_PULSE_OPERATION: &str = "LIVENESS_PULSE";

/// Declarative per-table listener configuration supplied by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableListenerConfig {
    /// Operations this table should be watched for.
    pub operations: HashSet<Operation>,
    /// `None` means "whole row"; `Some(vec![])` means "no payload" (null
    /// records); `Some(columns)` means "project to these columns, in this
    /// order, as a keyed record".
    #[serde(default)]
    pub record_columns: Option<Vec<String>>,
}

impl TableListenerConfig {
    pub fn new(operations: impl IntoIterator<Item = Operation>) -> Self {
        Self {
            operations: operations.into_iter().collect(),
            record_columns: None,
        }
    }

    pub fn with_record_columns(mut self, columns: Vec<String>) -> Self {
        self.record_columns = Some(columns);
        self
    }

    pub(crate) fn validate(&self, table_name: &str) -> Result<()> {
        if self.operations.is_empty() {
            return Err(HortonError::configuration(format!(
                "table listener for {table_name} has no operations configured"
            )));
        }
        if let Some(columns) = &self.record_columns {
            for column in columns {
                if !matches(COLUMN_GRAMMAR, column) {
                    return Err(HortonError::configuration(format!(
                        "invalid column name {column:?} in record_columns for table {table_name}"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl From<Vec<Operation>> for TableListenerConfig {
    fn from(operations: Vec<Operation>) -> Self {
        Self::new(operations)
    }
}

/// Either a connection string this crate should build its own pool from, or
/// a pool the host has already built and wants this crate to adopt.
#[derive(Clone)]
pub enum PoolSource {
    ConnectionString(String),
    Existing(PgPool),
}

impl std::fmt::Debug for PoolSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolSource::ConnectionString(_) => f.write_str("PoolSource::ConnectionString(..)"),
            PoolSource::Existing(_) => f.write_str("PoolSource::Existing(..)"),
        }
    }
}

/// Connection-level configuration for the [`crate::gateway::DatabaseGateway`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub pool_source: PoolSource,
    /// Shared prefix for every managed database object. Must match
    /// `^[a-z_-]+$`.
    pub prefix: String,
    /// Maximum number of pooled connections (ignored when `pool_source` is
    /// [`PoolSource::Existing`]).
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl ConnectionOptions {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            pool_source: PoolSource::ConnectionString(connection_string.into()),
            prefix: default_prefix(),
            max_connections: default_max_connections(),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool_source: PoolSource::Existing(pool),
            prefix: default_prefix(),
            max_connections: default_max_connections(),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }

    /// Build from `DATABASE_URL` / `HORTON_PREFIX` / `HORTON_MAX_CONNECTIONS`
    /// environment variables, in the style of this codebase's env-backed
    /// `Config::from_env`.
    pub fn from_env() -> Result<Self> {
        let url = env::var("DATABASE_URL")
            .map_err(|_| HortonError::configuration("DATABASE_URL must be set"))?;

        let mut options = Self::new(url);

        if let Ok(prefix) = env::var("HORTON_PREFIX") {
            options.prefix = prefix;
        }
        if let Ok(max_connections) = env::var("HORTON_MAX_CONNECTIONS") {
            options.max_connections = max_connections
                .parse()
                .map_err(|e| HortonError::configuration(format!("invalid HORTON_MAX_CONNECTIONS: {e}")))?;
        }

        options.validate()?;
        Ok(options)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !matches(PREFIX_GRAMMAR, &self.prefix) {
            return Err(HortonError::configuration(format!(
                "prefix {:?} does not match {PREFIX_GRAMMAR}",
                self.prefix
            )));
        }
        Ok(())
    }
}

fn default_prefix() -> String {
    "horton-meta".to_string()
}

fn default_max_connections() -> u32 {
    10
}

/// Validates a source-table name and projected-column names against the
/// conservative identifier grammar (§4.1, §9).
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    if !matches(PREFIX_GRAMMAR, name) {
        return Err(HortonError::configuration(format!(
            "identifier {name:?} does not match {PREFIX_GRAMMAR}"
        )));
    }
    Ok(())
}

/// Configuration for the [`crate::event_queue::EventQueue`].
#[derive(Debug, Clone)]
pub struct EventQueueOptions {
    pub reconciliation_frequency_ms: u64,
    pub dequeue_grace_period_ms: u64,
}

impl Default for EventQueueOptions {
    fn default() -> Self {
        Self {
            reconciliation_frequency_ms: 5_000,
            dequeue_grace_period_ms: 5_000,
        }
    }
}

/// Configuration for the [`crate::liveness::LivenessChecker`].
#[derive(Debug, Clone)]
pub struct LivenessCheckerOptions {
    pub pulse_interval_ms: u64,
    pub max_missed_pulses: u32,
}

impl Default for LivenessCheckerOptions {
    fn default() -> Self {
        Self {
            pulse_interval_ms: 10_000,
            max_missed_pulses: 3,
        }
    }
}

/// How the [`crate::dispatcher::Dispatcher`] should treat a dequeue whose
/// handler(s) returned `Err` (SPEC_FULL.md §9, resolved open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerFailurePolicy {
    /// Drop the error, commit the dequeue (row removed). Matches the
    /// upstream design's documented behaviour.
    #[default]
    DropAndCommit,
    /// Skip the `DELETE`, roll back the dequeue transaction, so the row is
    /// redelivered on the next reconciliation pass.
    PreserveRowOnFailure,
}

/// Top-level configuration passed to [`crate::dispatcher::Dispatcher::new`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub connection: ConnectionOptions,
    pub table_listeners: HashMap<String, TableListenerConfig>,
    pub event_queue: EventQueueOptions,
    pub liveness_checker: LivenessCheckerOptions,
    pub handler_failure_policy: HandlerFailurePolicy,
}

impl DispatcherConfig {
    pub fn new(connection: ConnectionOptions) -> Self {
        Self {
            connection,
            table_listeners: HashMap::new(),
            event_queue: EventQueueOptions::default(),
            liveness_checker: LivenessCheckerOptions::default(),
            handler_failure_policy: HandlerFailurePolicy::default(),
        }
    }

    pub fn with_table_listener(
        mut self,
        table_name: impl Into<String>,
        config: impl Into<TableListenerConfig>,
    ) -> Self {
        self.table_listeners.insert(table_name.into(), config.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        for (table_name, config) in &self.table_listeners {
            validate_identifier(table_name)?;
            config.validate(table_name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_grammar_rejects_digits_and_uppercase() {
        let opts = ConnectionOptions::new("postgres://x").with_prefix("Horton1");
        assert!(opts.validate().is_err());
    }

    #[test]
    fn prefix_grammar_accepts_lowercase_dashes_and_underscores() {
        let opts = ConnectionOptions::new("postgres://x").with_prefix("horton-meta_v2");
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn operation_round_trips_through_str() {
        for op in [Operation::Insert, Operation::Update, Operation::Delete] {
            let parsed: Operation = op.as_str().parse().unwrap();
            assert_eq!(parsed, op);
        }
    }

    #[test]
    fn unknown_operation_is_configuration_fault() {
        let result = "TRUNCATE".parse::<Operation>();
        assert!(matches!(result, Err(HortonError::Configuration(_))));
    }

    #[test]
    fn table_listener_requires_at_least_one_operation() {
        let config = TableListenerConfig {
            operations: HashSet::new(),
            record_columns: None,
        };
        assert!(config.validate("t").is_err());
    }

    #[test]
    fn table_listener_rejects_invalid_column_name() {
        let config = TableListenerConfig::new([Operation::Update]).with_record_columns(vec!["Bad Column".into()]);
        assert!(config.validate("t").is_err());
    }

    #[test]
    fn table_listener_from_vec_implies_whole_row() {
        let config: TableListenerConfig = vec![Operation::Insert].into();
        assert_eq!(config.operations.len(), 1);
        assert!(config.record_columns.is_none());
    }
}
