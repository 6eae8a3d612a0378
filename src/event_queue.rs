//! The durable queue table, its insert trigger, and the dequeue path (§4.3).

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use sqlx::postgres::PgListener;
use sqlx::{Postgres, Row, Transaction};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{EventQueueOptions, Operation};
use crate::error::{HortonError, Result};
use crate::event_bus::{EventKey, NotificationBus};
use crate::gateway::{quote_ident, quote_literal, DatabaseGateway};
use crate::model::{parse_notification_payload, QueueRow, INTERNAL_PSEUDO_TABLE_LOGICAL_NAME};

const QUEUE_TABLE_LOGICAL_NAME: &str = "event_queue";
const TRIGGER_LOGICAL_NAME: &str = "event_queue_trigger";
const FUNCTION_LOGICAL_NAME: &str = "event_queue_trigger_function";
const CHANNEL_LOGICAL_NAME: &str = "event_queue_notifications";

/// Expected column signature of the queue table (name, postgres type,
/// nullable), used by [`EventQueue::validate`] to detect an incompatible
/// pre-existing table.
const EXPECTED_COLUMNS: &[(&str, &str, bool)] = &[
    ("id", "bigint", false),
    ("table_name", "text", false),
    ("operation", "text", false),
    ("previous_record", "json", true),
    ("current_record", "json", true),
    ("queued_at", "timestamp with time zone", false),
];

/// Owns the queue table, its insert trigger, the listener connection, and
/// the reconciliation timer (§4.3). Routes notifications to internal
/// subscribers (the [`crate::dispatcher::Dispatcher`]'s dequeue loop, the
/// [`crate::liveness::LivenessChecker`]'s pulse handler) via a
/// [`NotificationBus`] keyed by [`EventKey`].
pub struct EventQueue {
    gateway: Arc<DatabaseGateway>,
    options: EventQueueOptions,
    bus: Arc<NotificationBus>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    reconciler_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    pub fn new(gateway: Arc<DatabaseGateway>, options: EventQueueOptions) -> Self {
        Self {
            gateway,
            options,
            bus: Arc::new(NotificationBus::new()),
            listener_task: Mutex::new(None),
            reconciler_task: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> Arc<NotificationBus> {
        self.bus.clone()
    }

    fn table_name(&self) -> Result<String> {
        self.gateway.prefix_name(QUEUE_TABLE_LOGICAL_NAME, Some(quote_ident))
    }

    fn internal_pseudo_table(&self) -> Result<String> {
        self.gateway.prefix_name(INTERNAL_PSEUDO_TABLE_LOGICAL_NAME, None)
    }

    fn channel_name(&self) -> Result<String> {
        self.gateway.prefix_name(CHANNEL_LOGICAL_NAME, None)
    }

    /// `CREATE TABLE IF NOT EXISTS`, then a column-signature check, then
    /// (re)install the insert trigger — all inside the one transaction
    /// SPEC_FULL.md §4.3/§4.1 require, so a schema mismatch or a failed
    /// trigger install leaves no partial state behind. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        let table = self.table_name()?;
        let create_sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n\
             \u{20}\u{20}id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,\n\
             \u{20}\u{20}table_name TEXT NOT NULL,\n\
             \u{20}\u{20}operation TEXT NOT NULL,\n\
             \u{20}\u{20}previous_record JSON,\n\
             \u{20}\u{20}current_record JSON,\n\
             \u{20}\u{20}queued_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()\n\
             )"
        );

        let table_unquoted = self.gateway.prefix_name(QUEUE_TABLE_LOGICAL_NAME, None)?;
        let validate_query = validate_query_sql(&table_unquoted);

        let function_name = self.gateway.prefix_name(FUNCTION_LOGICAL_NAME, Some(quote_ident))?;
        let trigger_name = self.gateway.prefix_name(TRIGGER_LOGICAL_NAME, Some(quote_ident))?;
        let channel = self.channel_name()?;
        let (function_sql, drop_trigger_sql, create_trigger_sql) =
            trigger_sql(&table, &function_name, &trigger_name, &channel);

        self.gateway
            .transaction(move |tx| {
                Box::pin(async move {
                    sqlx::query(&create_sql).execute(&mut **tx).await?;
                    validate_signature(tx, &table_unquoted, &validate_query).await?;
                    sqlx::query(&function_sql).execute(&mut **tx).await?;
                    sqlx::query(&drop_trigger_sql).execute(&mut **tx).await?;
                    sqlx::query(&create_trigger_sql).execute(&mut **tx).await?;
                    Ok(())
                })
            })
            .await?;

        tracing::info!(table = %table, "event queue initialized");
        Ok(())
    }

    /// Reads the queue table's column signature from the information schema
    /// and checks it matches [`EXPECTED_COLUMNS`] exactly. Exposed standalone
    /// for hosts that want to probe schema compatibility outside of
    /// `initialize()`, which runs the same check inline within its own
    /// transaction.
    pub async fn validate(&self) -> Result<()> {
        let table_unquoted = self.gateway.prefix_name(QUEUE_TABLE_LOGICAL_NAME, None)?;
        let query = validate_query_sql(&table_unquoted);

        self.gateway
            .transaction(move |tx| Box::pin(async move { validate_signature(tx, &table_unquoted, &query).await }))
            .await
    }

    /// Inserts one row; the queue table's own trigger emits the notification.
    pub async fn queue(
        &self,
        table_name: &str,
        operation: &str,
        previous_record: Option<serde_json::Value>,
        current_record: Option<serde_json::Value>,
    ) -> Result<()> {
        let table = self.table_name()?;
        let insert_sql = format!(
            "INSERT INTO {table} (table_name, operation, previous_record, current_record) \
             VALUES ($1, $2, $3, $4)"
        );
        let table_name = table_name.to_string();
        let operation = operation.to_string();

        self.gateway
            .transaction(move |tx| {
                Box::pin(async move {
                    sqlx::query(&insert_sql)
                        .bind(table_name)
                        .bind(operation)
                        .bind(previous_record)
                        .bind(current_record)
                        .execute(&mut **tx)
                        .await?;
                    Ok(())
                })
            })
            .await
    }

    /// Enqueues an internal row (e.g. a liveness pulse) under the reserved
    /// pseudo-table name.
    pub async fn queue_internal(&self, operation: &str, metadata: serde_json::Value) -> Result<()> {
        let internal_table = self.internal_pseudo_table()?;
        self.queue(&internal_table, operation, None, Some(metadata)).await
    }

    /// Locks, invokes `callback`, and deletes the row on success, all in one
    /// transaction. A missing row (already claimed) is a silent no-op.
    /// Returns `Ok(None)` when no row was found, `Ok(Some(handler_ok))`
    /// otherwise, where `handler_ok` reflects whether `callback` succeeded
    /// (used by callers honouring `HandlerFailurePolicy::PreserveRowOnFailure`).
    pub async fn dequeue<F>(&self, row_id: i64, callback: F) -> Result<Option<bool>>
    where
        F: for<'c> FnOnce(QueueRow) -> BoxFuture<'c, bool> + Send,
    {
        let table = self.table_name()?;
        let select_sql = format!(
            "SELECT id, table_name, operation, previous_record, current_record, queued_at \
             FROM {table} WHERE id = $1 FOR UPDATE"
        );
        let delete_sql = format!("DELETE FROM {table} WHERE id = $1");

        self.gateway
            .transaction(move |tx| {
                Box::pin(async move {
                    let row: Option<QueueRow> = sqlx::query_as(&select_sql)
                        .bind(row_id)
                        .fetch_optional(&mut **tx)
                        .await?;

                    let Some(row) = row else {
                        return Ok(None);
                    };

                    let handler_ok = callback(row).await;
                    if handler_ok {
                        sqlx::query(&delete_sql).bind(row_id).execute(&mut **tx).await?;
                    }
                    Ok(Some(handler_ok))
                })
            })
            .await
    }

    /// Starts the listener connection and the reconciliation timer.
    pub async fn connect(&self) -> Result<()> {
        let channel = self.channel_name()?;
        let mut listener = self.gateway.create_listener().await?;
        listener.listen(&channel).await?;

        let internal_pseudo_table = self.internal_pseudo_table()?;
        let bus = self.bus.clone();
        let gateway = self.gateway.clone();
        let listener_handle = tokio::spawn(listener_loop(listener, gateway, channel, internal_pseudo_table, bus));
        *self.listener_task.lock().await = Some(listener_handle);

        let reconciler_handle = tokio::spawn(reconciliation_loop(
            self.gateway.clone(),
            self.table_name()?,
            self.internal_pseudo_table()?,
            self.options.reconciliation_frequency_ms,
            self.bus.clone(),
        ));
        *self.reconciler_task.lock().await = Some(reconciler_handle);

        tracing::info!("event queue connected");
        Ok(())
    }

    /// Stops the reconciler, force-releases the listener, and waits
    /// `grace_period_ms` (default from [`EventQueueOptions::dequeue_grace_period_ms`])
    /// for in-flight dequeues to settle.
    pub async fn disconnect(&self, grace_period_ms: Option<u64>) -> Result<()> {
        if let Some(handle) = self.reconciler_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.listener_task.lock().await.take() {
            handle.abort();
        }

        let grace_period = grace_period_ms.unwrap_or(self.options.dequeue_grace_period_ms);
        tokio::time::sleep(Duration::from_millis(grace_period)).await;

        tracing::info!("event queue disconnected");
        Ok(())
    }

    /// `disconnect(cooldown)` followed by `connect()`; used by the liveness
    /// checker to recover a stalled listener.
    pub async fn reconnect(&self, cooldown_ms: u64) -> Result<()> {
        self.disconnect(Some(cooldown_ms)).await?;
        self.connect().await
    }

    /// Drops the queue table's insert trigger/function and the table itself,
    /// in one transaction. Used by the dispatcher's `teardown()` (§4.5).
    pub async fn teardown(&self) -> Result<()> {
        let table = self.table_name()?;
        let function_name = self.gateway.prefix_name(FUNCTION_LOGICAL_NAME, Some(quote_ident))?;
        let trigger_name = self.gateway.prefix_name(TRIGGER_LOGICAL_NAME, Some(quote_ident))?;

        let drop_trigger_sql = format!("DROP TRIGGER IF EXISTS {trigger_name} ON {table}");
        let drop_function_sql = format!("DROP FUNCTION IF EXISTS {function_name}()");
        let drop_table_sql = format!("DROP TABLE IF EXISTS {table}");

        self.gateway
            .transaction(move |tx| {
                Box::pin(async move {
                    sqlx::query(&drop_trigger_sql).execute(&mut **tx).await?;
                    sqlx::query(&drop_function_sql).execute(&mut **tx).await?;
                    sqlx::query(&drop_table_sql).execute(&mut **tx).await?;
                    Ok(())
                })
            })
            .await?;

        tracing::info!("event queue torn down");
        Ok(())
    }
}

/// Builds the information-schema query used to read back a table's column
/// signature, shared by `initialize()` (inline, one transaction) and the
/// standalone `validate()`.
fn validate_query_sql(table_unquoted: &str) -> String {
    let table_literal = quote_literal(table_unquoted);
    format!(
        "SELECT column_name, data_type, is_nullable = 'YES' AS is_nullable \
         FROM information_schema.columns \
         WHERE table_name = {table_literal} AND table_schema = current_schema() \
         ORDER BY ordinal_position"
    )
}

/// Runs `query` against the open `tx` and checks the result matches
/// [`EXPECTED_COLUMNS`] exactly.
async fn validate_signature(tx: &mut Transaction<'_, Postgres>, table_unquoted: &str, query: &str) -> Result<()> {
    let actual: Vec<(String, String, bool)> = sqlx::query_as(query).fetch_all(&mut **tx).await?;
    let expected: Vec<(String, String, bool)> = EXPECTED_COLUMNS
        .iter()
        .map(|(name, ty, nullable)| (name.to_string(), ty.to_string(), *nullable))
        .collect();

    if actual != expected {
        return Err(HortonError::schema_mismatch(format!(
            "queue table {table_unquoted} exists but is not valid: expected columns {expected:?}, found {actual:?}"
        )));
    }
    Ok(())
}

/// Builds the `(function_sql, drop_trigger_sql, create_trigger_sql)` triple
/// for the queue table's own `AFTER INSERT` trigger, which fires `pg_notify`
/// with the `"<rowId>:<tableName>:<operation>"` payload.
fn trigger_sql(table: &str, function_name: &str, trigger_name: &str, channel: &str) -> (String, String, String) {
    let function_sql = format!(
        "CREATE OR REPLACE FUNCTION {function_name}() RETURNS trigger AS $fn$\n\
         BEGIN\n\
         \u{20}\u{20}PERFORM pg_notify('{channel}', NEW.id || ':' || NEW.table_name || ':' || NEW.operation);\n\
         \u{20}\u{20}RETURN NEW;\n\
         END;\n\
         $fn$ LANGUAGE plpgsql;"
    );
    let drop_trigger_sql = format!("DROP TRIGGER IF EXISTS {trigger_name} ON {table}");
    let create_trigger_sql = format!(
        "CREATE TRIGGER {trigger_name} AFTER INSERT ON {table} \
         FOR EACH ROW EXECUTE FUNCTION {function_name}()"
    );
    (function_sql, drop_trigger_sql, create_trigger_sql)
}

async fn listener_loop(
    mut listener: PgListener,
    gateway: Arc<DatabaseGateway>,
    channel: String,
    internal_pseudo_table: String,
    bus: Arc<NotificationBus>,
) {
    loop {
        match listener.recv().await {
            Ok(notification) => {
                let payload = notification.payload();
                match parse_notification_payload(payload) {
                    Ok((row_id, table_name, operation)) => {
                        emit_routed(&bus, &internal_pseudo_table, row_id, &table_name, &operation).await;
                    }
                    Err(error) => {
                        tracing::debug!(%error, %payload, "dropped malformed queue notification");
                    }
                }
            }
            Err(error) => {
                tracing::error!(%error, "listener connection lost, reconnecting");
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    match gateway.create_listener().await {
                        Ok(mut fresh) => {
                            if fresh.listen(&channel).await.is_ok() {
                                listener = fresh;
                                break;
                            }
                        }
                        Err(error) => {
                            tracing::error!(%error, "failed to re-establish listener connection");
                        }
                    }
                }
            }
        }
    }
}

async fn reconciliation_loop(
    gateway: Arc<DatabaseGateway>,
    table: String,
    internal_pseudo_table: String,
    frequency_ms: u64,
    bus: Arc<NotificationBus>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(frequency_ms));
    loop {
        ticker.tick().await;

        let select_sql = format!(
            "SELECT id, table_name, operation FROM {table} \
             ORDER BY queued_at ASC FOR UPDATE SKIP LOCKED LIMIT 1000"
        );
        let result: Result<Vec<(i64, String, String)>> = gateway
            .transaction(|tx| {
                let select_sql = select_sql.clone();
                Box::pin(async move {
                    let rows = sqlx::query(&select_sql)
                        .fetch_all(&mut **tx)
                        .await?
                        .into_iter()
                        .map(|row| {
                            (
                                row.get::<i64, _>("id"),
                                row.get::<String, _>("table_name"),
                                row.get::<String, _>("operation"),
                            )
                        })
                        .collect();
                    Ok(rows)
                })
            })
            .await;

        match result {
            Ok(rows) => {
                for (row_id, table_name, operation) in rows {
                    emit_routed(&bus, &internal_pseudo_table, row_id, &table_name, &operation).await;
                }
            }
            Err(error) => {
                tracing::error!(%error, "reconciliation scan failed, will retry next tick");
            }
        }
    }
}

/// Routes one `(row_id, table_name, operation)` triple to every relevant
/// [`EventKey`] bucket: `internal:<operation>` for internal rows, or both
/// `queued:<table>:<operation>` and `<table>:*` for source-table rows.
async fn emit_routed(
    bus: &NotificationBus,
    internal_pseudo_table: &str,
    row_id: i64,
    table_name: &str,
    operation: &str,
) {
    if table_name == internal_pseudo_table {
        bus.emit(&EventKey::Internal(operation.to_string()), row_id).await;
        return;
    }

    if let Ok(op) = operation.parse::<Operation>() {
        bus.emit(&EventKey::Queued(table_name.to_string(), op), row_id).await;
    }
    bus.emit(&EventKey::Wildcard(table_name.to_string()), row_id).await;
}
