//! Installs/removes per-source-table trigger + trigger-function pairs (§4.2).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::{Operation, TableListenerConfig};
use crate::error::Result;
use crate::gateway::{quote_ident, quote_literal, DatabaseGateway};

/// Creates, drops, and enumerates the per-source-table triggers that feed
/// the event queue.
pub struct TriggerInstaller {
    gateway: Arc<DatabaseGateway>,
    event_queue_table_logical_name: &'static str,
}

impl TriggerInstaller {
    pub fn new(gateway: Arc<DatabaseGateway>) -> Self {
        Self {
            gateway,
            event_queue_table_logical_name: "event_queue",
        }
    }

    fn trigger_logical_name(table_name: &str) -> String {
        format!("listener_trigger_{table_name}")
    }

    fn function_logical_name(table_name: &str) -> String {
        format!("listener_trigger_{table_name}_fn")
    }

    /// Installs (or idempotently re-creates) the trigger + function pair for
    /// `table_name`, bound to the union of `config.operations`.
    pub async fn install(&self, table_name: &str, config: &TableListenerConfig) -> Result<()> {
        config.validate(table_name)?;

        let queue_table = self
            .gateway
            .prefix_name(self.event_queue_table_logical_name, Some(quote_ident))?;
        let function_name = self
            .gateway
            .prefix_name(&Self::function_logical_name(table_name), Some(quote_ident))?;
        let trigger_name = self
            .gateway
            .prefix_name(&Self::trigger_logical_name(table_name), Some(quote_ident))?;
        let quoted_table = quote_ident(table_name);

        let function_sql = build_function_sql(&function_name, &queue_table, table_name, config);
        let events_clause = events_clause(&config.operations);
        let create_trigger_sql = format!(
            "CREATE TRIGGER {trigger_name} AFTER {events_clause} ON {quoted_table} \
             FOR EACH ROW EXECUTE FUNCTION {function_name}()"
        );
        let drop_trigger_sql = format!("DROP TRIGGER IF EXISTS {trigger_name} ON {quoted_table}");

        self.gateway
            .transaction(move |tx| {
                Box::pin(async move {
                    sqlx::query(&function_sql).execute(&mut **tx).await?;
                    sqlx::query(&drop_trigger_sql).execute(&mut **tx).await?;
                    sqlx::query(&create_trigger_sql).execute(&mut **tx).await?;
                    Ok(())
                })
            })
            .await?;

        tracing::info!(table_name, "installed listener trigger");
        Ok(())
    }

    /// Removes the trigger + function pair for `table_name`. A no-op if
    /// neither object exists.
    pub async fn drop_listener_trigger(&self, table_name: &str) -> Result<()> {
        let function_name = self
            .gateway
            .prefix_name(&Self::function_logical_name(table_name), Some(quote_ident))?;
        let trigger_name = self
            .gateway
            .prefix_name(&Self::trigger_logical_name(table_name), Some(quote_ident))?;
        let quoted_table = quote_ident(table_name);

        let drop_trigger_sql = format!("DROP TRIGGER IF EXISTS {trigger_name} ON {quoted_table}");
        let drop_function_sql = format!("DROP FUNCTION IF EXISTS {function_name}()");

        self.gateway
            .transaction(move |tx| {
                Box::pin(async move {
                    sqlx::query(&drop_trigger_sql).execute(&mut **tx).await?;
                    sqlx::query(&drop_function_sql).execute(&mut **tx).await?;
                    Ok(())
                })
            })
            .await?;

        tracing::info!(table_name, "dropped listener trigger");
        Ok(())
    }

    /// Discovers existing installed triggers by catalogue query, grouped by
    /// source table with their operation sets.
    pub async fn find_listener_triggers(&self) -> Result<HashMap<String, HashSet<Operation>>> {
        let prefix_pattern = quote_literal(&format!("{}__listener\\_trigger\\_%", self.gateway.prefix()));

        let query = format!(
            "SELECT event_object_table AS table_name, event_manipulation AS operation \
             FROM information_schema.triggers \
             WHERE trigger_name LIKE {prefix_pattern} ESCAPE '\\' \
               AND trigger_schema = current_schema()"
        );

        let rows: Vec<(String, String)> = self
            .gateway
            .transaction(move |tx| {
                Box::pin(async move {
                    let rows = sqlx::query_as(&query).fetch_all(&mut **tx).await?;
                    Ok(rows)
                })
            })
            .await?;

        let mut grouped: HashMap<String, HashSet<Operation>> = HashMap::new();
        for (table_name, operation) in rows {
            if let Ok(op) = operation.parse::<Operation>() {
                grouped.entry(table_name).or_default().insert(op);
            }
        }
        Ok(grouped)
    }

    /// Drops every installed trigger in one transaction.
    pub async fn teardown(&self) -> Result<()> {
        let installed = self.find_listener_triggers().await?;
        for table_name in installed.keys() {
            self.drop_listener_trigger(table_name).await?;
        }
        Ok(())
    }
}

fn events_clause(operations: &HashSet<Operation>) -> String {
    let mut ordered: Vec<Operation> = operations.iter().copied().collect();
    ordered.sort_by_key(|op| op.as_str());
    ordered
        .iter()
        .map(|op| op.as_str())
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Generates the `CREATE OR REPLACE FUNCTION` body that serialises row
/// images into the queue, applying the column-projection rule (§4.2).
fn build_function_sql(
    function_name: &str,
    queue_table: &str,
    table_name: &str,
    config: &TableListenerConfig,
) -> String {
    let (previous_insert_expr, previous_update_expr, previous_delete_expr) =
        projection_exprs(&config.record_columns, "OLD");
    let current_insert_expr = match &config.record_columns {
        Some(columns) if columns.is_empty() => "NULL".to_string(),
        Some(columns) => build_object_expr(columns, "NEW"),
        None => "to_json(NEW)".to_string(),
    };
    let current_update_expr = current_insert_expr.clone();
    // DELETE synthesises currentRecord from the OLD image (§3).
    let current_delete_expr = previous_delete_expr.clone();

    let table_literal = quote_literal(table_name);

    format!(
        "CREATE OR REPLACE FUNCTION {function_name}() RETURNS trigger AS $fn$\n\
         DECLARE\n\
         \u{20}\u{20}v_previous json;\n\
         \u{20}\u{20}v_current json;\n\
         BEGIN\n\
         \u{20}\u{20}IF TG_OP = 'INSERT' THEN\n\
         \u{20}\u{20}\u{20}\u{20}v_previous := {previous_insert_expr};\n\
         \u{20}\u{20}\u{20}\u{20}v_current := {current_insert_expr};\n\
         \u{20}\u{20}ELSIF TG_OP = 'UPDATE' THEN\n\
         \u{20}\u{20}\u{20}\u{20}v_previous := {previous_update_expr};\n\
         \u{20}\u{20}\u{20}\u{20}v_current := {current_update_expr};\n\
         \u{20}\u{20}ELSIF TG_OP = 'DELETE' THEN\n\
         \u{20}\u{20}\u{20}\u{20}v_previous := {previous_delete_expr};\n\
         \u{20}\u{20}\u{20}\u{20}v_current := {current_delete_expr};\n\
         \u{20}\u{20}END IF;\n\
         \n\
         \u{20}\u{20}BEGIN\n\
         \u{20}\u{20}\u{20}\u{20}INSERT INTO {queue_table} (table_name, operation, previous_record, current_record, queued_at)\n\
         \u{20}\u{20}\u{20}\u{20}VALUES ({table_literal}, TG_OP, v_previous, v_current, clock_timestamp());\n\
         \u{20}\u{20}EXCEPTION WHEN unique_violation THEN\n\
         \u{20}\u{20}\u{20}\u{20}RAISE NOTICE 'horton: duplicate queue insert for table %, ignoring', TG_TABLE_NAME;\n\
         \u{20}\u{20}END;\n\
         \n\
         \u{20}\u{20}RETURN NULL;\n\
         END;\n\
         $fn$ LANGUAGE plpgsql;"
    )
}

/// Returns `(insert_expr, update_expr, delete_expr)` for the `previousRecord`
/// side, which is only ever sourced from `OLD` (absent on `INSERT`).
fn projection_exprs(record_columns: &Option<Vec<String>>, side: &str) -> (String, String, String) {
    let populated = match record_columns {
        Some(columns) if columns.is_empty() => "NULL".to_string(),
        Some(columns) => build_object_expr(columns, side),
        None => format!("to_json({side})"),
    };
    ("NULL".to_string(), populated.clone(), populated)
}

/// Builds a `json_build_object(...)` call rather than `jsonb_build_object`:
/// `jsonb` reorders object keys (length-then-bytewise), which would break
/// the projection's ordered-column-list guarantee (§8). `json` preserves
/// the key order it was constructed with.
fn build_object_expr(columns: &[String], side: &str) -> String {
    let pairs: Vec<String> = columns
        .iter()
        .map(|c| format!("{}, {side}.{}", quote_literal(c), quote_ident(c)))
        .collect();
    format!("json_build_object({})", pairs.join(", "))
}
