//! Top-level lifecycle and the user-facing event surface (§4.5).

use std::sync::Arc;

use crate::config::{DispatcherConfig, HandlerFailurePolicy, Operation};
use crate::error::Result;
use crate::event_bus::{EventBus, EventKey, HealthBus, HealthHandler, RowHandler};
use crate::event_queue::EventQueue;
use crate::gateway::DatabaseGateway;
use crate::liveness::{HealthEvent, LivenessChecker};
use crate::trigger_installer::TriggerInstaller;

/// The library's single entry point. Owns the gateway, the event queue, the
/// trigger installer, the liveness checker, and the user-facing event bus,
/// and wires them together per `config` (§4.5, §9).
pub struct Dispatcher {
    config: DispatcherConfig,
    gateway: Arc<DatabaseGateway>,
    queue: Arc<EventQueue>,
    trigger_installer: Arc<TriggerInstaller>,
    liveness_checker: Arc<LivenessChecker>,
    event_bus: Arc<EventBus>,
    health_bus: Arc<HealthBus>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        config.validate()?;

        let gateway = Arc::new(DatabaseGateway::new(config.connection.clone())?);
        let queue = Arc::new(EventQueue::new(gateway.clone(), config.event_queue.clone()));
        let trigger_installer = Arc::new(TriggerInstaller::new(gateway.clone()));
        let health_bus = Arc::new(HealthBus::new());
        let liveness_checker = Arc::new(LivenessChecker::new(
            queue.clone(),
            config.liveness_checker.clone(),
            health_bus.clone(),
        ));

        Ok(Self {
            config,
            gateway,
            queue,
            trigger_installer,
            liveness_checker,
            event_bus: Arc::new(EventBus::new()),
            health_bus,
        })
    }

    /// Connects the gateway and the event queue, optionally initialises the
    /// queue's schema objects, installs every configured table's listener
    /// trigger, wires the dequeue loop to the queue's notification bus, and
    /// starts the liveness checker.
    pub async fn connect(self: &Arc<Self>, initialize_queue: bool) -> Result<()> {
        self.gateway.connect().await?;

        if initialize_queue {
            self.queue.initialize().await?;
        }

        for (table_name, table_config) in &self.config.table_listeners {
            self.trigger_installer.install(table_name, table_config).await?;
        }

        self.wire_dequeue_routes().await;
        self.wire_health_reactions().await;

        self.queue.connect().await?;
        self.liveness_checker.start().await?;

        tracing::info!("dispatcher connected");
        Ok(())
    }

    /// Subscribes the dispatcher's own reaction to liveness transitions
    /// (§4.4): `Unhealthy` reconnects the event queue, `Dead` initiates a
    /// full disconnect. Host-registered handlers via `subscribe_health` run
    /// independently of this reaction.
    async fn wire_health_reactions(self: &Arc<Self>) {
        let dispatcher = self.clone();
        self.health_bus
            .subscribe(crate::event_bus::health_handler(move |event| {
                let dispatcher = dispatcher.clone();
                async move {
                    match event {
                        HealthEvent::Unhealthy { .. } => {
                            tracing::warn!("liveness unhealthy, reconnecting event queue");
                            let cooldown_ms = dispatcher.config.liveness_checker.pulse_interval_ms;
                            if let Err(error) = dispatcher.queue.reconnect(cooldown_ms).await {
                                tracing::error!(%error, "failed to reconnect event queue after unhealthy status");
                            }
                        }
                        HealthEvent::Dead { .. } => {
                            tracing::error!("liveness dead, disconnecting dispatcher");
                            // Spawned rather than awaited inline: this handler runs on the
                            // liveness checker's own pulse task, and disconnect() aborts
                            // that very task as its first step.
                            tokio::spawn(async move {
                                if let Err(error) = dispatcher.disconnect(None).await {
                                    tracing::error!(%error, "failed to disconnect after dead status");
                                }
                            });
                        }
                        HealthEvent::Healthy { .. } | HealthEvent::Heartbeat { .. } => {}
                    }
                }
            }))
            .await;
    }

    /// For each configured `(table, operation)`, subscribes a notification
    /// handler that dequeues the row and fans it out to both the
    /// operation-specific and the wildcard row-handler buckets.
    async fn wire_dequeue_routes(self: &Arc<Self>) {
        let notification_bus = self.queue.bus();

        for (table_name, table_config) in &self.config.table_listeners {
            for operation in &table_config.operations {
                let dispatcher = self.clone();
                let table_name = table_name.clone();
                let operation = *operation;

                notification_bus
                    .subscribe(
                        EventKey::Queued(table_name.clone(), operation),
                        crate::event_bus::notification_handler(move |row_id| {
                            let dispatcher = dispatcher.clone();
                            let table_name = table_name.clone();
                            async move { dispatcher.dequeue_and_dispatch(row_id, &table_name, operation).await }
                        }),
                    )
                    .await;
            }
        }
    }

    /// Dequeues `row_id` and fans it out to both the `(table, operation)`
    /// bucket and the `(table, *)` wildcard bucket. Honours
    /// `HandlerFailurePolicy`: the default drops the row regardless of
    /// handler outcome; `PreserveRowOnFailure` leaves it queued when any
    /// handler failed.
    async fn dequeue_and_dispatch(&self, row_id: i64, table_name: &str, operation: Operation) {
        let event_bus = self.event_bus.clone();
        let policy = self.config.handler_failure_policy;
        let table_name = table_name.to_string();

        let result = self
            .queue
            .dequeue(row_id, move |row| {
                Box::pin(async move {
                    let operation_key = EventKey::Queued(table_name.clone(), operation);
                    let wildcard_key = EventKey::Wildcard(table_name.clone());

                    let operation_ok = event_bus.emit_sync(&operation_key, &row).await;
                    let wildcard_ok = event_bus.emit_sync(&wildcard_key, &row).await;
                    let all_ok = operation_ok && wildcard_ok;

                    match policy {
                        HandlerFailurePolicy::DropAndCommit => true,
                        HandlerFailurePolicy::PreserveRowOnFailure => all_ok,
                    }
                })
            })
            .await;

        if let Err(error) = result {
            tracing::error!(%error, row_id, "failed to dequeue row for dispatch");
        }
    }

    /// Stops the liveness checker, disconnects the event queue (honouring
    /// `grace_period_ms`), then disconnects the gateway.
    pub async fn disconnect(&self, grace_period_ms: Option<u64>) -> Result<()> {
        self.liveness_checker.stop().await;
        self.queue.disconnect(grace_period_ms).await?;
        self.gateway.disconnect().await?;

        tracing::info!("dispatcher disconnected");
        Ok(())
    }

    /// Drops every installed listener trigger and the queue's own schema
    /// objects, each in one transaction.
    pub async fn teardown(&self) -> Result<()> {
        self.trigger_installer.teardown().await?;
        self.queue.teardown().await?;
        tracing::info!("dispatcher teardown complete");
        Ok(())
    }

    pub async fn subscribe(&self, table_name: impl Into<String>, operation: Operation, handler: Arc<dyn RowHandler>) {
        self.event_bus
            .subscribe(EventKey::Queued(table_name.into(), operation), handler)
            .await;
    }

    pub async fn subscribe_wildcard(&self, table_name: impl Into<String>, handler: Arc<dyn RowHandler>) {
        self.event_bus.subscribe(EventKey::Wildcard(table_name.into()), handler).await;
    }

    pub async fn subscribe_health(&self, handler: Arc<dyn HealthHandler>) {
        self.health_bus.subscribe(handler).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptions;

    #[test]
    fn dispatcher_construction_rejects_invalid_prefix() {
        let config = DispatcherConfig::new(ConnectionOptions::new("postgres://x").with_prefix("Bad Prefix"));
        assert!(Dispatcher::new(config).is_err());
    }

    #[test]
    fn dispatcher_construction_accepts_valid_config() {
        let config = DispatcherConfig::new(ConnectionOptions::new("postgres://x"));
        assert!(Dispatcher::new(config).is_ok());
    }
}
