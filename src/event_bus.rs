//! Keyed multi-handler registry with synchronous, awaited fan-out (§9).
//!
//! Not a callback tree, not a typed variant dispatch — just `key → list<handler>`
//! with per-handler failure isolation. `EventBus` carries queue-row
//! notifications (row ids keyed by table/operation); `HealthBus` broadcasts
//! [`crate::liveness::HealthEvent`]s to every subscriber.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::Operation;
use crate::liveness::HealthEvent;
use crate::model::QueueRow;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Identifies a bucket of subscribers. Mirrors the wire-level routing keys
/// in SPEC_FULL.md §4.3/§6: `queued:<table>:<operation>`, `<table>:*`, and
/// `internal:<operation>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    Queued(String, Operation),
    Wildcard(String),
    Internal(String),
}

/// A user-registered row handler (§3 "Subscriber"). Implementors must
/// persist any side effect before returning: a failure here is logged and
/// swallowed, but the dequeue that invoked it still commits under the
/// default [`crate::config::HandlerFailurePolicy`].
#[async_trait]
pub trait RowHandler: Send + Sync {
    async fn handle(&self, row: QueueRow) -> anyhow::Result<()>;
}

struct ClosureRowHandler<F>(F)
where
    F: Fn(QueueRow) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

#[async_trait]
impl<F> RowHandler for ClosureRowHandler<F>
where
    F: Fn(QueueRow) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
{
    async fn handle(&self, row: QueueRow) -> anyhow::Result<()> {
        (self.0)(row).await
    }
}

/// Wraps an async closure `Fn(QueueRow) -> impl Future<Output = anyhow::Result<()>>`
/// as an `Arc<dyn RowHandler>`, so hosts don't need to hand-write a trait impl
/// for a one-off handler.
pub fn row_handler<F, Fut>(f: F) -> Arc<dyn RowHandler>
where
    F: Fn(QueueRow) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(ClosureRowHandler(move |row| Box::pin(f(row)) as BoxFuture<'static, _>))
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKey, Vec<Arc<dyn RowHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, key: EventKey, handler: Arc<dyn RowHandler>) {
        self.handlers.write().await.entry(key).or_default().push(handler);
    }

    /// Awaits every subscribed handler for `key` to completion. Returns
    /// `true` iff every handler returned `Ok`, which the caller (the
    /// dispatcher's dequeue path) uses to honour
    /// `HandlerFailurePolicy::PreserveRowOnFailure`.
    pub async fn emit_sync(&self, key: &EventKey, row: &QueueRow) -> bool {
        // Handler invocation traverses a snapshot (§5): the lock is released
        // before any handler runs, so subscribing during fan-out never
        // deadlocks and never affects the in-flight batch.
        let bucket = {
            let guard = self.handlers.read().await;
            guard.get(key).cloned().unwrap_or_default()
        };

        let mut all_succeeded = true;
        for handler in bucket {
            if let Err(error) = handler.handle(row.clone()).await {
                all_succeeded = false;
                tracing::error!(?key, row_id = row.id, %error, "row handler failed");
            }
        }
        all_succeeded
    }
}

/// The low-level notification router inside the [`crate::event_queue::EventQueue`]:
/// delivers a bare `rowId` to whatever internal consumer (the dispatcher's
/// dequeue loop, the liveness checker) is subscribed to the routing key the
/// listener/reconciler computed for that row (§4.3). Distinct from
/// [`EventBus`], which carries the fully hydrated [`QueueRow`] to
/// user-registered handlers after a successful dequeue.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, row_id: i64);
}

struct ClosureNotificationHandler<F>(F)
where
    F: Fn(i64) -> BoxFuture<'static, ()> + Send + Sync;

#[async_trait]
impl<F> NotificationHandler for ClosureNotificationHandler<F>
where
    F: Fn(i64) -> BoxFuture<'static, ()> + Send + Sync,
{
    async fn handle(&self, row_id: i64) {
        (self.0)(row_id).await
    }
}

pub fn notification_handler<F, Fut>(f: F) -> Arc<dyn NotificationHandler>
where
    F: Fn(i64) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(ClosureNotificationHandler(move |row_id| {
        Box::pin(f(row_id)) as BoxFuture<'static, ()>
    }))
}

#[derive(Default)]
pub struct NotificationBus {
    handlers: RwLock<HashMap<EventKey, Vec<Arc<dyn NotificationHandler>>>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, key: EventKey, handler: Arc<dyn NotificationHandler>) {
        self.handlers.write().await.entry(key).or_default().push(handler);
    }

    pub async fn emit(&self, key: &EventKey, row_id: i64) {
        let bucket = {
            let guard = self.handlers.read().await;
            guard.get(key).cloned().unwrap_or_default()
        };
        for handler in bucket {
            handler.handle(row_id).await;
        }
    }
}

/// A host-registered handler for liveness health transitions (§4.4, §6).
#[async_trait]
pub trait HealthHandler: Send + Sync {
    async fn handle(&self, event: HealthEvent);
}

struct ClosureHealthHandler<F>(F)
where
    F: Fn(HealthEvent) -> BoxFuture<'static, ()> + Send + Sync;

#[async_trait]
impl<F> HealthHandler for ClosureHealthHandler<F>
where
    F: Fn(HealthEvent) -> BoxFuture<'static, ()> + Send + Sync,
{
    async fn handle(&self, event: HealthEvent) {
        (self.0)(event).await
    }
}

pub fn health_handler<F, Fut>(f: F) -> Arc<dyn HealthHandler>
where
    F: Fn(HealthEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(ClosureHealthHandler(move |event| Box::pin(f(event)) as BoxFuture<'static, ()>))
}

#[derive(Default)]
pub struct HealthBus {
    handlers: RwLock<Vec<Arc<dyn HealthHandler>>>,
}

impl HealthBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, handler: Arc<dyn HealthHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub async fn emit(&self, event: HealthEvent) {
        let bucket = self.handlers.read().await.clone();
        for handler in bucket {
            handler.handle(event.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sample_row(id: i64) -> QueueRow {
        QueueRow {
            id,
            table_name: "t".into(),
            operation: "INSERT".into(),
            previous_record: None,
            current_record: None,
            queued_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn wildcard_and_operation_subscribers_both_fire() {
        let bus = EventBus::new();
        let wildcard_calls = Arc::new(AtomicUsize::new(0));
        let op_calls = Arc::new(AtomicUsize::new(0));

        {
            let counter = wildcard_calls.clone();
            bus.subscribe(
                EventKey::Wildcard("t".into()),
                row_handler(move |_row| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await;
        }
        {
            let counter = op_calls.clone();
            bus.subscribe(
                EventKey::Queued("t".into(), Operation::Insert),
                row_handler(move |_row| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await;
        }

        let row = sample_row(1);
        let ok_wildcard = bus.emit_sync(&EventKey::Wildcard("t".into()), &row).await;
        let ok_op = bus
            .emit_sync(&EventKey::Queued("t".into(), Operation::Insert), &row)
            .await;

        assert!(ok_wildcard && ok_op);
        assert_eq!(wildcard_calls.load(Ordering::SeqCst), 1);
        assert_eq!(op_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_failing_handler_does_not_block_the_others() {
        let bus = EventBus::new();
        let ran = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            EventKey::Wildcard("t".into()),
            row_handler(|_row| async move { Err(anyhow::anyhow!("boom")) }),
        )
        .await;
        {
            let ran = ran.clone();
            bus.subscribe(
                EventKey::Wildcard("t".into()),
                row_handler(move |_row| {
                    let ran = ran.clone();
                    async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await;
        }

        let all_ok = bus.emit_sync(&EventKey::Wildcard("t".into()), &sample_row(1)).await;

        assert!(!all_ok);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
