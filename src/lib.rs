//! Trigger-based change-data-capture for PostgreSQL, without logical replication.
//!
//! A host configures a set of source tables and operations of interest via
//! [`DispatcherConfig`]; [`Dispatcher`] installs the database-side triggers,
//! drains the resulting change log through a push notification plus a
//! periodic polling reconciler, and invokes registered handlers with the
//! previous and current row images.
//!
//! `Dispatcher::connect` takes `self: &Arc<Self>` because the dequeue
//! routes it wires hold a back-reference to the dispatcher for the lifetime
//! of the connection; construct it with `Arc::new(Dispatcher::new(config)?)`.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event_bus;
pub mod event_queue;
pub mod gateway;
pub mod liveness;
pub mod model;
pub mod trigger_installer;

pub use config::{
    ConnectionOptions, DispatcherConfig, EventQueueOptions, HandlerFailurePolicy, LivenessCheckerOptions, Operation,
    PoolSource, TableListenerConfig,
};
pub use dispatcher::Dispatcher;
pub use error::{HortonError, Result};
pub use event_bus::{health_handler, row_handler, EventKey, HealthHandler, RowHandler};
pub use liveness::HealthEvent;
pub use model::{QueueNotification, QueueRow, Record};

/// Initializes a `tracing` subscriber reading `RUST_LOG`, falling back to a
/// sensible default for this crate's own spans. Hosts embedding this crate
/// into an application that already configures `tracing` should skip this
/// and just ensure a subscriber is installed before calling `connect`.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "horton=debug,info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
