//! Liveness end-to-end: the checker should observe its own pulses round-trip.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use horton::{health_handler, HealthEvent};

#[tokio::test]
async fn pulses_round_trip_and_report_healthy() {
    let (container, url) = setup_postgres().await;
    let pool = PgPool::connect(&url).await.expect("connect");

    let mut config =
        DispatcherConfig::new(ConnectionOptions::from_pool(pool.clone()).with_prefix(test_prefix("pulse")));
    config.liveness_checker.pulse_interval_ms = 200;
    let dispatcher = Arc::new(horton::Dispatcher::new(config).expect("valid config"));
    dispatcher.connect(true).await.expect("connect");

    let heartbeats = Arc::new(AtomicUsize::new(0));
    let saw_healthy = Arc::new(AtomicUsize::new(0));
    {
        let heartbeats = heartbeats.clone();
        let saw_healthy = saw_healthy.clone();
        dispatcher
            .subscribe_health(health_handler(move |event| {
                let heartbeats = heartbeats.clone();
                let saw_healthy = saw_healthy.clone();
                async move {
                    match event {
                        HealthEvent::Heartbeat { .. } => {
                            heartbeats.fetch_add(1, Ordering::SeqCst);
                        }
                        HealthEvent::Healthy { .. } => {
                            saw_healthy.fetch_add(1, Ordering::SeqCst);
                        }
                        _ => {}
                    }
                }
            }))
            .await;
    }

    tokio::time::sleep(Duration::from_millis(900)).await;

    assert!(heartbeats.load(Ordering::SeqCst) >= 1, "expected at least one round-tripped pulse");
    assert!(saw_healthy.load(Ordering::SeqCst) >= 1, "expected at least one Healthy status emission");

    dispatcher.disconnect(Some(0)).await.expect("disconnect");
    drop(container);
}
