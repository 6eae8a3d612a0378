//! Uses the queue itself as a heartbeat to derive an end-to-end health signal (§4.4).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::{LivenessCheckerOptions, LIVENESS_PULSE_OPERATION};
use crate::error::Result;
use crate::event_bus::{EventKey, HealthBus};
use crate::event_queue::EventQueue;
use crate::model::InternalMetadata;

/// A tagged health transition or a raw round-trip measurement, surfaced to
/// the [`crate::dispatcher::Dispatcher`]'s [`HealthBus`] (§3.1, §6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthEvent {
    Healthy { last_heartbeat_at: DateTime<Utc> },
    Unhealthy { last_heartbeat_at: DateTime<Utc> },
    Dead { last_heartbeat_at: DateTime<Utc> },
    Heartbeat { pulsed_at: DateTime<Utc>, pulse_lag: Duration },
}

/// Round-trips an internal `LIVENESS_PULSE` row through the event queue
/// every `pulse_interval_ms` and classifies the time since the last
/// successful round trip into `Healthy`/`Unhealthy`/`Dead` (§4.4).
pub struct LivenessChecker {
    queue: Arc<EventQueue>,
    options: LivenessCheckerOptions,
    health_bus: Arc<HealthBus>,
    last_heartbeat_at: RwLock<DateTime<Utc>>,
    pulse_task: Mutex<Option<JoinHandle<()>>>,
}

impl LivenessChecker {
    pub fn new(queue: Arc<EventQueue>, options: LivenessCheckerOptions, health_bus: Arc<HealthBus>) -> Self {
        Self {
            queue,
            options,
            health_bus,
            last_heartbeat_at: RwLock::new(Utc::now()),
            pulse_task: Mutex::new(None),
        }
    }

    /// Subscribes to internal pulse notifications and starts the pulse-send
    /// timer.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let bus = self.queue.bus();
        let checker = self.clone();
        bus.subscribe(
            EventKey::Internal(LIVENESS_PULSE_OPERATION.to_string()),
            crate::event_bus::notification_handler(move |row_id| {
                let checker = checker.clone();
                async move { checker.handle_pulse_notification(row_id).await }
            }),
        )
        .await;

        let checker = self.clone();
        let pulse_interval = self.options.pulse_interval_ms;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(pulse_interval));
            loop {
                ticker.tick().await;
                if let Err(error) = checker.send_pulse().await {
                    tracing::error!(%error, "failed to enqueue liveness pulse");
                }
                checker.evaluate_and_emit_status().await;
            }
        });
        *self.pulse_task.lock().await = Some(handle);

        tracing::info!("liveness checker started");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.pulse_task.lock().await.take() {
            handle.abort();
        }
        tracing::info!("liveness checker stopped");
    }

    async fn send_pulse(&self) -> Result<()> {
        let metadata = serde_json::to_value(InternalMetadata::liveness_pulse())
            .expect("InternalMetadata always serialises");
        self.queue.queue_internal(LIVENESS_PULSE_OPERATION, metadata).await
    }

    /// Dequeues the pulse row, measures round-trip lag, advances
    /// `last_heartbeat_at` monotonically, and emits `Heartbeat`.
    async fn handle_pulse_notification(&self, row_id: i64) {
        let queued_at_cell: Arc<std::sync::Mutex<Option<DateTime<Utc>>>> = Arc::new(std::sync::Mutex::new(None));
        let cell = queued_at_cell.clone();

        let result = self
            .queue
            .dequeue(row_id, move |row| {
                Box::pin(async move {
                    *cell.lock().expect("lock not poisoned") = Some(row.queued_at);
                    true
                })
            })
            .await;

        match result {
            Ok(Some(true)) => {}
            Ok(Some(false)) | Ok(None) => return,
            Err(error) => {
                tracing::error!(%error, "failed to dequeue liveness pulse");
                return;
            }
        };

        let pulsed_at = Utc::now();
        let queued_at = queued_at_cell.lock().expect("lock not poisoned").unwrap_or(pulsed_at);
        let pulse_lag = (pulsed_at - queued_at).to_std().unwrap_or(Duration::from_millis(0));

        {
            let mut last = self.last_heartbeat_at.write().await;
            if pulsed_at > *last {
                *last = pulsed_at;
            }
        }

        self.health_bus.emit(HealthEvent::Heartbeat { pulsed_at, pulse_lag }).await;
    }

    /// Computes the Healthy/Unhealthy/Dead threshold table from
    /// `last_heartbeat_at` and emits exactly one `HealthEvent`.
    async fn evaluate_and_emit_status(&self) {
        let last_heartbeat_at = *self.last_heartbeat_at.read().await;
        let elapsed_ms = (Utc::now() - last_heartbeat_at).num_milliseconds().max(0) as u64;
        let event = classify_status(elapsed_ms, &self.options, last_heartbeat_at);
        self.health_bus.emit(event).await;
    }
}

/// Pure threshold table lookup (§4.4): `elapsed_ms` since the last
/// successful heartbeat round trip classifies into exactly one of
/// `Healthy`/`Unhealthy`/`Dead`.
fn classify_status(elapsed_ms: u64, options: &LivenessCheckerOptions, last_heartbeat_at: DateTime<Utc>) -> HealthEvent {
    let healthy_threshold = options.pulse_interval_ms * options.max_missed_pulses as u64;
    let dead_threshold = healthy_threshold * 3;

    if elapsed_ms <= healthy_threshold {
        HealthEvent::Healthy { last_heartbeat_at }
    } else if elapsed_ms <= dead_threshold {
        HealthEvent::Unhealthy { last_heartbeat_at }
    } else {
        HealthEvent::Dead { last_heartbeat_at }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_threshold_is_interval_times_max_missed_pulses() {
        let options = LivenessCheckerOptions {
            pulse_interval_ms: 10_000,
            max_missed_pulses: 3,
        };
        assert_eq!(options.pulse_interval_ms * options.max_missed_pulses as u64, 30_000);
    }

    #[test]
    fn health_event_variants_carry_last_heartbeat_at() {
        let now = Utc::now();
        let healthy = HealthEvent::Healthy { last_heartbeat_at: now };
        match healthy {
            HealthEvent::Healthy { last_heartbeat_at } => assert_eq!(last_heartbeat_at, now),
            _ => panic!("expected Healthy"),
        }
    }

    fn options(pulse_interval_ms: u64, max_missed_pulses: u32) -> LivenessCheckerOptions {
        LivenessCheckerOptions {
            pulse_interval_ms,
            max_missed_pulses,
        }
    }

    #[test]
    fn classify_status_is_healthy_at_and_below_the_healthy_threshold() {
        let opts = options(1_000, 3);
        let now = Utc::now();
        assert!(matches!(classify_status(0, &opts, now), HealthEvent::Healthy { .. }));
        assert!(matches!(classify_status(3_000, &opts, now), HealthEvent::Healthy { .. }));
    }

    #[test]
    fn classify_status_is_unhealthy_just_above_the_healthy_threshold() {
        let opts = options(1_000, 3);
        let now = Utc::now();
        assert!(matches!(classify_status(3_001, &opts, now), HealthEvent::Unhealthy { .. }));
        assert!(matches!(classify_status(9_000, &opts, now), HealthEvent::Unhealthy { .. }));
    }

    #[test]
    fn classify_status_is_dead_just_above_the_dead_threshold() {
        let opts = options(1_000, 3);
        let now = Utc::now();
        assert!(matches!(classify_status(9_001, &opts, now), HealthEvent::Dead { .. }));
    }
}
