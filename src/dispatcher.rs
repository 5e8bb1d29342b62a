//! # Event Dispatcher
//!
//! Single consumer of the event conduit. Events are handled one at a time in
//! arrival order, so no two reconciliation actions ever overlap. A failed
//! action is logged and dropped; the next event is processed regardless.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{ControllerError, Result};
use crate::events::{trailing_app_id, ControllerEvent, EventReceiver};

/// Consumer of controller events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: ControllerEvent) -> Result<()>;

    /// Called with the error of a failed event; the event is not retried
    async fn handle_failure(&self, event: &ControllerEvent, error: &ControllerError) {
        log_failure(event, error);
    }
}

/// Dispatcher counters
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub store_events: AtomicU64,
    pub telemetry_events: AtomicU64,
}

pub struct EventDispatcher {
    dispatcher_id: Uuid,
    handler: Arc<dyn EventHandler>,
    stats: Arc<DispatcherStats>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("dispatcher_id", &self.dispatcher_id)
            .field("stats", &self.stats)
            .finish()
    }
}

impl EventDispatcher {
    pub fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self {
            dispatcher_id: Uuid::new_v4(),
            handler,
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        Arc::clone(&self.stats)
    }

    /// Consume events until cancelled or every producer has gone away.
    ///
    /// Cancellation is only observed between events; an action in progress
    /// runs to completion.
    #[instrument(skip_all, fields(dispatcher_id = %self.dispatcher_id))]
    pub async fn run(&self, mut receiver: EventReceiver, cancel: CancellationToken) {
        info!("Event dispatcher started");

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Event dispatcher cancelled");
                    break;
                }
                event = receiver.recv() => event,
            };

            let Some(event) = event else {
                info!("All producers closed, event dispatcher stopping");
                break;
            };

            self.dispatch(event).await;
        }

        info!(
            processed = self.stats.processed.load(Ordering::Relaxed),
            failed = self.stats.failed.load(Ordering::Relaxed),
            "Event dispatcher stopped"
        );
    }

    /// Handle one event, recording the outcome
    pub async fn dispatch(&self, event: ControllerEvent) {
        match &event {
            ControllerEvent::Store(_) => self.stats.store_events.fetch_add(1, Ordering::Relaxed),
            ControllerEvent::Telemetry(_) => {
                self.stats.telemetry_events.fetch_add(1, Ordering::Relaxed)
            }
        };
        debug!(kind = event.kind(), "Dispatching event");

        let failure_context = event.clone();
        match self.handler.handle_event(event).await {
            Ok(()) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.handler.handle_failure(&failure_context, &e).await;
            }
        }
    }
}

/// Log a failed event with whatever identity it carries
pub fn log_failure(event: &ControllerEvent, err: &ControllerError) {
    let (app_id, digital_twin, affinity) = match event {
        ControllerEvent::Store(store_event) => (trailing_app_id(&store_event.key), None, None),
        ControllerEvent::Telemetry(metric) => (
            Some(metric.app_id),
            Some(metric.digital_twin.as_str()),
            Some(metric.affinity.as_str()),
        ),
    };

    if err.is_transient() || err.is_malformed_input() {
        warn!(
            kind = event.kind(),
            app_id = ?app_id,
            digital_twin = ?digital_twin,
            affinity = ?affinity,
            error = %err,
            "Event handling failed"
        );
    } else {
        error!(
            kind = event.kind(),
            app_id = ?app_id,
            digital_twin = ?digital_twin,
            affinity = ?affinity,
            error = %err,
            "Event handling failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_channel, StoreEvent};
    use crate::models::Metric;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        handled: Mutex<Vec<ControllerEvent>>,
        failures: Mutex<Vec<String>>,
        fail_kind: Option<&'static str>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle_event(&self, event: ControllerEvent) -> Result<()> {
            let kind = event.kind();
            self.handled.lock().push(event);
            if Some(kind) == self.fail_kind {
                return Err(ControllerError::Cluster("create deployment t1: boom".into()));
            }
            Ok(())
        }

        async fn handle_failure(&self, event: &ControllerEvent, error: &ControllerError) {
            self.failures.lock().push(format!("{}: {error}", event.kind()));
        }
    }

    #[tokio::test]
    async fn test_events_handled_in_arrival_order_and_failures_do_not_stop() {
        let handler = Arc::new(RecordingHandler {
            fail_kind: Some("store_delete"),
            ..Default::default()
        });
        let dispatcher = EventDispatcher::new(handler.clone());
        let stats = dispatcher.stats();
        let (sender, receiver) = event_channel(4);

        let events = vec![
            ControllerEvent::Store(StoreEvent::put("/apps/9", b"{}".to_vec(), false)),
            ControllerEvent::Store(StoreEvent::delete("/apps/9")),
            ControllerEvent::Telemetry(Metric::entanglement_broken(7, "t1", "edge")),
        ];
        let producer = {
            let events = events.clone();
            tokio::spawn(async move {
                for event in events {
                    sender.send(event).await.unwrap();
                }
            })
        };

        dispatcher.run(receiver, CancellationToken::new()).await;
        producer.await.unwrap();

        assert_eq!(*handler.handled.lock(), events);
        assert_eq!(handler.failures.lock().len(), 1);
        assert!(handler.failures.lock()[0].starts_with("store_delete"));
        assert_eq!(stats.processed.load(Ordering::Relaxed), 2);
        assert_eq!(stats.failed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.store_events.load(Ordering::Relaxed), 2);
        assert_eq!(stats.telemetry_events.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_idle_dispatcher() {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = EventDispatcher::new(handler.clone());
        let (_sender, receiver) = event_channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        dispatcher.run(receiver, cancel).await;
        assert!(handler.handled.lock().is_empty());
    }
}
