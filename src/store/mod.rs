//! # Declarative Store
//!
//! Read and watch access to app records, and the [`StoreWatcher`] producer
//! that turns change records into controller events.

pub mod etcd;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ControllerError, Result};
use crate::events::{ControllerEvent, EventSender, StoreEvent};

pub use etcd::EtcdAppStore;

/// Stream of change records in store delivery order
pub type StoreEventStream = BoxStream<'static, Result<StoreEvent>>;

/// Key-value store holding app records
#[async_trait]
pub trait AppStore: Send + Sync {
    /// Watch every key under `prefix`, reporting whether each changed key existed before
    async fn watch(&self, prefix: &str) -> Result<StoreEventStream>;

    /// Current value of `key`, if any
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Watcher counters
#[derive(Debug, Default)]
pub struct WatcherStats {
    pub events_forwarded: AtomicU64,
    pub stream_errors: AtomicU64,
}

/// Producer forwarding store changes into the event conduit
pub struct StoreWatcher {
    store: Arc<dyn AppStore>,
    prefix: String,
    stats: Arc<WatcherStats>,
}

impl std::fmt::Debug for StoreWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWatcher")
            .field("prefix", &self.prefix)
            .field("stats", &self.stats)
            .finish()
    }
}

impl StoreWatcher {
    pub fn new(store: Arc<dyn AppStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            stats: Arc::new(WatcherStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WatcherStats> {
        Arc::clone(&self.stats)
    }

    /// Watched key range: every key strictly below the prefix directory
    pub fn watch_key(&self) -> String {
        format!("{}/", self.prefix)
    }

    /// Forward change records until cancelled.
    ///
    /// A stream that fails or ends before cancellation is an error; the
    /// watcher never goes quiet while the controller keeps running. A closed
    /// conduit ends the watcher cleanly. There is no local retry; resuming a
    /// broken watch belongs to the store client.
    #[instrument(skip_all, fields(prefix = %self.prefix))]
    pub async fn run(self, sender: EventSender, cancel: CancellationToken) -> Result<()> {
        let watch_key = self.watch_key();
        let mut stream = tokio::select! {
            stream = self.store.watch(&watch_key) => stream?,
            _ = cancel.cancelled() => return Ok(()),
        };
        info!("Store watcher started");

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = cancel.cancelled() => {
                    info!("Store watcher cancelled");
                    break;
                }
            };

            match next {
                Some(Ok(event)) => {
                    debug!(
                        key = %event.key,
                        kind = ?event.kind,
                        had_previous = event.had_previous,
                        "Store change observed"
                    );
                    let delivered = tokio::select! {
                        sent = sender.send(ControllerEvent::Store(event)) => sent,
                        _ = cancel.cancelled() => break,
                    };
                    if delivered.is_err() {
                        warn!("Event conduit closed, stopping store watcher");
                        break;
                    }
                    self.stats.events_forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Some(Err(e)) => {
                    self.stats.stream_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Store watch stream failed");
                    return Err(e);
                }
                None if cancel.is_cancelled() => break,
                None => {
                    self.stats.stream_errors.fetch_add(1, Ordering::Relaxed);
                    error!("Store watch stream ended unexpectedly");
                    return Err(ControllerError::Store("watch stream ended".into()));
                }
            }
        }

        Ok(())
    }
}
