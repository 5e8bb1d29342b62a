//! # Controller
//!
//! Wires the store watcher and telemetry poller into one conduit drained by
//! the dispatcher, all sharing a single cancellation token.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::cluster::{ClusterGateway, DrainPolicy, KubeClusterGateway};
use crate::config::ControllerConfig;
use crate::dispatcher::{DispatcherStats, EventDispatcher};
use crate::error::{ControllerError, Result};
use crate::events::event_channel;
use crate::reconciler::Reconciler;
use crate::store::{AppStore, EtcdAppStore, StoreWatcher};
use crate::telemetry::{PrometheusClient, TelemetryPoller, TelemetrySource};

pub struct Controller {
    config: ControllerConfig,
    store: Arc<dyn AppStore>,
    telemetry: Arc<dyn TelemetrySource>,
    reconciler: Arc<Reconciler>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("reconciler", &self.reconciler)
            .finish()
    }
}

impl Controller {
    /// Connect to the store, telemetry backend and cluster named by `config`
    pub async fn new(config: ControllerConfig) -> Result<Self> {
        config.validate()?;

        let store = EtcdAppStore::connect(&config.store).await?;
        let telemetry = PrometheusClient::new(&config.telemetry)?;
        let cluster = KubeClusterGateway::connect(&config.cluster).await?;
        info!(
            store = %store.endpoint(),
            telemetry = %telemetry.base_url(),
            namespace = %cluster.namespace(),
            "Controller backends connected"
        );

        Ok(Self::with_components(
            config,
            Arc::new(store),
            Arc::new(telemetry),
            Arc::new(cluster),
        ))
    }

    pub fn with_components(
        config: ControllerConfig,
        store: Arc<dyn AppStore>,
        telemetry: Arc<dyn TelemetrySource>,
        cluster: Arc<dyn ClusterGateway>,
    ) -> Self {
        let reconciler = Reconciler::new(
            cluster,
            Arc::clone(&store),
            config.store.key_prefix.clone(),
            DrainPolicy::from(&config.drain),
        );
        Self::with_reconciler(config, store, telemetry, reconciler)
    }

    /// Use a pre-built reconciler, e.g. one with a seeded random source
    pub fn with_reconciler(
        config: ControllerConfig,
        store: Arc<dyn AppStore>,
        telemetry: Arc<dyn TelemetrySource>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            config,
            store,
            telemetry,
            reconciler: Arc::new(reconciler),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Run until `cancel` fires or both producers stop.
    ///
    /// A store watch that fails or ends cancels the whole controller and is
    /// returned, so a supervisor can restart it with a fresh watch.
    #[instrument(skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<Arc<DispatcherStats>> {
        let (sender, receiver) = event_channel(self.config.dispatcher.event_buffer_size);

        let watcher = StoreWatcher::new(Arc::clone(&self.store), self.config.store.key_prefix.clone());
        let poller = TelemetryPoller::new(
            Arc::clone(&self.telemetry),
            self.config.telemetry.metric_name.clone(),
            self.config.telemetry.poll_interval(),
        );
        let dispatcher = EventDispatcher::new(self.reconciler.clone());

        let watcher_task = tokio::spawn({
            let sender = sender.clone();
            let cancel = cancel.clone();
            async move {
                let result = watcher.run(sender, cancel.clone()).await;
                if let Err(e) = &result {
                    error!(error = %e, "Store watcher failed, shutting down controller");
                    cancel.cancel();
                }
                result
            }
        });
        let poller_task = tokio::spawn(poller.run(sender, cancel.clone()));

        info!(
            key_prefix = %self.config.store.key_prefix,
            metric = %self.config.telemetry.metric_name,
            "Controller running"
        );
        dispatcher.run(receiver, cancel.clone()).await;
        cancel.cancel();

        let (watcher_result, poller_result) = tokio::join!(watcher_task, poller_task);
        poller_result
            .map_err(|e| ControllerError::Telemetry(format!("poller task failed: {e}")))?;
        watcher_result.map_err(|e| ControllerError::Store(format!("watcher task failed: {e}")))??;

        info!("Controller stopped");
        Ok(dispatcher.stats())
    }
}
