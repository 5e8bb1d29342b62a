//! # Reconciler
//!
//! Decision logic translating events into cluster mutations:
//!
//! - store put without a previous value: [`Reconciler::create_app`]
//! - store put replacing a value: [`Reconciler::update_app`] (delete, then create)
//! - store delete: [`Reconciler::delete_app`]
//! - telemetry reporting a broken entanglement: [`Reconciler::handle_entanglement_break`]
//!
//! Every object is found again through its label triple; nothing about what
//! was deployed is kept locally. All resources of an operation are built from
//! the record before the first mutation, so malformed input never leaves a
//! half-created app behind.
//!
//! ```rust
//! use std::sync::Arc;
//! use dtm_controller::test_helpers::{app, digital_twin, InMemoryCluster, InMemoryStore};
//! use dtm_controller::{DrainPolicy, Reconciler, ResourceKind};
//!
//! # tokio_test::block_on(async {
//! let cluster = Arc::new(InMemoryCluster::new());
//! let reconciler = Reconciler::new(
//!     cluster.clone(),
//!     Arc::new(InMemoryStore::new()),
//!     "/apps",
//!     DrainPolicy::default(),
//! );
//!
//! let record = app(7, vec![digital_twin("t1", Some("cloud"), &["edge", "cloud"])]);
//! reconciler.create_app(&record).await.unwrap();
//! assert_eq!(cluster.names_of(ResourceKind::Workload), vec!["t1-cloud"]);
//! # });
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{
    delete_labeled, ClusterGateway, ClusterResource, DeletionSummary, DrainPolicy, ResourceLabels,
};
use crate::dispatcher::EventHandler;
use crate::error::{ControllerError, Result};
use crate::events::{app_key, ControllerEvent, StoreEvent, StoreEventKind};
use crate::models::{App, Deployment, DigitalTwin, Metric};
use crate::store::AppStore;

/// Resources of one deployment variant, labelled and ready to create
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedDeployment {
    pub labels: ResourceLabels,
    pub resources: Vec<ClusterResource>,
}

#[derive(Debug, Default)]
pub struct ReconcilerStats {
    pub apps_created: AtomicU64,
    pub apps_updated: AtomicU64,
    pub apps_deleted: AtomicU64,
    pub failovers: AtomicU64,
    /// Twins left without resources because no variant matched their preferred affinity
    pub unmatched_preferences: AtomicU64,
    /// Failovers whose reported variant had no objects left to remove
    pub stale_failovers: AtomicU64,
}

pub struct Reconciler {
    cluster: Arc<dyn ClusterGateway>,
    store: Arc<dyn AppStore>,
    key_prefix: String,
    drain: DrainPolicy,
    rng: Mutex<StdRng>,
    stats: Arc<ReconcilerStats>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("key_prefix", &self.key_prefix)
            .field("drain", &self.drain)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterGateway>,
        store: Arc<dyn AppStore>,
        key_prefix: impl Into<String>,
        drain: DrainPolicy,
    ) -> Self {
        Self {
            cluster,
            store,
            key_prefix: key_prefix.into(),
            drain,
            rng: Mutex::new(StdRng::from_entropy()),
            stats: Arc::new(ReconcilerStats::default()),
        }
    }

    /// Replace the random source used for failover selection
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn stats(&self) -> Arc<ReconcilerStats> {
        Arc::clone(&self.stats)
    }

    /// Select and realize the variant to deploy for every twin of `app`.
    ///
    /// A twin with a preferred affinity gets exactly the matching variant, or
    /// nothing when none matches. A twin without one gets its first variant.
    pub fn plan_app(&self, app: &App) -> Result<Vec<PlannedDeployment>> {
        let mut planned = Vec::with_capacity(app.digital_twins.len());

        for twin in &app.digital_twins {
            let selected = match twin.preferred_affinity() {
                Some(preferred) => match twin.deployment(preferred) {
                    Some(deployment) => deployment,
                    None => {
                        self.stats
                            .unmatched_preferences
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(
                            app_id = app.id,
                            digital_twin = %twin.name,
                            preferred_affinity = %preferred,
                            "No deployment matches the preferred affinity, twin left undeployed"
                        );
                        continue;
                    }
                },
                None => twin.deployments.first().ok_or_else(|| {
                    ControllerError::NoDeploymentVariants {
                        app_id: app.id,
                        digital_twin: twin.name.clone(),
                    }
                })?,
            };

            planned.push(plan_deployment(app.id, &twin.name, selected)?);
        }

        Ok(planned)
    }

    #[instrument(skip(self, app), fields(app_id = app.id))]
    pub async fn create_app(&self, app: &App) -> Result<usize> {
        let planned = self.plan_app(app)?;
        let created = self.create_planned(&planned).await?;

        self.stats.apps_created.fetch_add(1, Ordering::Relaxed);
        info!(twins = planned.len(), resources = created, "App created");
        Ok(created)
    }

    /// Delete every object labelled with `app_id`, draining workloads
    #[instrument(skip(self))]
    pub async fn delete_app(&self, app_id: i64) -> Result<DeletionSummary> {
        let selector = ResourceLabels::for_app(app_id).selector();
        let summary = delete_labeled(self.cluster.as_ref(), &selector, &self.drain).await?;

        self.stats.apps_deleted.fetch_add(1, Ordering::Relaxed);
        info!(
            workloads = summary.workloads,
            services = summary.services,
            data_configs = summary.data_configs,
            "App deleted"
        );
        Ok(summary)
    }

    /// Replace the app's resources wholesale.
    ///
    /// The new record is planned before anything is deleted. A failure after
    /// the delete leaves the app without resources; there is no rollback.
    #[instrument(skip(self, app), fields(app_id = app.id))]
    pub async fn update_app(&self, app: &App) -> Result<usize> {
        let planned = self.plan_app(app)?;

        let removed = self.delete_app(app.id).await?;
        let created = self.create_planned(&planned).await?;

        self.stats.apps_updated.fetch_add(1, Ordering::Relaxed);
        info!(removed = removed.total(), created, "App updated");
        Ok(created)
    }

    /// Move the reported twin to a different affinity.
    ///
    /// Returns the affinity the twin was moved to.
    #[instrument(
        skip(self, metric),
        fields(app_id = metric.app_id, digital_twin = %metric.digital_twin, affinity = %metric.affinity)
    )]
    pub async fn handle_entanglement_break(&self, metric: &Metric) -> Result<String> {
        let key = app_key(&self.key_prefix, metric.app_id);
        let record = self
            .store
            .get(&key)
            .await?
            .ok_or(ControllerError::AppNotFound {
                app_id: metric.app_id,
            })?;
        let app = App::from_slice(&record)?;

        let twin = app.digital_twin(&metric.digital_twin).ok_or_else(|| {
            ControllerError::DigitalTwinNotFound {
                app_id: metric.app_id,
                digital_twin: metric.digital_twin.clone(),
            }
        })?;
        if twin.deployment(&metric.affinity).is_none() {
            warn!("Reported affinity is not a declared variant of this twin");
        }

        let target = {
            let mut rng = self.rng.lock();
            select_failover_target(metric.app_id, twin, &metric.affinity, &mut *rng)?
        };
        let planned = plan_deployment(metric.app_id, &twin.name, target)?;
        info!(target_affinity = %target.affinity, "Failing over digital twin");

        let current =
            ResourceLabels::for_deployment(metric.app_id, &metric.digital_twin, &metric.affinity);
        let removed = delete_labeled(self.cluster.as_ref(), &current.selector(), &self.drain).await?;
        if removed.total() == 0 {
            self.stats.stale_failovers.fetch_add(1, Ordering::Relaxed);
            warn!(
                target_affinity = %target.affinity,
                "Reported variant has no objects, twin may already have moved"
            );
        } else {
            debug!(removed = removed.total(), "Current variant removed");
        }

        self.create_planned(std::slice::from_ref(&planned)).await?;

        self.stats.failovers.fetch_add(1, Ordering::Relaxed);
        info!(target_affinity = %target.affinity, "Failover complete");
        Ok(target.affinity.clone())
    }

    async fn create_planned(&self, planned: &[PlannedDeployment]) -> Result<usize> {
        let mut created = 0;
        for deployment in planned {
            for resource in &deployment.resources {
                self.cluster.create(resource).await?;
                created += 1;
                debug!(
                    kind = %resource.kind(),
                    name = ?resource.name(),
                    selector = %deployment.labels.selector(),
                    "Created resource"
                );
            }
        }
        Ok(created)
    }

    async fn handle_store_event(&self, event: StoreEvent) -> Result<()> {
        match event.kind {
            StoreEventKind::Delete => {
                let app_id = event.app_id(&self.key_prefix)?;
                self.delete_app(app_id).await.map(|_| ())
            }
            StoreEventKind::Put => {
                let app = App::from_slice(&event.value)?;
                let key_id = event.app_id(&self.key_prefix)?;
                if key_id != app.id {
                    return Err(ControllerError::Validation(format!(
                        "record under {} declares id {}",
                        event.key, app.id
                    )));
                }

                if event.had_previous {
                    self.update_app(&app).await.map(|_| ())
                } else {
                    self.create_app(&app).await.map(|_| ())
                }
            }
        }
    }
}

#[async_trait]
impl EventHandler for Reconciler {
    async fn handle_event(&self, event: ControllerEvent) -> Result<()> {
        match event {
            ControllerEvent::Store(store_event) => self.handle_store_event(store_event).await,
            ControllerEvent::Telemetry(metric) => {
                if !metric.lifecycle_state.is_actionable() {
                    debug!(metric = %metric, "Ignoring quiescent lifecycle state");
                    return Ok(());
                }
                self.handle_entanglement_break(&metric).await.map(|_| ())
            }
        }
    }
}

/// Label and realize every config of one variant
pub fn plan_deployment(
    app_id: i64,
    digital_twin: &str,
    deployment: &Deployment,
) -> Result<PlannedDeployment> {
    let labels = ResourceLabels::for_deployment(app_id, digital_twin, &deployment.affinity);
    let resources = deployment
        .configs
        .iter()
        .map(|config| ClusterResource::from_config(config, &labels))
        .collect::<Result<Vec<_>>>()?;

    Ok(PlannedDeployment { labels, resources })
}

/// Pick uniformly among the variants whose affinity differs from `current_affinity`
pub fn select_failover_target<'a, R: Rng + ?Sized>(
    app_id: i64,
    twin: &'a DigitalTwin,
    current_affinity: &str,
    rng: &mut R,
) -> Result<&'a Deployment> {
    let no_alternative = || ControllerError::NoAlternativeAffinity {
        app_id,
        digital_twin: twin.name.clone(),
        affinity: current_affinity.to_string(),
    };

    if twin.deployments.len() < 2 {
        return Err(no_alternative());
    }

    let candidates: Vec<&Deployment> = twin
        .deployments
        .iter()
        .filter(|deployment| deployment.affinity != current_affinity)
        .collect();

    candidates.choose(rng).copied().ok_or_else(no_alternative)
}
