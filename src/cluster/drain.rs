//! Drain barrier and label-scoped deletion.
//!
//! A deleted workload must fully vacate (zero owned pods) before a
//! replacement claims the same identity or ports.

use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument};

use super::{ClusterGateway, ResourceKind};
use crate::config::DrainConfig;
use crate::error::{ControllerError, Result};

/// Poll cadence and hard ceiling of the drain barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self::from(&DrainConfig::default())
    }
}

impl From<&DrainConfig> for DrainPolicy {
    fn from(config: &DrainConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }
}

/// Counts of objects removed by [`delete_labeled`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionSummary {
    pub workloads: usize,
    pub services: usize,
    pub data_configs: usize,
}

impl DeletionSummary {
    pub fn total(&self) -> usize {
        self.workloads + self.services + self.data_configs
    }
}

/// Block until no pod matches `selector`.
///
/// Exceeding the ceiling is a [`ControllerError::DrainTimeout`]; a failed pod
/// listing aborts the wait immediately.
#[instrument(skip(gateway, policy), fields(timeout = ?policy.timeout))]
pub async fn wait_for_pod_termination(
    gateway: &dyn ClusterGateway,
    selector: &str,
    policy: &DrainPolicy,
) -> Result<()> {
    match tokio::time::timeout(
        policy.timeout,
        poll_until_empty(gateway, selector, policy.poll_interval),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ControllerError::DrainTimeout {
            selector: selector.to_string(),
            timeout: policy.timeout,
        }),
    }
}

async fn poll_until_empty(
    gateway: &dyn ClusterGateway,
    selector: &str,
    poll_interval: Duration,
) -> Result<()> {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let remaining = gateway.count_pods(selector).await?;
        if remaining == 0 {
            return Ok(());
        }
        debug!(selector = %selector, remaining, "Waiting for pods to terminate");
    }
}

/// Delete every managed object matching `selector`.
///
/// Workloads go first, each followed by the drain barrier on its own pod
/// selector, then services, then data configs. The first failure aborts.
#[instrument(skip(gateway, policy))]
pub async fn delete_labeled(
    gateway: &dyn ClusterGateway,
    selector: &str,
    policy: &DrainPolicy,
) -> Result<DeletionSummary> {
    let mut summary = DeletionSummary::default();

    for kind in ResourceKind::ALL {
        let objects = gateway.list(kind, selector).await?;

        for object in objects {
            let pod_selector = match kind {
                ResourceKind::Workload => Some(object.pod_selector.clone().ok_or_else(|| {
                    ControllerError::cluster(
                        "drain deployment",
                        &object.name,
                        "workload has no pod selector",
                    )
                })?),
                _ => None,
            };

            gateway.delete(kind, &object.name).await?;
            info!(kind = %kind, name = %object.name, "Deleted managed object");

            if let Some(pod_selector) = pod_selector {
                wait_for_pod_termination(gateway, &pod_selector, policy).await?;
                debug!(name = %object.name, "Workload drained");
            }

            match kind {
                ResourceKind::Workload => summary.workloads += 1,
                ResourceKind::Service => summary.services += 1,
                ResourceKind::DataConfig => summary.data_configs += 1,
            }
        }
    }

    Ok(summary)
}
