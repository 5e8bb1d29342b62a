//! # Cluster Gateway
//!
//! Narrow, label-addressed access to the orchestration API. Every object the
//! controller creates carries the `dtm/id`, `dtm/digitaltwin` and
//! `dtm/affinity` labels; those labels are the only handle used to find the
//! objects again, so there is no local cache of what was deployed.
//!
//! - [`ClusterGateway`] - typed create/list/delete seam plus pod counting
//! - [`kube_gateway`] - Kubernetes implementation
//! - [`resources`] - realization of app configs into typed objects
//! - [`drain`] - drain barrier and label-scoped deletion

pub mod drain;
pub mod kube_gateway;
pub mod resources;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

use crate::constants::labels;
use crate::error::Result;

pub use drain::{delete_labeled, wait_for_pod_termination, DeletionSummary, DrainPolicy};
pub use kube_gateway::KubeClusterGateway;
pub use resources::ClusterResource;

/// Resource kinds the controller manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Workload,
    Service,
    DataConfig,
}

impl ResourceKind {
    /// Deletion order: workloads first so their pods drain before anything else goes
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Workload,
        ResourceKind::Service,
        ResourceKind::DataConfig,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::Workload => "deployment",
            ResourceKind::Service => "service",
            ResourceKind::DataConfig => "configmap",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The label triple (or its app-only prefix) addressing managed objects
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceLabels {
    pub app_id: i64,
    pub digital_twin: Option<String>,
    pub affinity: Option<String>,
}

impl ResourceLabels {
    /// Matches every object of an app
    pub fn for_app(app_id: i64) -> Self {
        Self {
            app_id,
            digital_twin: None,
            affinity: None,
        }
    }

    /// Matches the objects of one deployment variant of one twin
    pub fn for_deployment(
        app_id: i64,
        digital_twin: impl Into<String>,
        affinity: impl Into<String>,
    ) -> Self {
        Self {
            app_id,
            digital_twin: Some(digital_twin.into()),
            affinity: Some(affinity.into()),
        }
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(labels::APP_ID.to_string(), self.app_id.to_string());
        if let Some(twin) = &self.digital_twin {
            map.insert(labels::DIGITAL_TWIN.to_string(), twin.clone());
        }
        if let Some(affinity) = &self.affinity {
            map.insert(labels::AFFINITY.to_string(), affinity.clone());
        }
        map
    }

    /// Equality-based label selector, e.g. `dtm/affinity=edge,dtm/digitaltwin=t1,dtm/id=7`
    pub fn selector(&self) -> String {
        self.to_map()
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// An object found through a label query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedObject {
    pub kind: ResourceKind,
    pub name: String,
    /// Selector of the pods a workload owns; `None` for other kinds
    pub pod_selector: Option<String>,
}

/// Namespaced access to the orchestration API.
///
/// Implementations surface backend errors to the caller and never retry.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn create(&self, resource: &ClusterResource) -> Result<()>;

    async fn list(&self, kind: ResourceKind, selector: &str) -> Result<Vec<ManagedObject>>;

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<()>;

    /// Number of pods currently matching `selector`
    async fn count_pods(&self, selector: &str) -> Result<usize>;
}
