// Test Helpers Module - In-Memory Backends
//
// Fakes for the three external seams (cluster, store, telemetry) that record
// every call for later assertions, plus builders for app records and cluster
// objects. Shared by the unit tests and the tests/ integration suite.

use async_trait::async_trait;
use futures::channel::mpsc;
use k8s_openapi::api::apps::v1::{Deployment as WorkloadObject, DeploymentSpec};
use k8s_openapi::api::core::v1::{PodTemplateSpec, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::cluster::{ClusterGateway, ClusterResource, ManagedObject, ResourceKind, ResourceLabels};
use crate::constants::{metric_labels, DEFAULT_KEY_PREFIX};
use crate::error::{ControllerError, Result};
use crate::events::{app_key, StoreEvent, StoreEventKind};
use crate::models::{App, Config, Deployment, DigitalTwin, Requirements};
use crate::store::{AppStore, StoreEventStream};
use crate::telemetry::{QueryOutcome, Sample, TelemetrySource};

/// A recorded gateway call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    Create(ResourceKind, String),
    List(ResourceKind, String),
    Delete(ResourceKind, String),
    CountPods(String),
}

#[derive(Debug, Default)]
struct ClusterState {
    objects: Vec<ClusterResource>,
    calls: Vec<ClusterCall>,
    pod_countdowns: HashMap<String, VecDeque<usize>>,
    pod_queries: HashMap<String, usize>,
    fail_pod_listing: bool,
    fail_creates: bool,
}

/// Cluster gateway holding objects in memory.
///
/// Pod counts are scripted per selector with [`InMemoryCluster::set_pod_countdown`];
/// unscripted selectors report zero pods.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object without recording a call
    pub fn seed(&self, resource: ClusterResource) {
        self.state.lock().objects.push(resource);
    }

    /// Successive pod counts for `selector`; the last value repeats
    pub fn set_pod_countdown(&self, selector: &str, counts: Vec<usize>) {
        self.state
            .lock()
            .pod_countdowns
            .insert(selector.to_string(), counts.into());
    }

    pub fn fail_pod_listing(&self, fail: bool) {
        self.state.lock().fail_pod_listing = fail;
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state.lock().fail_creates = fail;
    }

    pub fn pod_queries(&self, selector: &str) -> usize {
        self.state
            .lock()
            .pod_queries
            .get(selector)
            .copied()
            .unwrap_or(0)
    }

    pub fn objects(&self) -> Vec<ClusterResource> {
        self.state.lock().objects.clone()
    }

    pub fn objects_of(&self, kind: ResourceKind) -> Vec<ClusterResource> {
        self.state
            .lock()
            .objects
            .iter()
            .filter(|object| object.kind() == kind)
            .cloned()
            .collect()
    }

    /// Sorted names of the live objects of one kind
    pub fn names_of(&self, kind: ResourceKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .objects_of(kind)
            .iter()
            .filter_map(|object| object.name().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.state.lock().calls.clone()
    }

    /// Calls that change cluster state
    pub fn mutations(&self) -> Vec<ClusterCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, ClusterCall::Create(..) | ClusterCall::Delete(..)))
            .collect()
    }
}

/// Equality-only selector matching, e.g. `a=1,b=2`; bare keys test existence
pub fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ClusterGateway for InMemoryCluster {
    async fn create(&self, resource: &ClusterResource) -> Result<()> {
        let kind = resource.kind();
        let name = resource.name().unwrap_or_default().to_string();
        let mut state = self.state.lock();
        state.calls.push(ClusterCall::Create(kind, name.clone()));

        if state.fail_creates {
            return Err(ControllerError::cluster(
                &format!("create {kind}"),
                &name,
                "injected failure",
            ));
        }
        if state
            .objects
            .iter()
            .any(|object| object.kind() == kind && object.name() == Some(name.as_str()))
        {
            return Err(ControllerError::cluster(
                &format!("create {kind}"),
                &name,
                "already exists",
            ));
        }

        state.objects.push(resource.clone());
        Ok(())
    }

    async fn list(&self, kind: ResourceKind, selector: &str) -> Result<Vec<ManagedObject>> {
        let mut state = self.state.lock();
        state
            .calls
            .push(ClusterCall::List(kind, selector.to_string()));

        state
            .objects
            .iter()
            .filter(|object| object.kind() == kind && selector_matches(selector, &object.labels()))
            .map(|object| {
                Ok(ManagedObject {
                    kind,
                    name: object.name().unwrap_or_default().to_string(),
                    pod_selector: object.pod_selector().transpose()?,
                })
            })
            .collect()
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(ClusterCall::Delete(kind, name.to_string()));

        let position = state
            .objects
            .iter()
            .position(|object| object.kind() == kind && object.name() == Some(name))
            .ok_or_else(|| ControllerError::cluster(&format!("delete {kind}"), name, "not found"))?;
        state.objects.remove(position);
        Ok(())
    }

    async fn count_pods(&self, selector: &str) -> Result<usize> {
        let mut state = self.state.lock();
        state.calls.push(ClusterCall::CountPods(selector.to_string()));

        if state.fail_pod_listing {
            return Err(ControllerError::cluster(
                "list pods",
                selector,
                "injected failure",
            ));
        }
        *state.pod_queries.entry(selector.to_string()).or_default() += 1;

        let count = match state.pod_countdowns.get_mut(selector) {
            Some(counts) if counts.len() > 1 => counts.pop_front().unwrap_or(0),
            Some(counts) => counts.front().copied().unwrap_or(0),
            None => 0,
        };
        Ok(count)
    }
}

type WatchItem = Result<StoreEvent>;

#[derive(Debug, Default)]
struct StoreState {
    values: HashMap<String, Vec<u8>>,
    watched: Vec<String>,
    gets: Vec<String>,
    fail_get: bool,
}

/// App store backed by a map plus a scripted watch stream.
///
/// The watch stream stays open until [`InMemoryStore::close_watch`] is called.
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    watch_sender: Mutex<Option<mpsc::UnboundedSender<WatchItem>>>,
    watch_receiver: Mutex<Option<mpsc::UnboundedReceiver<WatchItem>>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded();
        Self {
            state: Mutex::new(StoreState::default()),
            watch_sender: Mutex::new(Some(sender)),
            watch_receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Store a value without emitting a change
    pub fn insert(&self, key: impl Into<String>, value: Vec<u8>) {
        self.state.lock().values.insert(key.into(), value);
    }

    /// Store an app record under the default prefix without emitting a change
    pub fn put_app(&self, app: &App) {
        self.insert(app_key(DEFAULT_KEY_PREFIX, app.id), app_record(app));
    }

    pub fn remove(&self, key: &str) {
        self.state.lock().values.remove(key);
    }

    /// Apply a change and deliver it on the watch stream
    pub fn emit(&self, event: StoreEvent) {
        {
            let mut state = self.state.lock();
            match event.kind {
                StoreEventKind::Put => {
                    state.values.insert(event.key.clone(), event.value.clone());
                }
                StoreEventKind::Delete => {
                    state.values.remove(&event.key);
                }
            }
        }
        self.push(Ok(event));
    }

    pub fn emit_error(&self, error: ControllerError) {
        self.push(Err(error));
    }

    /// End the watch stream after everything already emitted, as a lost store connection would
    pub fn close_watch(&self) {
        self.watch_sender.lock().take();
    }

    pub fn fail_get(&self, fail: bool) {
        self.state.lock().fail_get = fail;
    }

    pub fn watched_prefixes(&self) -> Vec<String> {
        self.state.lock().watched.clone()
    }

    pub fn gets(&self) -> Vec<String> {
        self.state.lock().gets.clone()
    }

    fn push(&self, item: WatchItem) {
        if let Some(sender) = self.watch_sender.lock().as_ref() {
            let _ = sender.unbounded_send(item);
        }
    }
}

#[async_trait]
impl AppStore for InMemoryStore {
    async fn watch(&self, prefix: &str) -> Result<StoreEventStream> {
        self.state.lock().watched.push(prefix.to_string());
        let receiver = self
            .watch_receiver
            .lock()
            .take()
            .ok_or_else(|| ControllerError::Store("watch already taken".to_string()))?;
        Ok(Box::pin(receiver))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        state.gets.push(key.to_string());
        if state.fail_get {
            return Err(ControllerError::Store(format!("get {key}: injected failure")));
        }
        Ok(state.values.get(key).cloned())
    }
}

/// Telemetry source replaying scripted outcomes, then empty vectors
#[derive(Debug, Default)]
pub struct StaticTelemetry {
    outcomes: Mutex<VecDeque<Result<QueryOutcome>>>,
    queries: Mutex<Vec<String>>,
}

impl StaticTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: Result<QueryOutcome>) {
        self.outcomes.lock().push_back(outcome);
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl TelemetrySource for StaticTelemetry {
    async fn instant_query(&self, query: &str) -> Result<QueryOutcome> {
        self.queries.lock().push(query.to_string());
        self.outcomes
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(QueryOutcome::default()))
    }
}

/// A lifecycle sample labelled the way the twin runtime exports it
pub fn lifecycle_sample(app_id: &str, digital_twin: &str, affinity: &str, value: &str) -> Sample {
    Sample {
        labels: HashMap::from([
            ("__name__".to_string(), "dt_life_cycle_state".to_string()),
            (metric_labels::TWIN_ID.to_string(), app_id.to_string()),
            (metric_labels::DIGITAL_TWIN.to_string(), digital_twin.to_string()),
            (metric_labels::AFFINITY.to_string(), affinity.to_string()),
        ]),
        value: value.to_string(),
    }
}

/// A workload whose pods are selected by `app=<app_label>`
pub fn sample_workload(name: &str, app_label: &str, labels: &ResourceLabels) -> ClusterResource {
    let pod_labels = BTreeMap::from([("app".to_string(), app_label.to_string())]);
    let mut template_labels = pod_labels.clone();
    template_labels.extend(labels.to_map());

    ClusterResource::Workload(WorkloadObject {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.to_map()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(pod_labels),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(template_labels),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn sample_service(name: &str, labels: &ResourceLabels) -> ClusterResource {
    ClusterResource::Service(Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.to_map()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port: 80,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Deployment variant realized as a workload `<twin>-<affinity>` and a
/// service `<twin>-<affinity>-svc`, specs encoded as JSON strings
pub fn deployment_variant(twin: &str, affinity: &str) -> Deployment {
    let name = format!("{twin}-{affinity}");
    let workload = json!({
        "metadata": {"name": name},
        "spec": {
            "selector": {"matchLabels": {"app": name}},
            "template": {
                "metadata": {"labels": {"app": name}},
                "spec": {"containers": [{"name": "twin", "image": format!("{twin}:latest")}]}
            }
        }
    });
    let service = json!({
        "metadata": {"name": format!("{name}-svc")},
        "spec": {"selector": {"app": name}, "ports": [{"port": 80}]}
    });

    Deployment {
        affinity: affinity.to_string(),
        configs: vec![
            Config {
                config_type: "Deployment".to_string(),
                spec: json!(workload.to_string()),
            },
            Config {
                config_type: "Service".to_string(),
                spec: json!(service.to_string()),
            },
        ],
    }
}

/// A twin with one [`deployment_variant`] per affinity
pub fn digital_twin(name: &str, preferred_affinity: Option<&str>, affinities: &[&str]) -> DigitalTwin {
    DigitalTwin {
        name: name.to_string(),
        requirements: Requirements {
            preferred_affinity: preferred_affinity.unwrap_or_default().to_string(),
        },
        deployments: affinities
            .iter()
            .map(|affinity| deployment_variant(name, affinity))
            .collect(),
    }
}

pub fn app(id: i64, digital_twins: Vec<DigitalTwin>) -> App {
    App { id, digital_twins }
}

/// Wire encoding of an app record
pub fn app_record(app: &App) -> Vec<u8> {
    serde_json::to_vec(app).unwrap_or_default()
}
