#![allow(clippy::doc_markdown)] // Allow technical terms like etcd, Prometheus in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # DTM Controller
//!
//! Entanglement-aware reconciliation controller for digital-twin workloads.
//!
//! ## Overview
//!
//! The controller keeps declaratively-described digital twins placed on a
//! cluster and relocates a twin to a different affinity zone (cloud, edge,
//! mec, ...) when telemetry reports that it lost its live binding to its
//! physical counterpart.
//!
//! ## Architecture
//!
//! Two producers feed one bounded event conduit:
//!
//! - the **store watcher** reports every put and delete under `/apps`
//! - the **telemetry poller** reports every twin whose lifecycle state is 4
//!
//! A single **dispatcher** drains the conduit one event at a time and hands
//! each event to the **reconciler**, which issues create/list/delete calls
//! through the **cluster gateway**. Cluster objects are found again only by
//! their `dtm/id`, `dtm/digitaltwin` and `dtm/affinity` labels.
//!
//! ## Module Organization
//!
//! - [`cluster`] - label-addressed cluster access and the drain barrier
//! - [`store`] - app store access and the store watcher
//! - [`telemetry`] - lifecycle metric queries and the telemetry poller
//! - [`dispatcher`] - sequential event consumption
//! - [`reconciler`] - create/update/delete and failover decisions
//! - [`controller`] - wiring and shutdown
//! - [`config`] - layered configuration
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dtm_controller::{Controller, ControllerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ControllerConfig::load(None)?.with_namespace("twins");
//! let controller = Controller::new(config).await?;
//! controller.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! [`test_helpers`] provides in-memory cluster, store and telemetry backends:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and scenario tests
//! ```

pub mod cluster;
pub mod config;
pub mod constants;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod reconciler;
pub mod store;
pub mod telemetry;
pub mod test_helpers;

pub use cluster::{ClusterGateway, ClusterResource, DrainPolicy, KubeClusterGateway, ResourceKind, ResourceLabels};
pub use config::ControllerConfig;
pub use constants::LifecycleState;
pub use controller::Controller;
pub use dispatcher::{EventDispatcher, EventHandler};
pub use error::{ControllerError, Result};
pub use events::{ControllerEvent, StoreEvent, StoreEventKind};
pub use models::{App, Config, ConfigKind, Deployment, DigitalTwin, Metric, Requirements};
pub use reconciler::Reconciler;
pub use store::{AppStore, EtcdAppStore, StoreWatcher};
pub use telemetry::{PrometheusClient, TelemetryPoller, TelemetrySource};
