//! # Controller Configuration
//!
//! Layered configuration for the reconciliation controller: built-in defaults,
//! an optional TOML file, then `DTM__`-prefixed environment variables.
//!
//! ```rust
//! use dtm_controller::config::ControllerConfig;
//!
//! let config = ControllerConfig::default()
//!     .with_telemetry_url("http://prometheus:9090")
//!     .with_namespace("twins");
//! assert!(config.validate().is_ok());
//! assert_eq!(config.store.key_prefix, "/apps");
//! assert_eq!(config.telemetry.metric_name, "dt_life_cycle_state");
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{ControllerError, Result};

/// Environment variable prefix, e.g. `DTM__TELEMETRY__URL`
pub const ENV_PREFIX: &str = "DTM";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ControllerConfig {
    pub store: StoreConfig,
    pub telemetry: TelemetryConfig,
    pub cluster: ClusterConfig,
    pub drain: DrainConfig,
    pub dispatcher: DispatcherConfig,
}

/// Declarative store connection and key namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// etcd endpoints; the first reachable one is used
    pub endpoints: Vec<String>,
    /// Prefix under which app records live (`<prefix>/<id>`)
    pub key_prefix: String,
    pub request_timeout_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:2379".to_string()],
            key_prefix: "/apps".to_string(),
            request_timeout_seconds: 10,
        }
    }
}

/// Telemetry backend polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub url: String,
    pub poll_interval_seconds: u64,
    /// Instantaneous metric carrying the twin lifecycle state
    pub metric_name: String,
    pub request_timeout_seconds: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090".to_string(),
            poll_interval_seconds: 10,
            metric_name: "dt_life_cycle_state".to_string(),
            request_timeout_seconds: 10,
        }
    }
}

impl TelemetryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Orchestration API access
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Explicit kubeconfig path; `None` means `$HOME/.kube/config`, then the inferred config
    pub kubeconfig: Option<PathBuf>,
    pub namespace: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            namespace: "default".to_string(),
        }
    }
}

impl ClusterConfig {
    /// Kubeconfig path to load, if one can be determined
    pub fn resolved_kubeconfig(&self) -> Option<PathBuf> {
        self.kubeconfig.clone().or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .map(|home| home.join(".kube").join("config"))
                .filter(|path| path.is_file())
        })
    }
}

/// Pod drain barrier timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    pub poll_interval_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 10,
            timeout_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Event conduit capacity; 1 keeps producers in lockstep with the dispatcher
    pub event_buffer_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1,
        }
    }
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load defaults, then the optional file, then `DTM__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            debug!(path = %path.display(), "Loading controller configuration file");
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("store.endpoints"),
        );

        let config: ControllerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.endpoints.is_empty() {
            return Err(invalid("store.endpoints must not be empty"));
        }
        if !self.store.key_prefix.starts_with('/') || self.store.key_prefix.ends_with('/') {
            return Err(invalid(
                "store.key_prefix must start with '/' and must not end with '/'",
            ));
        }
        if self.store.request_timeout_seconds == 0 {
            return Err(invalid("store.request_timeout_seconds must be positive"));
        }
        if self.telemetry.url.is_empty() {
            return Err(invalid("telemetry.url must not be empty"));
        }
        if self.telemetry.poll_interval_seconds == 0 {
            return Err(invalid("telemetry.poll_interval_seconds must be positive"));
        }
        if self.telemetry.metric_name.is_empty() {
            return Err(invalid("telemetry.metric_name must not be empty"));
        }
        if self.telemetry.request_timeout_seconds == 0 {
            return Err(invalid("telemetry.request_timeout_seconds must be positive"));
        }
        if self.cluster.namespace.is_empty() {
            return Err(invalid("cluster.namespace must not be empty"));
        }
        if self.drain.poll_interval_seconds == 0 || self.drain.timeout_seconds == 0 {
            return Err(invalid("drain intervals must be positive"));
        }
        if self.drain.poll_interval_seconds > self.drain.timeout_seconds {
            return Err(invalid(
                "drain.poll_interval_seconds cannot exceed drain.timeout_seconds",
            ));
        }
        if self.dispatcher.event_buffer_size == 0 {
            return Err(invalid("dispatcher.event_buffer_size must be positive"));
        }
        Ok(())
    }

    pub fn with_store_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.store.endpoints = vec![endpoint.into()];
        self
    }

    pub fn with_key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.store.key_prefix = prefix.into();
        self
    }

    pub fn with_telemetry_url<S: Into<String>>(mut self, url: S) -> Self {
        self.telemetry.url = url.into();
        self
    }

    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.telemetry.poll_interval_seconds = seconds;
        self
    }

    pub fn with_kubeconfig<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cluster.kubeconfig = Some(path.into());
        self
    }

    pub fn with_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.cluster.namespace = namespace.into();
        self
    }

    pub fn with_drain(mut self, poll_interval_seconds: u64, timeout_seconds: u64) -> Self {
        self.drain = DrainConfig {
            poll_interval_seconds,
            timeout_seconds,
        };
        self
    }
}

fn invalid(message: &str) -> ControllerError {
    ControllerError::Configuration(message.to_string())
}
