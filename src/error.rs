//! Error types for the DTM controller.
//!

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControllerError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Telemetry error: {0}")]
    Telemetry(String),
    #[error("Cluster error: {0}")]
    Cluster(String),
    #[error("Invalid store key '{key}'")]
    InvalidStoreKey { key: String },
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
    #[error("Unsupported config type '{config_type}'")]
    UnsupportedConfigType { config_type: String },
    #[error("App {app_id} not found in store")]
    AppNotFound { app_id: i64 },
    #[error("Digital twin '{digital_twin}' not found in app {app_id}")]
    DigitalTwinNotFound { app_id: i64, digital_twin: String },
    #[error("Digital twin '{digital_twin}' of app {app_id} declares no deployments")]
    NoDeploymentVariants { app_id: i64, digital_twin: String },
    #[error(
        "No alternative affinity for digital twin '{digital_twin}' of app {app_id} (current: {affinity})"
    )]
    NoAlternativeAffinity {
        app_id: i64,
        digital_twin: String,
        affinity: String,
    },
    #[error("Timed out after {timeout:?} waiting for pods matching '{selector}' to terminate")]
    DrainTimeout { selector: String, timeout: Duration },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Event channel closed")]
    ChannelClosed,
}

impl ControllerError {
    pub fn cluster(operation: &str, target: &str, reason: impl std::fmt::Display) -> Self {
        ControllerError::Cluster(format!("{operation} {target}: {reason}"))
    }

    /// Faults of the store or telemetry backends that the next natural
    /// schedule point may clear on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, ControllerError::Store(_) | ControllerError::Telemetry(_))
    }

    /// Input that can never be processed, regardless of retries.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            ControllerError::InvalidStoreKey { .. }
                | ControllerError::InvalidRecord(_)
                | ControllerError::UnsupportedConfigType { .. }
                | ControllerError::Validation(_)
        )
    }
}

impl From<serde_json::Error> for ControllerError {
    fn from(error: serde_json::Error) -> Self {
        ControllerError::InvalidRecord(format!("JSON error: {error}"))
    }
}

impl From<config::ConfigError> for ControllerError {
    fn from(error: config::ConfigError) -> Self {
        ControllerError::Configuration(error.to_string())
    }
}

impl From<kube::Error> for ControllerError {
    fn from(error: kube::Error) -> Self {
        ControllerError::Cluster(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ControllerError::Store("down".into()).is_transient());
        assert!(ControllerError::Telemetry("timeout".into()).is_transient());
        assert!(!ControllerError::Cluster("forbidden".into()).is_transient());

        let bad_key = ControllerError::InvalidStoreKey {
            key: "/apps/abc".into(),
        };
        assert!(bad_key.is_malformed_input());
        assert!(!bad_key.is_transient());
    }

    #[test]
    fn test_display_carries_context() {
        let err = ControllerError::NoAlternativeAffinity {
            app_id: 7,
            digital_twin: "t1".into(),
            affinity: "edge".into(),
        };
        let message = err.to_string();
        assert!(message.contains("t1"));
        assert!(message.contains("7"));
        assert!(message.contains("edge"));

        let err = ControllerError::cluster("delete deployment", "web", "not found");
        assert_eq!(err.to_string(), "Cluster error: delete deployment web: not found");
    }

    #[test]
    fn test_json_error_conversion() {
        let err: ControllerError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, ControllerError::InvalidRecord(_)));
    }
}
