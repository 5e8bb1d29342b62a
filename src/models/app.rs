//! App records as stored under `/apps/<id>` by the administrative API.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

use crate::error::{ControllerError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub id: i64,
    #[serde(default)]
    pub digital_twins: Vec<DigitalTwin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitalTwin {
    pub name: String,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub deployments: Vec<Deployment>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirements {
    #[serde(default)]
    pub preferred_affinity: String,
}

/// One affinity variant of a twin's runtime footprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub affinity: String,
    #[serde(default)]
    pub configs: Vec<Config>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "type")]
    pub config_type: String,
    /// Opaque payload interpreted according to `config_type`
    pub spec: serde_json::Value,
}

/// Closed set of config types the controller knows how to realize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    Workload,
    Service,
    DataConfig,
}

impl FromStr for ConfigKind {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Workload" | "Deployment" => Ok(ConfigKind::Workload),
            "Service" => Ok(ConfigKind::Service),
            "DataConfig" | "ConfigMap" => Ok(ConfigKind::DataConfig),
            other => Err(ControllerError::UnsupportedConfigType {
                config_type: other.to_string(),
            }),
        }
    }
}

impl App {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let app: App = serde_json::from_slice(bytes)?;
        app.validate()?;
        Ok(app)
    }

    /// Deployment affinities must be unique within a twin
    pub fn validate(&self) -> Result<()> {
        for twin in &self.digital_twins {
            let mut seen = HashSet::new();
            for deployment in &twin.deployments {
                if !seen.insert(deployment.affinity.as_str()) {
                    return Err(ControllerError::Validation(format!(
                        "digital twin '{}' of app {} declares affinity '{}' more than once",
                        twin.name, self.id, deployment.affinity
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn digital_twin(&self, name: &str) -> Option<&DigitalTwin> {
        self.digital_twins.iter().find(|twin| twin.name == name)
    }
}

impl DigitalTwin {
    pub fn preferred_affinity(&self) -> Option<&str> {
        let preferred = self.requirements.preferred_affinity.as_str();
        (!preferred.is_empty()).then_some(preferred)
    }

    pub fn deployment(&self, affinity: &str) -> Option<&Deployment> {
        self.deployments.iter().find(|d| d.affinity == affinity)
    }
}

impl Config {
    pub fn kind(&self) -> Result<ConfigKind> {
        self.config_type.parse()
    }

    /// The payload as structured JSON.
    ///
    /// The administrative API stores specs as JSON-encoded strings; embedded
    /// objects are accepted as well.
    pub fn spec_value(&self) -> Result<serde_json::Value> {
        match &self.spec {
            serde_json::Value::String(raw) => Ok(serde_json::from_str(raw)?),
            value @ serde_json::Value::Object(_) => Ok(value.clone()),
            other => Err(ControllerError::InvalidRecord(format!(
                "{} spec must be an object or a JSON string, got {other}",
                self.config_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record() -> serde_json::Value {
        json!({
            "id": 7,
            "digitalTwins": [{
                "name": "t1",
                "requirements": {"preferredAffinity": "cloud"},
                "deployments": [
                    {"affinity": "edge", "configs": [
                        {"type": "Deployment", "spec": "{\"metadata\":{\"name\":\"t1-edge\"}}"}
                    ]},
                    {"affinity": "cloud", "configs": [
                        {"type": "Service", "spec": {"metadata": {"name": "t1-svc"}}}
                    ]}
                ]
            }]
        })
    }

    #[test]
    fn test_parse_wire_record() {
        let bytes = serde_json::to_vec(&sample_record()).unwrap();
        let app = App::from_slice(&bytes).unwrap();

        assert_eq!(app.id, 7);
        let twin = app.digital_twin("t1").unwrap();
        assert_eq!(twin.preferred_affinity(), Some("cloud"));
        assert_eq!(twin.deployments.len(), 2);
        assert_eq!(twin.deployment("edge").unwrap().configs.len(), 1);
        assert!(app.digital_twin("t2").is_none());
    }

    #[test]
    fn test_missing_requirements_means_no_preference() {
        let app: App = serde_json::from_value(json!({
            "id": 1,
            "digitalTwins": [{"name": "t1", "deployments": [{"affinity": "edge"}]}]
        }))
        .unwrap();
        assert_eq!(app.digital_twins[0].preferred_affinity(), None);
        assert!(app.digital_twins[0].deployments[0].configs.is_empty());
    }

    #[test]
    fn test_duplicate_affinity_rejected() {
        let record = json!({
            "id": 3,
            "digitalTwins": [{"name": "t1", "deployments": [
                {"affinity": "edge"}, {"affinity": "edge"}
            ]}]
        });
        let bytes = serde_json::to_vec(&record).unwrap();
        assert!(matches!(
            App::from_slice(&bytes),
            Err(ControllerError::Validation(_))
        ));
    }

    #[test]
    fn test_config_kind_aliases() {
        assert_eq!("Deployment".parse::<ConfigKind>().unwrap(), ConfigKind::Workload);
        assert_eq!("Workload".parse::<ConfigKind>().unwrap(), ConfigKind::Workload);
        assert_eq!("ConfigMap".parse::<ConfigKind>().unwrap(), ConfigKind::DataConfig);
        assert_eq!("Service".parse::<ConfigKind>().unwrap(), ConfigKind::Service);
        assert!(matches!(
            "StatefulSet".parse::<ConfigKind>(),
            Err(ControllerError::UnsupportedConfigType { .. })
        ));
    }

    #[test]
    fn test_spec_value_accepts_string_and_object() {
        let embedded = Config {
            config_type: "Service".into(),
            spec: json!({"metadata": {"name": "svc"}}),
        };
        let encoded = Config {
            config_type: "Service".into(),
            spec: json!("{\"metadata\":{\"name\":\"svc\"}}"),
        };
        assert_eq!(embedded.spec_value().unwrap(), encoded.spec_value().unwrap());

        let bad = Config {
            config_type: "Service".into(),
            spec: json!(42),
        };
        assert!(matches!(bad.spec_value(), Err(ControllerError::InvalidRecord(_))));
    }
}
