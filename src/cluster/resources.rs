//! Realization of app configs into typed cluster objects.

use k8s_openapi::api::apps::v1::Deployment as WorkloadObject;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

use super::{ResourceKind, ResourceLabels};
use crate::error::{ControllerError, Result};
use crate::models::{Config, ConfigKind};

/// A typed object ready to be created, labels already applied
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterResource {
    Workload(WorkloadObject),
    Service(Service),
    DataConfig(ConfigMap),
}

impl ClusterResource {
    /// Parse a config payload by its declared type and stamp the label set on it.
    ///
    /// Workloads also get the labels on their pod template so the drain
    /// barrier can find owned pods later.
    pub fn from_config(config: &Config, labels: &ResourceLabels) -> Result<Self> {
        let kind = config.kind()?;
        let spec = config.spec_value()?;
        let label_map = labels.to_map();

        let resource = match kind {
            ConfigKind::Workload => {
                let mut workload: WorkloadObject = serde_json::from_value(spec)?;
                merge_labels(&mut workload.metadata, &label_map);
                let template = &mut workload
                    .spec
                    .as_mut()
                    .ok_or_else(|| {
                        ControllerError::InvalidRecord(format!(
                            "workload for app {} has no spec",
                            labels.app_id
                        ))
                    })?
                    .template;
                merge_labels(template.metadata.get_or_insert_with(ObjectMeta::default), &label_map);
                ClusterResource::Workload(workload)
            }
            ConfigKind::Service => {
                let mut service: Service = serde_json::from_value(spec)?;
                merge_labels(&mut service.metadata, &label_map);
                ClusterResource::Service(service)
            }
            ConfigKind::DataConfig => {
                let mut config_map: ConfigMap = serde_json::from_value(spec)?;
                merge_labels(&mut config_map.metadata, &label_map);
                ClusterResource::DataConfig(config_map)
            }
        };

        if resource.name().is_none() {
            return Err(ControllerError::InvalidRecord(format!(
                "{} for app {} has no metadata.name",
                resource.kind(),
                labels.app_id
            )));
        }
        Ok(resource)
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ClusterResource::Workload(_) => ResourceKind::Workload,
            ClusterResource::Service(_) => ResourceKind::Service,
            ClusterResource::DataConfig(_) => ResourceKind::DataConfig,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            ClusterResource::Workload(object) => &object.metadata,
            ClusterResource::Service(object) => &object.metadata,
            ClusterResource::DataConfig(object) => &object.metadata,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata().name.as_deref()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata().labels.clone().unwrap_or_default()
    }

    /// Rendered pod selector of a workload
    pub fn pod_selector(&self) -> Option<Result<String>> {
        match self {
            ClusterResource::Workload(workload) => workload
                .spec
                .as_ref()
                .map(|spec| format_label_selector(&spec.selector)),
            _ => None,
        }
    }
}

fn merge_labels(metadata: &mut ObjectMeta, labels: &BTreeMap<String, String>) {
    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// Render a structured selector in the string form accepted by list calls.
///
/// An empty selector would match every pod in the namespace, so it is rejected.
pub fn format_label_selector(selector: &LabelSelector) -> Result<String> {
    let mut parts = Vec::new();

    if let Some(match_labels) = &selector.match_labels {
        parts.extend(match_labels.iter().map(|(k, v)| format!("{k}={v}")));
    }

    for expression in selector.match_expressions.iter().flatten() {
        let values = expression.values.clone().unwrap_or_default().join(",");
        let part = match expression.operator.as_str() {
            "In" => format!("{} in ({values})", expression.key),
            "NotIn" => format!("{} notin ({values})", expression.key),
            "Exists" => expression.key.clone(),
            "DoesNotExist" => format!("!{}", expression.key),
            other => {
                return Err(ControllerError::InvalidRecord(format!(
                    "unsupported selector operator '{other}'"
                )))
            }
        };
        parts.push(part);
    }

    if parts.is_empty() {
        return Err(ControllerError::InvalidRecord(
            "workload selector is empty".to_string(),
        ));
    }
    Ok(parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use serde_json::json;

    fn workload_config() -> Config {
        Config {
            config_type: "Deployment".into(),
            spec: json!({
                "metadata": {"name": "t1-edge", "labels": {"team": "iot"}},
                "spec": {
                    "selector": {"matchLabels": {"app": "t1"}},
                    "template": {
                        "metadata": {"labels": {"app": "t1"}},
                        "spec": {"containers": [{"name": "twin", "image": "twin:latest"}]}
                    }
                }
            }),
        }
    }

    #[test]
    fn test_workload_labels_applied_to_object_and_template() {
        let labels = ResourceLabels::for_deployment(7, "t1", "edge");
        let resource = ClusterResource::from_config(&workload_config(), &labels).unwrap();

        assert_eq!(resource.kind(), ResourceKind::Workload);
        assert_eq!(resource.name(), Some("t1-edge"));

        let object_labels = resource.labels();
        assert_eq!(object_labels["team"], "iot");
        assert_eq!(object_labels["dtm/id"], "7");
        assert_eq!(object_labels["dtm/affinity"], "edge");

        let ClusterResource::Workload(workload) = &resource else {
            panic!("expected a workload");
        };
        let template_labels = workload
            .spec
            .as_ref()
            .and_then(|spec| spec.template.metadata.as_ref())
            .and_then(|meta| meta.labels.as_ref())
            .unwrap();
        assert_eq!(template_labels["app"], "t1");
        assert_eq!(template_labels["dtm/digitaltwin"], "t1");

        assert_eq!(resource.pod_selector().unwrap().unwrap(), "app=t1");
    }

    #[test]
    fn test_template_without_metadata_gets_labels() {
        let config = Config {
            config_type: "Workload".into(),
            spec: json!({
                "metadata": {"name": "bare"},
                "spec": {"selector": {"matchLabels": {"app": "bare"}}, "template": {}}
            }),
        };
        let resource =
            ClusterResource::from_config(&config, &ResourceLabels::for_deployment(1, "t", "mec"))
                .unwrap();
        let ClusterResource::Workload(workload) = resource else {
            panic!("expected a workload");
        };
        let template_meta = workload.spec.unwrap().template.metadata.unwrap();
        assert_eq!(template_meta.labels.unwrap()["dtm/affinity"], "mec");
    }

    #[test]
    fn test_service_and_config_map_from_string_spec() {
        let labels = ResourceLabels::for_deployment(2, "t2", "cloud");
        let service = Config {
            config_type: "Service".into(),
            spec: json!("{\"metadata\":{\"name\":\"t2-svc\"},\"spec\":{\"ports\":[{\"port\":80}]}}"),
        };
        let data = Config {
            config_type: "ConfigMap".into(),
            spec: json!({"metadata": {"name": "t2-conf"}, "data": {"mode": "fast"}}),
        };

        let service = ClusterResource::from_config(&service, &labels).unwrap();
        assert_eq!(service.kind(), ResourceKind::Service);
        assert_eq!(service.labels()["dtm/id"], "2");
        assert!(service.pod_selector().is_none());

        let data = ClusterResource::from_config(&data, &labels).unwrap();
        assert_eq!(data.kind(), ResourceKind::DataConfig);
        assert_eq!(data.name(), Some("t2-conf"));
    }

    #[test]
    fn test_unknown_type_and_missing_name_rejected() {
        let labels = ResourceLabels::for_app(3);
        let unknown = Config {
            config_type: "CronJob".into(),
            spec: json!({"metadata": {"name": "x"}}),
        };
        assert!(matches!(
            ClusterResource::from_config(&unknown, &labels),
            Err(ControllerError::UnsupportedConfigType { .. })
        ));

        let unnamed = Config {
            config_type: "ConfigMap".into(),
            spec: json!({"data": {}}),
        };
        assert!(matches!(
            ClusterResource::from_config(&unnamed, &labels),
            Err(ControllerError::InvalidRecord(_))
        ));
    }

    #[test]
    fn test_format_label_selector_expressions() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("app".to_string(), "t1".to_string())])),
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "tier".into(),
                    operator: "In".into(),
                    values: Some(vec!["edge".into(), "mec".into()]),
                },
                LabelSelectorRequirement {
                    key: "canary".into(),
                    operator: "DoesNotExist".into(),
                    values: None,
                },
            ]),
        };
        assert_eq!(
            format_label_selector(&selector).unwrap(),
            "app=t1,tier in (edge,mec),!canary"
        );

        assert!(format_label_selector(&LabelSelector::default()).is_err());
    }
}
