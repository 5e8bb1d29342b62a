//! Prometheus HTTP API client for instantaneous vector queries.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use super::{QueryOutcome, Sample, TelemetrySource};
use crate::config::TelemetryConfig;
use crate::error::{ControllerError, Result};

#[derive(Debug, Clone)]
pub struct PrometheusClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    #[serde(default)]
    result: Vec<VectorEntry>,
}

#[derive(Debug, Deserialize)]
struct VectorEntry {
    #[serde(default)]
    metric: HashMap<String, String>,
    /// `[unix_seconds, "value"]`
    value: (f64, String),
}

impl PrometheusClient {
    pub fn new(config: &TelemetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ControllerError::Telemetry(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl TelemetrySource for PrometheusClient {
    async fn instant_query(&self, query: &str) -> Result<QueryOutcome> {
        let url = format!("{}/api/v1/query", self.base_url);
        debug!(url = %url, query = %query, "Querying Prometheus");

        let response = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| ControllerError::Telemetry(format!("query request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ControllerError::Telemetry(format!("failed to read response: {e}")))?;

        parse_query_response(&body).map_err(|e| match e {
            ControllerError::Telemetry(reason) if !status.is_success() => {
                ControllerError::Telemetry(format!("HTTP {status}: {reason}"))
            }
            other => other,
        })
    }
}

/// Decode a `/api/v1/query` response body
pub(crate) fn parse_query_response(body: &str) -> Result<QueryOutcome> {
    let response: ApiResponse = serde_json::from_str(body)
        .map_err(|e| ControllerError::Telemetry(format!("invalid query response: {e}")))?;

    if response.status != "success" {
        return Err(ControllerError::Telemetry(format!(
            "query failed ({}): {}",
            response.error_type.unwrap_or_default(),
            response.error.unwrap_or_default()
        )));
    }

    let data = response
        .data
        .ok_or_else(|| ControllerError::Telemetry("query response has no data".to_string()))?;
    if data.result_type != "vector" {
        return Err(ControllerError::Telemetry(format!(
            "expected a vector result, got {}",
            data.result_type
        )));
    }

    let samples = data
        .result
        .into_iter()
        .map(|entry| Sample {
            labels: entry.metric,
            value: entry.value.1,
        })
        .collect();

    Ok(QueryOutcome {
        samples,
        warnings: response.warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vector_response() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"__name__": "dt_life_cycle_state", "dtm_id": "7", "dtm_digitaltwin": "t1", "dtm_affinity": "edge"},
                     "value": [1700000000.123, "4"]},
                    {"metric": {"dtm_id": "8", "dtm_digitaltwin": "t2", "dtm_affinity": "cloud"},
                     "value": [1700000000.123, "5"]}
                ]
            },
            "warnings": ["partial response"]
        }"#;

        let outcome = parse_query_response(body).unwrap();
        assert_eq!(outcome.samples.len(), 2);
        assert_eq!(outcome.samples[0].labels["dtm_id"], "7");
        assert_eq!(outcome.samples[0].value, "4");
        assert_eq!(outcome.warnings, vec!["partial response".to_string()]);
    }

    #[test]
    fn test_error_status_is_telemetry_error() {
        let body = r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#;
        let err = parse_query_response(body).unwrap_err();
        assert!(matches!(err, ControllerError::Telemetry(ref m) if m.contains("bad_data")));
    }

    #[test]
    fn test_non_vector_result_rejected() {
        let body = r#"{"status":"success","data":{"resultType":"matrix","result":[]}}"#;
        assert!(parse_query_response(body).is_err());
        assert!(parse_query_response("<html>").is_err());
    }
}
