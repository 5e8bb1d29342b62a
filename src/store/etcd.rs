//! etcd v3 store access through the JSON gateway (`/v3/kv/range`, `/v3/watch`).
//!
//! Keys and values travel base64-encoded; watch responses arrive as one JSON
//! object per line on a long-lived response body.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{AppStore, StoreEventStream};
use crate::config::StoreConfig;
use crate::error::{ControllerError, Result};
use crate::events::StoreEvent;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EtcdAppStore {
    client: reqwest::Client,
    endpoint: String,
    request_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct RangeRequest {
    key: String,
}

#[derive(Debug, Default, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Serialize)]
struct WatchRequest {
    create_request: WatchCreateRequest,
}

#[derive(Debug, Serialize)]
struct WatchCreateRequest {
    key: String,
    range_end: String,
    prev_kv: bool,
}

#[derive(Debug, Deserialize)]
struct WatchFrame {
    #[serde(default)]
    result: Option<WatchResult>,
    #[serde(default)]
    error: Option<GatewayError>,
}

#[derive(Debug, Deserialize)]
struct WatchResult {
    #[serde(default)]
    events: Vec<WatchEvent>,
    #[serde(default)]
    canceled: bool,
    #[serde(default)]
    cancel_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    /// Omitted by the gateway for PUT, the zero value
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    kv: Option<KeyValue>,
    #[serde(default)]
    prev_kv: Option<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    #[serde(default)]
    message: String,
}

impl EtcdAppStore {
    /// Connect to the first endpoint that answers a status probe
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ControllerError::Store(format!("failed to build HTTP client: {e}")))?;
        let request_timeout = Duration::from_secs(config.request_timeout_seconds);

        let mut last_error = None;
        for endpoint in &config.endpoints {
            let candidate = Self {
                client: client.clone(),
                endpoint: endpoint.trim_end_matches('/').to_string(),
                request_timeout,
            };
            match candidate.probe().await {
                Ok(()) => {
                    info!(endpoint = %candidate.endpoint, "Connected to etcd");
                    return Ok(candidate);
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "etcd endpoint unreachable");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ControllerError::Store("no etcd endpoints configured".to_string())))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn probe(&self) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v3/maintenance/status", self.endpoint))
            .timeout(self.request_timeout)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| ControllerError::Store(format!("status probe failed: {e}")))?;
        check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl AppStore for EtcdAppStore {
    #[instrument(skip(self))]
    async fn watch(&self, prefix: &str) -> Result<StoreEventStream> {
        let request = WatchRequest {
            create_request: WatchCreateRequest {
                key: STANDARD.encode(prefix.as_bytes()),
                range_end: STANDARD.encode(prefix_range_end(prefix.as_bytes())),
                prev_kv: true,
            },
        };

        let response = self
            .client
            .post(format!("{}/v3/watch", self.endpoint))
            .json(&request)
            .send()
            .await
            .map_err(|e| ControllerError::Store(format!("failed to open watch: {e}")))?;
        let response = check_status(response).await?;

        debug!("Watch stream opened");
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();

        Ok(watch_stream(body))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .client
            .post(format!("{}/v3/kv/range", self.endpoint))
            .timeout(self.request_timeout)
            .json(&RangeRequest {
                key: STANDARD.encode(key.as_bytes()),
            })
            .send()
            .await
            .map_err(|e| ControllerError::Store(format!("failed to read {key}: {e}")))?;

        let range: RangeResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ControllerError::Store(format!("invalid range response for {key}: {e}")))?;

        match range.kvs.into_iter().next() {
            Some(kv) => Ok(Some(decode_value(kv.value.as_deref())?)),
            None => Ok(None),
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ControllerError::Store(format!(
        "etcd gateway returned {status}: {body}"
    )))
}

/// Smallest key greater than every key starting with `prefix`
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Every byte was 0xff: watch to the end of the keyspace
    vec![0]
}

fn decode_value(value: Option<&str>) -> Result<Vec<u8>> {
    match value {
        Some(encoded) => STANDARD
            .decode(encoded)
            .map_err(|e| ControllerError::Store(format!("invalid base64 value: {e}"))),
        None => Ok(Vec::new()),
    }
}

fn decode_key(kv: &KeyValue) -> Result<String> {
    let raw = STANDARD
        .decode(&kv.key)
        .map_err(|e| ControllerError::Store(format!("invalid base64 key: {e}")))?;
    String::from_utf8(raw).map_err(|e| ControllerError::Store(format!("non UTF-8 key: {e}")))
}

/// Decode one line of the watch response body into change records
fn decode_watch_frame(line: &[u8]) -> Result<Vec<StoreEvent>> {
    let frame: WatchFrame = serde_json::from_slice(line)
        .map_err(|e| ControllerError::Store(format!("invalid watch frame: {e}")))?;

    if let Some(error) = frame.error {
        return Err(ControllerError::Store(format!(
            "watch failed: {}",
            error.message
        )));
    }

    let Some(result) = frame.result else {
        return Ok(Vec::new());
    };

    if result.canceled {
        return Err(ControllerError::Store(format!(
            "watch canceled: {}",
            result.cancel_reason.unwrap_or_default()
        )));
    }

    result
        .events
        .into_iter()
        .map(|event| {
            let kv = event
                .kv
                .ok_or_else(|| ControllerError::Store("watch event without kv".to_string()))?;
            let key = decode_key(&kv)?;
            match event.event_type.as_deref() {
                None | Some("PUT") => Ok(StoreEvent::put(
                    key,
                    decode_value(kv.value.as_deref())?,
                    event.prev_kv.is_some(),
                )),
                Some("DELETE") => Ok(StoreEvent::delete(key)),
                Some(other) => Err(ControllerError::Store(format!(
                    "unknown watch event type '{other}'"
                ))),
            }
        })
        .collect()
}

struct WatchState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<StoreEvent>>,
    done: bool,
}

impl WatchState {
    fn push_line(&mut self, line: &[u8]) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        match decode_watch_frame(line) {
            Ok(events) => self.pending.extend(events.into_iter().map(Ok)),
            Err(e) => {
                self.pending.push_back(Err(e));
                self.done = true;
            }
        }
    }

    fn drain_lines(&mut self) {
        while !self.done {
            let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            self.push_line(&line);
        }
    }
}

fn watch_stream(body: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> StoreEventStream {
    let state = WatchState {
        body,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    state.drain_lines();
                }
                Some(Err(e)) => {
                    state
                        .pending
                        .push_back(Err(ControllerError::Store(format!("watch stream broke: {e}"))));
                    state.done = true;
                }
                None => {
                    let rest = std::mem::take(&mut state.buffer);
                    state.push_line(&rest);
                    state.done = true;
                }
            }
        }
    })
    .boxed()
}
