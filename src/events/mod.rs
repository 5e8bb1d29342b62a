//! # Controller Events
//!
//! The unit of work flowing from the producers (store watcher, telemetry
//! poller) to the dispatcher. Both producers share one bounded conduit and
//! events are consumed strictly in arrival order.

use regex::Regex;
use std::sync::OnceLock;
use tokio::sync::mpsc;

use crate::error::{ControllerError, Result};
use crate::models::Metric;

/// Tagged union of everything the dispatcher can receive
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Store(StoreEvent),
    Telemetry(Metric),
}

impl ControllerEvent {
    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerEvent::Store(event) => match event.kind {
                StoreEventKind::Put => "store_put",
                StoreEventKind::Delete => "store_delete",
            },
            ControllerEvent::Telemetry(_) => "telemetry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Put,
    Delete,
}

/// One change record observed on the watched key prefix
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub key: String,
    /// New value for puts, empty for deletes
    pub value: Vec<u8>,
    /// Whether the key existed before this change (create vs. update)
    pub had_previous: bool,
}

impl StoreEvent {
    pub fn put(key: impl Into<String>, value: Vec<u8>, had_previous: bool) -> Self {
        Self {
            kind: StoreEventKind::Put,
            key: key.into(),
            value,
            had_previous,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: StoreEventKind::Delete,
            key: key.into(),
            value: Vec::new(),
            had_previous: true,
        }
    }

    /// Numeric app id of this event's key under `prefix`
    pub fn app_id(&self, prefix: &str) -> Result<i64> {
        parse_app_id(prefix, &self.key)
    }
}

fn app_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(/.+)/(\d+)$").expect("app key pattern is valid"))
}

/// Extract the numeric id from an app key of the form `<prefix>/<id>`.
///
/// The prefix may span several segments; everything before the last `/`
/// must equal `prefix` exactly.
pub fn parse_app_id(prefix: &str, key: &str) -> Result<i64> {
    let invalid = || ControllerError::InvalidStoreKey {
        key: key.to_string(),
    };

    let captures = app_key_pattern().captures(key).ok_or_else(invalid)?;
    match (captures.get(1), captures.get(2)) {
        (Some(found), Some(id)) if found.as_str() == prefix => {
            id.as_str().parse::<i64>().map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

/// Best-effort id from the last segment of a key, for log context only
pub fn trailing_app_id(key: &str) -> Option<i64> {
    app_key_pattern()
        .captures(key)
        .and_then(|captures| captures.get(2))
        .and_then(|id| id.as_str().parse().ok())
}

/// Render the store key of an app record
pub fn app_key(prefix: &str, app_id: i64) -> String {
    format!("{prefix}/{app_id}")
}

/// Producer side of the event conduit
#[derive(Debug, Clone)]
pub struct EventSender(mpsc::Sender<ControllerEvent>);

/// Consumer side of the event conduit
#[derive(Debug)]
pub struct EventReceiver(mpsc::Receiver<ControllerEvent>);

/// Create the bounded conduit shared by all producers
pub fn event_channel(buffer_size: usize) -> (EventSender, EventReceiver) {
    let (sender, receiver) = mpsc::channel(buffer_size.max(1));
    (EventSender(sender), EventReceiver(receiver))
}

impl EventSender {
    /// Blocks while the conduit is full; fails once the dispatcher is gone
    pub async fn send(&self, event: ControllerEvent) -> Result<()> {
        self.0
            .send(event)
            .await
            .map_err(|_| ControllerError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<ControllerEvent> {
        self.0.recv().await
    }
}
