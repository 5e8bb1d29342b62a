//! # Telemetry Poller
//!
//! Periodically queries the lifecycle-state metric of every known twin
//! instance and emits one event per instance whose entanglement is broken.
//! States 1, 2, 3 and 5 mean the twin is still binding or is healthy, so they
//! produce nothing.

pub mod prometheus;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::constants::{metric_labels, LifecycleState};
use crate::error::{ControllerError, Result};
use crate::events::{ControllerEvent, EventSender};
use crate::models::Metric;

pub use prometheus::PrometheusClient;

/// One labelled sample of an instantaneous vector
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: HashMap<String, String>,
    /// Raw sample value as reported by the backend
    pub value: String,
}

/// Samples plus any non-fatal warnings the backend attached
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutcome {
    pub samples: Vec<Sample>,
    pub warnings: Vec<String>,
}

/// Backend answering instantaneous queries
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn instant_query(&self, query: &str) -> Result<QueryOutcome>;
}

/// Poller counters
#[derive(Debug, Default)]
pub struct PollerStats {
    pub polling_cycles: AtomicU64,
    pub polling_errors: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub events_emitted: AtomicU64,
}

pub struct TelemetryPoller {
    poller_id: Uuid,
    source: Arc<dyn TelemetrySource>,
    metric_name: String,
    interval: Duration,
    stats: Arc<PollerStats>,
}

impl std::fmt::Debug for TelemetryPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryPoller")
            .field("poller_id", &self.poller_id)
            .field("metric_name", &self.metric_name)
            .field("interval", &self.interval)
            .finish()
    }
}

impl TelemetryPoller {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        metric_name: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            poller_id: Uuid::new_v4(),
            source,
            metric_name: metric_name.into(),
            interval,
            stats: Arc::new(PollerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PollerStats> {
        Arc::clone(&self.stats)
    }

    /// Run one query and return the actionable readings.
    ///
    /// A failed query yields an error and no readings; individual samples
    /// that cannot be parsed are dropped while the rest of the batch goes on.
    pub async fn poll_once(&self) -> Result<Vec<Metric>> {
        self.stats.polling_cycles.fetch_add(1, Ordering::Relaxed);

        let outcome = match self.source.instant_query(&self.metric_name).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.polling_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        for warning in &outcome.warnings {
            warn!(poller_id = %self.poller_id, warning = %warning, "Telemetry query warning");
        }

        let mut actionable = Vec::new();
        for sample in &outcome.samples {
            match parse_sample(sample) {
                Ok(metric) if metric.lifecycle_state.is_actionable() => actionable.push(metric),
                Ok(metric) => {
                    debug!(metric = %metric, "Quiescent lifecycle state");
                }
                Err(e) => {
                    self.stats.samples_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        poller_id = %self.poller_id,
                        labels = ?sample.labels,
                        value = %sample.value,
                        error = %e,
                        "Dropping unparseable telemetry sample"
                    );
                }
            }
        }

        Ok(actionable)
    }

    /// Poll on every tick until cancelled or the conduit closes
    #[instrument(skip_all, fields(poller_id = %self.poller_id))]
    pub async fn run(self, sender: EventSender, cancel: CancellationToken) {
        info!(
            metric = %self.metric_name,
            interval_ms = self.interval.as_millis() as u64,
            "Telemetry poller started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; wait a full interval like the backend scrape does
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }

            let metrics = tokio::select! {
                polled = self.poll_once() => polled,
                _ = cancel.cancelled() => break,
            };

            let metrics = match metrics {
                Ok(metrics) => metrics,
                Err(e) => {
                    warn!(error = %e, "Telemetry query failed, skipping tick");
                    continue;
                }
            };

            for metric in metrics {
                info!(metric = %metric, "Entanglement broken");
                let sent = tokio::select! {
                    sent = sender.send(ControllerEvent::Telemetry(metric)) => sent,
                    _ = cancel.cancelled() => {
                        info!("Telemetry poller cancelled");
                        return;
                    }
                };
                if sent.is_err() {
                    warn!("Event conduit closed, stopping telemetry poller");
                    return;
                }
                self.stats.events_emitted.fetch_add(1, Ordering::Relaxed);
            }
        }

        info!("Telemetry poller cancelled");
    }
}

/// Turn a labelled sample into a typed reading
pub fn parse_sample(sample: &Sample) -> Result<Metric> {
    let label = |name: &str| {
        sample.labels.get(name).cloned().ok_or_else(|| {
            ControllerError::InvalidRecord(format!("sample is missing label '{name}'"))
        })
    };

    let raw_id = label(metric_labels::TWIN_ID)?;
    let app_id = raw_id.parse::<i64>().map_err(|_| {
        ControllerError::InvalidRecord(format!("twin id '{raw_id}' is not an integer"))
    })?;

    let value = sample.value.parse::<f64>().map_err(|_| {
        ControllerError::InvalidRecord(format!("sample value '{}' is not numeric", sample.value))
    })?;
    if value.fract() != 0.0 {
        return Err(ControllerError::InvalidRecord(format!(
            "lifecycle state {value} is not an integer"
        )));
    }
    let lifecycle_state = LifecycleState::try_from(value as i64).map_err(|code| {
        ControllerError::InvalidRecord(format!("unknown lifecycle state {code}"))
    })?;

    Ok(Metric {
        app_id,
        digital_twin: label(metric_labels::DIGITAL_TWIN)?,
        affinity: label(metric_labels::AFFINITY)?,
        lifecycle_state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use crate::test_helpers::{lifecycle_sample, StaticTelemetry};

    #[tokio::test]
    async fn test_only_broken_instances_are_actionable() {
        let source = Arc::new(StaticTelemetry::new());
        source.push_outcome(Ok(QueryOutcome {
            samples: vec![
                lifecycle_sample("1", "t1", "edge", "1"),
                lifecycle_sample("2", "t2", "edge", "2"),
                lifecycle_sample("3", "t3", "edge", "3"),
                lifecycle_sample("4", "t4", "cloud", "4"),
                lifecycle_sample("5", "t5", "mec", "5"),
            ],
            warnings: vec![],
        }));

        let poller = TelemetryPoller::new(source.clone(), "dt_life_cycle_state", Duration::from_secs(10));
        let metrics = poller.poll_once().await.unwrap();

        assert_eq!(metrics, vec![Metric::entanglement_broken(4, "t4", "cloud")]);
        assert_eq!(source.queries(), vec!["dt_life_cycle_state".to_string()]);
    }

    #[tokio::test]
    async fn test_unparseable_samples_dropped_rest_processed() {
        let source = Arc::new(StaticTelemetry::new());
        source.push_outcome(Ok(QueryOutcome {
            samples: vec![
                lifecycle_sample("not-a-number", "t1", "edge", "4"),
                lifecycle_sample("7", "t1", "edge", "4"),
                lifecycle_sample("8", "t2", "edge", "9"),
            ],
            warnings: vec!["partial data".into()],
        }));

        let poller = TelemetryPoller::new(source, "dt_life_cycle_state", Duration::from_secs(10));
        let metrics = poller.poll_once().await.unwrap();

        assert_eq!(metrics, vec![Metric::entanglement_broken(7, "t1", "edge")]);
        assert_eq!(poller.stats().samples_dropped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_query_failure_yields_no_partial_results() {
        let source = Arc::new(StaticTelemetry::new());
        source.push_outcome(Err(ControllerError::Telemetry("connection refused".into())));

        let poller = TelemetryPoller::new(source, "dt_life_cycle_state", Duration::from_secs(10));
        assert!(poller.poll_once().await.is_err());
        assert_eq!(poller.stats().polling_errors.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_parse_sample_accepts_float_encoded_states() {
        let metric = parse_sample(&lifecycle_sample("12", "t1", "mec", "4.0")).unwrap();
        assert_eq!(metric.lifecycle_state, LifecycleState::EntanglementBroken);
        assert!(parse_sample(&lifecycle_sample("12", "t1", "mec", "4.5")).is_err());

        let mut missing = lifecycle_sample("12", "t1", "mec", "4");
        missing.labels.remove("dtm_affinity");
        assert!(parse_sample(&missing).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_emits_events_and_skips_failed_ticks() {
        let source = Arc::new(StaticTelemetry::new());
        source.push_outcome(Err(ControllerError::Telemetry("timeout".into())));
        source.push_outcome(Ok(QueryOutcome {
            samples: vec![lifecycle_sample("7", "t1", "edge", "4")],
            warnings: vec![],
        }));

        let poller = TelemetryPoller::new(source.clone(), "dt_life_cycle_state", Duration::from_secs(10));
        let stats = poller.stats();
        let (sender, mut receiver) = event_channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.run(sender, cancel.clone()));

        let event = receiver.recv().await.unwrap();
        assert_eq!(
            event,
            ControllerEvent::Telemetry(Metric::entanglement_broken(7, "t1", "edge"))
        );

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(stats.polling_errors.load(Ordering::Relaxed), 1);
        assert_eq!(stats.events_emitted.load(Ordering::Relaxed), 1);
    }
}
