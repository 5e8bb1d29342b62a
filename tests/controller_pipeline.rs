//! Full controller runs: both producers, one conduit, one dispatcher.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use dtm_controller::telemetry::QueryOutcome;
use dtm_controller::test_helpers::{
    app, app_record, digital_twin, lifecycle_sample, InMemoryCluster, InMemoryStore,
    StaticTelemetry,
};
use dtm_controller::{Controller, ControllerConfig, ControllerError, ResourceKind, StoreEvent};

async fn wait_until(condition: impl Fn() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn telemetry_break_after_create_fails_over() {
    let store = Arc::new(InMemoryStore::new());
    let telemetry = Arc::new(StaticTelemetry::new());
    let cluster = Arc::new(InMemoryCluster::new());

    let record = app(7, vec![digital_twin("t1", None, &["edge", "cloud"])]);
    store.emit(StoreEvent::put("/apps/7", app_record(&record), false));
    telemetry.push_outcome(Ok(QueryOutcome {
        samples: vec![
            lifecycle_sample("7", "t1", "edge", "4"),
            lifecycle_sample("8", "t5", "mec", "5"),
        ],
        warnings: vec![],
    }));
    cluster.set_pod_countdown("app=t1-edge", vec![1, 0]);

    let controller = Controller::with_components(
        ControllerConfig::default(),
        store.clone(),
        telemetry.clone(),
        cluster.clone(),
    );
    let cancel = CancellationToken::new();

    let run = controller.run(cancel.clone());
    let stop = async {
        wait_until(|| cluster.names_of(ResourceKind::Workload) == vec!["t1-cloud".to_string()])
            .await;
        cancel.cancel();
    };
    let (stats, ()) = tokio::join!(run, stop);
    let stats = stats.unwrap();

    assert_eq!(stats.store_events.load(std::sync::atomic::Ordering::Relaxed), 1);
    assert_eq!(stats.telemetry_events.load(std::sync::atomic::Ordering::Relaxed), 1);
    assert_eq!(stats.failed.load(std::sync::atomic::Ordering::Relaxed), 0);
    assert_eq!(
        cluster.names_of(ResourceKind::Service),
        vec!["t1-cloud-svc".to_string()]
    );
    assert_eq!(store.watched_prefixes(), vec!["/apps/".to_string()]);
    assert!(!telemetry.queries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_events_do_not_stop_the_controller() {
    let store = Arc::new(InMemoryStore::new());
    let telemetry = Arc::new(StaticTelemetry::new());
    let cluster = Arc::new(InMemoryCluster::new());

    store.emit(StoreEvent::put("/apps/1", b"{broken".to_vec(), false));
    telemetry.push_outcome(Err(ControllerError::Telemetry("connection refused".into())));
    telemetry.push_outcome(Ok(QueryOutcome {
        samples: vec![lifecycle_sample("404", "ghost", "edge", "4")],
        warnings: vec!["partial".into()],
    }));
    let record = app(2, vec![digital_twin("t1", None, &["edge"])]);
    store.emit(StoreEvent::put("/apps/2", app_record(&record), false));

    let controller = Controller::with_components(
        ControllerConfig::default(),
        store.clone(),
        telemetry.clone(),
        cluster.clone(),
    );
    let cancel = CancellationToken::new();

    let run = controller.run(cancel.clone());
    let stop = async {
        wait_until(|| telemetry.queries().len() >= 3).await;
        cancel.cancel();
    };
    let (stats, ()) = tokio::join!(run, stop);
    let stats = stats.unwrap();

    // Broken record and unknown app both failed; the valid app was still created
    assert_eq!(stats.failed.load(std::sync::atomic::Ordering::Relaxed), 2);
    assert_eq!(cluster.names_of(ResourceKind::Workload), vec!["t1-edge".to_string()]);
}
