//! Whole-pipeline test: simulated acquisition → polling driver → reduction
//! operator → catalog write-back, all in-process over bounded channels.

use std::sync::Arc;
use std::time::Duration;

use saxs_stream::catalog::mock::MockCatalog;
use saxs_stream::catalog::RunCatalog;
use saxs_stream::channel::{bounded, MessageSource};
use saxs_stream::driver::polling::{PollerOptions, PollingDriver};
use saxs_stream::messages::{DerivedEvent, LifecycleEvent};
use saxs_stream::publisher::{CatalogWriteBack, ONE_D_KEY};
use saxs_stream::recovery::RetryPolicy;
use saxs_stream::reduce::operator::ReductionOperator;
use saxs_stream::reduce::registry::ReducerRegistry;
use saxs_stream::shutdown;
use saxs_stream::sim::{AcquisitionSim, SimOptions};

#[tokio::test]
async fn test_sim_to_writeback_pipeline() {
    let catalog = MockCatalog::new();
    let (handle, signal) = shutdown::channel();

    // Driver: polls the mock catalog, emits into the operator's channel.
    let (event_tx, event_rx) = bounded::<LifecycleEvent>(64);
    let driver = PollingDriver::new(
        Arc::new(catalog.clone()) as Arc<dyn RunCatalog>,
        vec!["primary".to_string(), "data".to_string(), "image".to_string()],
        PollerOptions {
            poll_interval: Duration::from_millis(10),
            ..PollerOptions::default()
        },
        event_tx,
        signal.clone(),
    );

    // Operator: radial profile, publishing to a capture channel and the
    // catalog write-back.
    let registry = ReducerRegistry::new();
    let reducer = registry
        .create("radial_profile", &toml::Value::Table(toml::map::Map::new()))
        .expect("built-in reducer");
    let (derived_tx, mut derived_rx) = bounded::<DerivedEvent>(64);
    let writeback = CatalogWriteBack::new(Arc::new(catalog.clone()));
    let operator = ReductionOperator::new(
        event_rx,
        reducer,
        vec![Box::new(derived_tx), Box::new(writeback)],
        RetryPolicy::default(),
        signal.clone(),
    );

    let driver_task = tokio::spawn(driver.run());
    let operator_task = tokio::spawn(operator.run());

    // One short simulated run.
    let sim = AcquisitionSim::new(
        catalog.clone(),
        SimOptions {
            runs: 1,
            frames_per_run: 5,
            frame_interval: Duration::from_millis(5),
            run_pause: Duration::from_millis(5),
            width: 16,
            height: 16,
        },
    );
    sim.run(signal.clone()).await.expect("sim failed");

    // Collect the derived stream for the complete run.
    let mut derived = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), derived_rx.recv())
            .await
            .expect("timed out waiting for derived events")
            .expect("channel error")
            .expect("stream ended early");
        let stop = matches!(event, DerivedEvent::Stop(_));
        derived.push(event);
        if stop {
            break;
        }
    }

    assert_eq!(derived.len(), 7, "Start + 5 curves + Stop: {derived:?}");
    assert!(matches!(&derived[0], DerivedEvent::Start(_)));
    let run_id = match &derived[0] {
        DerivedEvent::Start(start) => start.run_id.clone(),
        _ => unreachable!(),
    };
    for (offset, event) in derived[1..6].iter().enumerate() {
        match event {
            DerivedEvent::OneDReduction(curve) => {
                assert_eq!(curve.frame_number, offset as u64);
                assert_eq!(curve.q.len(), curve.intensity.len());
                assert!(!curve.q.is_empty());
            }
            other => panic!("expected curve, got {other:?}"),
        }
    }
    match &derived[6] {
        DerivedEvent::Stop(stop) => {
            assert_eq!(stop.num_frames, 5);
            assert!(!stop.aborted);
        }
        _ => unreachable!(),
    }

    // The write-back mirrored one curve row per frame into the catalog.
    assert_eq!(catalog.result_rows(&run_id, ONE_D_KEY).len(), 5);

    handle.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(2), driver_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), operator_task).await;
}
