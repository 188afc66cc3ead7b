//! Integration tests for the fly-scan orchestrator
//!
//! Scenarios run on mock APBs and mock positioners under a paused Tokio
//! clock, so the timings below are exact.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use flyscan::error::{DaqError, TransferErrorKind};
use flyscan::flyer::{FlyOrchestrator, FlyState};
use flyscan::hardware::mock::MockPositioner;
use flyscan::ledger::AssetDocument;
use flyscan::plan::run_fly_scan;
use flyscan::records::{CachingResolver, FileResolver, RecordResolver};
use flyscan::status::StatusError;
use tokio::time::Instant;

const HOST: &str = "10.8.0.19";

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_end_to_end_joins_at_later_signal() {
    let rig = Rig::new();
    rig.host_files(HOST, FILE_ROWS);
    let station = rig.station("apb_stream", HOST, Some(stops_after(Duration::from_secs(5))));
    let positioner = Arc::new(MockPositioner::timed("hhm", Duration::from_millis(5200)));
    let flyer = flyer(&station, positioner.clone());

    flyer.stage().await.unwrap();
    assert_eq!(flyer.state(), FlyState::Armed);
    assert_eq!(station.apb.stream_samples.writes(), vec![12_000.0]);
    assert_eq!(station.apb.trig_source.writes(), vec![1.0]);

    let t0 = Instant::now();
    flyer.kickoff().await.unwrap().await.unwrap();
    assert_eq!(flyer.state(), FlyState::Streaming);
    assert_eq!(positioner.start_count(), 1);

    let joined = flyer.complete().await.unwrap();
    assert_eq!(flyer.state(), FlyState::Completing);
    joined.await.unwrap();

    let elapsed = t0.elapsed();
    assert!(
        elapsed >= Duration::from_millis(5200) && elapsed < Duration::from_millis(5300),
        "Expected ~5200ms, got {}ms",
        elapsed.as_millis()
    );
    // Motion reaction stopped the stream once.
    assert_eq!(station.apb.stream.writes()[..2], [1.0, 0.0]);

    let records = flyer.collect().await.unwrap();
    assert_eq!(flyer.state(), FlyState::Done);
    assert_eq!(records.len(), 1);

    let run = station.detector.run().unwrap();
    let record = &records[0];
    assert_eq!(record.data["apb_stream"], format!("{}/0", run.resource_uid));
    assert!(!record.filled["apb_stream"]);
    assert!(run.local_bin.exists());
    assert!(run.local_txt.exists());
    assert!(!station.device.is_claimed());

    let docs = flyer.collect_asset_docs();
    assert_eq!(docs.len(), 2);
    match &docs[0] {
        AssetDocument::Resource(resource) => {
            assert_eq!(resource.spec, "APB");
            assert_eq!(resource.uid, run.resource_uid);
            assert_eq!(resource.resource_path, run.local_bin.display().to_string());
        }
        other => panic!("expected resource first, got {:?}", other),
    }
    assert!(matches!(&docs[1], AssetDocument::Datum(d) if d.resource == run.resource_uid));
}

#[tokio::test(start_paused = true)]
async fn test_motion_first_stops_stream_then_joins() {
    let rig = Rig::new();
    rig.host_files(HOST, FILE_ROWS);
    let station = rig.station("apb_stream", HOST, Some(stops_on_request()));
    let positioner = Arc::new(MockPositioner::timed("hhm", Duration::from_secs(3)));
    let flyer = flyer(&station, positioner);

    flyer.stage().await.unwrap();
    let t0 = Instant::now();
    flyer.kickoff().await.unwrap().await.unwrap();
    flyer.complete().await.unwrap().await.unwrap();

    let elapsed = t0.elapsed();
    assert!(
        elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3100),
        "Expected ~3000ms, got {}ms",
        elapsed.as_millis()
    );
    assert_eq!(station.apb.streaming.value(), 0.0);
    assert_eq!(flyer.collect().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_complete_still_joins_once() {
    let rig = Rig::new();
    rig.host_files(HOST, FILE_ROWS);
    let station = rig.station("apb_stream", HOST, Some(stops_after(Duration::from_secs(1))));
    let positioner = Arc::new(MockPositioner::timed("hhm", Duration::from_secs(2)));
    let flyer = flyer(&station, positioner);

    flyer.stage().await.unwrap();
    flyer.kickoff().await.unwrap().await.unwrap();
    // Both signals arrive before complete() is called.
    tokio::time::sleep(Duration::from_secs(4)).await;

    flyer.complete().await.unwrap().await.unwrap();
    let records = flyer.collect().await.unwrap();
    assert_eq!(records.len(), 1);
    let run = station.detector.run().unwrap();
    assert_eq!(run.datum_ids, vec![format!("{}/0", run.resource_uid)]);
}

#[tokio::test(start_paused = true)]
async fn test_reactions_are_inspectable() {
    let rig = Rig::new();
    rig.host_files(HOST, FILE_ROWS);
    rig.host_files("10.8.0.20", FILE_ROWS);
    let primary = rig.station("apb_stream", HOST, Some(stops_on_request()));
    let aux = rig.station("apb_aux", "10.8.0.20", Some(stops_on_request()));
    let positioner = Arc::new(MockPositioner::timed("hhm", Duration::from_secs(2)));
    let flyer = flyer(&primary, positioner).with_auxiliary(aux.detector.clone());

    assert!(flyer.reactions().is_empty());
    flyer.stage().await.unwrap();
    flyer.kickoff().await.unwrap().await.unwrap();
    assert!(aux.device.is_claimed(), "auxiliary staged on the rising edge");

    flyer.complete().await.unwrap().await.unwrap();
    let reactions = flyer.reactions();
    assert_eq!(reactions.len(), 2);
    assert_eq!(reactions[0].trigger, "apb_stream streaming rising edge");
    assert_eq!(
        reactions[0].actions,
        vec!["start motion of hhm".to_string(), "stage and kickoff apb_aux".to_string()]
    );
    assert_eq!(reactions[1].trigger, "hhm motion finished");
    assert!(reactions[1].actions.contains(&"complete apb_aux".to_string()));

    let keys = flyer.describe_collect();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys["apb_aux"].external, "FILESTORE:");
    assert_eq!(keys["apb_stream"].shape, vec![-1, -1]);

    let records = flyer.collect().await.unwrap();
    let fields: Vec<_> = records
        .iter()
        .flat_map(|r| r.data.keys().cloned())
        .collect();
    assert_eq!(fields, vec!["apb_aux".to_string(), "apb_stream".to_string()]);
    assert_eq!(flyer.collect_asset_docs().len(), 4);
    assert!(!aux.device.is_claimed());
}

#[tokio::test(start_paused = true)]
async fn test_plan_and_deferred_resolution() {
    let rig = Rig::new();
    rig.host_files(HOST, FILE_ROWS);
    let station = rig.station("apb_stream", HOST, Some(stops_on_request()));
    let positioner = Arc::new(MockPositioner::timed("hhm", Duration::from_secs(1)));
    let flyer = flyer(&station, positioner);

    let output = run_fly_scan(&flyer).await.unwrap();
    assert_eq!(output.records.len(), 1);
    assert_eq!(output.asset_docs.len(), 2);
    assert!(output.descriptors.contains_key("apb_stream"));

    let resolver = CachingResolver::new(FileResolver::from_documents(&output.asset_docs));
    let reference = &output.records[0].refs()[0];
    let first = resolver.resolve(&reference.datum_id).await.unwrap();
    assert_eq!(first.table.shape(), (FILE_ROWS, 9));
    let second = resolver.resolve(&reference.datum_id).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(resolver.cached(), 1);
}

// =============================================================================
// Preconditions and singleton
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_collect_before_join_is_rejected() {
    let rig = Rig::new();
    rig.host_files(HOST, FILE_ROWS);
    let station = rig.station("apb_stream", HOST, Some(stops_on_request()));
    let positioner = Arc::new(MockPositioner::manual("hhm"));
    let flyer = flyer(&station, positioner.clone());

    // Out of order from Idle.
    let err = flyer.collect().await.unwrap_err();
    assert!(matches!(err, DaqError::Precondition { operation: "collect", .. }));
    assert_eq!(flyer.state(), FlyState::Idle);

    flyer.stage().await.unwrap();
    flyer.kickoff().await.unwrap().await.unwrap();
    let joined = flyer.complete().await.unwrap();

    let err = flyer.collect().await.unwrap_err();
    assert!(matches!(err, DaqError::Precondition { .. }));
    assert_eq!(flyer.state(), FlyState::Completing);
    assert!(!joined.is_done());

    assert!(positioner.finish_motion());
    joined.await.unwrap();
    assert_eq!(flyer.collect().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_complete_requires_resolved_kickoff() {
    let rig = Rig::new();
    // No responder: the streaming flag never rises.
    let station = rig.station("apb_stream", HOST, None);
    let positioner = Arc::new(MockPositioner::manual("hhm"));
    let flyer = flyer(&station, positioner.clone());

    flyer.stage().await.unwrap();
    let kickoff = flyer.kickoff().await.unwrap();
    assert!(!kickoff.is_done());

    let err = flyer.complete().await.unwrap_err();
    assert!(matches!(err, DaqError::Precondition { operation: "complete", .. }));
    assert_eq!(flyer.state(), FlyState::Streaming);
    assert_eq!(positioner.start_count(), 0, "motion waits for the rising edge");
}

#[tokio::test(start_paused = true)]
async fn test_double_stage_across_orchestrators() {
    let rig = Rig::new();
    let station = rig.station("apb_stream", HOST, Some(stops_on_request()));
    let first = flyer(&station, Arc::new(MockPositioner::manual("hhm")));
    let second = FlyOrchestrator::new(
        rig.detector_on(station.device.clone()),
        Arc::new(MockPositioner::manual("hhm2")),
    );

    first.stage().await.unwrap();
    let err = second.stage().await.unwrap_err();
    assert!(matches!(&err, DaqError::AlreadyRunning { device } if device == "apb_stream"));
    assert!(err.to_string().contains("apb_stream"));
    assert_eq!(second.state(), FlyState::Idle);
    assert_eq!(first.state(), FlyState::Armed);

    first.unstage().await.unwrap();
    second.stage().await.unwrap();
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_watchdog_expiry_fails_orchestrator() {
    let rig = Rig::new();
    let station = rig.station("apb_stream", HOST, Some(stops_on_request()));
    let positioner = Arc::new(MockPositioner::manual("hhm"));
    let flyer = flyer(&station, positioner).with_watchdog(Duration::from_secs(30));

    flyer.stage().await.unwrap();
    flyer.kickoff().await.unwrap().await.unwrap();
    let t0 = Instant::now();
    let err = flyer.complete().await.unwrap().await.unwrap_err();

    assert!(matches!(err, StatusError::TimedOut { after, .. } if after == Duration::from_secs(30)));
    assert!(t0.elapsed() >= Duration::from_secs(30));
    assert!(wait_for_state(&flyer, FlyState::Failed).await);
    assert!(flyer.failure().unwrap().contains("timed out"));

    // Collect is refused from Failed.
    assert!(matches!(
        flyer.collect().await.unwrap_err(),
        DaqError::Precondition { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_motion_fault_fails_orchestrator() {
    let rig = Rig::new();
    let station = rig.station("apb_stream", HOST, Some(stops_on_request()));
    let positioner = Arc::new(MockPositioner::manual("hhm"));
    let flyer = flyer(&station, positioner.clone());

    flyer.stage().await.unwrap();
    flyer.kickoff().await.unwrap().await.unwrap();
    let joined = flyer.complete().await.unwrap();
    assert!(positioner.fail_motion("following error"));

    let err = joined.await.unwrap_err();
    assert!(err.to_string().contains("following error"));
    assert!(wait_for_state(&flyer, FlyState::Failed).await);
    assert!(flyer.failure().unwrap().contains("following error"));
}

#[tokio::test(start_paused = true)]
async fn test_transfer_failure_then_reset() {
    let rig = Rig::new();
    // No files on the host: the mirror reports it unreachable.
    let station = rig.station("apb_stream", HOST, Some(stops_on_request()));
    let positioner = Arc::new(MockPositioner::timed("hhm", Duration::from_secs(1)));
    let flyer = flyer(&station, positioner);

    flyer.stage().await.unwrap();
    flyer.kickoff().await.unwrap().await.unwrap();
    flyer.complete().await.unwrap().await.unwrap();

    let err = flyer.collect().await.unwrap_err();
    match &err {
        DaqError::Transfer(transfer) => {
            assert_eq!(transfer.kind, TransferErrorKind::Unreachable);
            assert_eq!(transfer.host, HOST);
            assert!(!transfer.is_retryable());
        }
        other => panic!("expected transfer error, got {:?}", other),
    }
    assert_eq!(flyer.state(), FlyState::Failed);
    assert!(flyer.failure().unwrap().contains(HOST));

    assert!(matches!(
        flyer.stage().await.unwrap_err(),
        DaqError::Precondition { .. }
    ));
    flyer.reset().await.unwrap();
    assert_eq!(flyer.state(), FlyState::Idle);
    assert!(flyer.failure().is_none());
    assert!(!station.device.is_claimed());

    rig.host_files(HOST, FILE_ROWS);
    let output = run_fly_scan(&flyer).await.unwrap();
    assert_eq!(output.records.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_run_documents_do_not_leak_into_next_run() {
    let rig = Rig::new();
    let station = rig.station("apb_stream", HOST, Some(stops_on_request()));
    let positioner = Arc::new(MockPositioner::timed("hhm", Duration::from_secs(1)));
    let flyer = flyer(&station, positioner);

    // Nothing on the host: the first run fails at retrieval.
    run_fly_scan(&flyer).await.unwrap_err();
    let failed_resource = station.detector.run().unwrap().resource_uid;
    flyer.reset().await.unwrap();
    assert!(flyer.collect_asset_docs().is_empty());

    rig.host_files(HOST, FILE_ROWS);
    let output = run_fly_scan(&flyer).await.unwrap();
    let current = station.detector.run().unwrap().resource_uid;
    assert_ne!(current, failed_resource);

    assert_eq!(output.asset_docs.len(), 2);
    assert!(output
        .asset_docs
        .iter()
        .all(|doc| doc.resource_uid() == current));
    assert_eq!(station.detector.ledger().resource_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_plan_unstages_on_failure() {
    let rig = Rig::new();
    let station = rig.station("apb_stream", HOST, Some(stops_on_request()));
    let positioner = Arc::new(MockPositioner::timed("hhm", Duration::from_secs(1)));
    let flyer = flyer(&station, positioner);

    let err = run_fly_scan(&flyer).await.unwrap_err();
    assert!(matches!(err, DaqError::Transfer(_)));
    assert_eq!(flyer.state(), FlyState::Failed);
    assert!(!station.device.is_claimed());
}
