//! Shared fixtures for fly-scan integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use flyscan::decoder::ApbSettings;
use flyscan::detector::{DetectorSettings, StreamingDetector};
use flyscan::flyer::{FlyOrchestrator, FlyState};
use flyscan::hardware::apb::{AcquisitionDevice, NUM_CHANNELS};
use flyscan::hardware::mock::{write_stream_files, MockApb, MockPositioner, ResponderBehavior};
use flyscan::sampling::FixedSampleCount;
use flyscan::transfer::{LocalMirrorFetcher, DEFAULT_REMOTE_BIN, DEFAULT_REMOTE_TXT};
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// Sample target used by most scenarios.
pub const SAMPLES: i64 = 12_000;

/// Rows written to mirrored stream files.
pub const FILE_ROWS: usize = 500;

/// One simulated APB with its detector.
pub struct Station {
    pub apb: MockApb,
    pub device: Arc<AcquisitionDevice>,
    pub detector: Arc<StreamingDetector>,
    pub responder: Option<JoinHandle<()>>,
}

/// Temp data root, mirror and helpers.
pub struct Rig {
    pub dir: TempDir,
    pub mirror: LocalMirrorFetcher,
}

impl Rig {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mirror = LocalMirrorFetcher::new(dir.path().join("hosts"));
        Self { dir, mirror }
    }

    pub fn settings(&self) -> DetectorSettings {
        DetectorSettings::new(self.dir.path().join("root"))
    }

    /// Put a stream file pair on `host`.
    pub fn host_files(&self, host: &str, rows: usize) {
        write_stream_files(
            &self.mirror.remote_path(host, DEFAULT_REMOTE_BIN),
            &self.mirror.remote_path(host, DEFAULT_REMOTE_TXT),
            &ApbSettings::new(NUM_CHANNELS, 10.0),
            rows,
        )
        .unwrap();
    }

    /// Station on `host`, with a responder if `behavior` is given.
    pub fn station(&self, name: &str, host: &str, behavior: Option<ResponderBehavior>) -> Station {
        let apb = MockApb::new(&format!("XF:08IDB-CT{{{}}}:", name), 10.0);
        let device = Arc::new(apb.device(name, host));
        let detector = Arc::new(StreamingDetector::new(
            device.clone(),
            Arc::new(self.mirror.clone()),
            Arc::new(FixedSampleCount(SAMPLES)),
            self.settings(),
        ));
        let responder = behavior.map(|b| apb.spawn_responder(b));
        Station {
            apb,
            device,
            detector,
            responder,
        }
    }

    /// Detector sharing an existing device.
    pub fn detector_on(&self, device: Arc<AcquisitionDevice>) -> Arc<StreamingDetector> {
        Arc::new(StreamingDetector::new(
            device,
            Arc::new(self.mirror.clone()),
            Arc::new(FixedSampleCount(SAMPLES)),
            self.settings(),
        ))
    }
}

/// Box that goes busy immediately and stops when asked.
pub fn stops_on_request() -> ResponderBehavior {
    ResponderBehavior {
        idle_on_stop: true,
        ..Default::default()
    }
}

/// Box that finishes on its own after `after`.
pub fn stops_after(after: Duration) -> ResponderBehavior {
    ResponderBehavior {
        auto_stop_after: Some(after),
        idle_on_stop: true,
        ..Default::default()
    }
}

pub fn flyer(station: &Station, positioner: Arc<MockPositioner>) -> FlyOrchestrator {
    FlyOrchestrator::new(station.detector.clone(), positioner)
}

/// Poll until the orchestrator reaches `state` (or give up after ~10 s).
pub async fn wait_for_state(flyer: &FlyOrchestrator, state: FlyState) -> bool {
    for _ in 0..1000 {
        if flyer.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
