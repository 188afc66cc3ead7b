//! Streaming detector
//!
//! [`StreamingDetector`] wraps one [`AcquisitionDevice`] with everything a
//! streaming run needs: the asset ledger, the remote fetcher and the sample
//! count source. It owns the [`AcquisitionRun`] created by `stage`.
//!
//! Every device taking part in a fly scan implements [`FlyerComponent`].
//! The orchestrator drives the primary detector directly and every auxiliary
//! through this trait, so an auxiliary may be another APB.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::FlyscanConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::apb::AcquisitionDevice;
use crate::ledger::{self, AssetDocument, AssetLedger};
use crate::records::{now_secs, CollectedRecord, DataKey};
use crate::sampling::SampleCountSource;
use crate::status::CompletionStatus;
use crate::transfer::{FetchRequest, RemoteFileFetcher, DEFAULT_REMOTE_BIN, DEFAULT_REMOTE_TXT};

/// Device that can take part in a fly scan.
///
/// # Contract
/// - `stage` / `unstage` bracket one run; `unstage` is safe to call twice
/// - `kickoff` resolves once the device is acquiring
/// - `complete` closes the current slice of data; the returned status
///   resolves when the device has finished
/// - `collect` yields one unfilled record per datum and may be called after
///   `unstage`
#[async_trait]
pub trait FlyerComponent: Send + Sync {
    /// Device name, used as the record field.
    fn name(&self) -> &str;

    /// Prepare a run.
    async fn stage(&self) -> AppResult<()>;

    /// Start acquiring.
    async fn kickoff(&self) -> AppResult<CompletionStatus>;

    /// Finish acquiring.
    async fn complete(&self) -> AppResult<CompletionStatus>;

    /// Retrieve the run's data and return unfilled records.
    async fn collect(&self) -> AppResult<Vec<CollectedRecord>>;

    /// Drain queued asset documents.
    fn collect_asset_docs(&self) -> Vec<AssetDocument>;

    /// End the run and release the device.
    async fn unstage(&self) -> AppResult<()>;

    /// Data keys of the records `collect` yields.
    fn describe_collect(&self) -> BTreeMap<String, DataKey>;
}

/// Local storage and transfer settings of a detector.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Local data root.
    pub root: PathBuf,
    /// Login user on the device host.
    pub user: String,
    /// Samples file on the device host.
    pub remote_bin: String,
    /// Settings file on the device host.
    pub remote_txt: String,
}

impl DetectorSettings {
    /// Default transfer settings under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            user: "root".to_string(),
            remote_bin: DEFAULT_REMOTE_BIN.to_string(),
            remote_txt: DEFAULT_REMOTE_TXT.to_string(),
        }
    }

    /// Settings from loaded configuration.
    pub fn from_config(config: &FlyscanConfig) -> Self {
        Self {
            root: config.acquisition.root_path.clone(),
            user: config.transfer.user.clone(),
            remote_bin: config.transfer.remote_bin_path.clone(),
            remote_txt: config.transfer.remote_txt_path.clone(),
        }
    }
}

/// Local `.bin` / `.txt` paths of a run started at `when`.
///
/// `<root>/data/apb/YYYY/MM/DD/<file_uid>.bin` and `.txt`.
pub fn run_paths(root: &Path, when: DateTime<Local>, file_uid: &str) -> (PathBuf, PathBuf) {
    let base = root
        .join("data")
        .join("apb")
        .join(format!("{:04}", when.year()))
        .join(format!("{:02}", when.month()))
        .join(format!("{:02}", when.day()))
        .join(file_uid);
    (base.with_extension("bin"), base.with_extension("txt"))
}

/// State of one stage → unstage bracket.
#[derive(Debug, Clone)]
pub struct AcquisitionRun {
    /// Samples requested from the device.
    pub sample_target: i64,
    /// Resource opened for this run.
    pub resource_uid: String,
    /// Local samples file.
    pub local_bin: PathBuf,
    /// Local settings file.
    pub local_txt: PathBuf,
    /// Datums recorded so far.
    pub datum_ids: Vec<String>,
    /// `false` once unstaged.
    pub staged: bool,
    finished: Option<CompletionStatus>,
}

/// APB streaming detector.
pub struct StreamingDetector {
    device: Arc<AcquisitionDevice>,
    ledger: AssetLedger,
    fetcher: Arc<dyn RemoteFileFetcher>,
    samples: Arc<dyn SampleCountSource>,
    settings: DetectorSettings,
    run: Mutex<Option<AcquisitionRun>>,
}

impl std::fmt::Debug for StreamingDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingDetector")
            .field("device", &self.device)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Watchers returned by [`StreamingDetector::start_stream`].
#[derive(Debug, Clone)]
pub struct StreamWatch {
    /// Resolves on the rising edge of the streaming flag.
    pub started: CompletionStatus,
    /// Resolves on the falling edge that follows it.
    pub finished: CompletionStatus,
}

impl StreamingDetector {
    /// Create a detector.
    pub fn new(
        device: Arc<AcquisitionDevice>,
        fetcher: Arc<dyn RemoteFileFetcher>,
        samples: Arc<dyn SampleCountSource>,
        settings: DetectorSettings,
    ) -> Self {
        Self {
            device,
            ledger: AssetLedger::new(),
            fetcher,
            samples,
            settings,
            run: Mutex::new(None),
        }
    }

    /// Underlying device.
    pub fn device(&self) -> &Arc<AcquisitionDevice> {
        &self.device
    }

    /// Asset ledger of this detector.
    pub fn ledger(&self) -> &AssetLedger {
        &self.ledger
    }

    /// Snapshot of the current or last run.
    pub fn run(&self) -> Option<AcquisitionRun> {
        self.run.lock().clone()
    }

    /// Start streaming with both edge watchers registered first.
    pub async fn start_stream(&self) -> AppResult<StreamWatch> {
        self.require_staged("kickoff")?;
        let watch = StreamWatch {
            started: self.device.watch_streaming_started(),
            finished: self.device.watch_completion(),
        };
        self.device.start().await?;
        if let Some(run) = self.run.lock().as_mut() {
            run.finished = Some(watch.finished.clone());
        }
        Ok(watch)
    }

    /// Stop streaming and record the run's datum.
    pub async fn finish_stream(&self) -> AppResult<String> {
        let resource_uid = self.require_staged("complete")?.resource_uid;
        self.device.stop().await?;
        let datum_id = self.ledger.record_datum(&resource_uid)?;
        if let Some(run) = self.run.lock().as_mut() {
            run.datum_ids.push(datum_id.clone());
        }
        info!(device = %self.device.name(), datum = %datum_id, "stream finished");
        Ok(datum_id)
    }

    fn require_staged(&self, operation: &'static str) -> AppResult<AcquisitionRun> {
        match self.run.lock().as_ref() {
            Some(run) if run.staged => Ok(run.clone()),
            Some(_) => Err(DaqError::Precondition {
                operation,
                state: format!("device '{}' is unstaged", self.device.name()),
            }),
            None => Err(DaqError::Precondition {
                operation,
                state: format!("device '{}' is not staged", self.device.name()),
            }),
        }
    }

    fn fetch_request(&self, run: &AcquisitionRun) -> FetchRequest {
        FetchRequest {
            host: self.device.host().to_string(),
            user: self.settings.user.clone(),
            remote_bin: self.settings.remote_bin.clone(),
            remote_txt: self.settings.remote_txt.clone(),
            local_bin: run.local_bin.clone(),
            local_txt: run.local_txt.clone(),
        }
    }

    async fn prepare(&self) -> AppResult<AcquisitionRun> {
        let sample_target = self.samples.sample_target(&self.device).await?;
        if sample_target <= 0 {
            return Err(DaqError::Configuration(format!(
                "device '{}': derived sample target {} is not positive",
                self.device.name(),
                sample_target
            )));
        }

        let (local_bin, local_txt) =
            run_paths(&self.settings.root, Local::now(), &ledger::new_uid());
        let resource_uid = self.ledger.open_resource(
            ledger::APB_SPEC,
            &self.settings.root.display().to_string(),
            &local_bin.display().to_string(),
        );
        self.device.arm(sample_target).await?;

        Ok(AcquisitionRun {
            sample_target,
            resource_uid,
            local_bin,
            local_txt,
            datum_ids: Vec::new(),
            staged: true,
            finished: None,
        })
    }
}

#[async_trait]
impl FlyerComponent for StreamingDetector {
    fn name(&self) -> &str {
        self.device.name()
    }

    async fn stage(&self) -> AppResult<()> {
        self.device.claim()?;
        let stale = self.ledger.clear();
        if stale > 0 {
            warn!(device = %self.device.name(), stale, "discarded documents of an unfinished run");
        }
        match self.prepare().await {
            Ok(run) => {
                info!(
                    device = %self.device.name(),
                    sample_target = run.sample_target,
                    path = %run.local_bin.display(),
                    "staged"
                );
                *self.run.lock() = Some(run);
                Ok(())
            }
            Err(e) => {
                self.device.release();
                Err(e)
            }
        }
    }

    async fn kickoff(&self) -> AppResult<CompletionStatus> {
        Ok(self.start_stream().await?.started)
    }

    async fn complete(&self) -> AppResult<CompletionStatus> {
        self.finish_stream().await?;
        let finished = self.run.lock().as_ref().and_then(|r| r.finished.clone());
        Ok(finished.unwrap_or_else(|| {
            CompletionStatus::done(format!("{}:complete", self.device.name()))
        }))
    }

    async fn collect(&self) -> AppResult<Vec<CollectedRecord>> {
        let run = self.run().ok_or_else(|| DaqError::Precondition {
            operation: "collect",
            state: format!("device '{}' has no run", self.device.name()),
        })?;

        let request = self.fetch_request(&run);
        info!(
            device = %self.device.name(),
            host = %request.host,
            local = %request.local_bin.display(),
            "retrieving stream files"
        );
        self.fetcher.fetch(&request).await?;

        let now = now_secs();
        Ok(run
            .datum_ids
            .iter()
            .map(|datum_id| CollectedRecord::reference(self.device.name(), datum_id, now))
            .collect())
    }

    fn collect_asset_docs(&self) -> Vec<AssetDocument> {
        self.ledger.drain_documents()
    }

    async fn unstage(&self) -> AppResult<()> {
        let was_staged = {
            let mut run = self.run.lock();
            match run.as_mut() {
                Some(run) if run.staged => {
                    run.staged = false;
                    true
                }
                _ => false,
            }
        };
        if !was_staged {
            debug!(device = %self.device.name(), "unstage: nothing staged");
            return Ok(());
        }

        let stopped = self.device.stop().await;
        self.device.release();
        if let Err(e) = &stopped {
            warn!(device = %self.device.name(), error = %e, "stop during unstage failed");
        }
        stopped
    }

    fn describe_collect(&self) -> BTreeMap<String, DataKey> {
        self.run
            .lock()
            .as_ref()
            .map(|run| {
                BTreeMap::from([(
                    self.device.name().to_string(),
                    DataKey::apb(
                        run.local_bin.display().to_string(),
                        run.local_txt.display().to_string(),
                    ),
                )])
            })
            .unwrap_or_default()
    }
}
