//! Fly-scan plan
//!
//! [`run_fly_scan`] drives one orchestrator through the whole scan and
//! gathers everything a consumer needs afterwards.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::error::AppResult;
use crate::flyer::FlyOrchestrator;
use crate::ledger::AssetDocument;
use crate::records::{CollectedRecord, DataKey};

/// Result of a successful fly scan.
#[derive(Debug, Clone)]
pub struct FlyScanOutput {
    /// Data keys per device.
    pub descriptors: BTreeMap<String, DataKey>,
    /// Unfilled records, auxiliaries first.
    pub records: Vec<CollectedRecord>,
    /// Resource and Datum documents, in emission order per device.
    pub asset_docs: Vec<AssetDocument>,
}

/// stage → kickoff → complete → collect → asset documents.
///
/// On failure every device is unstaged and the error returned; the
/// orchestrator stays in its failed state for inspection until `reset`.
pub async fn run_fly_scan(flyer: &FlyOrchestrator) -> AppResult<FlyScanOutput> {
    match scan(flyer).await {
        Ok(output) => Ok(output),
        Err(e) => {
            warn!(flyer = %flyer.name(), state = %flyer.state(), error = %e, "fly scan aborted");
            if let Err(unstage_err) = flyer.unstage().await {
                warn!(flyer = %flyer.name(), error = %unstage_err, "unstage after failure failed");
            }
            Err(e)
        }
    }
}

async fn scan(flyer: &FlyOrchestrator) -> AppResult<FlyScanOutput> {
    flyer.stage().await?;
    flyer.kickoff().await?.await?;
    flyer.complete().await?.await?;
    let descriptors = flyer.describe_collect();
    let records = flyer.collect().await?;
    let asset_docs = flyer.collect_asset_docs();
    info!(
        flyer = %flyer.name(),
        records = records.len(),
        documents = asset_docs.len(),
        "fly scan finished"
    );
    Ok(FlyScanOutput {
        descriptors,
        records,
        asset_docs,
    })
}
