//! FlyOrchestrator - state machine for one fly scan
//!
//! Coordinates a primary [`StreamingDetector`], a [`Positioner`] and any
//! number of auxiliary [`FlyerComponent`]s through one continuous-motion
//! scan.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ stage() ┌───────┐ kickoff() ┌───────────┐ complete() ┌────────────┐
//! │ Idle │────────▶│ Armed │──────────▶│ Streaming │───────────▶│ Completing │
//! └──────┘         └───────┘           └───────────┘            └─────┬──────┘
//!  ▲    ▲                                                             │ collect()
//!  │    │         reset()           ┌──────┐      ┌────────────┐      │
//!  │    └───────────────────────────│ Done │◀─────│ Retrieving │◀─────┘
//!  │                                └──────┘      └────────────┘
//!  │              reset()           ┌────────┐
//!  └────────────────────────────────│ Failed │◀── any unrecoverable error
//!                                   └────────┘
//! ```
//!
//! # Cross-device reactions
//!
//! Two reactions are registered while the scan runs and can be inspected
//! with [`FlyOrchestrator::reactions`]:
//!
//! 1. kickoff: rising edge of the primary's streaming flag → start motion,
//!    stage and kick off every auxiliary
//! 2. complete: motion finished → stop the primary, record its datum,
//!    complete every auxiliary
//!
//! `complete()` returns the conjunction of the primary's completion watcher
//! and the motion reaction, so it resolves once both happened, in either
//! order. A sample batch is therefore recorded exactly once.
//!
//! # Usage
//!
//! ```rust,ignore
//! let flyer = FlyOrchestrator::new(detector, positioner).with_watchdog(Duration::from_secs(300));
//! flyer.stage().await?;
//! flyer.kickoff().await?.await?;
//! flyer.complete().await?.await?;
//! let records = flyer.collect().await?;
//! let docs = flyer.collect_asset_docs();
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::detector::{FlyerComponent, StreamingDetector};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::Positioner;
use crate::ledger::AssetDocument;
use crate::records::{CollectedRecord, DataKey};
use crate::status::{CompletionStatus, StatusError};

/// Default watchdog for kickoff and complete statuses.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(300);

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlyState {
    /// Nothing staged
    Idle,
    /// Primary armed, waiting for kickoff
    Armed,
    /// Primary streaming, motion released on its rising edge
    Streaming,
    /// Waiting for streaming and motion to both finish
    Completing,
    /// Fetching files
    Retrieving,
    /// Records emitted
    Done,
    /// An unrecoverable error occurred; see [`FlyOrchestrator::failure`]
    Failed,
}

impl FlyState {
    /// `Done` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlyState::Done | FlyState::Failed)
    }
}

impl std::fmt::Display for FlyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlyState::Idle => write!(f, "idle"),
            FlyState::Armed => write!(f, "armed"),
            FlyState::Streaming => write!(f, "streaming"),
            FlyState::Completing => write!(f, "completing"),
            FlyState::Retrieving => write!(f, "retrieving"),
            FlyState::Done => write!(f, "done"),
            FlyState::Failed => write!(f, "failed"),
        }
    }
}

/// A cross-device trigger binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    /// Event that fires the reaction.
    pub trigger: String,
    /// What runs in response, in order.
    pub actions: Vec<String>,
}

#[derive(Debug)]
struct FlyerShared {
    state: FlyState,
    failure: Option<String>,
    reactions: Vec<Reaction>,
    finished: Option<CompletionStatus>,
    motion: Option<CompletionStatus>,
    joined: Option<CompletionStatus>,
}

impl FlyerShared {
    fn new() -> Self {
        Self {
            state: FlyState::Idle,
            failure: None,
            reactions: Vec::new(),
            finished: None,
            motion: None,
            joined: None,
        }
    }

    /// Move to `Failed` unless already terminal. Returns whether it moved.
    fn fail(&mut self, reason: String) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = FlyState::Failed;
        self.failure = Some(reason);
        true
    }
}

/// Fly-scan orchestrator
pub struct FlyOrchestrator {
    name: String,
    primary: Arc<StreamingDetector>,
    positioner: Arc<dyn Positioner>,
    auxiliaries: Vec<Arc<dyn FlyerComponent>>,
    watchdog: Duration,
    shared: Arc<Mutex<FlyerShared>>,
}

impl std::fmt::Debug for FlyOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlyOrchestrator")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("watchdog", &self.watchdog)
            .finish_non_exhaustive()
    }
}

fn status_failure(label: &str, err: DaqError) -> StatusError {
    StatusError::Failed {
        label: label.to_string(),
        reason: err.to_string(),
    }
}

impl FlyOrchestrator {
    /// Orchestrator for `primary` streaming while `positioner` moves.
    pub fn new(primary: Arc<StreamingDetector>, positioner: Arc<dyn Positioner>) -> Self {
        let name = format!("{}-{}-flyer", positioner.name(), primary.name());
        Self {
            name,
            primary,
            positioner,
            auxiliaries: Vec::new(),
            watchdog: DEFAULT_WATCHDOG,
            shared: Arc::new(Mutex::new(FlyerShared::new())),
        }
    }

    /// Add an auxiliary device, staged and kicked off on the primary's
    /// rising edge.
    pub fn with_auxiliary(mut self, auxiliary: Arc<dyn FlyerComponent>) -> Self {
        self.auxiliaries.push(auxiliary);
        self
    }

    /// Watchdog applied to kickoff and complete statuses.
    pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Orchestrator name (`<positioner>-<primary>-flyer`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary detector.
    pub fn primary(&self) -> &Arc<StreamingDetector> {
        &self.primary
    }

    /// Current state.
    pub fn state(&self) -> FlyState {
        self.shared.lock().state
    }

    /// Reason for the `Failed` state.
    pub fn failure(&self) -> Option<String> {
        self.shared.lock().failure.clone()
    }

    /// Reactions registered so far in this run.
    pub fn reactions(&self) -> Vec<Reaction> {
        self.shared.lock().reactions.clone()
    }

    fn require(&self, operation: &'static str, expected: FlyState) -> AppResult<()> {
        let state = self.state();
        if state != expected {
            return Err(DaqError::Precondition {
                operation,
                state: state.to_string(),
            });
        }
        Ok(())
    }

    fn transition(&self, to: FlyState) {
        let mut shared = self.shared.lock();
        debug!(flyer = %self.name, from = %shared.state, to = %to, "state transition");
        shared.state = to;
    }

    /// Record `err` and move to `Failed` unless it is recoverable.
    fn fail(&self, err: DaqError) -> DaqError {
        if err.can_recover() {
            warn!(flyer = %self.name, error = %err, "operation rejected");
        } else if self.shared.lock().fail(err.to_string()) {
            error!(flyer = %self.name, error = %err, "fly scan failed");
        }
        err
    }

    fn fail_on_error(&self, status: &CompletionStatus) {
        let shared = self.shared.clone();
        let name = self.name.clone();
        status.on_done(move |result| {
            if let Err(e) = result {
                if shared.lock().fail(e.to_string()) {
                    error!(flyer = %name, error = %e, "fly scan failed");
                }
            }
        });
    }

    /// Claim and arm the primary. `Idle → Armed`.
    #[instrument(skip(self), fields(flyer = %self.name))]
    pub async fn stage(&self) -> AppResult<()> {
        self.require("stage", FlyState::Idle)?;
        self.primary.stage().await.map_err(|e| self.fail(e))?;
        {
            let mut shared = self.shared.lock();
            shared.failure = None;
            shared.reactions.clear();
            shared.finished = None;
            shared.motion = None;
            shared.joined = None;
        }
        self.transition(FlyState::Armed);
        info!("staged");
        Ok(())
    }

    /// Start streaming; release motion on the rising edge. `Armed → Streaming`.
    ///
    /// The returned status resolves once the motion has been released and
    /// every auxiliary kicked off.
    #[instrument(skip(self), fields(flyer = %self.name))]
    pub async fn kickoff(&self) -> AppResult<CompletionStatus> {
        self.require("kickoff", FlyState::Armed)?;
        let watch = self.primary.start_stream().await.map_err(|e| self.fail(e))?;

        let trigger = watch.started.clone();
        let positioner = self.positioner.clone();
        let auxiliaries = self.auxiliaries.clone();
        let shared = self.shared.clone();
        let label = format!("{}:kickoff", self.name);
        let reaction_label = label.clone();

        let reaction = CompletionStatus::from_future(label, async move {
            trigger.wait().await?;
            let motion = positioner
                .start_motion()
                .await
                .map_err(|e| status_failure(&reaction_label, e))?;
            shared.lock().motion = Some(motion);
            info!(positioner = %positioner.name(), "motion released on streaming edge");

            for aux in &auxiliaries {
                aux.stage()
                    .await
                    .map_err(|e| status_failure(&reaction_label, e))?;
                let started = aux
                    .kickoff()
                    .await
                    .map_err(|e| status_failure(&reaction_label, e))?;
                let name = aux.name().to_string();
                started.on_done(move |result| match result {
                    Ok(()) => debug!(device = %name, "auxiliary acquiring"),
                    Err(e) => warn!(device = %name, error = %e, "auxiliary kickoff failed"),
                });
            }
            Ok(())
        })
        .with_watchdog(self.watchdog);

        let mut actions = vec![format!("start motion of {}", self.positioner.name())];
        actions.extend(
            self.auxiliaries
                .iter()
                .map(|aux| format!("stage and kickoff {}", aux.name())),
        );
        {
            let mut shared = self.shared.lock();
            shared.finished = Some(watch.finished);
            shared.reactions.push(Reaction {
                trigger: format!("{} streaming rising edge", self.primary.name()),
                actions,
            });
        }

        self.fail_on_error(&reaction);
        self.transition(FlyState::Streaming);
        Ok(reaction)
    }

    /// Join streaming completion and motion completion.
    /// `Streaming → Completing`.
    ///
    /// Requires a resolved kickoff. When motion finishes the primary is
    /// stopped, its datum recorded and every auxiliary completed.
    #[instrument(skip(self), fields(flyer = %self.name))]
    pub async fn complete(&self) -> AppResult<CompletionStatus> {
        self.require("complete", FlyState::Streaming)?;
        let (finished, motion) = {
            let shared = self.shared.lock();
            (shared.finished.clone(), shared.motion.clone())
        };
        let (Some(finished), Some(motion)) = (finished, motion) else {
            return Err(DaqError::Precondition {
                operation: "complete",
                state: "kickoff has not resolved".to_string(),
            });
        };

        let primary = self.primary.clone();
        let auxiliaries = self.auxiliaries.clone();
        let label = format!("{}:motion-done", self.name);
        let reaction_label = label.clone();
        let motion_leg = CompletionStatus::from_future(label, async move {
            motion.wait().await?;
            primary
                .finish_stream()
                .await
                .map_err(|e| status_failure(&reaction_label, e))?;

            let mut pending = Vec::with_capacity(auxiliaries.len());
            for aux in &auxiliaries {
                let status = aux
                    .complete()
                    .await
                    .map_err(|e| status_failure(&reaction_label, e))?;
                pending.push(async move { status.wait().await });
            }
            future::try_join_all(pending).await?;
            Ok(())
        });

        let joined = finished.and(&motion_leg).with_watchdog(self.watchdog);

        let mut actions = vec![
            format!("stop streaming on {}", self.primary.name()),
            format!("record datum for {}", self.primary.name()),
        ];
        actions.extend(
            self.auxiliaries
                .iter()
                .map(|aux| format!("complete {}", aux.name())),
        );
        {
            let mut shared = self.shared.lock();
            shared.joined = Some(joined.clone());
            shared.reactions.push(Reaction {
                trigger: format!("{} motion finished", self.positioner.name()),
                actions,
            });
        }

        self.fail_on_error(&joined);
        self.transition(FlyState::Completing);
        Ok(joined)
    }

    /// Retrieve files and emit one unfilled record per device and datum.
    /// `Completing → Retrieving → Done`.
    #[instrument(skip(self), fields(flyer = %self.name))]
    pub async fn collect(&self) -> AppResult<Vec<CollectedRecord>> {
        self.require("collect", FlyState::Completing)?;
        let joined = self.shared.lock().joined.clone();
        match joined.as_ref().and_then(CompletionStatus::result) {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(self.fail(e.into())),
            None => {
                return Err(DaqError::Precondition {
                    operation: "collect",
                    state: "completion is still pending".to_string(),
                })
            }
        }

        self.transition(FlyState::Retrieving);
        self.unstage().await.map_err(|e| self.fail(e))?;

        let mut records = Vec::new();
        for aux in &self.auxiliaries {
            records.extend(aux.collect().await.map_err(|e| self.fail(e))?);
        }
        records.extend(self.primary.collect().await.map_err(|e| self.fail(e))?);

        self.transition(FlyState::Done);
        info!(records = records.len(), "collected");
        Ok(records)
    }

    /// Drain asset documents of the primary, then of every auxiliary.
    pub fn collect_asset_docs(&self) -> Vec<AssetDocument> {
        let mut docs = self.primary.collect_asset_docs();
        for aux in &self.auxiliaries {
            docs.extend(aux.collect_asset_docs());
        }
        docs
    }

    /// Data keys of every device taking part.
    pub fn describe_collect(&self) -> BTreeMap<String, DataKey> {
        let mut keys = self.primary.describe_collect();
        for aux in &self.auxiliaries {
            keys.extend(aux.describe_collect());
        }
        keys
    }

    /// Unstage every auxiliary, then the primary. Does not change state.
    ///
    /// Every device is unstaged even if an earlier one fails; the first
    /// error is returned.
    pub async fn unstage(&self) -> AppResult<()> {
        let mut first_error = None;
        for aux in &self.auxiliaries {
            if let Err(e) = aux.unstage().await {
                warn!(device = %aux.name(), error = %e, "unstage failed");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.primary.unstage().await {
            first_error.get_or_insert(e);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Unstage everything, drop undrained asset documents and return to
    /// `Idle` from `Done` or `Failed`.
    #[instrument(skip(self), fields(flyer = %self.name))]
    pub async fn reset(&self) -> AppResult<()> {
        let state = self.state();
        if !state.is_terminal() {
            return Err(DaqError::Precondition {
                operation: "reset",
                state: state.to_string(),
            });
        }
        if let Err(e) = self.unstage().await {
            warn!(error = %e, "unstage during reset failed");
        }
        self.primary.ledger().clear();
        *self.shared.lock() = FlyerShared::new();
        info!("reset to idle");
        Ok(())
    }
}
