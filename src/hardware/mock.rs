//! Mock Hardware Implementations
//!
//! Provides simulated hardware for testing without a beamline.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep),
//! so tests can run them under a paused Tokio clock.
//!
//! # Available Mocks
//!
//! - `MockChannel` - In-memory signal channel with write history
//! - `MockApb` - Full APB channel set plus an optional hardware responder task
//! - `MockPositioner` - Trajectory axis, timed or manually finished
//! - `write_stream_files` - Synthetic `.bin`/`.txt` pair in the APB layout

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BufMut;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info};

use crate::decoder::{ApbSettings, FRACTION_SCALE};
use crate::error::{AppResult, DaqError};
use crate::hardware::apb::{suffix, AcquisitionDevice, ApbChannels, NUM_CHANNELS};
use crate::hardware::capabilities::{Positioner, TrajectorySource};
use crate::hardware::channel::{ChannelSubscription, ChannelUpdate, SignalChannel};
use crate::status::{CompletionStatus, StatusResolver};

// =============================================================================
// MockChannel - In-memory signal channel
// =============================================================================

struct MockChannelInner {
    name: String,
    value: RwLock<f64>,
    writes: Mutex<Vec<f64>>,
    updates: broadcast::Sender<ChannelUpdate>,
}

/// In-memory signal channel.
///
/// Clones share the same value and subscribers. Every `write` (and every
/// hardware-side [`post`](Self::post)) broadcasts an `(old, new)` update,
/// even when the value is unchanged.
#[derive(Clone)]
pub struct MockChannel {
    inner: Arc<MockChannelInner>,
}

impl MockChannel {
    /// Create a channel with an initial value.
    pub fn new(name: impl Into<String>, initial: f64) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(MockChannelInner {
                name: name.into(),
                value: RwLock::new(initial),
                writes: Mutex::new(Vec::new()),
                updates,
            }),
        }
    }

    /// Current value without going through the async trait.
    pub fn value(&self) -> f64 {
        *self.inner.value.read()
    }

    /// Values written through [`SignalChannel::write`], oldest first.
    pub fn writes(&self) -> Vec<f64> {
        self.inner.writes.lock().clone()
    }

    /// Hardware-side value change (not recorded as a client write).
    pub fn post(&self, value: f64) {
        let old = std::mem::replace(&mut *self.inner.value.write(), value);
        self.broadcast(ChannelUpdate { old, new: value });
    }

    /// Deliver a raw notification, e.g. a duplicated or reordered one.
    ///
    /// The stored value becomes `update.new`.
    pub fn inject(&self, update: ChannelUpdate) {
        *self.inner.value.write() = update.new;
        self.broadcast(update);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.updates.receiver_count()
    }

    fn broadcast(&self, update: ChannelUpdate) {
        // No receivers is fine: nobody is watching this channel right now.
        let _ = self.inner.updates.send(update);
    }
}

#[async_trait]
impl SignalChannel for MockChannel {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn read(&self) -> AppResult<f64> {
        Ok(self.value())
    }

    async fn write(&self, value: f64) -> AppResult<()> {
        self.inner.writes.lock().push(value);
        self.post(value);
        Ok(())
    }

    fn subscribe(&self) -> ChannelSubscription {
        ChannelSubscription::new(self.inner.name.clone(), self.inner.updates.subscribe())
    }
}

// =============================================================================
// MockApb - Simulated analog pizza box
// =============================================================================

/// How the simulated box reacts to stream requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponderBehavior {
    /// Delay between `stream = 1` and the streaming flag going busy.
    pub start_latency: Duration,
    /// Stop on its own this long after streaming started.
    pub auto_stop_after: Option<Duration>,
    /// Go idle when the client writes `stream = 0`.
    pub idle_on_stop: bool,
    /// Duration of one averaged acquisition.
    pub average_duration: Duration,
}

/// Simulated APB: typed mock channels plus the [`ApbChannels`] view.
#[derive(Clone)]
pub struct MockApb {
    /// Software trigger.
    pub acquire: MockChannel,
    /// Averaging-mode busy flag.
    pub acquiring: MockChannel,
    /// Streaming enable.
    pub stream: MockChannel,
    /// Streaming busy flag.
    pub streaming: MockChannel,
    /// Streaming sample count.
    pub stream_samples: MockChannel,
    /// Sample rate readback (kHz).
    pub acq_rate: MockChannel,
    /// Clock divider.
    pub divide: MockChannel,
    /// Trigger source.
    pub trig_source: MockChannel,
    /// Averaged readings.
    pub means: Vec<MockChannel>,
}

impl MockApb {
    /// Create an idle box whose channels are named `prefix + suffix`.
    ///
    /// # Arguments
    /// * `prefix` - PV prefix, e.g. `XF:08IDB-CT{PBA:1}:`
    /// * `rate_khz` - Value reported by the rate readback
    pub fn new(prefix: &str, rate_khz: f64) -> Self {
        let pv = |s: &str| format!("{}{}", prefix, s);
        Self {
            acquire: MockChannel::new(pv(suffix::ACQUIRE), 0.0),
            acquiring: MockChannel::new(pv(suffix::ACQUIRING), 0.0),
            stream: MockChannel::new(pv(suffix::STREAM), 0.0),
            streaming: MockChannel::new(pv(suffix::STREAMING), 0.0),
            stream_samples: MockChannel::new(pv(suffix::STREAM_SAMPLES), 0.0),
            acq_rate: MockChannel::new(pv(suffix::ACQ_RATE), rate_khz),
            divide: MockChannel::new(pv(suffix::DIVIDE), 1.0),
            trig_source: MockChannel::new(pv(suffix::TRIG_SOURCE), 0.0),
            means: (1..=NUM_CHANNELS)
                .map(|n| MockChannel::new(pv(&suffix::channel_mean(n)), 0.0))
                .collect(),
        }
    }

    /// Trait-object view for [`AcquisitionDevice`].
    pub fn channels(&self) -> ApbChannels {
        fn dynamic(channel: &MockChannel) -> Arc<dyn SignalChannel> {
            Arc::new(channel.clone())
        }
        ApbChannels {
            acquire: dynamic(&self.acquire),
            acquiring: dynamic(&self.acquiring),
            stream: dynamic(&self.stream),
            streaming: dynamic(&self.streaming),
            stream_samples: dynamic(&self.stream_samples),
            acq_rate: dynamic(&self.acq_rate),
            divide: dynamic(&self.divide),
            trig_source: dynamic(&self.trig_source),
            means: self.means.iter().map(dynamic).collect(),
        }
    }

    /// Build a device handle on these channels.
    pub fn device(&self, name: &str, host: &str) -> AcquisitionDevice {
        AcquisitionDevice::new(name, host, self.channels())
    }

    /// Spawn a task that plays the firmware side of the box.
    ///
    /// The task runs until the returned handle is aborted or the channels
    /// are dropped.
    pub fn spawn_responder(&self, behavior: ResponderBehavior) -> JoinHandle<()> {
        let apb = self.clone();
        let mut stream_requests = self.stream.subscribe();
        let mut triggers = self.acquire.subscribe();

        tokio::spawn(async move {
            let mut auto_stop: Option<JoinHandle<()>> = None;
            loop {
                tokio::select! {
                    update = stream_requests.next() => {
                        let Some(update) = update else { break };
                        if update.new.round() as i64 == 1 {
                            sleep(behavior.start_latency).await;
                            apb.streaming.post(1.0);
                            info!(channel = %apb.streaming.inner.name, "mock apb streaming");
                            if let Some(after) = behavior.auto_stop_after {
                                let streaming = apb.streaming.clone();
                                auto_stop = Some(tokio::spawn(async move {
                                    sleep(after).await;
                                    streaming.post(0.0);
                                }));
                            }
                        } else if behavior.idle_on_stop && apb.streaming.value().round() as i64 == 1 {
                            if let Some(task) = auto_stop.take() {
                                task.abort();
                            }
                            apb.streaming.post(0.0);
                        }
                    }
                    update = triggers.next() => {
                        let Some(update) = update else { break };
                        if update.new.round() as i64 == 1 {
                            apb.acquiring.post(1.0);
                            sleep(behavior.average_duration).await;
                            apb.acquiring.post(0.0);
                            apb.acquire.post(0.0);
                        }
                    }
                }
            }
            debug!("mock apb responder stopped");
        })
    }
}

// =============================================================================
// MockPositioner - Simulated trajectory axis
// =============================================================================

enum MotionMode {
    Timed(Duration),
    Manual,
}

/// Mock trajectory axis
///
/// Simulates a monochromator-style axis with:
/// - timed motion (resolves after a fixed duration) or manual motion
///   (resolved by the test through [`finish_motion`](Self::finish_motion))
/// - a configurable trajectory size for sample-count derivation
pub struct MockPositioner {
    name: String,
    mode: MotionMode,
    trajectory_points: Option<u64>,
    starts: AtomicUsize,
    started_at: Mutex<Option<Instant>>,
    pending: Mutex<Option<StatusResolver>>,
}

impl MockPositioner {
    /// Axis whose motion takes `duration`.
    pub fn timed(name: impl Into<String>, duration: Duration) -> Self {
        Self::with_mode(name.into(), MotionMode::Timed(duration))
    }

    /// Axis whose motion only finishes when the test says so.
    pub fn manual(name: impl Into<String>) -> Self {
        Self::with_mode(name.into(), MotionMode::Manual)
    }

    fn with_mode(name: String, mode: MotionMode) -> Self {
        Self {
            name,
            mode,
            trajectory_points: None,
            starts: AtomicUsize::new(0),
            started_at: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    /// Report a loaded trajectory of `points` LUT points.
    pub fn with_trajectory(mut self, points: u64) -> Self {
        self.trajectory_points = Some(points);
        self
    }

    /// How many times motion was started.
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// When the last motion started.
    pub fn started_at(&self) -> Option<Instant> {
        *self.started_at.lock()
    }

    /// Finish a manual motion successfully. Returns `false` if none is pending.
    pub fn finish_motion(&self) -> bool {
        match self.pending.lock().take() {
            Some(resolver) => {
                resolver.succeed();
                true
            }
            None => false,
        }
    }

    /// Fail a manual motion. Returns `false` if none is pending.
    pub fn fail_motion(&self, reason: &str) -> bool {
        match self.pending.lock().take() {
            Some(resolver) => {
                resolver.fail(reason);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Positioner for MockPositioner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start_motion(&self) -> AppResult<CompletionStatus> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.started_at.lock() = Some(Instant::now());
        let (resolver, status) = CompletionStatus::pending(format!("{}:motion", self.name));

        match self.mode {
            MotionMode::Timed(duration) => {
                let name = self.name.clone();
                tokio::spawn(async move {
                    // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
                    sleep(duration).await;
                    debug!(positioner = %name, "trajectory finished");
                    resolver.succeed();
                });
            }
            MotionMode::Manual => {
                let mut pending = self.pending.lock();
                if pending.is_some() {
                    return Err(DaqError::Instrument(format!(
                        "positioner '{}' is already moving",
                        self.name
                    )));
                }
                *pending = Some(resolver);
            }
        }
        info!(positioner = %self.name, "trajectory started");
        Ok(status)
    }
}

#[async_trait]
impl TrajectorySource for MockPositioner {
    async fn trajectory_points(&self) -> AppResult<Option<u64>> {
        Ok(self.trajectory_points)
    }
}

// =============================================================================
// Synthetic stream files
// =============================================================================

/// First channel value of row 0 in synthetic files.
pub const SYNTHETIC_I0_ROW0: i32 = -2_512_861;

/// Epoch seconds of the first synthetic sample.
pub const SYNTHETIC_START_SECONDS: i32 = 1_600_000_000;

/// Encode `rows` synthetic samples in the APB binary layout.
///
/// Channel `c` of row `r` holds `SYNTHETIC_I0_ROW0 + 1000 * c + r`; the
/// timestamp advances one millisecond per row.
pub fn synthetic_stream_bytes(settings: &ApbSettings, rows: usize) -> Vec<u8> {
    let ticks_per_ms = (1e-3 / FRACTION_SCALE).round() as i64;
    let mut buf = Vec::with_capacity(rows * settings.row_width() * 4);
    for row in 0..rows {
        for channel in 0..settings.num_channels {
            buf.put_i32_le(SYNTHETIC_I0_ROW0 + 1000 * channel as i32 + row as i32);
        }
        let millis = row as i64 % 1000;
        buf.put_i32_le(SYNTHETIC_START_SECONDS + (row / 1000) as i32);
        buf.put_i32_le((millis * ticks_per_ms) as i32);
    }
    buf
}

/// Write a synthetic `.bin` and matching `.txt` settings file.
pub fn write_stream_files(
    bin_path: &Path,
    txt_path: &Path,
    settings: &ApbSettings,
    rows: usize,
) -> AppResult<()> {
    if let Some(parent) = bin_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Some(parent) = txt_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(bin_path, synthetic_stream_bytes(settings, rows))?;
    std::fs::write(txt_path, settings.to_text())?;
    Ok(())
}
