//! Analog pizza box (APB) acquisition device
//!
//! Owns the set of [`SignalChannel`]s of one sampling subsystem and exposes
//! the operations a fly scan needs: arm, start/stop streaming, and
//! edge-triggered completion detection on the busy/idle channels.
//!
//! # Channel Map
//!
//! | Field | Suffix | Role |
//! |-------|--------|------|
//! | `acquire` | `FA:SoftTrig-SP` | software trigger (averaging mode) |
//! | `acquiring` | `FA:Busy-I` | busy flag, averaging mode |
//! | `stream` | `FA:Stream-SP` | start (1) / stop (0) streaming |
//! | `streaming` | `FA:Streaming-I` | busy flag, streaming mode |
//! | `stream_samples` | `FA:Stream:Samples-SP` | samples to stream |
//! | `acq_rate` | `FA:Rate-I` | sample rate, kHz |
//! | `divide` | `FA:Divide-SP` | clock divider |
//! | `trig_source` | `Machine:Clk-SP` | trigger source select |
//! | `means[n]` | `FA:Ch{n}:Mean-I` | averaged channel readings |
//!
//! # Singleton Policy
//!
//! The hardware can run only one acquisition at a time. A run claims the
//! device with [`AcquisitionDevice::claim`]; a second claim fails with
//! [`DaqError::AlreadyRunning`] until the first run releases it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::error::{AppResult, DaqError};
use crate::hardware::channel::SignalChannel;
use crate::hardware::edge::{EdgeLatch, StatusEdge};
use crate::status::CompletionStatus;

/// PV suffixes relative to the device prefix.
pub mod suffix {
    /// Software trigger.
    pub const ACQUIRE: &str = "FA:SoftTrig-SP";
    /// Averaging-mode busy flag.
    pub const ACQUIRING: &str = "FA:Busy-I";
    /// Streaming enable.
    pub const STREAM: &str = "FA:Stream-SP";
    /// Streaming busy flag.
    pub const STREAMING: &str = "FA:Streaming-I";
    /// Streaming sample count.
    pub const STREAM_SAMPLES: &str = "FA:Stream:Samples-SP";
    /// Sample rate readback (kHz).
    pub const ACQ_RATE: &str = "FA:Rate-I";
    /// Clock divider.
    pub const DIVIDE: &str = "FA:Divide-SP";
    /// Trigger source.
    pub const TRIG_SOURCE: &str = "Machine:Clk-SP";

    /// Averaged reading for channel `n` (1-based).
    pub fn channel_mean(n: usize) -> String {
        format!("FA:Ch{}:Mean-I", n)
    }
}

/// Number of analog inputs on one box.
pub const NUM_CHANNELS: usize = 8;

/// Trigger source value selecting the machine clock.
const MACHINE_CLOCK: f64 = 1.0;

/// The channel handles of one APB.
#[derive(Clone)]
pub struct ApbChannels {
    /// Software trigger.
    pub acquire: Arc<dyn SignalChannel>,
    /// Averaging-mode busy flag.
    pub acquiring: Arc<dyn SignalChannel>,
    /// Streaming enable.
    pub stream: Arc<dyn SignalChannel>,
    /// Streaming busy flag.
    pub streaming: Arc<dyn SignalChannel>,
    /// Streaming sample count.
    pub stream_samples: Arc<dyn SignalChannel>,
    /// Sample rate readback (kHz).
    pub acq_rate: Arc<dyn SignalChannel>,
    /// Clock divider.
    pub divide: Arc<dyn SignalChannel>,
    /// Trigger source.
    pub trig_source: Arc<dyn SignalChannel>,
    /// Averaged readings, channel 1 first.
    pub means: Vec<Arc<dyn SignalChannel>>,
}

/// Which edge a watcher waits for.
#[derive(Debug, Clone, Copy)]
enum WatchMode {
    /// First rising edge.
    Started,
    /// Falling edge after an observed rising edge.
    Finished,
}

/// One sampling subsystem.
pub struct AcquisitionDevice {
    name: String,
    host: String,
    channels: ApbChannels,
    claimed: AtomicBool,
}

impl std::fmt::Debug for AcquisitionDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionDevice")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("claimed", &self.is_claimed())
            .finish_non_exhaustive()
    }
}

impl AcquisitionDevice {
    /// Create a device handle.
    ///
    /// # Arguments
    /// * `name` - Device name, used as the record field name
    /// * `host` - Network host that stores the streamed files
    /// * `channels` - Connected channel handles
    pub fn new(name: impl Into<String>, host: impl Into<String>, channels: ApbChannels) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            channels,
            claimed: AtomicBool::new(false),
        }
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host that stores the streamed files.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Channel handles.
    pub fn channels(&self) -> &ApbChannels {
        &self.channels
    }

    /// Claim the device for one run.
    pub fn claim(&self) -> AppResult<()> {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| DaqError::AlreadyRunning {
                device: self.name.clone(),
            })
    }

    /// Release a previous claim. Releasing an unclaimed device is a no-op.
    pub fn release(&self) {
        if self.claimed.swap(false, Ordering::AcqRel) {
            debug!(device = %self.name, "device released");
        }
    }

    /// Whether a run currently holds the device.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Write the sample target and select the machine-clock trigger source.
    pub async fn arm(&self, sample_target: i64) -> AppResult<()> {
        if sample_target <= 0 {
            return Err(DaqError::Configuration(format!(
                "device '{}': sample target must be positive, got {}",
                self.name, sample_target
            )));
        }
        self.channels.stream_samples.write(sample_target as f64).await?;
        self.channels.trig_source.write(MACHINE_CLOCK).await?;
        info!(device = %self.name, sample_target, "armed");
        Ok(())
    }

    /// Whether the streaming busy flag currently reads busy.
    pub async fn is_streaming(&self) -> AppResult<bool> {
        let value = self.channels.streaming.read().await?;
        Ok(value.round() as i64 == 1)
    }

    /// Start streaming. Rejected while the device already reports busy.
    pub async fn start(&self) -> AppResult<()> {
        if self.is_streaming().await? {
            return Err(DaqError::AlreadyRunning {
                device: self.name.clone(),
            });
        }
        self.channels.stream.write(1.0).await?;
        debug!(device = %self.name, "stream requested");
        Ok(())
    }

    /// Stop streaming. Always safe.
    pub async fn stop(&self) -> AppResult<()> {
        self.channels.stream.write(0.0).await?;
        debug!(device = %self.name, "stream stop requested");
        Ok(())
    }

    /// Status that resolves when streaming finishes.
    ///
    /// Resolves on a falling edge of the streaming flag that follows an
    /// observed rising edge. Subscribe before calling [`start`](Self::start)
    /// or the rising edge is missed.
    pub fn watch_completion(&self) -> CompletionStatus {
        watch_edges(
            self.channels.streaming.clone(),
            format!("{}:streaming-finished", self.name),
            WatchMode::Finished,
        )
    }

    /// Status that resolves on the first rising edge of the streaming flag.
    pub fn watch_streaming_started(&self) -> CompletionStatus {
        watch_edges(
            self.channels.streaming.clone(),
            format!("{}:streaming-started", self.name),
            WatchMode::Started,
        )
    }

    /// Single averaged acquisition.
    ///
    /// Subscribes to the averaging busy flag, fires the software trigger and
    /// returns a status that resolves when the acquisition went busy and back
    /// to idle.
    pub async fn trigger(&self) -> AppResult<CompletionStatus> {
        let status = watch_edges(
            self.channels.acquiring.clone(),
            format!("{}:acquire", self.name),
            WatchMode::Finished,
        );
        self.channels.acquire.write(1.0).await?;
        Ok(status)
    }

    /// Current sample rate in kHz.
    pub async fn sample_rate_khz(&self) -> AppResult<f64> {
        self.channels.acq_rate.read().await
    }

    /// Averaged readings of every channel, channel 1 first.
    pub async fn read_means(&self) -> AppResult<Vec<f64>> {
        let mut values = Vec::with_capacity(self.channels.means.len());
        for channel in &self.channels.means {
            values.push(channel.read().await?);
        }
        Ok(values)
    }
}

fn watch_edges(channel: Arc<dyn SignalChannel>, label: String, mode: WatchMode) -> CompletionStatus {
    let mut subscription = channel.subscribe();
    let channel_name = subscription.channel().to_string();
    let (mut resolver, status) = CompletionStatus::pending(label);

    tokio::spawn(async move {
        let mut latch = EdgeLatch::new();
        loop {
            let update = tokio::select! {
                update = subscription.next() => update,
                _ = resolver.cancelled() => {
                    trace!(channel = %channel_name, "watcher cancelled");
                    return;
                }
            };
            let Some(update) = update else {
                let reason = format!("channel '{}' closed", channel_name);
                resolver.fail(reason);
                return;
            };

            let edge = update.edge();
            trace!(
                channel = %channel_name,
                old = update.old,
                new = update.new,
                ?edge,
                "status update"
            );
            let fired = match mode {
                WatchMode::Started => edge == StatusEdge::Rising,
                WatchMode::Finished => latch.observe(edge),
            };
            if fired {
                debug!(status = %resolver.label(), "edge detected");
                resolver.succeed();
                return;
            }
        }
    });

    status
}
