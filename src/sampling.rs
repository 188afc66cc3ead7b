//! Sample-count derivation
//!
//! The APB needs to know up front how many samples to stream. For a
//! trajectory scan that is the trajectory duration times the sample rate,
//! padded by an overhead factor and rounded to a quantum:
//!
//! ```text
//! duration_s = trajectory_points / lut_clock_hz
//! target     = round_to(duration_s * rate_khz * 1000 * overhead, quantum)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppResult, DaqError};
use crate::hardware::apb::AcquisitionDevice;
use crate::hardware::capabilities::TrajectorySource;

/// Parameters of the trajectory-based derivation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Rate at which the controller steps through LUT points.
    #[serde(default = "default_lut_clock_hz")]
    pub lut_clock_hz: f64,
    /// Padding applied to the nominal sample count.
    #[serde(default = "default_overhead_factor")]
    pub overhead_factor: f64,
    /// Result is rounded to the nearest multiple of this.
    #[serde(default = "default_rounding_quantum")]
    pub rounding_quantum: u64,
}

fn default_lut_clock_hz() -> f64 {
    16_000.0
}

fn default_overhead_factor() -> f64 {
    1.3
}

fn default_rounding_quantum() -> u64 {
    100
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            lut_clock_hz: default_lut_clock_hz(),
            overhead_factor: default_overhead_factor(),
            rounding_quantum: default_rounding_quantum(),
        }
    }
}

/// Compute the sample target for a trajectory of `points` LUT points.
pub fn derive_sample_target(points: u64, rate_khz: f64, params: &SamplingParams) -> AppResult<i64> {
    if params.lut_clock_hz <= 0.0 || params.rounding_quantum == 0 {
        return Err(DaqError::Configuration(format!(
            "invalid sampling parameters: lut_clock_hz={}, rounding_quantum={}",
            params.lut_clock_hz, params.rounding_quantum
        )));
    }
    if !rate_khz.is_finite() || rate_khz <= 0.0 {
        return Err(DaqError::Configuration(format!(
            "sample rate must be positive, got {} kHz",
            rate_khz
        )));
    }

    let duration = points as f64 / params.lut_clock_hz;
    let nominal = duration * rate_khz * 1000.0 * params.overhead_factor;
    let quantum = params.rounding_quantum as f64;
    let target = ((nominal / quantum).round() * quantum) as i64;
    debug!(points, rate_khz, nominal, target, "derived sample target");
    Ok(target)
}

/// Where a run's sample target comes from.
#[async_trait]
pub trait SampleCountSource: Send + Sync {
    /// Sample target for the next run on `device`.
    async fn sample_target(&self, device: &AcquisitionDevice) -> AppResult<i64>;
}

/// Always the same target.
#[derive(Debug, Clone, Copy)]
pub struct FixedSampleCount(pub i64);

#[async_trait]
impl SampleCountSource for FixedSampleCount {
    async fn sample_target(&self, _device: &AcquisitionDevice) -> AppResult<i64> {
        Ok(self.0)
    }
}

/// Target derived from the loaded trajectory and the device sample rate.
pub struct TrajectorySampleCount {
    trajectory: Arc<dyn TrajectorySource>,
    params: SamplingParams,
}

impl TrajectorySampleCount {
    /// Derive from `trajectory` with `params`.
    pub fn new(trajectory: Arc<dyn TrajectorySource>, params: SamplingParams) -> Self {
        Self { trajectory, params }
    }
}

#[async_trait]
impl SampleCountSource for TrajectorySampleCount {
    async fn sample_target(&self, device: &AcquisitionDevice) -> AppResult<i64> {
        let points = self.trajectory.trajectory_points().await?.ok_or_else(|| {
            DaqError::Configuration(format!(
                "device '{}': no trajectory metadata available",
                device.name()
            ))
        })?;
        let rate_khz = device.sample_rate_khz().await?;
        derive_sample_target(points, rate_khz, &self.params)
    }
}
