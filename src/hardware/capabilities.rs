//! Positioner capabilities
//!
//! The fly orchestrator only needs two things from the moving axis: start the
//! prepared trajectory and say when it has finished, and report how long the
//! loaded trajectory is so the acquisition can be sized to it. Each is its own
//! small trait, in the same spirit as the atomic `Movable`/`Triggerable`
//! capabilities: drivers implement what they support and tests mock each
//! capability independently.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Reports failures as [`DaqError`](crate::error::DaqError)
//! - Focuses on ONE thing

use async_trait::async_trait;

use crate::error::AppResult;
use crate::status::CompletionStatus;

/// Capability: continuous trajectory motion
///
/// # Contract
/// - `start_motion` returns as soon as motion has been released
/// - the returned status resolves when the trajectory is finished, or fails
///   if the controller reports a fault
/// - calling `start_motion` again before the previous status resolved is a
///   driver error
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Device name, used in logs and errors.
    fn name(&self) -> &str;

    /// Release the prepared trajectory.
    async fn start_motion(&self) -> AppResult<CompletionStatus>;

    /// Stop motion immediately.
    ///
    /// Default implementation does nothing (for axes that cannot be stopped
    /// mid-trajectory).
    async fn stop(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Capability: trajectory introspection
///
/// Exposes the size of the trajectory currently loaded in the controller's
/// lookup table, in LUT points.
#[async_trait]
pub trait TrajectorySource: Send + Sync {
    /// Number of points in the active trajectory, or `None` if no trajectory
    /// metadata is available.
    async fn trajectory_points(&self) -> AppResult<Option<u64>>;
}
