//! # flyscan
//!
//! Orchestration of time-synchronised "fly scans": a streaming analog
//! acquisition box (APB) samples continuously while a positioner runs a
//! trajectory, and the resulting waveform is retrieved as a file and exposed
//! as deferred, time-indexed records.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: Signal channels, edge detection, the APB device,
//!   positioner capabilities and mock hardware.
//! - **`status`**: `CompletionStatus`, a resolve-once future with
//!   conjunction and watchdog.
//! - **`ledger`**: Resource/Datum asset documents.
//! - **`sampling`**: Sample-count derivation from the loaded trajectory.
//! - **`detector`**: `StreamingDetector` and the `FlyerComponent` trait.
//! - **`flyer`**: The `FlyOrchestrator` state machine.
//! - **`plan`**: `run_fly_scan`, the whole scan in one call.
//! - **`transfer`**: Remote file retrieval (`scp` or a local mirror).
//! - **`decoder`**: Decoding of streamed `.bin`/`.txt` pairs.
//! - **`records`**: Collected records and deferred resolution.
//! - **`config`**: Figment-based configuration.
//! - **`telemetry`**: `tracing` subscriber setup.
//! - **`error`**: The `DaqError` enum and `AppResult` alias.

pub mod config;
pub mod decoder;
pub mod detector;
pub mod error;
pub mod flyer;
pub mod hardware;
pub mod ledger;
pub mod plan;
pub mod records;
pub mod sampling;
pub mod status;
pub mod telemetry;
pub mod transfer;

pub use error::{AppResult, DaqError};
pub use flyer::{FlyOrchestrator, FlyState};
pub use status::CompletionStatus;
