//! Hardware boundary
//!
//! Signal channels, edge detection, the APB acquisition device, positioner
//! capabilities and the mock implementations used by tests and the simulator.

pub mod apb;
pub mod capabilities;
pub mod channel;
pub mod edge;
pub mod mock;

pub use apb::{AcquisitionDevice, ApbChannels};
pub use capabilities::{Positioner, TrajectorySource};
pub use channel::{ChannelSubscription, ChannelUpdate, SignalChannel};
pub use edge::{EdgeLatch, StatusEdge};
