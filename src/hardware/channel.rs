//! Signal channel boundary
//!
//! A [`SignalChannel`] is one named scalar process variable on a device:
//! readable, writable, and observable. The control-system client that backs
//! a real channel lives outside this crate; [`crate::hardware::mock::MockChannel`]
//! is the in-memory implementation used by tests and the simulator.
//!
//! Updates are pushed over a `tokio::sync::broadcast` channel as
//! [`ChannelUpdate`] pairs carrying both the previous and the new value, so
//! subscribers can classify edges without racing a separate `read()`.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::AppResult;
use crate::hardware::edge::StatusEdge;

/// One change notification: the value before and after.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelUpdate {
    /// Value before the change.
    pub old: f64,
    /// Value after the change.
    pub new: f64,
}

impl ChannelUpdate {
    /// Edge represented by this update.
    pub fn edge(&self) -> StatusEdge {
        StatusEdge::classify(self.old, self.new)
    }
}

/// Live subscription to a channel. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ChannelSubscription {
    channel: String,
    rx: broadcast::Receiver<ChannelUpdate>,
}

impl ChannelSubscription {
    /// Wrap a broadcast receiver produced by a channel implementation.
    pub fn new(channel: impl Into<String>, rx: broadcast::Receiver<ChannelUpdate>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    /// Name of the subscribed channel.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next update, or `None` once the channel is gone.
    ///
    /// Cancel safe. Lagged receivers skip the missed updates with a warning;
    /// the `(old, new)` pairs that do arrive are still consistent.
    pub async fn next(&mut self) -> Option<ChannelUpdate> {
        loop {
            match self.rx.recv().await {
                Ok(update) => return Some(update),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "subscription lagged, updates dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Explicitly end the subscription.
    pub fn unsubscribe(self) {}
}

/// Named, addressable scalar value with change subscription.
///
/// # Contract
/// - `subscribe` registers synchronously: any write issued after it returns
///   is delivered to the subscription.
/// - Updates carry both values; implementations must not coalesce them.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Full channel name (device prefix + suffix).
    fn name(&self) -> &str;

    /// Current value.
    async fn read(&self) -> AppResult<f64>;

    /// Write a new value.
    async fn write(&self, value: f64) -> AppResult<()>;

    /// Subscribe to subsequent changes.
    fn subscribe(&self) -> ChannelSubscription;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn lagged_subscription_skips_to_latest() {
        let (tx, rx) = broadcast::channel(1);
        let mut sub = ChannelSubscription::new("PBA:FA:Streaming-I", rx);
        for value in [1.0, 0.0, 1.0] {
            tx.send(ChannelUpdate { old: 1.0 - value, new: value }).unwrap();
        }

        let update = sub.next().await.unwrap();
        assert_eq!(update.edge(), StatusEdge::Rising);
        assert!(logs_contain("subscription lagged"));

        drop(tx);
        assert!(sub.next().await.is_none());
    }
}
