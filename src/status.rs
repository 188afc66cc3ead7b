//! Completion statuses
//!
//! A [`CompletionStatus`] is a clonable handle on an operation that finishes
//! exactly once, either successfully or with a [`StatusError`]. Hardware
//! watchers, positioners and the fly orchestrator all hand these out so the
//! caller can suspend on them instead of polling.
//!
//! Internally a status is a `futures::future::Shared` future. Pending
//! statuses are fed by a `tokio::sync::oneshot` channel owned by a
//! [`StatusResolver`]; consuming the resolver is the only way to resolve,
//! which makes "resolves exactly once" a property of the types.
//!
//! ```rust,ignore
//! let (resolver, status) = CompletionStatus::pending("apb:streaming");
//! tokio::spawn(async move {
//!     // ... wait for hardware ...
//!     resolver.succeed();
//! });
//! let both = status.and(&motion_status).with_watchdog(Duration::from_secs(300));
//! both.await?;
//! ```

use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome of a completion status.
pub type StatusResult = Result<(), StatusError>;

/// Failure reason carried by a resolved status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    /// The operation reported a failure.
    #[error("{label} failed: {reason}")]
    Failed {
        /// Status label.
        label: String,
        /// Failure reason.
        reason: String,
    },
    /// A watchdog expired before the operation finished.
    #[error("{label} timed out after {after:?}")]
    TimedOut {
        /// Status label.
        label: String,
        /// Watchdog duration.
        after: Duration,
    },
    /// The resolver was dropped without resolving.
    #[error("{label} was abandoned before it resolved")]
    Abandoned {
        /// Status label.
        label: String,
    },
}

type SharedStatus = Shared<BoxFuture<'static, StatusResult>>;

/// Future-like handle that resolves exactly once.
#[derive(Clone)]
pub struct CompletionStatus {
    label: Arc<str>,
    inner: SharedStatus,
}

impl std::fmt::Debug for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionStatus")
            .field("label", &self.label)
            .field("result", &self.inner.peek())
            .finish()
    }
}

impl CompletionStatus {
    /// Create an unresolved status and the resolver that completes it.
    pub fn pending(label: impl Into<String>) -> (StatusResolver, Self) {
        let label: Arc<str> = Arc::from(label.into());
        let (tx, rx) = oneshot::channel();
        let abandoned = label.to_string();
        let fut = async move {
            rx.await
                .unwrap_or_else(|_| Err(StatusError::Abandoned { label: abandoned }))
        };
        let resolver = StatusResolver {
            label: label.clone(),
            tx,
        };
        (resolver, Self::from_parts(label, fut.boxed()))
    }

    /// Wrap an arbitrary future as a status.
    pub fn from_future<F>(label: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = StatusResult> + Send + 'static,
    {
        Self::from_parts(Arc::from(label.into()), fut.boxed())
    }

    /// An already successful status.
    pub fn done(label: impl Into<String>) -> Self {
        Self::from_future(label, future::ready(Ok(())))
    }

    /// An already failed status.
    pub fn failed(label: impl Into<String>, reason: impl Into<String>) -> Self {
        let label = label.into();
        let err = StatusError::Failed {
            label: label.clone(),
            reason: reason.into(),
        };
        Self::from_future(label, future::ready(Err(err)))
    }

    fn from_parts(label: Arc<str>, fut: BoxFuture<'static, StatusResult>) -> Self {
        Self {
            label,
            inner: fut.shared(),
        }
    }

    /// Status label used in logs and error messages.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The outcome, if the status has resolved.
    ///
    /// Polls the underlying future once, so a status whose resolver already
    /// fired reports as done even if nobody has awaited it yet. Must be
    /// called from within a Tokio runtime when the status carries a watchdog.
    pub fn result(&self) -> Option<StatusResult> {
        if let Some(result) = self.inner.peek() {
            return Some(result.clone());
        }
        self.inner.clone().now_or_never()
    }

    /// Whether the status has resolved, successfully or not.
    pub fn is_done(&self) -> bool {
        self.result().is_some()
    }

    /// Whether the status has resolved successfully.
    pub fn succeeded(&self) -> bool {
        matches!(self.result(), Some(Ok(())))
    }

    /// Wait for the status to resolve.
    pub async fn wait(&self) -> StatusResult {
        self.inner.clone().await
    }

    /// Conjunction of two statuses.
    ///
    /// Succeeds once both have succeeded, in either order. Fails as soon as
    /// either fails.
    pub fn and(&self, other: &CompletionStatus) -> CompletionStatus {
        let label = format!("{} & {}", self.label, other.label);
        let left = self.inner.clone();
        let right = other.inner.clone();
        Self::from_future(label, async move {
            future::try_join(left, right).await.map(|_| ())
        })
    }

    /// Fail with [`StatusError::TimedOut`] if not resolved within `after`.
    pub fn with_watchdog(&self, after: Duration) -> CompletionStatus {
        let label = self.label.to_string();
        let inner = self.inner.clone();
        let timed_out = label.clone();
        Self::from_future(label, async move {
            match tokio::time::timeout(after, inner).await {
                Ok(result) => result,
                Err(_) => Err(StatusError::TimedOut {
                    label: timed_out,
                    after,
                }),
            }
        })
    }

    /// Run `callback` on a Tokio task once the status resolves.
    pub fn on_done<F>(&self, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(StatusResult) + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = inner.await;
            callback(result);
        })
    }
}

impl IntoFuture for CompletionStatus {
    type Output = StatusResult;
    type IntoFuture = SharedStatus;

    fn into_future(self) -> Self::IntoFuture {
        self.inner
    }
}

/// Write side of a pending [`CompletionStatus`].
pub struct StatusResolver {
    label: Arc<str>,
    tx: oneshot::Sender<StatusResult>,
}

impl std::fmt::Debug for StatusResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusResolver")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl StatusResolver {
    /// Label of the status this resolver completes.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Resolve successfully.
    pub fn succeed(self) {
        self.resolve(Ok(()));
    }

    /// Resolve with a failure reason.
    pub fn fail(self, reason: impl Into<String>) {
        let err = StatusError::Failed {
            label: self.label.to_string(),
            reason: reason.into(),
        };
        self.resolve(Err(err));
    }

    /// Resolve with an explicit outcome.
    pub fn resolve(self, result: StatusResult) {
        let StatusResolver { label, tx } = self;
        if tx.send(result).is_err() {
            debug!(status = %label, "status resolved after every handle was dropped");
        }
    }

    /// Completes once every handle on the status has been dropped.
    ///
    /// Watchers select on this to unsubscribe when nobody is waiting anymore.
    pub async fn cancelled(&mut self) {
        self.tx.closed().await;
    }
}
