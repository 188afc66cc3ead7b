//! Remote file retrieval
//!
//! After a streaming run the box holds the samples in two fixed files. The
//! [`RemoteFileFetcher`] trait copies them to the per-run local paths.
//!
//! - [`ScpFetcher`] shells out to `scp` in batch mode (key-based login only)
//! - [`LocalMirrorFetcher`] copies from a local directory tree standing in
//!   for the hosts, used by the simulator and tests
//!
//! Failures are reported as [`TransferError`] and never retried here.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::{TransferError, TransferErrorKind};

/// Default location of the streamed samples on the box.
pub const DEFAULT_REMOTE_BIN: &str = "/home/Save/FAstream.bin";

/// Default location of the stream settings on the box.
pub const DEFAULT_REMOTE_TXT: &str = "/home/Save/FAstreamSettings.txt";

/// One run's worth of files to copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Device host.
    pub host: String,
    /// Login user.
    pub user: String,
    /// Samples file on the host.
    pub remote_bin: String,
    /// Settings file on the host.
    pub remote_txt: String,
    /// Local destination of the samples.
    pub local_bin: PathBuf,
    /// Local destination of the settings.
    pub local_txt: PathBuf,
}

impl FetchRequest {
    /// `(remote, local)` pairs in copy order.
    pub fn pairs(&self) -> [(&str, &Path); 2] {
        [
            (self.remote_bin.as_str(), self.local_bin.as_path()),
            (self.remote_txt.as_str(), self.local_txt.as_path()),
        ]
    }
}

/// Copies acquisition files from a device host.
///
/// # Contract
/// - Parent directories of both local paths exist when `fetch` returns `Ok`
/// - The samples file is copied before the settings file
/// - No retries; the first failure is returned
#[async_trait]
pub trait RemoteFileFetcher: Send + Sync {
    /// Copy both files of `request`.
    async fn fetch(&self, request: &FetchRequest) -> Result<(), TransferError>;
}

async fn ensure_parent(request: &FetchRequest, local: &Path) -> Result<(), TransferError> {
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            TransferError::new(
                request.host.clone(),
                local.display().to_string(),
                TransferErrorKind::Transfer,
                format!("cannot create local directory '{}': {}", parent.display(), e),
            )
        })?;
    }
    Ok(())
}

// =============================================================================
// scp
// =============================================================================

static UNREACHABLE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(could not resolve hostname|connection refused|connection timed out|no route to host|network is unreachable|name or service not known|connection closed by remote host)",
    )
    .expect("unreachable regex should compile")
});

static AUTH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(permission denied \(|authentication failed|too many authentication failures|host key verification failed)",
    )
    .expect("auth regex should compile")
});

/// Classify `scp` stderr into a failure category.
pub fn classify_scp_failure(stderr: &str) -> TransferErrorKind {
    if AUTH_PATTERN.is_match(stderr) {
        TransferErrorKind::Authentication
    } else if UNREACHABLE_PATTERN.is_match(stderr) {
        TransferErrorKind::Unreachable
    } else {
        TransferErrorKind::Transfer
    }
}

/// Fetcher that runs `scp -B`.
#[derive(Debug, Clone)]
pub struct ScpFetcher {
    program: String,
    connect_timeout: Duration,
}

impl Default for ScpFetcher {
    fn default() -> Self {
        Self::new("scp", Duration::from_secs(10))
    }
}

impl ScpFetcher {
    /// Fetcher running `program` with the given SSH connect timeout.
    pub fn new(program: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            connect_timeout,
        }
    }

    /// Fetcher using the configured program and connect timeout.
    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.program.clone(), config.connect_timeout)
    }

    /// Command line for one copy, without the program name.
    pub fn args(&self, user: &str, host: &str, remote: &str, local: &Path) -> Vec<String> {
        vec![
            "-B".to_string(),
            "-q".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            format!("{}@{}:{}", user, host, remote),
            local.display().to_string(),
        ]
    }

    async fn copy(&self, request: &FetchRequest, remote: &str, local: &Path) -> Result<(), TransferError> {
        info!(host = %request.host, remote, local = %local.display(), "fetching file");
        let output = Command::new(&self.program)
            .args(self.args(&request.user, &request.host, remote, local))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                TransferError::new(
                    request.host.clone(),
                    remote,
                    TransferErrorKind::Transfer,
                    format!("failed to run '{}': {}", self.program, e),
                )
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let kind = classify_scp_failure(&stderr);
        warn!(host = %request.host, remote, %kind, %stderr, "scp failed");
        let message = if stderr.is_empty() {
            format!("{} exited with {}", self.program, output.status)
        } else {
            stderr
        };
        Err(match kind {
            TransferErrorKind::Authentication => {
                TransferError::authentication(request.host.clone(), remote, message)
            }
            kind => TransferError::new(request.host.clone(), remote, kind, message),
        })
    }
}

#[async_trait]
impl RemoteFileFetcher for ScpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<(), TransferError> {
        for (remote, local) in request.pairs() {
            ensure_parent(request, local).await?;
            self.copy(request, remote, local).await?;
        }
        debug!(host = %request.host, "fetch complete");
        Ok(())
    }
}

// =============================================================================
// Local mirror
// =============================================================================

/// Fetcher that copies from `<root>/<host>/<remote path>`.
///
/// A missing `<root>/<host>` directory reports the host as unreachable.
#[derive(Debug, Clone)]
pub struct LocalMirrorFetcher {
    root: PathBuf,
}

impl LocalMirrorFetcher {
    /// Mirror rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Mirror root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory standing in for `host`.
    pub fn host_dir(&self, host: &str) -> PathBuf {
        self.root.join(host)
    }

    /// Local path of `remote` on `host`.
    pub fn remote_path(&self, host: &str, remote: &str) -> PathBuf {
        self.host_dir(host).join(remote.trim_start_matches('/'))
    }
}

#[async_trait]
impl RemoteFileFetcher for LocalMirrorFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<(), TransferError> {
        let host_dir = self.host_dir(&request.host);
        if !tokio::fs::try_exists(&host_dir).await.unwrap_or(false) {
            return Err(TransferError::unreachable(
                request.host.clone(),
                request.remote_bin.clone(),
                format!("no mirror directory '{}'", host_dir.display()),
            ));
        }

        for (remote, local) in request.pairs() {
            ensure_parent(request, local).await?;
            let source = self.remote_path(&request.host, remote);
            tokio::fs::copy(&source, local).await.map_err(|e| {
                TransferError::new(
                    request.host.clone(),
                    remote,
                    TransferErrorKind::Transfer,
                    format!("copy from '{}' failed: {}", source.display(), e),
                )
            })?;
            debug!(host = %request.host, remote, local = %local.display(), "mirrored file");
        }
        Ok(())
    }
}
