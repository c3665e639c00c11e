//! Remote execution channels.
//!
//! A channel is one authenticated connection to a build host. It runs shell
//! commands and moves files. The pool owns channels as `Box<dyn RemoteChannel>`
//! and opens them through a [`Connector`].

pub mod output;
pub mod ssh;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::HostSpec;

pub use output::BoundedLog;
pub use ssh::{ControlDir, SshConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Upload => write!(f, "upload"),
            TransferDirection::Download => write!(f, "download"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("connection to {host} dropped: {reason}")]
    Disconnected { host: String, reason: String },

    #[error("{operation} timed out after {}s", .timeout.as_secs_f64())]
    Timeout { operation: String, timeout: Duration },

    #[error("{direction} between {} and {remote} failed: {reason}", .local.display())]
    Transfer {
        direction: TransferDirection,
        local: PathBuf,
        remote: String,
        exit_code: Option<i32>,
        reason: String,
    },

    #[error("preparing {host} failed: {reason}")]
    Prepare { host: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("local transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a command that ran to completion on the remote host.
///
/// A nonzero exit code is still `Ok`; the caller classifies it.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: BoundedLog,
    pub stderr: BoundedLog,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, for pattern matching.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.as_string();
        text.push_str(&self.stderr.as_string());
        text
    }
}

#[async_trait]
pub trait RemoteChannel: Send {
    fn host(&self) -> &HostSpec;

    /// Run a shell command. Cancelling the token kills the transport and
    /// returns [`ChannelError::Cancelled`].
    async fn run(
        &mut self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ChannelError>;

    async fn transfer(
        &mut self,
        local: &Path,
        remote: &str,
        direction: TransferDirection,
        timeout: Duration,
    ) -> Result<(), ChannelError>;

    /// Cheap no-op used for health checks.
    async fn probe(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        let output = self
            .run("echo ok", timeout, &CancellationToken::new())
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(ChannelError::Disconnected {
                host: self.host().name.clone(),
                reason: format!("health probe exited with status {}", output.exit_code),
            })
        }
    }

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &HostSpec,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteChannel>, ChannelError>;
}
