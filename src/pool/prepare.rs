//! One-time host preparation, run on the first channel opened to a host.

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelError, RemoteChannel};
use crate::config::HostPrepare;
use crate::matrix::Os;

/// Preparation progress of one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareState {
    /// The host has no prepare section
    NotRequired,
    Pending,
    Running,
    Ready,
    /// A prepare command exited nonzero; the host takes no more leases
    Failed,
}

impl PrepareState {
    pub(crate) fn initial(prepare: Option<&HostPrepare>) -> Self {
        match prepare {
            Some(_) => PrepareState::Pending,
            None => PrepareState::NotRequired,
        }
    }

    /// Whether a lease may be handed out on the host.
    pub(crate) fn admits_leases(self) -> bool {
        !matches!(self, PrepareState::Running | PrepareState::Failed)
    }
}

/// Run the prepare commands unless the marker says an earlier run already did.
///
/// Transport errors are returned unchanged so the host can be tried again;
/// a command that exits nonzero becomes [`ChannelError::Prepare`].
pub async fn prepare_host(
    channel: &mut dyn RemoteChannel,
    prepare: &HostPrepare,
    default_timeout: Duration,
) -> Result<(), ChannelError> {
    let host = channel.host().name.clone();
    let os = channel.host().os;
    let timeout = prepare.timeout().unwrap_or(default_timeout);
    let cancel = CancellationToken::new();

    if let Some(marker) = &prepare.marker {
        let check = channel.run(&marker_check(os, marker), timeout, &cancel).await?;
        if check.success() {
            tracing::info!(host = %host, marker = %marker, "Host already prepared");
            return Ok(());
        }
    }

    tracing::info!(host = %host, commands = prepare.commands.len(), "Preparing host");
    for command in &prepare.commands {
        let output = channel.run(command, timeout, &cancel).await?;
        if !output.success() {
            let stderr = output.stderr.as_string();
            return Err(ChannelError::Prepare {
                host,
                reason: format!(
                    "`{}` exited with status {}: {}",
                    command,
                    output.exit_code,
                    stderr.trim()
                ),
            });
        }
    }

    if let Some(marker) = &prepare.marker {
        let output = channel.run(&marker_touch(os, marker), timeout, &cancel).await?;
        if !output.success() {
            // The host is usable; the next run just prepares it again
            tracing::warn!(host = %host, marker = %marker, "Could not write prepare marker");
        }
    }
    tracing::info!(host = %host, "Host prepared");
    Ok(())
}

pub fn marker_check(os: Os, marker: &str) -> String {
    match os {
        Os::Windows => format!("if exist \"{}\" (exit 0) else (exit 1)", marker),
        _ => format!("test -e '{}'", marker),
    }
}

pub fn marker_touch(os: Os, marker: &str) -> String {
    match os {
        Os::Windows => format!("type nul > \"{}\"", marker),
        _ => format!("mkdir -p \"$(dirname '{0}')\" && touch '{0}'", marker),
    }
}
