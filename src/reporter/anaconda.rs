use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{PackageChannel, PublishError};
use crate::config::Secret;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const MAX_ERROR_LINES: usize = 5;

/// Uploads packages with the `anaconda` command-line client.
///
/// The token goes to the client through `ANACONDA_API_TOKEN`, never on its
/// command line.
#[derive(Debug, Clone)]
pub struct AnacondaClient {
    program: PathBuf,
    token: Secret,
    timeout: Duration,
}

impl AnacondaClient {
    pub fn new(token: Secret) -> Self {
        Self {
            program: PathBuf::from("anaconda"),
            token,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

#[async_trait]
impl PackageChannel for AnacondaClient {
    async fn upload_packages(&self, channel: &str, files: &[PathBuf]) -> Result<(), PublishError> {
        let mut command = Command::new(&self.program);
        command
            .arg("upload")
            .arg("--user")
            .arg(channel)
            .arg("--force")
            .args(files)
            .env("ANACONDA_API_TOKEN", self.token.expose())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(channel, files = files.len(), "Running anaconda upload");
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| PublishError::Transport {
                operation: "upload packages".to_string(),
                reason: format!("timed out after {}s", self.timeout.as_secs()),
            })?
            .map_err(|e| PublishError::Command {
                program: self.program_name(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
        let tail = lines[lines.len().saturating_sub(MAX_ERROR_LINES)..].join("\n");
        Err(PublishError::Command {
            program: self.program_name(),
            reason: format!("{}: {}", output.status, tail),
        })
    }
}
