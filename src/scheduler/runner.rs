//! Executes one attempt of one job on a leased channel.
//!
//! The runner never touches job state. It reports progress as [`JobEvent`]s
//! and the scheduler applies them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{BoundedLog, ChannelError, RemoteChannel, TransferDirection};
use crate::matrix::{BuildMatrixEntry, BuildStep, Os};
use crate::pool::Lease;
use crate::scheduler::job::ArtifactRef;
use crate::scheduler::policy::{Failure, FailureKind};

#[derive(Debug)]
pub enum AttemptOutcome {
    Succeeded,
    Failed(Failure),
}

#[derive(Debug)]
pub enum AttemptEvent {
    Connected,
    StepStarted { index: usize },
    StepOutput { output: BoundedLog },
    StepCompleted { index: usize, artifacts: Vec<ArtifactRef> },
    Finished(AttemptOutcome),
}

#[derive(Debug)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub attempt: u32,
    pub event: AttemptEvent,
}

/// Per-run settings the runner needs.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub step_timeout: Duration,
    pub transfer_timeout: Duration,
    pub artifact_dir: Option<PathBuf>,
}

pub struct AttemptRunner {
    pub job_id: Uuid,
    pub attempt: u32,
    pub entry: Arc<BuildMatrixEntry>,
    pub settings: RunnerSettings,
    pub events: mpsc::UnboundedSender<JobEvent>,
    pub cancel: CancellationToken,
}

impl AttemptRunner {
    fn emit(&self, event: AttemptEvent) {
        // The scheduler outlives every runner; a closed channel means it gave up on us
        let _ = self.events.send(JobEvent {
            job_id: self.job_id,
            attempt: self.attempt,
            event,
        });
    }

    /// Run the attempt to completion. The lease is returned to the pool before
    /// the final event is sent.
    pub async fn run(self, mut lease: Lease) {
        let outcome = self.execute(&mut lease).await;
        if let AttemptOutcome::Failed(failure) = &outcome {
            if matches!(failure.kind, FailureKind::Connection | FailureKind::Timeout) {
                lease.mark_broken();
            }
        }
        drop(lease);
        self.emit(AttemptEvent::Finished(outcome));
    }

    async fn execute(&self, lease: &mut Lease) -> AttemptOutcome {
        let key = self.entry.key.as_str();
        let policy = &self.entry.classification;

        if !lease.is_connected() {
            let connected = tokio::select! {
                result = lease.connect() => result,
                _ = self.cancel.cancelled() => Err(ChannelError::Cancelled),
            };
            if let Err(e) = connected {
                tracing::warn!(key, host = %lease.host().name, error = %e, "Connect failed");
                return AttemptOutcome::Failed(policy.classify_error(&e, None));
            }
        }
        self.emit(AttemptEvent::Connected);

        let Some(channel) = lease.channel_mut() else {
            return AttemptOutcome::Failed(Failure::permanent(
                FailureKind::Connection,
                "lease has no open channel",
            ));
        };
        let os = self.entry.platform.os;

        for (index, step) in self.entry.steps.iter().enumerate() {
            self.emit(AttemptEvent::StepStarted { index });

            if index == 0 {
                if let Err(failure) = self.reset_workspace(channel, os).await {
                    return AttemptOutcome::Failed(failure);
                }
            }

            tracing::info!(key, step = %step.name, "Running step");
            let command = in_workdir(os, &self.entry.workdir, &step.command);
            let timeout = step.timeout.unwrap_or(self.settings.step_timeout);
            let output = match channel.run(&command, timeout, &self.cancel).await {
                Ok(output) => output,
                Err(e) => {
                    return AttemptOutcome::Failed(policy.classify_error(&e, Some(&step.name)));
                }
            };

            let mut combined = output.stdout.clone();
            combined.extend(&output.stderr);
            self.emit(AttemptEvent::StepOutput { output: combined });

            if !output.success() {
                return AttemptOutcome::Failed(policy.classify_exit(
                    output.exit_code,
                    &output.combined(),
                    Some(&step.name),
                ));
            }

            let artifacts = match self.collect_artifacts(channel, os, step).await {
                Ok(artifacts) => artifacts,
                Err(failure) => return AttemptOutcome::Failed(failure),
            };
            self.emit(AttemptEvent::StepCompleted { index, artifacts });
        }

        AttemptOutcome::Succeeded
    }

    async fn reset_workspace(
        &self,
        channel: &mut dyn RemoteChannel,
        os: Os,
    ) -> Result<(), Failure> {
        let command = reset_command(os, &self.entry.workdir);
        let output = channel
            .run(&command, self.settings.step_timeout, &self.cancel)
            .await
            .map_err(|e| self.entry.classification.classify_error(&e, None))?;
        if output.success() {
            return Ok(());
        }
        let mut failure =
            self.entry
                .classification
                .classify_exit(output.exit_code, &output.combined(), None);
        failure.message = format!(
            "failed to reset workspace {}: {}",
            self.entry.workdir,
            output.stderr.excerpt(3)
        );
        Err(failure)
    }

    /// Verify the step's declared artifacts exist and optionally download them.
    async fn collect_artifacts(
        &self,
        channel: &mut dyn RemoteChannel,
        os: Os,
        step: &BuildStep,
    ) -> Result<Vec<ArtifactRef>, Failure> {
        let policy = &self.entry.classification;
        let mut artifacts = Vec::new();

        for pattern in &step.artifacts {
            let output = channel
                .run(&list_command(os, pattern), self.settings.step_timeout, &self.cancel)
                .await
                .map_err(|e| policy.classify_error(&e, Some(&step.name)))?;
            let files: Vec<String> = if output.success() {
                output
                    .stdout
                    .as_string()
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            } else {
                Vec::new()
            };
            if files.is_empty() {
                return Err(Failure::permanent(
                    FailureKind::MissingArtifact,
                    format!("no file matches artifact pattern {}", pattern),
                )
                .with_step(Some(&step.name)));
            }

            for remote in files {
                let local_path = match &self.settings.artifact_dir {
                    Some(dir) => Some(self.download(channel, os, dir, &remote, step).await?),
                    None => None,
                };
                artifacts.push(ArtifactRef {
                    step: step.name.clone(),
                    remote_path: remote,
                    local_path,
                });
            }
        }
        Ok(artifacts)
    }

    async fn download(
        &self,
        channel: &mut dyn RemoteChannel,
        os: Os,
        dir: &Path,
        remote: &str,
        step: &BuildStep,
    ) -> Result<PathBuf, Failure> {
        let target_dir = dir.join(self.entry.slug());
        tokio::fs::create_dir_all(&target_dir).await.map_err(|e| {
            Failure::permanent(
                FailureKind::Transfer,
                format!("cannot create {}: {}", target_dir.display(), e),
            )
            .with_step(Some(&step.name))
        })?;
        let local = target_dir.join(remote_file_name(os, remote));

        let transfer = channel.transfer(
            &local,
            remote,
            TransferDirection::Download,
            self.settings.transfer_timeout,
        );
        let result = tokio::select! {
            result = transfer => result,
            _ = self.cancel.cancelled() => Err(ChannelError::Cancelled),
        };
        match result {
            Ok(()) => {
                tracing::info!(key = %self.entry.key, remote, local = %local.display(), "Downloaded artifact");
                Ok(local)
            }
            Err(e) => {
                let mut failure = self.entry.classification.classify_error(&e, Some(&step.name));
                // Anything that goes wrong while moving the file is a transfer failure
                if failure.kind != FailureKind::Cancelled {
                    failure.kind = FailureKind::Transfer;
                }
                Err(failure)
            }
        }
    }
}

/// Remove and recreate `workdir` so every attempt starts clean.
pub fn reset_command(os: Os, workdir: &str) -> String {
    match os {
        Os::Windows => format!(
            "if exist \"{w}\" rd /s /q \"{w}\" & mkdir \"{w}\"",
            w = workdir
        ),
        Os::Linux | Os::Macos => format!("rm -rf '{w}' && mkdir -p '{w}'", w = workdir),
    }
}

/// Run `command` from inside `workdir`.
pub fn in_workdir(os: Os, workdir: &str, command: &str) -> String {
    match os {
        Os::Windows => format!("cd /d \"{}\" && {}", workdir, command),
        Os::Linux | Os::Macos => format!("cd '{}' && {}", workdir, command),
    }
}

/// List files matching a glob, one absolute path per line.
pub fn list_command(os: Os, pattern: &str) -> String {
    match os {
        Os::Windows => format!("dir /b /s \"{}\"", pattern),
        // Left unquoted so the remote shell expands the glob
        Os::Linux | Os::Macos => format!("ls -1d {}", pattern),
    }
}

fn remote_file_name(os: Os, remote: &str) -> String {
    let name = match os {
        Os::Windows => remote.rsplit(['\\', '/']).next(),
        Os::Linux | Os::Macos => remote.rsplit('/').next(),
    };
    name.filter(|n| !n.is_empty())
        .unwrap_or("artifact")
        .to_string()
}
