//! Pushes a finished [`MatrixReport`] to the code-hosting service or a
//! package channel.
//!
//! Publishing never changes the report. Each remote call is retried on its
//! own with [`PublishConfig::retry`], independently of build retries.

pub mod anaconda;
pub mod github;

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::PublishConfig;
use crate::matrix::slugify;
use crate::report::{render, MatrixReport, TargetReport};
use crate::scheduler::job::JobState;
use crate::scheduler::policy::RetryPolicy;

pub use anaconda::AnacondaClient;
pub use github::GitHubApi;

/// Longest description the commit status API accepts.
const MAX_DESCRIPTION: usize = 140;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTarget {
    Commit { repo: String, sha: String },
    PullRequest { repo: String, number: u64 },
    Release { repo: String, tag: String },
    /// anaconda.org user or organization receiving the built packages
    Channel { channel: String },
}

impl fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishTarget::Commit { repo, sha } => write!(f, "{}@{}", repo, sha),
            PublishTarget::PullRequest { repo, number } => write!(f, "{}#{}", repo, number),
            PublishTarget::Release { repo, tag } => write!(f, "{} release {}", repo, tag),
            PublishTarget::Channel { channel } => write!(f, "anaconda.org/{}", channel),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitStatus {
    pub state: CommitState,
    pub context: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("{operation} failed with HTTP {status}: {body}")]
    Http {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("{operation} failed: {reason}")]
    Transport { operation: String, reason: String },

    #[error("artifact {}: {reason}", .path.display())]
    Artifact { path: PathBuf, reason: String },

    #[error("`{program}` failed: {reason}")]
    Command { program: String, reason: String },

    #[error("no client configured for {0}")]
    NotConfigured(String),

    #[error("{failed} of {total} updates failed, first error: {first}")]
    Partial {
        failed: usize,
        total: usize,
        first: String,
    },
}

impl PublishError {
    /// Worth retrying: server-side errors, rate limiting and network trouble.
    pub fn is_transient(&self) -> bool {
        match self {
            PublishError::Http { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            PublishError::Transport { .. } => true,
            PublishError::Artifact { .. }
            | PublishError::Command { .. }
            | PublishError::NotConfigured(_)
            | PublishError::Partial { .. } => false,
        }
    }
}

#[async_trait]
pub trait HostingApi: Send + Sync {
    async fn set_commit_status(
        &self,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<(), PublishError>;

    async fn post_comment(&self, repo: &str, number: u64, body: &str) -> Result<(), PublishError>;

    /// Upload `path` as release asset `name`. An asset of that name that
    /// already exists counts as uploaded.
    async fn upload_release_asset(
        &self,
        repo: &str,
        tag: &str,
        name: &str,
        path: &Path,
    ) -> Result<(), PublishError>;
}

/// A package channel that takes conda packages, e.g. anaconda.org.
#[async_trait]
pub trait PackageChannel: Send + Sync {
    /// Upload `files` to `channel`, replacing packages of the same name.
    async fn upload_packages(&self, channel: &str, files: &[PathBuf]) -> Result<(), PublishError>;
}

pub struct Publisher {
    hosting: Option<Arc<dyn HostingApi>>,
    packages: Option<Arc<dyn PackageChannel>>,
    config: PublishConfig,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(api: Arc<dyn HostingApi>, config: PublishConfig) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        Self {
            hosting: Some(api),
            packages: None,
            config,
            retry,
        }
    }

    /// Publisher for [`PublishTarget::Channel`] only.
    pub fn for_packages(packages: Arc<dyn PackageChannel>, config: PublishConfig) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        Self {
            hosting: None,
            packages: Some(packages),
            config,
            retry,
        }
    }

    pub fn with_package_channel(mut self, packages: Arc<dyn PackageChannel>) -> Self {
        self.packages = Some(packages);
        self
    }

    fn hosting(&self) -> Result<&dyn HostingApi, PublishError> {
        self.hosting
            .as_deref()
            .ok_or_else(|| PublishError::NotConfigured("the code-hosting service".to_string()))
    }

    pub async fn publish(
        &self,
        report: &MatrixReport,
        target: &PublishTarget,
    ) -> Result<(), PublishError> {
        tracing::info!(%target, "Publishing build results");
        match target {
            PublishTarget::Commit { repo, sha } => self.publish_statuses(report, repo, sha).await,
            PublishTarget::PullRequest { repo, number } => {
                let api = self.hosting()?;
                let body = render::render_markdown(report);
                self.with_retry("post comment", || api.post_comment(repo, *number, &body))
                    .await
            }
            PublishTarget::Release { repo, tag } => self.upload_artifacts(report, repo, tag).await,
            PublishTarget::Channel { channel } => self.upload_packages(report, channel).await,
        }
    }

    /// Statuses for every target plus one aggregate status for the matrix.
    pub fn commit_statuses(&self, report: &MatrixReport) -> Vec<CommitStatus> {
        let prefix = &self.config.context_prefix;
        let mut statuses: Vec<CommitStatus> = report
            .targets
            .iter()
            .map(|t| CommitStatus {
                state: match t.state {
                    JobState::Succeeded => CommitState::Success,
                    _ => CommitState::Failure,
                },
                context: format!("{}/{}", prefix, t.key),
                description: truncate(&target_description(t), MAX_DESCRIPTION),
                target_url: self.config.details_url.clone(),
            })
            .collect();
        statuses.extend(report.pending.iter().map(|p| CommitStatus {
            state: CommitState::Pending,
            context: format!("{}/{}", prefix, p.key),
            description: format!("{} (attempt {})", p.state, p.attempts),
            target_url: self.config.details_url.clone(),
        }));

        let s = &report.summary;
        let state = if !report.complete {
            CommitState::Pending
        } else if s.failed == 0 {
            CommitState::Success
        } else {
            CommitState::Failure
        };
        statuses.push(CommitStatus {
            state,
            context: format!("{}/matrix", prefix),
            description: truncate(
                &format!(
                    "{} of {} targets succeeded, {} failed",
                    s.succeeded, s.total, s.failed
                ),
                MAX_DESCRIPTION,
            ),
            target_url: self.config.details_url.clone(),
        });
        statuses
    }

    async fn publish_statuses(
        &self,
        report: &MatrixReport,
        repo: &str,
        sha: &str,
    ) -> Result<(), PublishError> {
        let api = self.hosting()?;
        let statuses = self.commit_statuses(report);
        let mut errors = Vec::new();
        for status in &statuses {
            let result = self
                .with_retry("set commit status", || api.set_commit_status(repo, sha, status))
                .await;
            if let Err(e) = result {
                tracing::warn!(context = %status.context, error = %e, "Failed to set commit status");
                errors.push(e);
            }
        }
        collect_errors(errors, statuses.len())
    }

    async fn upload_artifacts(
        &self,
        report: &MatrixReport,
        repo: &str,
        tag: &str,
    ) -> Result<(), PublishError> {
        let api = self.hosting()?;
        let files: Vec<(&TargetReport, &Path)> = report
            .targets
            .iter()
            .filter(|t| t.state == JobState::Succeeded)
            .flat_map(|t| {
                t.artifacts
                    .iter()
                    .filter_map(move |a| a.local_path.as_deref().map(|path| (t, path)))
            })
            .collect();
        if files.is_empty() {
            tracing::info!(repo, tag, "No downloaded artifacts to upload");
            return Ok(());
        }

        let mut errors = Vec::new();
        for (target, path) in &files {
            let result = match asset_name(&target.key, path) {
                Ok(name) => {
                    self.with_retry("upload release asset", || {
                        api.upload_release_asset(repo, tag, &name, path)
                    })
                    .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => tracing::info!(repo, tag, file = %path.display(), "Uploaded release asset"),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Failed to upload release asset");
                    errors.push(e);
                }
            }
        }
        collect_errors(errors, files.len())
    }

    /// Every downloaded `.conda` and `.tar.bz2` of the succeeded targets, in one upload.
    async fn upload_packages(&self, report: &MatrixReport, channel: &str) -> Result<(), PublishError> {
        let packages = self
            .packages
            .as_deref()
            .ok_or_else(|| PublishError::NotConfigured("package channels".to_string()))?;
        let files: Vec<PathBuf> = report
            .targets
            .iter()
            .filter(|t| t.state == JobState::Succeeded)
            .flat_map(|t| t.artifacts.iter())
            .filter_map(|a| a.local_path.clone())
            .filter(|p| is_conda_package(p))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if files.is_empty() {
            tracing::info!(channel, "No downloaded packages to upload");
            return Ok(());
        }
        self.with_retry("upload packages", || packages.upload_packages(channel, &files))
            .await?;
        tracing::info!(channel, packages = files.len(), "Uploaded packages");
        Ok(())
    }

    async fn with_retry<F, Fut>(&self, operation: &str, mut call: F) -> Result<(), PublishError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), PublishError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt, RetryPolicy::sample_jitter());
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Release asset name for `path`: the target's slug, then the file name.
pub fn asset_name(key: &str, path: &Path) -> Result<String, PublishError> {
    let file = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PublishError::Artifact {
            path: path.to_path_buf(),
            reason: "no usable file name".to_string(),
        })?;
    Ok(format!("{}__{}", slugify(key), file))
}

fn is_conda_package(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".conda") || n.ends_with(".tar.bz2"))
}

fn collect_errors(mut errors: Vec<PublishError>, total: usize) -> Result<(), PublishError> {
    match errors.len() {
        0 => Ok(()),
        1 if total == 1 => Err(errors.remove(0)),
        failed => Err(PublishError::Partial {
            failed,
            total,
            first: errors[0].to_string(),
        }),
    }
}

fn target_description(target: &TargetReport) -> String {
    match (&target.failure, target.state) {
        (Some(failure), _) => failure.to_string(),
        (None, JobState::Succeeded) if target.attempts == 1 => "succeeded".to_string(),
        (None, JobState::Succeeded) => format!("succeeded after {} attempts", target.attempts),
        (None, state) => state.to_string(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max - 3).collect();
    out.push_str("...");
    out
}
