use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::channel::BoundedLog;
use crate::matrix::BuildMatrixEntry;
use crate::scheduler::policy::Failure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Connecting,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl JobState {
    /// Edges of the job lifecycle graph.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Connecting)
                | (Connecting, Running)
                | (Connecting, Retrying)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, Retrying)
                | (Retrying, Queued)
                | (Queued, Failed)
                | (Connecting, Failed)
                | (Running, Failed)
                | (Retrying, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Occupies a concurrency slot.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Connecting | JobState::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Connecting => write!(f, "connecting"),
            JobState::Running => write!(f, "running"),
            JobState::Retrying => write!(f, "retrying"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}

/// A file produced by a build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    pub step: String,
    pub remote_path: String,
    /// Where the file was downloaded to, if artifact download is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

/// Runtime state of one build target. Only the scheduler mutates jobs.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub entry: Arc<BuildMatrixEntry>,
    state: JobState,
    attempts: u32,
    retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub host: Option<String>,
    pub current_step: Option<usize>,
    log: BoundedLog,
    artifacts: Vec<ArtifactRef>,
    last_failure: Option<Failure>,
}

impl Job {
    pub fn new(entry: Arc<BuildMatrixEntry>, log_limit: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            entry,
            state: JobState::Queued,
            attempts: 0,
            retries: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            host: None,
            current_step: None,
            log: BoundedLog::new(log_limit),
            artifacts: Vec::new(),
            last_failure: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.entry.key
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn log(&self) -> &BoundedLog {
        &self.log
    }

    pub fn artifacts(&self) -> &[ArtifactRef] {
        &self.artifacts
    }

    pub fn last_failure(&self) -> Option<&Failure> {
        self.last_failure.as_ref()
    }

    fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(key = %self.entry.key, from = %self.state, to = %next, "Job transition");
        self.state = next;
        Ok(())
    }

    /// Queued -> Connecting. Starts a new attempt on `host`.
    pub fn begin_attempt(&mut self, host: &str) -> Result<(), TransitionError> {
        self.transition(JobState::Connecting)?;
        self.attempts += 1;
        self.host = Some(host.to_string());
        self.current_step = None;
        // The workspace is wiped per attempt, so earlier artifacts are gone
        self.artifacts.clear();
        let now = Utc::now();
        self.started_at.get_or_insert(now);
        self.log
            .push_line(&format!("=== attempt {} on {} ===", self.attempts, host));
        Ok(())
    }

    /// Connecting -> Running, or Running -> Running for the next step.
    pub fn start_step(&mut self, index: usize) -> Result<(), TransitionError> {
        self.transition(JobState::Running)?;
        self.current_step = Some(index);
        if let Some(step) = self.entry.steps.get(index) {
            self.log.push_line(&format!("--- step {} ---", step.name));
        }
        Ok(())
    }

    /// Record artifacts of a step that already exited successfully.
    pub fn record_artifacts(&mut self, artifacts: Vec<ArtifactRef>) -> Result<(), TransitionError> {
        if self.state != JobState::Running {
            return Err(TransitionError {
                from: self.state,
                to: JobState::Running,
            });
        }
        self.artifacts.extend(artifacts);
        Ok(())
    }

    pub fn append_output(&mut self, output: &BoundedLog) {
        self.log.extend(output);
    }

    pub fn append_line(&mut self, line: &str) {
        self.log.push_line(line);
    }

    /// Running -> Succeeded.
    pub fn succeed(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Succeeded)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Connecting/Running -> Retrying.
    pub fn retry(&mut self, failure: Failure) -> Result<(), TransitionError> {
        self.transition(JobState::Retrying)?;
        self.retries += 1;
        self.log.push_line(&format!("!!! {}", failure));
        self.last_failure = Some(failure);
        Ok(())
    }

    /// Retrying -> Queued once the backoff elapsed.
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Queued)?;
        self.host = None;
        self.current_step = None;
        Ok(())
    }

    /// Any non-terminal state -> Failed.
    pub fn fail(&mut self, failure: Failure) -> Result<(), TransitionError> {
        self.transition(JobState::Failed)?;
        self.log.push_line(&format!("!!! {}", failure));
        self.last_failure = Some(failure);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Wall-clock time from first attempt to terminal state.
    pub fn duration_ms(&self) -> Option<u64> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds().max(0) as u64)
    }
}
