//! Failure classification and retry policy.
//!
//! Both are plain data plus pure functions so the scheduler's decisions can be
//! tested without any I/O.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelError;
use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connection,
    Timeout,
    Execution,
    Transfer,
    MissingArtifact,
    PoolExhausted,
    Cancelled,
    JobTimeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Connection => "connection",
            FailureKind::Timeout => "timeout",
            FailureKind::Execution => "execution",
            FailureKind::Transfer => "transfer",
            FailureKind::MissingArtifact => "missing_artifact",
            FailureKind::PoolExhausted => "pool_exhausted",
            FailureKind::Cancelled => "cancelled",
            FailureKind::JobTimeout => "job_timeout",
        };
        f.write_str(s)
    }
}

/// Structured reason for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub transient: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub message: String,
}

impl Failure {
    pub fn transient(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            transient: true,
            exit_code: None,
            step: None,
            message: message.into(),
        }
    }

    pub fn permanent(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            transient: false,
            exit_code: None,
            step: None,
            message: message.into(),
        }
    }

    pub fn with_step(mut self, step: Option<&str>) -> Self {
        self.step = step.map(str::to_string);
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(step) = &self.step {
            write!(f, " in step '{}'", step)?;
        }
        if let Some(code) = self.exit_code {
            write!(f, " (exit {})", code)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Per-package additions to the default classification table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassificationOverrides {
    #[serde(default)]
    pub transient_exit_codes: Vec<i32>,
    #[serde(default)]
    pub permanent_exit_codes: Vec<i32>,
    #[serde(default)]
    pub transient_patterns: Vec<String>,
    #[serde(default)]
    pub permanent_patterns: Vec<String>,
}

/// Decides whether a failed command is worth retrying.
///
/// Rules are checked in order: a permanent exit code or output pattern always
/// wins, then transient exit codes, then transient output patterns. A
/// nonzero exit matching nothing is permanent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationPolicy {
    pub transient_exit_codes: BTreeSet<i32>,
    pub permanent_exit_codes: BTreeSet<i32>,
    pub transient_patterns: Vec<String>,
    pub permanent_patterns: Vec<String>,
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self {
            // 255 is ssh's own failure, 124 is coreutils `timeout`
            transient_exit_codes: [124, 255].into_iter().collect(),
            permanent_exit_codes: BTreeSet::new(),
            transient_patterns: [
                "Connection reset by peer",
                "Connection timed out",
                "Broken pipe",
                "Temporary failure in name resolution",
                "Could not resolve host",
                "CondaHTTPError",
                "HTTP 502",
                "HTTP 503",
                "HTTP 504",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            permanent_patterns: Vec::new(),
        }
    }
}

impl ClassificationPolicy {
    pub fn merged(&self, overrides: &ClassificationOverrides) -> Self {
        let mut merged = self.clone();
        merged
            .transient_exit_codes
            .extend(overrides.transient_exit_codes.iter().copied());
        merged
            .permanent_exit_codes
            .extend(overrides.permanent_exit_codes.iter().copied());
        // An explicit permanent code beats an inherited transient one
        for code in &overrides.permanent_exit_codes {
            merged.transient_exit_codes.remove(code);
        }
        merged
            .transient_patterns
            .extend(overrides.transient_patterns.iter().cloned());
        merged
            .permanent_patterns
            .extend(overrides.permanent_patterns.iter().cloned());
        merged
    }

    pub fn is_transient_exit(&self, code: i32) -> bool {
        self.transient_exit_codes.contains(&code) && !self.permanent_exit_codes.contains(&code)
    }

    fn is_transient(&self, exit_code: Option<i32>, output: &str) -> bool {
        if exit_code.is_some_and(|c| self.permanent_exit_codes.contains(&c)) {
            return false;
        }
        if self.permanent_patterns.iter().any(|p| output.contains(p.as_str())) {
            return false;
        }
        if exit_code.is_some_and(|c| self.transient_exit_codes.contains(&c)) {
            return true;
        }
        self.transient_patterns.iter().any(|p| output.contains(p.as_str()))
    }

    /// Classify a command that ran to completion with a nonzero exit code.
    pub fn classify_exit(&self, exit_code: i32, output: &str, step: Option<&str>) -> Failure {
        let transient = self.is_transient(Some(exit_code), output);
        Failure {
            kind: FailureKind::Execution,
            transient,
            exit_code: Some(exit_code),
            step: step.map(str::to_string),
            message: format!("command exited with status {}", exit_code),
        }
    }

    /// Classify an error raised by the channel itself.
    pub fn classify_error(&self, error: &ChannelError, step: Option<&str>) -> Failure {
        let failure = match error {
            // A host that fails preparation stops taking leases; another host may serve
            ChannelError::Connect { .. }
            | ChannelError::Disconnected { .. }
            | ChannelError::Prepare { .. } => {
                Failure::transient(FailureKind::Connection, error.to_string())
            }
            ChannelError::Timeout { .. } => Failure::transient(FailureKind::Timeout, error.to_string()),
            ChannelError::Transfer {
                exit_code, reason, ..
            } => {
                let mut failure = if self.is_transient(*exit_code, reason) {
                    Failure::transient(FailureKind::Transfer, error.to_string())
                } else {
                    Failure::permanent(FailureKind::Transfer, error.to_string())
                };
                failure.exit_code = *exit_code;
                failure
            }
            ChannelError::Cancelled => Failure::permanent(FailureKind::Cancelled, error.to_string()),
            // Failing to spawn the local transport is not a network problem
            ChannelError::Io(_) => Failure::permanent(FailureKind::Connection, error.to_string()),
        };
        failure.with_step(step)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Retry { delay: Duration },
    GiveUp,
}

/// Exponential backoff with relative jitter, capped.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// `attempts` is the number of attempts already made, the failed one
    /// included. `jitter_sample` is in `[-1.0, 1.0]`.
    pub fn next_action(&self, attempts: u32, failure: &Failure, jitter_sample: f64) -> NextAction {
        if !failure.transient || attempts >= self.max_attempts {
            return NextAction::GiveUp;
        }
        NextAction::Retry {
            delay: self.backoff(attempts, jitter_sample),
        }
    }

    /// Delay before the retry that follows attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let raw = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let factor = 1.0 + self.jitter * jitter_sample.clamp(-1.0, 1.0);
        raw.mul_f64(factor.max(0.0)).min(self.max_delay)
    }

    pub fn sample_jitter() -> f64 {
        rand::thread_rng().gen_range(-1.0..=1.0)
    }
}
