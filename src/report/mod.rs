//! Matrix-level results derived from job state.

pub mod render;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::matrix::{CudaVersion, Platform};
use crate::scheduler::job::{ArtifactRef, Job, JobState};
use crate::scheduler::policy::Failure;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Terminal targets that needed more than one attempt
    pub retried: usize,
    /// Targets not yet terminal
    pub pending: usize,
}

/// Outcome of one terminal target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub key: String,
    pub package: String,
    pub platform: Platform,
    pub cuda: CudaVersion,
    pub state: JobState,
    pub attempts: u32,
    pub retries: u32,
    pub host: Option<String>,
    pub duration_ms: Option<u64>,
    pub artifacts: Vec<ArtifactRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    /// Tail of the build log, for failed targets only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_excerpt: Option<String>,
}

/// Where a non-terminal target currently is.
#[derive(Debug, Clone, Serialize)]
pub struct PendingTarget {
    pub key: String,
    pub state: JobState,
    pub attempts: u32,
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatrixReport {
    /// Every target reached a terminal state
    pub complete: bool,
    pub generated_at: DateTime<Utc>,
    pub summary: Summary,
    /// Terminal targets, ordered by key
    pub targets: Vec<TargetReport>,
    /// Non-terminal targets, ordered by key
    pub pending: Vec<PendingTarget>,
}

impl MatrixReport {
    pub fn empty() -> Self {
        Self {
            complete: false,
            generated_at: Utc::now(),
            summary: Summary::default(),
            targets: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn target(&self, key: &str) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.key == key)
    }

    pub fn all_succeeded(&self) -> bool {
        self.complete && self.summary.failed == 0
    }

    /// 0 when every target succeeded, else the failed count clamped to 255.
    pub fn exit_code(&self) -> u8 {
        let failed = self.summary.failed + self.summary.pending;
        failed.min(u8::MAX as usize) as u8
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Build a report from job state. Pure; the result does not depend on the
/// order of `jobs`.
pub fn aggregate<'a>(jobs: impl IntoIterator<Item = &'a Job>, excerpt_lines: usize) -> MatrixReport {
    let mut summary = Summary::default();
    let mut targets = Vec::new();
    let mut pending = Vec::new();

    for job in jobs {
        summary.total += 1;
        let state = job.state();
        if !state.is_terminal() {
            summary.pending += 1;
            pending.push(PendingTarget {
                key: job.key().to_string(),
                state,
                attempts: job.attempts(),
                host: job.host.clone(),
            });
            continue;
        }

        match state {
            JobState::Succeeded => summary.succeeded += 1,
            _ => summary.failed += 1,
        }
        if job.attempts() > 1 {
            summary.retried += 1;
        }

        let failed = state == JobState::Failed;
        targets.push(TargetReport {
            key: job.key().to_string(),
            package: job.entry.package.clone(),
            platform: job.entry.platform.clone(),
            cuda: job.entry.cuda.clone(),
            state,
            attempts: job.attempts(),
            retries: job.retries(),
            host: job.host.clone(),
            duration_ms: job.duration_ms(),
            artifacts: job.artifacts().to_vec(),
            failure: if failed { job.last_failure().cloned() } else { None },
            log_excerpt: if failed && !job.log().is_empty() {
                Some(job.log().excerpt(excerpt_lines))
            } else {
                None
            },
        });
    }

    targets.sort_by(|a, b| a.key.cmp(&b.key));
    pending.sort_by(|a, b| a.key.cmp(&b.key));

    MatrixReport {
        complete: summary.pending == 0,
        generated_at: Utc::now(),
        summary,
        targets,
        pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::matrix::{BuildMatrixEntry, BuildStep, Os};
    use crate::scheduler::policy::{ClassificationPolicy, FailureKind};

    fn job(package: &str) -> Job {
        let platform = Platform::new(Os::Linux, "x86_64");
        let cuda: CudaVersion = "12.4".parse().unwrap();
        Job::new(
            Arc::new(BuildMatrixEntry {
                key: BuildMatrixEntry::target_key(package, &platform, &cuda),
                package: package.into(),
                branch: None,
                required_tags: Default::default(),
                platform,
                cuda,
                workdir: "/tmp/w".into(),
                steps: vec![BuildStep {
                    name: "build".into(),
                    command: "make".into(),
                    artifacts: vec![],
                    timeout: None,
                }],
                classification: ClassificationPolicy::default(),
            }),
            4096,
        )
    }

    fn succeeded(package: &str) -> Job {
        let mut j = job(package);
        j.begin_attempt("gpu-1").unwrap();
        j.start_step(0).unwrap();
        j.record_artifacts(vec![ArtifactRef {
            step: "build".into(),
            remote_path: format!("/tmp/w/{}.conda", package),
            local_path: None,
        }])
        .unwrap();
        j.succeed().unwrap();
        j
    }

    fn failed(package: &str) -> Job {
        let mut j = job(package);
        j.begin_attempt("gpu-1").unwrap();
        j.start_step(0).unwrap();
        j.append_line("error: undefined reference to cudaMalloc");
        j.fail(Failure::permanent(FailureKind::Execution, "exit 2").with_exit_code(2))
            .unwrap();
        j
    }

    #[test]
    fn counts_and_orders_targets() {
        let jobs = vec![succeeded("zlib"), failed("numpy"), job("scipy")];
        let report = aggregate(&jobs, 10);
        assert_eq!(
            report.summary,
            Summary {
                total: 3,
                succeeded: 1,
                failed: 1,
                retried: 0,
                pending: 1,
            }
        );
        assert!(!report.complete);
        let keys: Vec<&str> = report.targets.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["numpy/linux-x86_64/cuda-12.4", "zlib/linux-x86_64/cuda-12.4"]);
        assert_eq!(report.pending.len(), 1);
        assert_eq!(report.pending[0].state, JobState::Queued);
    }

    #[test]
    fn independent_of_job_order() {
        let jobs = vec![succeeded("a"), failed("b"), succeeded("c")];
        let forward = aggregate(&jobs, 10);
        let backward = aggregate(jobs.iter().rev(), 10);
        let keys = |r: &MatrixReport| r.targets.iter().map(|t| t.key.clone()).collect::<Vec<_>>();
        assert_eq!(keys(&forward), keys(&backward));
        assert_eq!(forward.summary, backward.summary);
        assert!(forward.complete);
    }

    #[test]
    fn failures_carry_detail_and_excerpt() {
        let jobs = vec![failed("numpy"), succeeded("zlib")];
        let report = aggregate(&jobs, 10);
        let numpy = report.target("numpy/linux-x86_64/cuda-12.4").unwrap();
        assert_eq!(numpy.failure.as_ref().map(|f| f.exit_code), Some(Some(2)));
        assert!(numpy
            .log_excerpt
            .as_deref()
            .unwrap()
            .contains("undefined reference"));

        let zlib = report.target("zlib/linux-x86_64/cuda-12.4").unwrap();
        assert!(zlib.failure.is_none());
        assert!(zlib.log_excerpt.is_none());
        assert_eq!(zlib.artifacts.len(), 1);
    }

    #[test]
    fn exit_code_is_failed_count() {
        let jobs = vec![failed("a"), failed("b"), succeeded("c")];
        assert_eq!(aggregate(&jobs, 10).exit_code(), 2);
        let jobs = vec![succeeded("c")];
        let report = aggregate(&jobs, 10);
        assert_eq!(report.exit_code(), 0);
        assert!(report.all_succeeded());
    }

    #[test]
    fn json_has_summary() {
        let jobs = vec![succeeded("a")];
        let json = aggregate(&jobs, 10).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["summary"]["succeeded"], 1);
        assert_eq!(value["targets"][0]["state"], "succeeded");
        assert_eq!(value["targets"][0]["cuda"], "12.4");
        assert_eq!(value["targets"][0]["platform"]["os"], "linux");
    }
}
