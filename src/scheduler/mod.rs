//! Drives every target of a build matrix to a terminal state.
//!
//! The scheduler is the only writer of job state. One event loop admits jobs,
//! leases channels for them, spawns an [`AttemptRunner`] per attempt and
//! applies the events the runners send back. It wakes on:
//!
//! - attempt events (mpsc channel)
//! - channel releases in the pool
//! - the earliest timer: retry backoff, per-job wall clock, cancellation
//!   grace, run deadline, stale-queue threshold
//! - run cancellation
//!
//! After every wakeup it publishes a [`MatrixReport`] snapshot over a `watch`
//! channel.

pub mod job;
pub mod policy;
pub mod queue;
pub mod runner;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RunConfig;
use crate::error::{Result, SisyphusError};
use crate::matrix::BuildMatrix;
use crate::pool::ChannelPool;
use crate::report::{self, MatrixReport};

pub use job::{ArtifactRef, Job, JobState, TransitionError};
pub use policy::{
    ClassificationOverrides, ClassificationPolicy, Failure, FailureKind, NextAction, RetryPolicy,
};
pub use queue::JobQueue;
pub use runner::{AttemptEvent, AttemptOutcome, AttemptRunner, JobEvent, RunnerSettings};

/// Bookkeeping for a job with an attempt in flight.
struct InFlight {
    attempt: u32,
    handle: JoinHandle<()>,
    token: CancellationToken,
    /// Wall-clock limit of this attempt
    deadline: Instant,
    /// Set once the attempt was told to stop; the job fails with this
    /// failure however the attempt ends
    forced: Option<(Failure, Instant)>,
}

pub struct Scheduler {
    pool: Arc<ChannelPool>,
    config: RunConfig,
    retry: RetryPolicy,
    progress: watch::Sender<MatrixReport>,
}

impl Scheduler {
    pub fn new(pool: Arc<ChannelPool>, config: RunConfig) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let (progress, _) = watch::channel(MatrixReport::empty());
        Self {
            pool,
            config,
            retry,
            progress,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    /// Progress snapshots, published after every scheduler wakeup.
    pub fn subscribe(&self) -> watch::Receiver<MatrixReport> {
        self.progress.subscribe()
    }

    /// Fail fast on targets no inventory host could ever build.
    pub fn preflight(&self, matrix: &BuildMatrix) -> Result<()> {
        for entry in matrix.entries() {
            if !self.pool.can_serve(&entry.required_tags) {
                return Err(SisyphusError::UnmatchedCapabilities {
                    target: entry.key.clone(),
                    tags: entry.required_tags.iter().cloned().collect(),
                });
            }
        }
        Ok(())
    }

    /// Run every target of `matrix` to a terminal state.
    ///
    /// Only configuration problems are returned as errors, before anything is
    /// dispatched. Build failures end up in the report.
    pub async fn run(
        &self,
        matrix: &BuildMatrix,
        concurrency_limit: usize,
        cancel: CancellationToken,
    ) -> Result<MatrixReport> {
        if concurrency_limit == 0 {
            return Err(SisyphusError::Config(
                "concurrency limit must be at least 1".to_string(),
            ));
        }
        if self.config.strict_capabilities {
            self.preflight(matrix)?;
        }

        let start = Instant::now();
        let mut run = RunState {
            scheduler: self,
            queue: JobQueue::new(),
            inflight: HashMap::new(),
            limit: concurrency_limit,
            cancel,
            cancelling: false,
            run_deadline: self.config.run_timeout().map(|d| start + d),
            run_expired: false,
            settings: RunnerSettings {
                step_timeout: self.config.step_timeout(),
                transfer_timeout: self.config.transfer_timeout(),
                artifact_dir: self.config.artifact_dir.clone(),
            },
        };

        for entry in matrix.entries() {
            run.queue
                .add_job(Job::new(entry.clone(), self.config.log_limit_bytes), start);
        }
        tracing::info!(
            targets = matrix.len(),
            concurrency_limit,
            "Starting build matrix run"
        );
        let report = run.drive().await;
        tracing::info!(
            succeeded = report.summary.succeeded,
            failed = report.summary.failed,
            retried = report.summary.retried,
            "Build matrix run finished"
        );
        Ok(report)
    }
}

struct RunState<'a> {
    scheduler: &'a Scheduler,
    queue: JobQueue,
    inflight: HashMap<Uuid, InFlight>,
    limit: usize,
    cancel: CancellationToken,
    cancelling: bool,
    run_deadline: Option<Instant>,
    run_expired: bool,
    settings: RunnerSettings,
}

impl RunState<'_> {
    fn config(&self) -> &RunConfig {
        &self.scheduler.config
    }

    async fn drive(&mut self) -> MatrixReport {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobEvent>();
        let pool = self.scheduler.pool.clone();

        loop {
            let notified = pool.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Outcomes that arrived before a cancel or deadline still count
            while let Ok(event) = rx.try_recv() {
                self.handle_event(event);
            }

            let now = Instant::now();
            if self.cancel.is_cancelled() && !self.cancelling {
                self.begin_cancel(now);
            }
            self.process_timers(now);
            if self.run_deadline.is_none() {
                self.fail_unservable();
            }
            self.dispatch(&tx, now);
            self.publish();

            if self.queue.all_terminal() && self.inflight.is_empty() {
                break;
            }

            let wake_at = self
                .next_deadline()
                .unwrap_or_else(|| now + Duration::from_secs(3600));
            tokio::select! {
                _ = self.cancel.cancelled(), if !self.cancelling => {}
                Some(event) = rx.recv() => self.handle_event(event),
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }

        self.publish()
    }

    fn publish(&self) -> MatrixReport {
        let snapshot = report::aggregate(self.queue.all_jobs(), self.config().excerpt_lines);
        self.scheduler.progress.send_replace(snapshot.clone());
        snapshot
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadlines = Vec::new();
        deadlines.extend(self.queue.next_retry_deadline());
        deadlines.extend(
            self.queue
                .next_stale_deadline(self.config().queue_stale_after()),
        );
        if !self.run_expired {
            deadlines.extend(self.run_deadline);
        }
        // A dead host coming back frees capacity without a release
        deadlines.extend(self.scheduler.pool.next_recovery());
        for flight in self.inflight.values() {
            match &flight.forced {
                Some((_, abort_at)) => deadlines.push(*abort_at),
                None => deadlines.push(flight.deadline),
            }
        }
        deadlines.into_iter().min()
    }

    /// Nothing bounds the run: a job no host can serve, because none provides
    /// its tags or every one that does failed preparation, would wait
    /// forever, so fail it now.
    fn fail_unservable(&mut self) {
        for id in self.queue.queued_ids() {
            let Some(job) = self.queue.get_job(&id) else {
                continue;
            };
            if self.scheduler.pool.can_serve(&job.entry.required_tags) {
                continue;
            }
            let tags: Vec<&str> = job.entry.required_tags.iter().map(String::as_str).collect();
            let failure = Failure::permanent(
                FailureKind::PoolExhausted,
                format!("no host provides {}", tags.join(", ")),
            );
            self.fail_job(&id, failure);
        }
    }

    fn dispatch(&mut self, tx: &mpsc::UnboundedSender<JobEvent>, now: Instant) {
        if self.cancelling || self.run_expired {
            return;
        }
        for id in self.queue.queued_ids() {
            if self.inflight.len() >= self.limit {
                break;
            }
            let Some(job) = self.queue.get_job_mut(&id) else {
                continue;
            };
            let Some(lease) = self.scheduler.pool.try_acquire(&job.entry.required_tags) else {
                continue;
            };
            if let Err(e) = job.begin_attempt(&lease.host().name) {
                tracing::error!(key = %job.key(), error = %e, "Cannot start attempt");
                continue;
            }
            let attempt = job.attempts();
            tracing::info!(
                key = %job.key(),
                attempt,
                host = %lease.host().name,
                "Dispatching job"
            );

            let token = self.cancel.child_token();
            let runner = AttemptRunner {
                job_id: id,
                attempt,
                entry: job.entry.clone(),
                settings: self.settings.clone(),
                events: tx.clone(),
                cancel: token.clone(),
            };
            let handle = tokio::spawn(runner.run(lease));
            self.queue.mark_dequeued(&id);
            self.inflight.insert(
                id,
                InFlight {
                    attempt,
                    handle,
                    token,
                    deadline: now + self.scheduler.config.job_timeout(),
                    forced: None,
                },
            );
        }
    }

    fn handle_event(&mut self, event: JobEvent) {
        let JobEvent {
            job_id,
            attempt,
            event,
        } = event;
        // Events of an attempt that was already given up on are stale
        if self.inflight.get(&job_id).map(|f| f.attempt) != Some(attempt) {
            return;
        }
        let Some(job) = self.queue.get_job_mut(&job_id) else {
            return;
        };

        match event {
            AttemptEvent::Connected => {
                let host = job.host.clone().unwrap_or_default();
                job.append_line(&format!("connected to {}", host));
            }
            AttemptEvent::StepStarted { index } => {
                if let Err(e) = job.start_step(index) {
                    tracing::error!(key = %job.key(), error = %e, "Invalid step transition");
                }
            }
            AttemptEvent::StepOutput { output } => job.append_output(&output),
            AttemptEvent::StepCompleted { index, artifacts } => {
                tracing::debug!(key = %job.key(), step = index, artifacts = artifacts.len(), "Step completed");
                if let Err(e) = job.record_artifacts(artifacts) {
                    tracing::error!(key = %job.key(), error = %e, "Artifacts outside a running step");
                }
            }
            AttemptEvent::Finished(outcome) => {
                let forced = self
                    .inflight
                    .remove(&job_id)
                    .and_then(|flight| flight.forced.map(|(failure, _)| failure));
                self.finish_attempt(job_id, outcome, forced);
            }
        }
    }

    fn finish_attempt(&mut self, id: Uuid, outcome: AttemptOutcome, forced: Option<Failure>) {
        // A stop request that lost the race against a successful attempt is moot
        match (forced, &outcome) {
            (Some(failure), AttemptOutcome::Succeeded) => {
                tracing::info!(job_id = %id, stop = %failure, "Attempt succeeded before it could be stopped");
            }
            (Some(failure), AttemptOutcome::Failed(_)) => {
                self.fail_job(&id, failure);
                return;
            }
            (None, _) => {}
        }
        let Some(job) = self.queue.get_job_mut(&id) else {
            return;
        };
        match outcome {
            AttemptOutcome::Succeeded => match job.succeed() {
                Ok(()) => tracing::info!(
                    key = %job.key(),
                    attempts = job.attempts(),
                    artifacts = job.artifacts().len(),
                    "Job succeeded"
                ),
                Err(e) => tracing::error!(key = %job.key(), error = %e, "Cannot mark job succeeded"),
            },
            AttemptOutcome::Failed(failure) => {
                let action =
                    self.scheduler
                        .retry
                        .next_action(job.attempts(), &failure, RetryPolicy::sample_jitter());
                match action {
                    NextAction::Retry { delay } => {
                        tracing::warn!(
                            key = %job.key(),
                            attempt = job.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            failure = %failure,
                            "Attempt failed, retrying"
                        );
                        if let Err(e) = job.retry(failure) {
                            tracing::error!(key = %job.key(), error = %e, "Cannot retry job");
                            return;
                        }
                        self.queue.schedule_retry(id, Instant::now() + delay);
                    }
                    NextAction::GiveUp => self.fail_job(&id, failure),
                }
            }
        }
    }

    fn fail_job(&mut self, id: &Uuid, failure: Failure) {
        self.queue.cancel_retry(id);
        self.queue.mark_dequeued(id);
        let Some(job) = self.queue.get_job_mut(id) else {
            return;
        };
        if job.state().is_terminal() {
            return;
        }
        let level_error = !failure.transient && failure.kind == FailureKind::Execution;
        if level_error {
            tracing::error!(key = %job.key(), attempts = job.attempts(), failure = %failure, "Job failed");
        } else {
            tracing::warn!(key = %job.key(), attempts = job.attempts(), failure = %failure, "Job failed");
        }
        if let Err(e) = job.fail(failure) {
            tracing::error!(key = %job.key(), error = %e, "Cannot mark job failed");
        }
    }

    /// Ask an in-flight attempt to stop; after the grace period it is aborted
    /// and the job fails with `failure`.
    fn force_stop(&mut self, id: &Uuid, failure: Failure, now: Instant) {
        let grace = self.scheduler.config.cancel_grace();
        if let Some(flight) = self.inflight.get_mut(id) {
            if flight.forced.is_none() {
                flight.token.cancel();
                flight.forced = Some((failure, now + grace));
            }
        }
    }

    fn begin_cancel(&mut self, now: Instant) {
        self.cancelling = true;
        tracing::warn!(in_flight = self.inflight.len(), "Run cancelled, stopping jobs");

        let waiting: Vec<Uuid> = self
            .queue
            .ids_in(JobState::Queued)
            .into_iter()
            .chain(self.queue.ids_in(JobState::Retrying))
            .collect();
        for id in waiting {
            self.fail_job(
                &id,
                Failure::permanent(FailureKind::Cancelled, "run cancelled before dispatch"),
            );
        }
        let active: Vec<Uuid> = self.inflight.keys().copied().collect();
        for id in active {
            self.force_stop(
                &id,
                Failure::permanent(FailureKind::Cancelled, "run cancelled"),
                now,
            );
        }
    }

    fn process_timers(&mut self, now: Instant) {
        for id in self.queue.due_retries(now) {
            if let Some(job) = self.queue.get_job_mut(&id) {
                match job.requeue() {
                    Ok(()) => {
                        tracing::info!(key = %job.key(), "Job requeued after backoff");
                        self.queue.mark_queued(id, now);
                    }
                    Err(e) => tracing::error!(key = %job.key(), error = %e, "Cannot requeue job"),
                }
            }
        }

        if let Some(deadline) = self.run_deadline {
            if !self.run_expired && now >= deadline {
                self.expire_run(now);
            }
        }

        let timed_out: Vec<Uuid> = self
            .inflight
            .iter()
            .filter(|(_, f)| f.forced.is_none() && now >= f.deadline)
            .map(|(id, _)| *id)
            .collect();
        let job_timeout = self.scheduler.config.job_timeout();
        for id in timed_out {
            if let Some(job) = self.queue.get_job(&id) {
                tracing::warn!(key = %job.key(), timeout_ms = job_timeout.as_millis() as u64, "Job exceeded its wall clock");
            }
            self.force_stop(
                &id,
                Failure::permanent(
                    FailureKind::JobTimeout,
                    format!("attempt exceeded {}s", job_timeout.as_secs()),
                ),
                now,
            );
        }

        let overdue: Vec<Uuid> = self
            .inflight
            .iter()
            .filter(|(_, f)| f.forced.as_ref().is_some_and(|(_, at)| now >= *at))
            .map(|(id, _)| *id)
            .collect();
        for id in overdue {
            if let Some(flight) = self.inflight.remove(&id) {
                // Aborting drops the lease, which returns the channel
                flight.handle.abort();
                if let Some((failure, _)) = flight.forced {
                    self.fail_job(&id, failure);
                }
            }
        }

        let threshold = self.config().queue_stale_after();
        for id in self.queue.newly_stale(now, threshold) {
            if let Some(job) = self.queue.get_job(&id) {
                tracing::warn!(
                    key = %job.key(),
                    queued_ms = threshold.as_millis() as u64,
                    tags = ?job.entry.required_tags,
                    "Job has been queued for a long time"
                );
            }
        }
    }

    fn expire_run(&mut self, now: Instant) {
        self.run_expired = true;
        tracing::warn!("Run timeout expired, failing unfinished jobs");

        for id in self.queue.ids_in(JobState::Queued) {
            self.fail_job(
                &id,
                Failure::permanent(
                    FailureKind::PoolExhausted,
                    "no matching channel became available before the run timeout",
                ),
            );
        }
        for id in self.queue.ids_in(JobState::Retrying) {
            let message = self
                .queue
                .get_job(&id)
                .and_then(|j| j.last_failure())
                .map(|f| format!("run timeout expired while waiting to retry after {}", f))
                .unwrap_or_else(|| "run timeout expired while waiting to retry".to_string());
            self.fail_job(&id, Failure::permanent(FailureKind::Timeout, message));
        }
        let active: Vec<Uuid> = self.inflight.keys().copied().collect();
        for id in active {
            self.force_stop(
                &id,
                Failure::permanent(FailureKind::Timeout, "run timeout expired"),
                now,
            );
        }
    }
}
