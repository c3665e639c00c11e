use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::scheduler::job::{Job, JobState};

/// Jobs of one run, in admission order, plus their timers.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: HashMap<Uuid, Job>,
    order: Vec<Uuid>,
    /// Backoff deadlines of jobs in `Retrying`
    retry_at: HashMap<Uuid, Instant>,
    /// When each `Queued` job entered the queue
    queued_since: HashMap<Uuid, Instant>,
    stale_reported: HashSet<Uuid>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a job. Returns false if a job with the same id already exists.
    pub fn add_job(&mut self, job: Job, now: Instant) -> bool {
        if self.jobs.contains_key(&job.id) {
            return false;
        }
        self.order.push(job.id);
        self.queued_since.insert(job.id, now);
        self.jobs.insert(job.id, job);
        true
    }

    pub fn get_job(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_job_mut(&mut self, id: &Uuid) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// Queued jobs, oldest admission first.
    pub fn queued_ids(&self) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|id| {
                self.jobs
                    .get(id)
                    .is_some_and(|j| j.state() == JobState::Queued)
            })
            .copied()
            .collect()
    }

    pub fn ids_in(&self, state: JobState) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|id| self.jobs.get(id).is_some_and(|j| j.state() == state))
            .copied()
            .collect()
    }

    /// The job left the queue for an attempt or a terminal state.
    pub fn mark_dequeued(&mut self, id: &Uuid) {
        self.queued_since.remove(id);
        self.stale_reported.remove(id);
    }

    pub fn mark_queued(&mut self, id: Uuid, now: Instant) {
        self.queued_since.insert(id, now);
    }

    pub fn schedule_retry(&mut self, id: Uuid, at: Instant) {
        self.retry_at.insert(id, at);
    }

    pub fn cancel_retry(&mut self, id: &Uuid) {
        self.retry_at.remove(id);
    }

    /// Remove and return the jobs whose backoff has elapsed.
    pub fn due_retries(&mut self, now: Instant) -> Vec<Uuid> {
        let mut due: Vec<Uuid> = self
            .retry_at
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        due.sort_by_key(|id| self.order.iter().position(|o| o == id));
        for id in &due {
            self.retry_at.remove(id);
        }
        due
    }

    pub fn next_retry_deadline(&self) -> Option<Instant> {
        self.retry_at.values().min().copied()
    }

    /// Jobs queued for longer than `threshold` that were not reported yet.
    pub fn newly_stale(&mut self, now: Instant, threshold: Duration) -> Vec<Uuid> {
        let stale: Vec<Uuid> = self
            .queued_since
            .iter()
            .filter(|(id, since)| {
                now.duration_since(**since) >= threshold && !self.stale_reported.contains(*id)
            })
            .map(|(id, _)| *id)
            .collect();
        self.stale_reported.extend(stale.iter().copied());
        stale
    }

    pub fn next_stale_deadline(&self, threshold: Duration) -> Option<Instant> {
        self.queued_since
            .iter()
            .filter(|(id, _)| !self.stale_reported.contains(*id))
            .map(|(_, since)| *since + threshold)
            .min()
    }

    /// All jobs in admission order.
    pub fn all_jobs(&self) -> Vec<&Job> {
        self.order.iter().filter_map(|id| self.jobs.get(id)).collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.jobs.values().all(|j| j.state().is_terminal())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
