use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::job::{Job, JobState};

/// Retention bounds for one terminal state class. Both limits apply:
/// rows past max_age are pruned, and only the newest max_count survive.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub max_count: usize,
}

impl RetentionPolicy {
    pub fn completed_default() -> Self {
        Self {
            max_age: Duration::hours(1),
            max_count: 100,
        }
    }

    pub fn failed_default() -> Self {
        Self {
            max_age: Duration::hours(24),
            max_count: 50,
        }
    }
}

/// Counts of jobs per state for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub delayed: usize,
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Durable job rows keyed by job id. All state transitions happen under
/// the entry lock, so the `Waiting -> Active` claim is what serializes
/// execution per job id. The store is shared by `Arc`: a broker rebuilt
/// over the same store (process restart) resumes from these rows.
#[derive(Default)]
pub struct JobStore {
    jobs: DashMap<String, Job>,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }

    /// Insert a new row. Returns false when the id already exists in any
    /// state; the caller reports a duplicate no-op.
    pub fn insert(&self, job: Job) -> bool {
        match self.jobs.entry(job.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(job);
                true
            }
        }
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.get(job_id).map(|j| j.clone())
    }

    /// Claim a waiting job for execution. Fails (None) for any other
    /// state, which is what keeps duplicate ready-signals harmless.
    pub fn claim(&self, job_id: &str, now: DateTime<Utc>) -> Option<Job> {
        let mut entry = self.jobs.get_mut(job_id)?;
        if entry.state != JobState::Waiting {
            return None;
        }
        entry.state = JobState::Active;
        entry.started_at = Some(now);
        entry.attempts_made += 1;
        Some(entry.clone())
    }

    pub fn complete(&self, job_id: &str, now: DateTime<Utc>) -> Option<Job> {
        let mut entry = self.jobs.get_mut(job_id)?;
        if entry.state != JobState::Active {
            return None;
        }
        entry.state = JobState::Completed;
        entry.finished_at = Some(now);
        entry.failure = None;
        Some(entry.clone())
    }

    /// Push an active job back to the delayed set for a later attempt.
    pub fn reschedule(&self, job_id: &str, run_at: DateTime<Utc>, error: &str) -> Option<Job> {
        let mut entry = self.jobs.get_mut(job_id)?;
        if entry.state != JobState::Active {
            return None;
        }
        entry.state = JobState::Delayed;
        entry.run_at = run_at;
        entry.started_at = None;
        entry.failure = Some(error.to_string());
        Some(entry.clone())
    }

    pub fn fail(&self, job_id: &str, error: &str, now: DateTime<Utc>) -> Option<Job> {
        let mut entry = self.jobs.get_mut(job_id)?;
        if entry.state != JobState::Active {
            return None;
        }
        entry.state = JobState::Failed;
        entry.finished_at = Some(now);
        entry.failure = Some(error.to_string());
        Some(entry.clone())
    }

    /// Flip due delayed jobs to waiting. Returns (queue, id) pairs for
    /// the broker to hand to workers.
    pub fn promote_due(&self, now: DateTime<Utc>) -> Vec<(String, String)> {
        let mut promoted = Vec::new();
        for mut entry in self.jobs.iter_mut() {
            if entry.state == JobState::Delayed && entry.run_at <= now {
                entry.state = JobState::Waiting;
                promoted.push((entry.queue.clone(), entry.id.clone()));
            }
        }
        promoted
    }

    /// Recover rows left `Active` by a crashed run. Handlers are
    /// idempotent from persisted state, so a re-run converges.
    pub fn reset_stale_active(&self) -> Vec<(String, String)> {
        let mut reset = Vec::new();
        for mut entry in self.jobs.iter_mut() {
            if entry.state == JobState::Active {
                entry.state = JobState::Waiting;
                entry.started_at = None;
                reset.push((entry.queue.clone(), entry.id.clone()));
            }
        }
        reset
    }

    pub fn waiting_jobs(&self) -> Vec<(String, String)> {
        self.jobs
            .iter()
            .filter(|j| j.state == JobState::Waiting)
            .map(|j| (j.queue.clone(), j.id.clone()))
            .collect()
    }

    pub fn counts_by_queue(&self) -> HashMap<String, QueueCounts> {
        let mut counts: HashMap<String, QueueCounts> = HashMap::new();
        for job in self.jobs.iter() {
            let entry = counts.entry(job.queue.clone()).or_default();
            match job.state {
                JobState::Delayed => entry.delayed += 1,
                JobState::Waiting => entry.waiting += 1,
                JobState::Active => entry.active += 1,
                JobState::Completed => entry.completed += 1,
                JobState::Failed => entry.failed += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Prune terminal rows per class. Freed ids become enqueueable again.
    pub fn prune(
        &self,
        completed: &RetentionPolicy,
        failed: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> usize {
        self.prune_state(JobState::Completed, completed, now)
            + self.prune_state(JobState::Failed, failed, now)
    }

    fn prune_state(&self, state: JobState, policy: &RetentionPolicy, now: DateTime<Utc>) -> usize {
        let cutoff = now - policy.max_age;
        let mut rows: Vec<(String, DateTime<Utc>)> = self
            .jobs
            .iter()
            .filter(|j| j.state == state)
            .map(|j| (j.id.clone(), j.finished_at.unwrap_or(j.enqueued_at)))
            .collect();
        // Newest first; everything beyond max_count or past max_age goes.
        rows.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = 0;
        for (idx, (id, finished_at)) in rows.iter().enumerate() {
            if idx >= policy.max_count || *finished_at < cutoff {
                if self.jobs.remove(id).is_some() {
                    removed += 1;
                }
            }
        }
        removed
    }
}
