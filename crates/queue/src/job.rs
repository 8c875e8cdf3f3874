use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A durable unit of work owned by one named queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Executions started so far. Incremented when a worker claims the
    /// job, so a crash mid-run still counts the attempt.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its run_at to pass.
    Delayed,
    /// Ready for a worker to claim.
    Waiting,
    /// Claimed; exactly one worker is running it.
    Active,
    Completed,
    Failed,
}

/// Options accepted at enqueue time.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Stable id for idempotent enqueues. Random when absent.
    pub job_id: Option<String>,
    /// Hold the job until now + delay before it becomes claimable.
    pub delay: Option<Duration>,
    /// Override the broker's default attempt budget.
    pub max_attempts: Option<u32>,
}

impl JobOptions {
    pub fn with_job_id(id: impl Into<String>) -> Self {
        Self {
            job_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn delayed(id: impl Into<String>, delay: Duration) -> Self {
        Self {
            job_id: Some(id.into()),
            delay: Some(delay),
            ..Self::default()
        }
    }
}

/// Result of an enqueue call. A duplicate is a no-op, not an error:
/// the existing row, whatever its state, already represents this work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted { job_id: String },
    Duplicate { job_id: String },
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            EnqueueOutcome::Accepted { job_id } | EnqueueOutcome::Duplicate { job_id } => job_id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate { .. })
    }
}

/// Terminal job report published on the broker's events stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub queue: String,
    pub name: String,
    pub status: JobEventStatus,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventStatus {
    Completed,
    Failed,
}

impl Job {
    pub fn new(queue: &str, name: &str, payload: serde_json::Value, options: &JobOptions, default_max_attempts: u32) -> Self {
        let now = Utc::now();
        let delay = options.delay.unwrap_or_else(Duration::zero);
        let state = if delay > Duration::zero() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        Self {
            id: options
                .job_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            queue: queue.to_string(),
            name: name.to_string(),
            payload,
            state,
            attempts_made: 0,
            max_attempts: options.max_attempts.unwrap_or(default_max_attempts),
            run_at: now + delay,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            failure: None,
        }
    }

    /// Fully-qualified name, `queue.job`, as handlers are registered.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.queue, self.name)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::Failed)
    }
}
