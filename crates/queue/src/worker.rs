use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::handler::HandlerRegistry;
use crate::job::{Job, JobEvent, JobEventStatus};
use crate::retry::RetryPolicy;
use crate::store::JobStore;

/// A single queue worker: a Tokio task that pulls ready job ids off the
/// shared channel, claims them, and runs the registered handler.
pub struct QueueWorker {
    pub worker_id: String,
    pub queue: String,
    store: Arc<JobStore>,
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
    ready: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    events: broadcast::Sender<JobEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl QueueWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: String,
        queue: String,
        store: Arc<JobStore>,
        registry: Arc<HandlerRegistry>,
        retry: RetryPolicy,
        ready: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
        events: broadcast::Sender<JobEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            worker_id,
            queue,
            store,
            registry,
            retry,
            ready,
            events,
            shutdown,
        }
    }

    /// Spawn this worker as a Tokio task. It drains until shutdown is
    /// signalled or the ready channel closes, finishing any in-flight
    /// job first.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(worker_id = %self.worker_id, queue = %self.queue, "Worker started");
            loop {
                let job_id = tokio::select! {
                    _ = self.shutdown.recv() => break,
                    job_id = next_ready(&self.ready) => match job_id {
                        Some(id) => id,
                        None => break,
                    },
                };
                self.process(&job_id).await;
            }
            debug!(worker_id = %self.worker_id, queue = %self.queue, "Worker stopped");
        })
    }

    async fn process(&self, job_id: &str) {
        // The claim is the exclusivity gate: a duplicate ready-signal
        // for the same id finds the row no longer Waiting and drops out.
        let job = match self.store.claim(job_id, Utc::now()) {
            Some(job) => job,
            None => return,
        };

        let handler = match self.registry.resolve(&job) {
            Some(handler) => handler,
            None => {
                let reason = format!("no handler registered for '{}'", job.qualified_name());
                error!(job_id = %job.id, queue = %job.queue, "{reason}");
                self.store.fail(&job.id, &reason, Utc::now());
                self.emit_failed(&job, &reason);
                return;
            }
        };

        let started = std::time::Instant::now();
        let result = handler.handle(&job).await;
        metrics::histogram!("queue.job_duration_ms", "queue" => job.queue.clone())
            .record(started.elapsed().as_millis() as f64);

        match result {
            Ok(()) => {
                self.store.complete(&job.id, Utc::now());
                metrics::counter!("queue.jobs_completed", "queue" => job.queue.clone())
                    .increment(1);
                let _ = self.events.send(JobEvent {
                    job_id: job.id.clone(),
                    queue: job.queue.clone(),
                    name: job.name.clone(),
                    status: JobEventStatus::Completed,
                    failure_reason: None,
                });
            }
            Err(e) if e.is_retryable() && job.attempts_made < job.max_attempts => {
                let backoff = self.retry.backoff_for_attempt(job.attempts_made - 1);
                let run_at = Utc::now()
                    + Duration::from_std(backoff).unwrap_or_else(|_| Duration::seconds(60));
                warn!(
                    job_id = %job.id,
                    queue = %job.queue,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Job failed, retrying with backoff"
                );
                self.store.reschedule(&job.id, run_at, &e.to_string());
                metrics::counter!("queue.jobs_retried", "queue" => job.queue.clone())
                    .increment(1);
            }
            Err(e) => {
                let reason = e.to_string();
                error!(
                    job_id = %job.id,
                    queue = %job.queue,
                    attempts = job.attempts_made,
                    error = %reason,
                    "Job failed permanently"
                );
                self.store.fail(&job.id, &reason, Utc::now());
                self.emit_failed(&job, &reason);
            }
        }
    }

    fn emit_failed(&self, job: &Job, reason: &str) {
        metrics::counter!("queue.jobs_failed", "queue" => job.queue.clone()).increment(1);
        let _ = self.events.send(JobEvent {
            job_id: job.id.clone(),
            queue: job.queue.clone(),
            name: job.name.clone(),
            status: JobEventStatus::Failed,
            failure_reason: Some(reason.to_string()),
        });
    }
}

/// Receive the next ready job id. The receiver is shared by every
/// worker of the queue; the lock is held only while waiting, and the
/// select loop dropping this future on shutdown releases it.
async fn next_ready(ready: &Arc<Mutex<mpsc::UnboundedReceiver<String>>>) -> Option<String> {
    let mut rx = ready.lock().await;
    rx.recv().await
}
