use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use drip_core::config::QueueConfig;

use crate::handler::{HandlerRegistry, JobHandler};
use crate::job::{EnqueueOutcome, Job, JobEvent, JobOptions};
use crate::retry::RetryPolicy;
use crate::store::{JobStore, QueueCounts, RetentionPolicy};
use crate::worker::QueueWorker;

/// Ready-signal channel for one named queue, shared by its workers.
struct QueueLane {
    tx: mpsc::UnboundedSender<String>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
}

impl QueueLane {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

/// In-process job broker: durable rows in a shared [`JobStore`], worker
/// pools per named queue, a promotion loop for delayed jobs, retention
/// sweeping, and a broadcast stream of terminal job events.
///
/// Handlers must be registered before [`start`](Self::start); jobs may
/// be enqueued at any time. Rebuilding a broker over the same store
/// resumes exactly where the previous process stopped.
pub struct QueueBroker {
    store: Arc<JobStore>,
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
    workers_per_queue: usize,
    promotion_interval: std::time::Duration,
    sweep_interval: std::time::Duration,
    completed_retention: RetentionPolicy,
    failed_retention: RetentionPolicy,
    lanes: Arc<DashMap<String, QueueLane>>,
    events_tx: broadcast::Sender<JobEvent>,
    shutdown_tx: broadcast::Sender<()>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl QueueBroker {
    pub fn new(store: Arc<JobStore>, config: &QueueConfig) -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            store,
            registry: Arc::new(HandlerRegistry::new()),
            retry: RetryPolicy::from_config(config),
            workers_per_queue: config.workers_per_queue.max(1),
            promotion_interval: std::time::Duration::from_millis(config.promotion_interval_ms.max(1)),
            sweep_interval: std::time::Duration::from_secs(config.sweep_interval_secs.max(1)),
            completed_retention: RetentionPolicy {
                max_age: chrono::Duration::seconds(config.completed_max_age_secs as i64),
                max_count: config.completed_max_count,
            },
            failed_retention: RetentionPolicy {
                max_age: chrono::Duration::seconds(config.failed_max_age_secs as i64),
                max_count: config.failed_max_count,
            },
            lanes: Arc::new(DashMap::new()),
            events_tx,
            shutdown_tx,
            handles: parking_lot::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> Arc<JobStore> {
        self.store.clone()
    }

    pub fn register_handler(&self, queue: &str, name: &str, handler: Arc<dyn JobHandler>) {
        self.registry.register(queue, name, handler);
        self.lanes.entry(queue.to_string()).or_insert_with(QueueLane::new);
    }

    /// Subscribe to terminal job events (completions and failures).
    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.events_tx.subscribe()
    }

    /// Durably add a job. An id that already exists in any state makes
    /// this a no-op duplicate; retention pruning is what frees ids.
    pub fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> EnqueueOutcome {
        let job = Job::new(queue, name, payload, &options, self.retry.max_attempts);
        let job_id = job.id.clone();
        let delayed = job.state == crate::job::JobState::Delayed;

        if !self.store.insert(job) {
            debug!(job_id = %job_id, queue = %queue, "Duplicate enqueue ignored");
            metrics::counter!("queue.jobs_duplicate", "queue" => queue.to_string()).increment(1);
            return EnqueueOutcome::Duplicate { job_id };
        }

        metrics::counter!("queue.jobs_enqueued", "queue" => queue.to_string()).increment(1);
        if !delayed {
            self.signal_ready(queue, job_id.clone());
        }
        EnqueueOutcome::Accepted { job_id }
    }

    fn signal_ready(&self, queue: &str, job_id: String) {
        let lane = self
            .lanes
            .entry(queue.to_string())
            .or_insert_with(QueueLane::new);
        let _ = lane.tx.send(job_id);
    }

    /// Recover persisted state and spawn the worker pools, promotion
    /// loop, and retention sweeper.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Queue broker already started");
            return;
        }

        let reset = self.store.reset_stale_active();
        if !reset.is_empty() {
            info!(
                count = reset.len(),
                "Reset stale active jobs from interrupted run"
            );
        }
        for (queue, job_id) in self.store.waiting_jobs() {
            self.signal_ready(&queue, job_id);
        }

        let mut handles = self.handles.lock();
        for lane in self.lanes.iter() {
            let queue = lane.key().clone();
            for i in 0..self.workers_per_queue {
                let worker = QueueWorker::new(
                    format!("{queue}-worker-{i:02}"),
                    queue.clone(),
                    self.store.clone(),
                    self.registry.clone(),
                    self.retry.clone(),
                    lane.rx.clone(),
                    self.events_tx.clone(),
                    self.shutdown_tx.subscribe(),
                );
                handles.push(worker.spawn());
            }
            info!(queue = %queue, workers = self.workers_per_queue, "Worker pool started");
        }
        handles.push(self.spawn_promotion_loop());
        handles.push(self.spawn_retention_sweeper());

        info!(
            queues = self.lanes.len(),
            handlers = self.registry.len(),
            "Queue broker started"
        );
    }

    fn spawn_promotion_loop(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let lanes = self.lanes.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = self.promotion_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        for (queue, job_id) in store.promote_due(Utc::now()) {
                            debug!(job_id = %job_id, queue = %queue, "Delayed job promoted");
                            if let Some(lane) = lanes.get(&queue) {
                                let _ = lane.tx.send(job_id);
                            }
                        }
                    }
                }
            }
        })
    }

    fn spawn_retention_sweeper(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let completed = self.completed_retention.clone();
        let failed = self.failed_retention.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = self.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let removed = store.prune(&completed, &failed, Utc::now());
                        if removed > 0 {
                            debug!(removed, "Retention sweep pruned terminal jobs");
                            metrics::counter!("queue.jobs_pruned").increment(removed as u64);
                        }
                        for (queue, counts) in store.counts_by_queue() {
                            metrics::gauge!("queue.depth", "queue" => queue.clone(), "state" => "waiting")
                                .set(counts.waiting as f64);
                            metrics::gauge!("queue.depth", "queue" => queue, "state" => "delayed")
                                .set(counts.delayed as f64);
                        }
                    }
                }
            }
        })
    }

    /// Stop accepting work and join every task. In-flight jobs finish;
    /// waiting jobs stay durable for the next start.
    pub async fn shutdown(&self) {
        info!("Queue broker shutting down");
        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Queue task panicked");
            }
        }
    }

    pub fn queue_depths(&self) -> std::collections::HashMap<String, QueueCounts> {
        self.store.counts_by_queue()
    }
}
