//! Arms wait-node deadlines as delayed queue jobs and adjudicates the
//! race between engagement signals and the deadline once it comes due.
//!
//! The persisted row status is the source of truth: cancellation and
//! firing both CAS the row, and whichever transition lands first wins.
//! Queue-level delivery is allowed to be at-least-once; everything here
//! is safe to replay.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use drip_core::config::SchedulerConfig;
use drip_core::types::{
    CampaignInstance, PlanNode, TimeoutJob, TimeoutKind, TimeoutOutcome, TimeoutStatus,
};
use drip_core::{duration, keys, queues, DripError, DripResult};
use drip_engagement::EngagementValidator;
use drip_queue::{JobOptions, QueueBroker};

use crate::store::{CancelOutcome, TimeoutStore};

/// Payload of a `campaign_execution.timeout` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutFirePayload {
    pub timeout_id: String,
}

/// What the fire handler should do with a due timeout.
#[derive(Debug)]
pub enum FireDecision {
    /// No qualifying engagement inside the window; take the timed-out
    /// edge.
    Proceed(TimeoutJob),
    /// A qualifying event landed inside `[armed_at, fire_at]`. The
    /// engagement path owns any advance; no branch is taken here.
    SupersededByEngagement { job: TimeoutJob, events: usize },
    /// The row was canceled before the deadline; nothing to do.
    AlreadyCanceled(TimeoutJob),
}

/// Schedules and resolves wait-node deadlines.
pub struct TimeoutScheduler {
    timeouts: Arc<TimeoutStore>,
    broker: Arc<QueueBroker>,
    validator: Arc<EngagementValidator>,
    defaults: SchedulerConfig,
}

impl TimeoutScheduler {
    pub fn new(
        timeouts: Arc<TimeoutStore>,
        broker: Arc<QueueBroker>,
        validator: Arc<EngagementValidator>,
        defaults: SchedulerConfig,
    ) -> Self {
        Self {
            timeouts,
            broker,
            validator,
            defaults,
        }
    }

    pub fn timeouts(&self) -> Arc<TimeoutStore> {
        Arc::clone(&self.timeouts)
    }

    fn default_timeout(&self, kind: TimeoutKind) -> &str {
        match kind {
            TimeoutKind::NoOpen => &self.defaults.default_no_open_timeout,
            TimeoutKind::NoClick => &self.defaults.default_no_click_timeout,
        }
    }

    /// Arm the wait deadline for a node the instance just entered. The
    /// duration is parsed here, once; the absolute `fire_at` it yields
    /// is what gets persisted and never moves afterwards.
    ///
    /// Idempotent per (instance, node, contact, kind): a re-arm while a
    /// row exists collapses onto it, and the delayed queue job shares
    /// the row's id so duplicate enqueues are dropped by the broker.
    pub fn arm(
        &self,
        instance: &CampaignInstance,
        node: &PlanNode,
        now: DateTime<Utc>,
    ) -> DripResult<TimeoutJob> {
        let (kind, config) = match (node.timeout_kind(), node.wait_config()) {
            (Some(kind), Some(config)) => (kind, config),
            _ => {
                return Err(DripError::Validation(format!(
                    "node {} does not wait on engagement",
                    node.id
                )))
            }
        };

        let spec = config
            .timeout
            .as_deref()
            .unwrap_or_else(|| self.default_timeout(kind));
        let fire_at = now + duration::parse(spec)?;

        let id = keys::timeout_job_id(instance.id, &node.id, instance.contact_id, kind);
        let (job, created) = self.timeouts.insert(TimeoutJob {
            id: id.clone(),
            tenant_id: instance.tenant_id,
            campaign_instance_id: instance.id,
            node_id: node.id.clone(),
            contact_id: instance.contact_id,
            kind,
            armed_at: now,
            fire_at,
            status: TimeoutStatus::Scheduled,
            outcome: None,
            cancel_requested_at: None,
        });

        if created {
            metrics::counter!("timeouts.armed", "kind" => kind.as_str()).increment(1);
            info!(
                timeout_id = %id,
                instance_id = %instance.id,
                kind = kind.as_str(),
                fire_at = %job.fire_at,
                "Timeout armed"
            );
        } else {
            debug!(timeout_id = %id, "Re-arm collapsed onto existing timeout");
        }

        // Enqueue even on collapse: the broker drops duplicates by id,
        // and a lost delayed job gets restored this way.
        self.broker.enqueue(
            queues::CAMPAIGN_EXECUTION,
            queues::JOB_TIMEOUT,
            serde_json::to_value(TimeoutFirePayload {
                timeout_id: id.clone(),
            })?,
            JobOptions::delayed(id, job.fire_at - now),
        );

        Ok(job)
    }

    /// Cancel the pending deadline for one (instance, node, contact,
    /// kind) tuple. Once the fire path has started, cancellation is
    /// recorded on the row but has no further effect.
    pub fn cancel(
        &self,
        campaign_instance_id: Uuid,
        node_id: &str,
        contact_id: Uuid,
        kind: TimeoutKind,
        outcome: TimeoutOutcome,
        now: DateTime<Utc>,
    ) -> CancelOutcome {
        let id = keys::timeout_job_id(campaign_instance_id, node_id, contact_id, kind);
        let result = self.timeouts.cancel(&id, outcome, now);
        match &result {
            CancelOutcome::Canceled(_) => {
                metrics::counter!("timeouts.canceled", "reason" => reason_label(outcome))
                    .increment(1);
                info!(timeout_id = %id, reason = reason_label(outcome), "Timeout canceled");
            }
            CancelOutcome::AlreadyFired(_) => {
                info!(timeout_id = %id, "Cancel arrived after fire; recorded only");
            }
            CancelOutcome::AlreadyCanceled(_) => {
                debug!(timeout_id = %id, "Timeout already canceled");
            }
            CancelOutcome::NotFound => {
                debug!(timeout_id = %id, "Cancel for unknown timeout ignored");
            }
        }
        result
    }

    /// Cancel every scheduled deadline for an instance. Used when the
    /// instance itself exits (unsubscribe, fatal send, completion).
    pub fn cancel_all_for_instance(
        &self,
        campaign_instance_id: Uuid,
        outcome: TimeoutOutcome,
        now: DateTime<Utc>,
    ) -> usize {
        let mut canceled = 0;
        for job in self.timeouts.scheduled_for_instance(campaign_instance_id) {
            if matches!(
                self.timeouts.cancel(&job.id, outcome, now),
                CancelOutcome::Canceled(_)
            ) {
                canceled += 1;
            }
        }
        if canceled > 0 {
            metrics::counter!("timeouts.canceled", "reason" => reason_label(outcome))
                .increment(canceled as u64);
            info!(
                instance_id = %campaign_instance_id,
                count = canceled,
                "Canceled pending timeouts for instance"
            );
        }
        canceled
    }

    /// Adjudicate a due timeout. Called at the start of the fire
    /// handler, before any branch action.
    ///
    /// The row status decides first: a canceled row is a no-op. A still
    /// scheduled row gets one last engagement check over the armed
    /// window, catching signals that were ingested but never reached the
    /// cancel path. A row already marked fired is resumed, so a crash
    /// between marking and branching replays to the same outcome.
    pub async fn resolve_fire(
        &self,
        timeout_id: &str,
        now: DateTime<Utc>,
    ) -> DripResult<FireDecision> {
        let job = self
            .timeouts
            .get(timeout_id)
            .ok_or_else(|| DripError::NotFound(format!("timeout job {timeout_id}")))?;

        match job.status {
            TimeoutStatus::Canceled => {
                debug!(timeout_id = %timeout_id, "Fire for canceled timeout; no-op");
                return Ok(FireDecision::AlreadyCanceled(job));
            }
            TimeoutStatus::Fired => {
                debug!(timeout_id = %timeout_id, "Replayed fire delivery; resuming");
                return Ok(FireDecision::Proceed(job));
            }
            TimeoutStatus::Scheduled => {}
        }

        let summary = self
            .validator
            .has_qualifying_event(
                job.tenant_id,
                job.contact_id,
                Some(job.campaign_instance_id),
                job.kind.engagement_kind(),
                job.armed_at,
                job.fire_at,
            )
            .await;

        if summary.has_events {
            return match self
                .timeouts
                .cancel(timeout_id, TimeoutOutcome::CanceledByEngagement, now)
            {
                CancelOutcome::Canceled(job) => {
                    metrics::counter!("timeouts.superseded", "kind" => job.kind.as_str())
                        .increment(1);
                    info!(
                        timeout_id = %timeout_id,
                        events = summary.count,
                        "Engagement found in window; timeout superseded"
                    );
                    Ok(FireDecision::SupersededByEngagement {
                        job,
                        events: summary.count,
                    })
                }
                CancelOutcome::AlreadyCanceled(job) => Ok(FireDecision::AlreadyCanceled(job)),
                CancelOutcome::AlreadyFired(job) => Ok(FireDecision::Proceed(job)),
                CancelOutcome::NotFound => {
                    Err(DripError::NotFound(format!("timeout job {timeout_id}")))
                }
            };
        }

        match self.timeouts.mark_fired(timeout_id) {
            Some(fired) => {
                metrics::counter!("timeouts.fired", "kind" => fired.kind.as_str()).increment(1);
                info!(timeout_id = %timeout_id, kind = fired.kind.as_str(), "Timeout fired");
                Ok(FireDecision::Proceed(fired))
            }
            // A concurrent cancel slipped in between the status read and
            // the CAS; the cancel wins.
            None => match self.timeouts.get(timeout_id) {
                Some(job) if job.status == TimeoutStatus::Fired => Ok(FireDecision::Proceed(job)),
                Some(job) => {
                    debug!(timeout_id = %timeout_id, "Cancel won the fire race");
                    Ok(FireDecision::AlreadyCanceled(job))
                }
                None => Err(DripError::NotFound(format!("timeout job {timeout_id}"))),
            },
        }
    }
}

fn reason_label(outcome: TimeoutOutcome) -> &'static str {
    match outcome {
        TimeoutOutcome::CanceledByCaller => "caller",
        TimeoutOutcome::CanceledByEngagement => "engagement",
        TimeoutOutcome::Elapsed => "elapsed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use drip_core::config::QueueConfig;
    use drip_core::types::{
        ChannelKind, EngagementEvent, EngagementKind, InstanceStatus, NodeKind, WaitConfig,
    };
    use drip_engagement::{in_memory_store, EngagementStore};
    use drip_queue::JobStore;

    fn wait_node(id: &str, timeout: Option<&str>) -> PlanNode {
        PlanNode {
            id: id.to_string(),
            kind: NodeKind::WaitNoOpen(WaitConfig {
                template_id: "tpl-1".to_string(),
                channel: ChannelKind::Email,
                timeout: timeout.map(|t| t.to_string()),
                on_engaged: Some("end".to_string()),
                on_timed_out: Some("send-2".to_string()),
            }),
        }
    }

    fn instance() -> CampaignInstance {
        let now = Utc::now();
        CampaignInstance {
            id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            lead_id: None,
            contact_id: Uuid::new_v4(),
            current_node_id: "wait-1".to_string(),
            status: InstanceStatus::Active,
            history: Vec::new(),
            entered_at: now,
            updated_at: now,
            completed_at: None,
            exit_reason: None,
        }
    }

    fn scheduler() -> (TimeoutScheduler, Arc<dyn EngagementStore>) {
        let store = in_memory_store();
        let validator = Arc::new(EngagementValidator::new(store.clone()));
        let broker = Arc::new(QueueBroker::new(
            Arc::new(JobStore::new()),
            &QueueConfig::default(),
        ));
        let scheduler = TimeoutScheduler::new(
            Arc::new(TimeoutStore::new()),
            broker,
            validator,
            SchedulerConfig::default(),
        );
        (scheduler, store)
    }

    fn open_event(job: &TimeoutJob, occurred_at: DateTime<Utc>) -> EngagementEvent {
        EngagementEvent {
            id: Uuid::new_v4(),
            tenant_id: job.tenant_id,
            contact_id: job.contact_id,
            campaign_instance_id: Some(job.campaign_instance_id),
            kind: EngagementKind::Open,
            occurred_at,
            source: "webhook".to_string(),
        }
    }

    #[tokio::test]
    async fn test_arm_is_idempotent_and_enqueues_one_job() {
        let (scheduler, _) = scheduler();
        let inst = instance();
        let node = wait_node("wait-1", Some("PT24H"));
        let now = Utc::now();

        let first = scheduler.arm(&inst, &node, now).unwrap();
        let second = scheduler.arm(&inst, &node, now + Duration::minutes(5)).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.fire_at, second.fire_at);
        assert_eq!(scheduler.broker.store().len(), 1);
    }

    #[tokio::test]
    async fn test_arm_falls_back_to_default_duration() {
        let (scheduler, _) = scheduler();
        let inst = instance();
        let now = Utc::now();

        let job = scheduler.arm(&inst, &wait_node("wait-1", None), now).unwrap();
        // No-open default is 72 hours.
        assert_eq!(job.fire_at, now + Duration::hours(72));
    }

    #[tokio::test]
    async fn test_arm_rejects_send_nodes() {
        let (scheduler, _) = scheduler();
        let node = PlanNode {
            id: "end".to_string(),
            kind: NodeKind::End,
        };
        let err = scheduler.arm(&instance(), &node, Utc::now()).unwrap_err();
        assert!(matches!(err, DripError::Validation(_)));
    }

    // Engagement at T+1h, cancel lands before the deadline: the fire
    // handler sees a canceled row and takes no branch.
    #[tokio::test]
    async fn test_canceled_timeout_fires_as_noop() {
        let (scheduler, store) = scheduler();
        let inst = instance();
        let now = Utc::now();
        let job = scheduler
            .arm(&inst, &wait_node("wait-1", Some("PT24H")), now)
            .unwrap();

        store
            .append(open_event(&job, now + Duration::hours(1)))
            .await
            .unwrap();
        let canceled = scheduler.cancel(
            inst.id,
            "wait-1",
            inst.contact_id,
            TimeoutKind::NoOpen,
            TimeoutOutcome::CanceledByEngagement,
            now + Duration::hours(1),
        );
        assert!(matches!(canceled, CancelOutcome::Canceled(_)));

        let decision = scheduler
            .resolve_fire(&job.id, now + Duration::hours(24))
            .await
            .unwrap();
        assert!(matches!(decision, FireDecision::AlreadyCanceled(_)));
    }

    // Engagement was ingested but the cancel never happened (e.g. crash
    // between record and cancel): the window check still catches it.
    #[tokio::test]
    async fn test_uncanceled_engagement_supersedes_fire() {
        let (scheduler, store) = scheduler();
        let inst = instance();
        let now = Utc::now();
        let job = scheduler
            .arm(&inst, &wait_node("wait-1", Some("PT24H")), now)
            .unwrap();

        store
            .append(open_event(&job, now + Duration::hours(2)))
            .await
            .unwrap();

        let decision = scheduler
            .resolve_fire(&job.id, now + Duration::hours(24))
            .await
            .unwrap();
        match decision {
            FireDecision::SupersededByEngagement { job, events } => {
                assert_eq!(events, 1);
                assert_eq!(job.status, TimeoutStatus::Canceled);
                assert_eq!(job.outcome, Some(TimeoutOutcome::CanceledByEngagement));
            }
            other => panic!("expected SupersededByEngagement, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_quiet_window_proceeds_along_timed_out_edge() {
        let (scheduler, store) = scheduler();
        let inst = instance();
        let now = Utc::now();
        let job = scheduler
            .arm(&inst, &wait_node("wait-1", Some("PT24H")), now)
            .unwrap();

        // An event after the deadline does not count.
        store
            .append(open_event(&job, now + Duration::hours(30)))
            .await
            .unwrap();

        let decision = scheduler
            .resolve_fire(&job.id, now + Duration::hours(24))
            .await
            .unwrap();
        match decision {
            FireDecision::Proceed(job) => {
                assert_eq!(job.status, TimeoutStatus::Fired);
                assert_eq!(job.outcome, Some(TimeoutOutcome::Elapsed));
            }
            other => panic!("expected Proceed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_kind_event_does_not_satisfy_wait() {
        let (scheduler, store) = scheduler();
        let inst = instance();
        let now = Utc::now();
        // Wait is no-click; only a click should supersede it.
        let node = PlanNode {
            id: "wait-1".to_string(),
            kind: NodeKind::WaitNoClick(WaitConfig {
                template_id: "tpl-1".to_string(),
                channel: ChannelKind::Email,
                timeout: Some("PT24H".to_string()),
                on_engaged: None,
                on_timed_out: None,
            }),
        };
        let job = scheduler.arm(&inst, &node, now).unwrap();

        store
            .append(open_event(&job, now + Duration::hours(1)))
            .await
            .unwrap();

        let decision = scheduler
            .resolve_fire(&job.id, now + Duration::hours(24))
            .await
            .unwrap();
        assert!(matches!(decision, FireDecision::Proceed(_)));
    }

    // Cancel at T+25h, after the fire at T+24h: recorded, no state change.
    #[tokio::test]
    async fn test_late_cancel_after_fire_is_recorded_only() {
        let (scheduler, _) = scheduler();
        let inst = instance();
        let now = Utc::now();
        let job = scheduler
            .arm(&inst, &wait_node("wait-1", Some("PT24H")), now)
            .unwrap();

        let decision = scheduler
            .resolve_fire(&job.id, now + Duration::hours(24))
            .await
            .unwrap();
        assert!(matches!(decision, FireDecision::Proceed(_)));

        let outcome = scheduler.cancel(
            inst.id,
            "wait-1",
            inst.contact_id,
            TimeoutKind::NoOpen,
            TimeoutOutcome::CanceledByCaller,
            now + Duration::hours(25),
        );
        assert!(matches!(outcome, CancelOutcome::AlreadyFired(_)));

        let row = scheduler.timeouts().get(&job.id).unwrap();
        assert_eq!(row.status, TimeoutStatus::Fired);
        assert_eq!(row.outcome, Some(TimeoutOutcome::Elapsed));
        assert!(row.cancel_requested_at.is_some());
    }

    #[tokio::test]
    async fn test_replayed_fire_resumes_instead_of_erroring() {
        let (scheduler, _) = scheduler();
        let inst = instance();
        let now = Utc::now();
        let job = scheduler
            .arm(&inst, &wait_node("wait-1", Some("PT24H")), now)
            .unwrap();

        let first = scheduler
            .resolve_fire(&job.id, now + Duration::hours(24))
            .await
            .unwrap();
        assert!(matches!(first, FireDecision::Proceed(_)));

        // Redelivery of the same job after a crash mid-branch.
        let replay = scheduler
            .resolve_fire(&job.id, now + Duration::hours(24))
            .await
            .unwrap();
        assert!(matches!(replay, FireDecision::Proceed(_)));
    }

    #[tokio::test]
    async fn test_cancel_all_for_instance() {
        let (scheduler, _) = scheduler();
        let inst = instance();
        let now = Utc::now();
        scheduler
            .arm(&inst, &wait_node("wait-1", Some("PT24H")), now)
            .unwrap();
        scheduler
            .arm(&inst, &wait_node("wait-2", Some("PT48H")), now)
            .unwrap();

        let canceled =
            scheduler.cancel_all_for_instance(inst.id, TimeoutOutcome::CanceledByCaller, now);
        assert_eq!(canceled, 2);
        assert!(scheduler.timeouts().scheduled_for_instance(inst.id).is_empty());
    }
}
