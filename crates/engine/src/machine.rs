//! Per-contact campaign state machine. Walks a contact through a plan's
//! node graph: sends on node entry, arms a deadline when the node waits
//! on engagement, and takes the engaged or timed-out edge when the race
//! settles.
//!
//! The machine itself holds no execution state. Every step is
//! reconstructed from the persisted plan, instance, message, and
//! timeout rows, so replayed jobs and restarts converge on the walk a
//! single clean run would have produced.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use drip_core::types::{
    CampaignInstance, CampaignPlan, ChannelKind, Contact, EdgeKind, EngagementEvent,
    InstanceStatus, MessageStatus, NodeKind, PlanNode, PlanStatus, TimeoutOutcome, TimeoutStatus,
};
use drip_core::{DripError, DripResult};
use drip_dispatch::{DispatchGateway, EmailContent, SendDisposition, SendRequest};
use drip_engagement::EngagementValidator;
use drip_scheduler::{CancelOutcome, FireDecision, TimeoutScheduler};

use crate::instance::InstanceStore;
use crate::leads::ContactDirectory;
use crate::plan::PlanStore;
use crate::suppression::SuppressionList;

/// Where a walk left the instance.
#[derive(Debug)]
pub enum WalkOutcome {
    /// Parked on a wait node with a deadline armed.
    Waiting {
        instance: CampaignInstance,
        timeout_id: String,
    },
    Completed(CampaignInstance),
    Canceled(CampaignInstance),
    /// A concurrent execution owns the current node's send; this walk
    /// backs off and lets it finish the advance.
    InFlightElsewhere(CampaignInstance),
}

/// What an engagement signal ended up doing.
#[derive(Debug, Default)]
pub struct EngagementDisposition {
    /// False when the event id had been ingested before.
    pub recorded: bool,
    /// Instances advanced along their engaged edge.
    pub advanced: Vec<Uuid>,
    /// Cancels that arrived after the timeout had already fired.
    pub lost_race: usize,
}

/// Aggregate statistics for one plan, derived from its instances.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStats {
    pub plan_id: Uuid,
    pub total_entered: u64,
    pub active: u64,
    /// Active instances currently parked on a wait node.
    pub waiting: u64,
    pub completed: u64,
    pub canceled: u64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub timeouts_fired: u64,
    pub timeouts_canceled: u64,
    pub avg_completion_secs: f64,
}

enum StepDelivery {
    Delivered,
    InFlightElsewhere,
    /// Fatal send failure and the plan says to keep walking.
    SkippedAfterFailure,
    /// Fatal send failure and the plan says to cancel the instance.
    CanceledByPolicy,
}

/// Core orchestration: owns the walk logic and the two race handlers.
pub struct CampaignStateMachine {
    plans: Arc<PlanStore>,
    instances: Arc<InstanceStore>,
    scheduler: Arc<TimeoutScheduler>,
    gateway: Arc<DispatchGateway>,
    validator: Arc<EngagementValidator>,
    contacts: Arc<dyn ContactDirectory>,
    suppressions: Arc<SuppressionList>,
}

impl std::fmt::Debug for CampaignStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampaignStateMachine")
            .field("plans", &self.plans.len())
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl CampaignStateMachine {
    pub fn new(
        plans: Arc<PlanStore>,
        instances: Arc<InstanceStore>,
        scheduler: Arc<TimeoutScheduler>,
        gateway: Arc<DispatchGateway>,
        validator: Arc<EngagementValidator>,
        contacts: Arc<dyn ContactDirectory>,
        suppressions: Arc<SuppressionList>,
    ) -> Self {
        Self {
            plans,
            instances,
            scheduler,
            gateway,
            validator,
            contacts,
            suppressions,
        }
    }

    pub fn plans(&self) -> Arc<PlanStore> {
        Arc::clone(&self.plans)
    }

    pub fn instances(&self) -> Arc<InstanceStore> {
        Arc::clone(&self.instances)
    }

    pub fn suppressions(&self) -> Arc<SuppressionList> {
        Arc::clone(&self.suppressions)
    }

    /// Enroll a contact into a plan and walk from the entry node.
    /// Returns `None` when the contact is suppressed. Re-delivery of the
    /// same enrollment resumes from the persisted position instead of
    /// re-sending.
    pub async fn initialize(
        &self,
        plan_id: Uuid,
        tenant_id: Uuid,
        lead_id: Option<Uuid>,
        contact_id: Uuid,
    ) -> DripResult<Option<WalkOutcome>> {
        let plan = self.plans.get_required(plan_id)?;
        if plan.status != PlanStatus::Active {
            return Err(DripError::Validation(format!(
                "plan {plan_id} is not active"
            )));
        }
        if self.suppressions.contains(tenant_id, contact_id) {
            info!(
                plan_id = %plan_id,
                contact_id = %contact_id,
                "Contact is suppressed; skipping enrollment"
            );
            metrics::counter!("instances.suppressed").increment(1);
            return Ok(None);
        }

        let now = Utc::now();
        let (instance, created) = self.instances.create(
            plan_id,
            tenant_id,
            lead_id,
            contact_id,
            &plan.entry_node_id,
            now,
        );

        if created {
            self.plans.mark_executing(plan_id);
            metrics::counter!("instances.entered").increment(1);
            info!(
                instance_id = %instance.id,
                plan_id = %plan_id,
                contact_id = %contact_id,
                "Contact entered campaign"
            );
        } else {
            match instance.status {
                InstanceStatus::Active => {
                    debug!(instance_id = %instance.id, "Enrollment replay; resuming walk")
                }
                InstanceStatus::Completed => {
                    return Ok(Some(WalkOutcome::Completed(instance)));
                }
                InstanceStatus::Canceled => {
                    return Ok(Some(WalkOutcome::Canceled(instance)));
                }
            }
        }

        self.walk(&plan, instance).await.map(Some)
    }

    /// Walk the graph from the instance's current node until it parks
    /// on a wait, completes, or cancels. Each node entry is send-then-
    /// advance; dedupe keys and idempotent arming make re-walks of
    /// already-executed prefixes no-ops.
    async fn walk(
        &self,
        plan: &CampaignPlan,
        mut instance: CampaignInstance,
    ) -> DripResult<WalkOutcome> {
        let mut node_id = instance.current_node_id.clone();
        loop {
            let node = plan.node(&node_id).ok_or_else(|| {
                DripError::Validation(format!("plan {}: node {node_id} missing", plan.id))
            })?;

            match &node.kind {
                NodeKind::End => {
                    let settled = self.instances.complete(instance.id, Utc::now())?;
                    metrics::counter!("instances.completed").increment(1);
                    return Ok(WalkOutcome::Completed(settled));
                }
                NodeKind::Send(cfg) => {
                    match self
                        .deliver(plan, &instance, node, &cfg.template_id, cfg.channel)
                        .await?
                    {
                        StepDelivery::Delivered | StepDelivery::SkippedAfterFailure => {}
                        StepDelivery::InFlightElsewhere => {
                            return Ok(WalkOutcome::InFlightElsewhere(instance));
                        }
                        StepDelivery::CanceledByPolicy => {
                            let settled =
                                self.cancel_instance(instance.id, "send failed fatally")?;
                            return Ok(WalkOutcome::Canceled(settled));
                        }
                    }
                    match &cfg.next {
                        Some(next) => {
                            instance = self.instances.advance(
                                instance.id,
                                next,
                                EdgeKind::Next,
                                Utc::now(),
                            )?;
                            node_id = next.clone();
                        }
                        None => {
                            let settled = self.instances.complete(instance.id, Utc::now())?;
                            metrics::counter!("instances.completed").increment(1);
                            return Ok(WalkOutcome::Completed(settled));
                        }
                    }
                }
                NodeKind::WaitNoOpen(cfg) | NodeKind::WaitNoClick(cfg) => {
                    match self
                        .deliver(plan, &instance, node, &cfg.template_id, cfg.channel)
                        .await?
                    {
                        StepDelivery::Delivered | StepDelivery::SkippedAfterFailure => {}
                        StepDelivery::InFlightElsewhere => {
                            return Ok(WalkOutcome::InFlightElsewhere(instance));
                        }
                        StepDelivery::CanceledByPolicy => {
                            let settled =
                                self.cancel_instance(instance.id, "send failed fatally")?;
                            return Ok(WalkOutcome::Canceled(settled));
                        }
                    }
                    let timeout = self.scheduler.arm(&instance, node, Utc::now())?;
                    return Ok(WalkOutcome::Waiting {
                        instance,
                        timeout_id: timeout.id,
                    });
                }
            }
        }
    }

    /// Send the node's message through the gateway and map the result
    /// onto the walk. Retryable errors propagate so the owning job goes
    /// through the broker's backoff; fatal ones apply the plan's
    /// failure policy.
    async fn deliver(
        &self,
        plan: &CampaignPlan,
        instance: &CampaignInstance,
        node: &PlanNode,
        template_id: &str,
        channel: ChannelKind,
    ) -> DripResult<StepDelivery> {
        let contact = self.contacts.get(instance.contact_id).await?;
        let request = SendRequest {
            tenant_id: instance.tenant_id,
            contact_id: instance.contact_id,
            plan_id: plan.id,
            campaign_instance_id: instance.id,
            node_id: node.id.clone(),
            channel,
            to_email: contact.email.clone(),
            content: render_content(template_id, &contact),
        };

        match self.gateway.send(request).await {
            Ok(outcome) => match outcome.disposition {
                SendDisposition::Sent => Ok(StepDelivery::Delivered),
                SendDisposition::DedupedReplay => {
                    debug!(
                        instance_id = %instance.id,
                        node_id = %node.id,
                        "Send already completed earlier; continuing walk"
                    );
                    Ok(StepDelivery::Delivered)
                }
                SendDisposition::DuplicateInFlight => {
                    debug!(
                        instance_id = %instance.id,
                        node_id = %node.id,
                        "Send owned by a concurrent execution; yielding"
                    );
                    Ok(StepDelivery::InFlightElsewhere)
                }
            },
            Err(err) if err.is_retryable() => Err(err),
            Err(err) => {
                warn!(
                    instance_id = %instance.id,
                    node_id = %node.id,
                    error = %err,
                    "Send failed fatally"
                );
                if plan.cancel_on_send_failure {
                    Ok(StepDelivery::CanceledByPolicy)
                } else {
                    Ok(StepDelivery::SkippedAfterFailure)
                }
            }
        }
    }

    fn cancel_instance(&self, instance_id: Uuid, reason: &str) -> DripResult<CampaignInstance> {
        self.scheduler.cancel_all_for_instance(
            instance_id,
            TimeoutOutcome::CanceledByCaller,
            Utc::now(),
        );
        let settled = self.instances.cancel(instance_id, reason, Utc::now())?;
        metrics::counter!("instances.canceled", "reason" => reason.to_string()).increment(1);
        Ok(settled)
    }

    /// Ingest one engagement signal: record it, then try to cancel the
    /// matching pending timeout on every targeted instance. Instances
    /// whose cancel wins advance along the engaged edge; where the
    /// timeout already fired, the signal is recorded and nothing moves.
    pub async fn handle_engagement(
        &self,
        event: EngagementEvent,
    ) -> DripResult<EngagementDisposition> {
        let recorded = self.validator.record(event.clone()).await?;
        metrics::counter!("engagement.received", "kind" => event.kind.as_str()).increment(1);
        if !recorded {
            // Duplicate webhook delivery. Routing again is harmless and
            // covers a crash between the first record and its cancel.
            debug!(event_id = %event.id, "Duplicate engagement event; routing again");
        }

        let targets: Vec<CampaignInstance> = match event.campaign_instance_id {
            Some(id) => self.instances.get(id).into_iter().collect(),
            None => self
                .instances
                .active_for_contact(event.tenant_id, event.contact_id),
        };

        let mut disposition = EngagementDisposition {
            recorded,
            ..Default::default()
        };

        for instance in targets {
            if instance.status != InstanceStatus::Active {
                continue;
            }
            let Some(plan) = self.plans.get(instance.plan_id) else {
                warn!(plan_id = %instance.plan_id, "Engagement for instance of unknown plan");
                continue;
            };
            let Some(node) = plan.node(&instance.current_node_id) else {
                continue;
            };
            let (Some(kind), Some(config)) = (node.timeout_kind(), node.wait_config()) else {
                continue;
            };
            // Kinds match exactly: an open never satisfies a no-click wait.
            if kind.engagement_kind() != event.kind {
                continue;
            }

            match self.scheduler.cancel(
                instance.id,
                &node.id,
                instance.contact_id,
                kind,
                TimeoutOutcome::CanceledByEngagement,
                Utc::now(),
            ) {
                CancelOutcome::Canceled(_) => {
                    info!(
                        instance_id = %instance.id,
                        node_id = %node.id,
                        kind = event.kind.as_str(),
                        "Engagement canceled pending timeout"
                    );
                    match &config.on_engaged {
                        Some(target) => {
                            let advanced = self.instances.advance(
                                instance.id,
                                target,
                                EdgeKind::Engaged,
                                Utc::now(),
                            )?;
                            self.walk(&plan, advanced).await?;
                        }
                        None => {
                            self.instances.complete(instance.id, Utc::now())?;
                            metrics::counter!("instances.completed").increment(1);
                        }
                    }
                    disposition.advanced.push(instance.id);
                }
                CancelOutcome::AlreadyFired(_) => {
                    info!(
                        instance_id = %instance.id,
                        node_id = %node.id,
                        "Engagement lost the race; timeout already fired"
                    );
                    metrics::counter!("engagement.lost_race").increment(1);
                    disposition.lost_race += 1;
                }
                CancelOutcome::AlreadyCanceled(_) | CancelOutcome::NotFound => {
                    debug!(
                        instance_id = %instance.id,
                        "No pending timeout for this engagement"
                    );
                }
            }
        }

        Ok(disposition)
    }

    /// Run when a timeout job comes due. Adjudication happens first;
    /// only a genuine `Proceed` takes the timed-out edge.
    pub async fn handle_timeout_fired(&self, timeout_id: &str) -> DripResult<Option<WalkOutcome>> {
        let job = match self.scheduler.resolve_fire(timeout_id, Utc::now()).await? {
            FireDecision::AlreadyCanceled(_) => {
                return Ok(None);
            }
            FireDecision::SupersededByEngagement { job, events } => {
                debug!(
                    timeout_id = %timeout_id,
                    instance_id = %job.campaign_instance_id,
                    events = events,
                    "Timeout superseded by engagement; no branch taken"
                );
                return Ok(None);
            }
            FireDecision::Proceed(job) => job,
        };

        let instance = self.instances.get_required(job.campaign_instance_id)?;
        if instance.status != InstanceStatus::Active {
            debug!(
                instance_id = %instance.id,
                timeout_id = %timeout_id,
                "Timeout fired for settled instance; no-op"
            );
            return Ok(None);
        }
        if instance.current_node_id != job.node_id {
            debug!(
                instance_id = %instance.id,
                timeout_id = %timeout_id,
                current = %instance.current_node_id,
                "Instance already moved past node; stale fire ignored"
            );
            return Ok(None);
        }

        let plan = self.plans.get_required(instance.plan_id)?;
        let node = plan.node(&job.node_id).ok_or_else(|| {
            DripError::Validation(format!("plan {}: node {} missing", plan.id, job.node_id))
        })?;
        let config = node.wait_config().ok_or_else(|| {
            DripError::Validation(format!(
                "timeout fired for non-wait node {} in plan {}",
                job.node_id, plan.id
            ))
        })?;

        match &config.on_timed_out {
            Some(target) => {
                let advanced =
                    self.instances
                        .advance(instance.id, target, EdgeKind::TimedOut, Utc::now())?;
                info!(
                    instance_id = %instance.id,
                    from = %job.node_id,
                    to = %target,
                    "Timed-out edge taken"
                );
                self.walk(&plan, advanced).await.map(Some)
            }
            None => {
                let settled = self.instances.complete(instance.id, Utc::now())?;
                metrics::counter!("instances.completed").increment(1);
                Ok(Some(WalkOutcome::Completed(settled)))
            }
        }
    }

    /// Suppress the contact and cancel everything in flight for them.
    /// No further timeouts are armed for a canceled instance.
    pub async fn handle_unsubscribe(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        reason: &str,
    ) -> DripResult<usize> {
        self.suppressions.add(tenant_id, contact_id, reason);

        let mut canceled = 0;
        for instance in self.instances.active_for_contact(tenant_id, contact_id) {
            self.scheduler.cancel_all_for_instance(
                instance.id,
                TimeoutOutcome::CanceledByCaller,
                Utc::now(),
            );
            self.instances.cancel(instance.id, reason, Utc::now())?;
            canceled += 1;
        }
        if canceled > 0 {
            metrics::counter!("instances.canceled", "reason" => "unsubscribed")
                .increment(canceled as u64);
        }
        info!(
            tenant_id = %tenant_id,
            contact_id = %contact_id,
            canceled = canceled,
            "Unsubscribe processed"
        );
        Ok(canceled)
    }

    /// Computes aggregate statistics for the given plan from its
    /// instances, messages, and timeout rows.
    pub fn plan_stats(&self, plan_id: Uuid) -> PlanStats {
        let plan = self.plans.get(plan_id);
        let wait_nodes: HashMap<&str, ()> = plan
            .as_ref()
            .map(|p| {
                p.nodes
                    .iter()
                    .filter(|n| n.timeout_kind().is_some())
                    .map(|n| (n.id.as_str(), ()))
                    .collect()
            })
            .unwrap_or_default();

        let mut stats = PlanStats {
            plan_id,
            total_entered: 0,
            active: 0,
            waiting: 0,
            completed: 0,
            canceled: 0,
            messages_sent: 0,
            messages_failed: 0,
            timeouts_fired: 0,
            timeouts_canceled: 0,
            avg_completion_secs: 0.0,
        };
        let mut total_completion_secs: f64 = 0.0;
        let mut completion_count: u64 = 0;

        let messages = self.gateway.messages();
        let timeouts = self.scheduler.timeouts();

        for instance in self.instances.for_plan(plan_id) {
            stats.total_entered += 1;
            match instance.status {
                InstanceStatus::Active => {
                    stats.active += 1;
                    if wait_nodes.contains_key(instance.current_node_id.as_str()) {
                        stats.waiting += 1;
                    }
                }
                InstanceStatus::Completed => {
                    stats.completed += 1;
                    total_completion_secs += instance
                        .updated_at
                        .signed_duration_since(instance.entered_at)
                        .num_seconds() as f64;
                    completion_count += 1;
                }
                InstanceStatus::Canceled => stats.canceled += 1,
            }

            for message in messages.for_instance(instance.id) {
                match message.status {
                    MessageStatus::Sent => stats.messages_sent += 1,
                    MessageStatus::Failed => stats.messages_failed += 1,
                    MessageStatus::Queued => {}
                }
            }
            for timeout in timeouts.for_instance(instance.id) {
                match timeout.status {
                    TimeoutStatus::Fired => stats.timeouts_fired += 1,
                    TimeoutStatus::Canceled => stats.timeouts_canceled += 1,
                    TimeoutStatus::Scheduled => {}
                }
            }
        }

        if completion_count > 0 {
            stats.avg_completion_secs = total_completion_secs / completion_count as f64;
        }
        stats
    }
}

/// Minimal deterministic rendering: the subject comes from the template
/// id, the body from the contact. Template storage itself lives outside
/// the engine.
fn render_content(template_id: &str, contact: &Contact) -> EmailContent {
    let name = contact.full_name.as_deref().unwrap_or("there");
    let subject = template_id
        .split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    EmailContent {
        subject,
        body: format!("Hi {name},\n\nWe wanted to share a quick update with you.\n\nThe DripExpress Team"),
    }
}
