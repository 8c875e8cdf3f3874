//! Queue handlers for the lead pipeline and campaign execution. Each
//! handler is a thin, idempotent adapter: payloads in, engine calls out.
//! Hops between stages go through the broker with deterministic job ids,
//! so a replayed stage re-enqueues the same downstream job and the
//! broker drops the duplicate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use drip_core::{keys, queues, DripResult};
use drip_queue::{Job, JobHandler, JobOptions, QueueBroker};
use drip_scheduler::TimeoutFirePayload;

use crate::leads::{ContactDirectory, LeadAnalyzer, LeadStore};
use crate::machine::CampaignStateMachine;

/// Payload of a `lead_initial_processing.process` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadProcessPayload {
    pub tenant_id: Uuid,
    pub lead_id: Uuid,
}

/// Payload of a `lead_analysis.process` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadAnalysisPayload {
    pub tenant_id: Uuid,
    pub lead_id: Uuid,
}

/// Payload of a `campaign_creation.create` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignCreatePayload {
    pub tenant_id: Uuid,
    pub lead_id: Uuid,
    pub plan_id: Uuid,
}

/// Payload of a `campaign_execution.initialize` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignInitializePayload {
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub contact_id: Uuid,
}

/// Which plan qualified leads of a tenant are enrolled into.
#[derive(Default)]
pub struct DefaultPlans {
    plans: DashMap<Uuid, Uuid>,
}

impl DefaultPlans {
    pub fn new() -> Self {
        Self {
            plans: DashMap::new(),
        }
    }

    pub fn assign(&self, tenant_id: Uuid, plan_id: Uuid) {
        self.plans.insert(tenant_id, plan_id);
    }

    pub fn get(&self, tenant_id: Uuid) -> Option<Uuid> {
        self.plans.get(&tenant_id).map(|p| *p)
    }
}

/// `lead_initial_processing.process`: normalize the lead's contacts into
/// the directory and hand the lead to analysis.
pub struct LeadInitialProcessingHandler {
    leads: Arc<LeadStore>,
    contacts: Arc<dyn ContactDirectory>,
    broker: Arc<QueueBroker>,
}

#[async_trait]
impl JobHandler for LeadInitialProcessingHandler {
    async fn handle(&self, job: &Job) -> DripResult<()> {
        let payload: LeadProcessPayload = serde_json::from_value(job.payload.clone())?;
        let lead = self.leads.get_required(payload.lead_id)?;

        let mut usable = 0;
        for contact in &lead.contacts {
            let email = contact.email.trim().to_lowercase();
            if !email.contains('@') {
                warn!(
                    lead_id = %lead.id,
                    contact_id = %contact.id,
                    "Contact has no usable email; skipped"
                );
                continue;
            }
            let mut normalized = contact.clone();
            normalized.email = email;
            self.contacts.upsert(normalized).await?;
            usable += 1;
        }
        metrics::counter!("leads.processed").increment(1);
        info!(
            lead_id = %lead.id,
            company = %lead.company,
            contacts = usable,
            "Lead contacts normalized"
        );

        self.broker.enqueue(
            queues::LEAD_ANALYSIS,
            queues::JOB_PROCESS,
            serde_json::to_value(LeadAnalysisPayload {
                tenant_id: payload.tenant_id,
                lead_id: payload.lead_id,
            })?,
            JobOptions::with_job_id(keys::lead_analysis_job_id(payload.lead_id)),
        );
        Ok(())
    }
}

/// `lead_analysis.process`: score the lead; qualified leads with a
/// tenant default plan move on to campaign creation.
pub struct LeadAnalysisHandler {
    leads: Arc<LeadStore>,
    analyzer: Arc<dyn LeadAnalyzer>,
    default_plans: Arc<DefaultPlans>,
    broker: Arc<QueueBroker>,
}

#[async_trait]
impl JobHandler for LeadAnalysisHandler {
    async fn handle(&self, job: &Job) -> DripResult<()> {
        let payload: LeadAnalysisPayload = serde_json::from_value(job.payload.clone())?;
        let lead = self.leads.get_required(payload.lead_id)?;

        let analysis = self.analyzer.analyze(&lead).await?;
        let qualified = analysis.qualified;
        self.leads.record_analysis(analysis);
        metrics::counter!("leads.analyzed", "qualified" => if qualified { "true" } else { "false" })
            .increment(1);

        if !qualified {
            info!(lead_id = %lead.id, "Lead did not qualify; pipeline ends here");
            return Ok(());
        }

        let Some(plan_id) = self.default_plans.get(payload.tenant_id) else {
            debug!(
                tenant_id = %payload.tenant_id,
                lead_id = %lead.id,
                "Qualified lead but tenant has no default plan"
            );
            return Ok(());
        };

        self.broker.enqueue(
            queues::CAMPAIGN_CREATION,
            queues::JOB_CREATE,
            serde_json::to_value(CampaignCreatePayload {
                tenant_id: payload.tenant_id,
                lead_id: payload.lead_id,
                plan_id,
            })?,
            JobOptions::with_job_id(keys::campaign_creation_job_id(payload.lead_id, plan_id)),
        );
        Ok(())
    }
}

/// `campaign_creation.create`: one instance per (plan, contact) pairing,
/// then an initialize job per instance. Existing pairings are reused,
/// never duplicated.
pub struct CampaignCreationHandler {
    machine: Arc<CampaignStateMachine>,
    leads: Arc<LeadStore>,
    broker: Arc<QueueBroker>,
}

#[async_trait]
impl JobHandler for CampaignCreationHandler {
    async fn handle(&self, job: &Job) -> DripResult<()> {
        let payload: CampaignCreatePayload = serde_json::from_value(job.payload.clone())?;
        let plan = self.machine.plans().get_required(payload.plan_id)?;
        let lead = self.leads.get_required(payload.lead_id)?;

        let mut enrolled = 0;
        for contact in &lead.contacts {
            if self
                .machine
                .suppressions()
                .contains(payload.tenant_id, contact.id)
            {
                debug!(
                    contact_id = %contact.id,
                    plan_id = %plan.id,
                    "Suppressed contact skipped at creation"
                );
                continue;
            }

            let (instance, created) = self.machine.instances().create(
                plan.id,
                payload.tenant_id,
                Some(lead.id),
                contact.id,
                &plan.entry_node_id,
                Utc::now(),
            );
            if created {
                enrolled += 1;
            }

            self.broker.enqueue(
                queues::CAMPAIGN_EXECUTION,
                queues::JOB_INITIALIZE,
                serde_json::to_value(CampaignInitializePayload {
                    tenant_id: payload.tenant_id,
                    plan_id: plan.id,
                    lead_id: Some(lead.id),
                    contact_id: contact.id,
                })?,
                JobOptions::with_job_id(keys::campaign_initialize_job_id(instance.id)),
            );
        }

        metrics::counter!("campaigns.created").increment(enrolled as u64);
        info!(
            plan_id = %plan.id,
            lead_id = %lead.id,
            enrolled = enrolled,
            reused = lead.contacts.len() - enrolled,
            "Campaign instances created"
        );
        Ok(())
    }
}

/// `campaign_execution.initialize`: run the walk from the entry node.
/// Redelivery converges on the persisted position.
pub struct CampaignInitializeHandler {
    machine: Arc<CampaignStateMachine>,
}

#[async_trait]
impl JobHandler for CampaignInitializeHandler {
    async fn handle(&self, job: &Job) -> DripResult<()> {
        let payload: CampaignInitializePayload = serde_json::from_value(job.payload.clone())?;
        let outcome = self
            .machine
            .initialize(
                payload.plan_id,
                payload.tenant_id,
                payload.lead_id,
                payload.contact_id,
            )
            .await?;
        debug!(
            plan_id = %payload.plan_id,
            contact_id = %payload.contact_id,
            outcome = ?outcome,
            "Initialize job handled"
        );
        Ok(())
    }
}

/// `campaign_execution.timeout`: adjudicate the engagement race and, on
/// a genuine fire, take the timed-out branch.
pub struct CampaignTimeoutHandler {
    machine: Arc<CampaignStateMachine>,
}

#[async_trait]
impl JobHandler for CampaignTimeoutHandler {
    async fn handle(&self, job: &Job) -> DripResult<()> {
        let payload: TimeoutFirePayload = serde_json::from_value(job.payload.clone())?;
        let outcome = self.machine.handle_timeout_fired(&payload.timeout_id).await?;
        debug!(
            timeout_id = %payload.timeout_id,
            outcome = ?outcome,
            "Timeout job handled"
        );
        Ok(())
    }
}

/// Register every engine handler on the broker. Call before
/// `broker.start()`.
pub fn register_handlers(
    broker: &Arc<QueueBroker>,
    machine: &Arc<CampaignStateMachine>,
    leads: &Arc<LeadStore>,
    contacts: Arc<dyn ContactDirectory>,
    analyzer: Arc<dyn LeadAnalyzer>,
    default_plans: &Arc<DefaultPlans>,
) {
    broker.register_handler(
        queues::LEAD_INITIAL_PROCESSING,
        queues::JOB_PROCESS,
        Arc::new(LeadInitialProcessingHandler {
            leads: Arc::clone(leads),
            contacts,
            broker: Arc::clone(broker),
        }),
    );
    broker.register_handler(
        queues::LEAD_ANALYSIS,
        queues::JOB_PROCESS,
        Arc::new(LeadAnalysisHandler {
            leads: Arc::clone(leads),
            analyzer,
            default_plans: Arc::clone(default_plans),
            broker: Arc::clone(broker),
        }),
    );
    broker.register_handler(
        queues::CAMPAIGN_CREATION,
        queues::JOB_CREATE,
        Arc::new(CampaignCreationHandler {
            machine: Arc::clone(machine),
            leads: Arc::clone(leads),
            broker: Arc::clone(broker),
        }),
    );
    broker.register_handler(
        queues::CAMPAIGN_EXECUTION,
        queues::JOB_INITIALIZE,
        Arc::new(CampaignInitializeHandler {
            machine: Arc::clone(machine),
        }),
    );
    broker.register_handler(
        queues::CAMPAIGN_EXECUTION,
        queues::JOB_TIMEOUT,
        Arc::new(CampaignTimeoutHandler {
            machine: Arc::clone(machine),
        }),
    );
}
