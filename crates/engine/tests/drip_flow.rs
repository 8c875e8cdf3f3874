//! End-to-end drip flow over a live broker: enrollment through the
//! initialize job, the engagement-vs-timeout race with real delayed
//! jobs, and crash/restart recovery from the shared stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use drip_core::config::{QueueConfig, SchedulerConfig};
use drip_core::types::{
    CampaignPlan, ChannelKind, Contact, EngagementEvent, EngagementKind, InstanceStatus, NodeKind,
    PlanNode, PlanStatus, SendConfig, TimeoutKind, TimeoutStatus, WaitConfig,
};
use drip_core::{keys, queues, DripResult};
use drip_dispatch::provider::{ChannelProvider, ProviderReceipt};
use drip_dispatch::{DispatchGateway, InMemoryTenantChannels, MessageStore, SendRequest};
use drip_engagement::{in_memory_store, EngagementStore, EngagementValidator};
use drip_engine::{
    register_handlers, CampaignInitializePayload, CampaignStateMachine, ContactDirectory,
    DefaultPlans, HeuristicLeadAnalyzer, InMemoryContacts, InstanceStore, LeadStore, PlanStore,
    SuppressionList,
};
use drip_queue::{JobOptions, JobStore, QueueBroker};
use drip_scheduler::{TimeoutScheduler, TimeoutStore};

struct CountingProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl ChannelProvider for CountingProvider {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn channel(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn deliver(&self, _request: &SendRequest) -> DripResult<ProviderReceipt> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProviderReceipt {
            provider_message_id: format!("msg-{call}"),
            response_status: 202,
            response_headers: Vec::new(),
            latency_ms: 0,
        })
    }
}

/// Everything a process would persist, shared across rebuilds.
struct Stores {
    jobs: Arc<JobStore>,
    timeouts: Arc<TimeoutStore>,
    messages: Arc<MessageStore>,
    engagement: Arc<dyn EngagementStore>,
    plans: Arc<PlanStore>,
    instances: Arc<InstanceStore>,
    leads: Arc<LeadStore>,
    contacts: Arc<InMemoryContacts>,
    suppressions: Arc<SuppressionList>,
    tenants: Arc<InMemoryTenantChannels>,
    provider: Arc<CountingProvider>,
    default_plans: Arc<DefaultPlans>,
}

impl Stores {
    fn new() -> Self {
        Self {
            jobs: Arc::new(JobStore::new()),
            timeouts: Arc::new(TimeoutStore::new()),
            messages: Arc::new(MessageStore::new()),
            engagement: in_memory_store(),
            plans: Arc::new(PlanStore::new()),
            instances: Arc::new(InstanceStore::new()),
            leads: Arc::new(LeadStore::new()),
            contacts: Arc::new(InMemoryContacts::new()),
            suppressions: Arc::new(SuppressionList::new()),
            tenants: Arc::new(InMemoryTenantChannels::new()),
            provider: Arc::new(CountingProvider {
                calls: AtomicUsize::new(0),
            }),
            default_plans: Arc::new(DefaultPlans::new()),
        }
    }
}

/// One "process": a broker and state machine built over the stores.
struct Process {
    broker: Arc<QueueBroker>,
    machine: Arc<CampaignStateMachine>,
}

fn boot(stores: &Stores) -> Process {
    let config = QueueConfig {
        workers_per_queue: 2,
        promotion_interval_ms: 20,
        ..QueueConfig::default()
    };
    let broker = Arc::new(QueueBroker::new(Arc::clone(&stores.jobs), &config));
    let validator = Arc::new(EngagementValidator::new(Arc::clone(&stores.engagement)));
    let scheduler = Arc::new(TimeoutScheduler::new(
        Arc::clone(&stores.timeouts),
        Arc::clone(&broker),
        Arc::clone(&validator),
        SchedulerConfig::default(),
    ));
    let gateway = Arc::new(DispatchGateway::new(
        Arc::clone(&stores.messages),
        Arc::clone(&stores.tenants) as Arc<dyn drip_dispatch::TenantChannelSource>,
    ));
    gateway.register_provider(Arc::clone(&stores.provider) as Arc<dyn ChannelProvider>);

    let machine = Arc::new(CampaignStateMachine::new(
        Arc::clone(&stores.plans),
        Arc::clone(&stores.instances),
        scheduler,
        gateway,
        validator,
        Arc::clone(&stores.contacts) as Arc<dyn ContactDirectory>,
        Arc::clone(&stores.suppressions),
    ));

    register_handlers(
        &broker,
        &machine,
        &stores.leads,
        Arc::clone(&stores.contacts) as Arc<dyn ContactDirectory>,
        Arc::new(HeuristicLeadAnalyzer::new()),
        &stores.default_plans,
    );
    broker.start();

    Process { broker, machine }
}

fn drip_plan(tenant_id: Uuid, wait_timeout: &str) -> CampaignPlan {
    let now = Utc::now();
    CampaignPlan {
        id: Uuid::new_v4(),
        tenant_id,
        name: "Welcome Drip".to_string(),
        description: "welcome, nudge if unopened".to_string(),
        status: PlanStatus::Active,
        entry_node_id: "welcome".to_string(),
        nodes: vec![
            PlanNode {
                id: "welcome".to_string(),
                kind: NodeKind::WaitNoOpen(WaitConfig {
                    template_id: "welcome-intro".to_string(),
                    channel: ChannelKind::Email,
                    timeout: Some(wait_timeout.to_string()),
                    on_engaged: Some("thanks".to_string()),
                    on_timed_out: Some("nudge".to_string()),
                }),
            },
            PlanNode {
                id: "thanks".to_string(),
                kind: NodeKind::Send(SendConfig {
                    template_id: "thanks".to_string(),
                    channel: ChannelKind::Email,
                    next: Some("end".to_string()),
                }),
            },
            PlanNode {
                id: "nudge".to_string(),
                kind: NodeKind::Send(SendConfig {
                    template_id: "nudge".to_string(),
                    channel: ChannelKind::Email,
                    next: Some("end".to_string()),
                }),
            },
            PlanNode {
                id: "end".to_string(),
                kind: NodeKind::End,
            },
        ],
        cancel_on_send_failure: true,
        created_at: now,
        updated_at: now,
        version: 1,
    }
}

async fn seed_contact(stores: &Stores, tenant_id: Uuid) -> Uuid {
    stores.tenants.assign(tenant_id, ChannelKind::Email, "counting");
    let contact = Contact {
        id: Uuid::new_v4(),
        email: "ada@example.com".to_string(),
        full_name: Some("Ada Lovelace".to_string()),
        title: Some("CTO".to_string()),
    };
    let id = contact.id;
    stores.contacts.upsert(contact).await.unwrap();
    id
}

fn enqueue_initialize(process: &Process, plan_id: Uuid, tenant_id: Uuid, contact_id: Uuid) {
    let (instance, _) = process.machine.instances().create(
        plan_id,
        tenant_id,
        None,
        contact_id,
        "welcome",
        Utc::now(),
    );
    process.broker.enqueue(
        queues::CAMPAIGN_EXECUTION,
        queues::JOB_INITIALIZE,
        serde_json::to_value(CampaignInitializePayload {
            tenant_id,
            plan_id,
            lead_id: None,
            contact_id,
        })
        .unwrap(),
        JobOptions::with_job_id(keys::campaign_initialize_job_id(instance.id)),
    );
}

async fn wait_for(cond: impl Fn() -> bool, timeout_ms: u64) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// No engagement: the delayed timeout job fires, the timed-out edge runs,
// and the nudge goes out.
#[tokio::test]
async fn test_timeout_path_end_to_end() {
    let stores = Stores::new();
    let process = boot(&stores);
    let tenant_id = Uuid::new_v4();
    let contact_id = seed_contact(&stores, tenant_id).await;
    let plan = drip_plan(tenant_id, "PT1S");
    stores.plans.register(plan.clone()).unwrap();

    enqueue_initialize(&process, plan.id, tenant_id, contact_id);

    assert!(
        wait_for(
            || {
                stores
                    .instances
                    .for_plan(plan.id)
                    .first()
                    .map(|i| i.status == InstanceStatus::Completed
                        && i.history.iter().any(|v| v.node_id == "nudge"))
                    .unwrap_or(false)
            },
            5000
        )
        .await,
        "timed-out branch never completed"
    );

    // Welcome plus nudge, nothing else.
    assert_eq!(stores.provider.calls.load(Ordering::SeqCst), 2);
    let instance = stores.instances.for_plan(plan.id).pop().unwrap();
    let timeout_id = keys::timeout_job_id(instance.id, "welcome", contact_id, TimeoutKind::NoOpen);
    assert_eq!(
        stores.timeouts.get(&timeout_id).unwrap().status,
        TimeoutStatus::Fired
    );
    process.broker.shutdown().await;
}

// Engagement lands before the deadline: the engaged edge runs promptly
// and the later fire is a durable no-op.
#[tokio::test]
async fn test_engagement_path_end_to_end() {
    let stores = Stores::new();
    let process = boot(&stores);
    let tenant_id = Uuid::new_v4();
    let contact_id = seed_contact(&stores, tenant_id).await;
    let plan = drip_plan(tenant_id, "PT2S");
    stores.plans.register(plan.clone()).unwrap();

    enqueue_initialize(&process, plan.id, tenant_id, contact_id);
    assert!(
        wait_for(|| stores.provider.calls.load(Ordering::SeqCst) >= 1, 3000).await,
        "welcome never sent"
    );

    process
        .machine
        .handle_engagement(EngagementEvent {
            id: Uuid::new_v4(),
            tenant_id,
            contact_id,
            campaign_instance_id: None,
            kind: EngagementKind::Open,
            occurred_at: Utc::now(),
            source: "webhook".to_string(),
        })
        .await
        .unwrap();

    let instance = stores.instances.for_plan(plan.id).pop().unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.history.iter().any(|v| v.node_id == "thanks"));

    // Let the delayed job come due; the fire handler must observe the
    // canceled row and change nothing.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let after = stores.instances.get(instance.id).unwrap();
    assert_eq!(after.history.len(), instance.history.len());
    assert_eq!(stores.provider.calls.load(Ordering::SeqCst), 2);

    let timeout_id = keys::timeout_job_id(instance.id, "welcome", contact_id, TimeoutKind::NoOpen);
    assert_eq!(
        stores.timeouts.get(&timeout_id).unwrap().status,
        TimeoutStatus::Canceled
    );
    process.broker.shutdown().await;
}

// Kill the process after "sent node N, timeout scheduled" and rebuild
// everything over the same stores: no duplicate send, no duplicate arm,
// and the pending deadline still fires.
#[tokio::test]
async fn test_crash_restart_reproduces_next_action() {
    let stores = Stores::new();
    let tenant_id = Uuid::new_v4();
    let contact_id = seed_contact(&stores, tenant_id).await;
    let plan = drip_plan(tenant_id, "PT1S");
    stores.plans.register(plan.clone()).unwrap();

    let first = boot(&stores);
    enqueue_initialize(&first, plan.id, tenant_id, contact_id);
    assert!(
        wait_for(|| stores.provider.calls.load(Ordering::SeqCst) == 1, 3000).await,
        "welcome never sent"
    );
    // "Crash": stop the workers with the delayed timeout still pending.
    first.broker.shutdown().await;
    drop(first);

    let sends_before = stores.provider.calls.load(Ordering::SeqCst);
    let instance = stores.instances.for_plan(plan.id).pop().unwrap();
    assert_eq!(instance.current_node_id, "welcome");

    let second = boot(&stores);
    // Replay the initialize delivery, as a broker would after recovery.
    second.broker.enqueue(
        queues::CAMPAIGN_EXECUTION,
        queues::JOB_INITIALIZE,
        serde_json::to_value(CampaignInitializePayload {
            tenant_id,
            plan_id: plan.id,
            lead_id: None,
            contact_id,
        })
        .unwrap(),
        JobOptions::with_job_id(keys::campaign_initialize_job_id(instance.id)),
    );

    // The replay is deduped; the recovered delayed job fires on schedule
    // and the walk finishes along the timed-out edge.
    assert!(
        wait_for(
            || {
                stores
                    .instances
                    .get(instance.id)
                    .map(|i| i.status == InstanceStatus::Completed)
                    .unwrap_or(false)
            },
            5000
        )
        .await,
        "recovered timeout never fired"
    );
    assert_eq!(
        stores.provider.calls.load(Ordering::SeqCst),
        sends_before + 1,
        "restart re-sent the welcome message"
    );
    assert_eq!(stores.timeouts.len(), 1);
    second.broker.shutdown().await;
}
