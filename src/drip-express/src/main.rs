//! DripExpress — multi-step, time-gated outbound email campaign engine.
//!
//! Main entry point: wires the stores, queue broker, scheduler, dispatch
//! gateway, and state machine together and runs until shutdown.

use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use drip_core::config::AppConfig;
use drip_core::types::{
    CampaignPlan, ChannelKind, Contact, Lead, NodeKind, PlanNode, PlanStatus, SendConfig,
    WaitConfig,
};
use drip_core::queues;
use drip_dispatch::{
    DispatchGateway, InMemoryTenantChannels, MessageStore, SendGridProvider, SmtpRelayProvider,
    TenantChannelSource,
};
use drip_engagement::{in_memory_store, EngagementValidator};
use drip_engine::{
    register_handlers, CampaignStateMachine, ContactDirectory, DefaultPlans,
    HeuristicLeadAnalyzer, InMemoryContacts, InstanceStore, LeadProcessPayload, LeadStore,
    PlanStore, SuppressionList,
};
use drip_queue::{JobEventStatus, JobOptions, JobStore, QueueBroker};
use drip_scheduler::{TimeoutScheduler, TimeoutStore};

#[derive(Parser, Debug)]
#[command(name = "drip-express")]
#[command(about = "Multi-step, time-gated outbound email campaign engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "DRIP_EXPRESS__NODE_ID")]
    node_id: Option<String>,

    /// Workers per queue (overrides config)
    #[arg(long, env = "DRIP_EXPRESS__QUEUE__WORKERS_PER_QUEUE")]
    workers: Option<usize>,

    /// Prometheus exporter port (overrides config)
    #[arg(long, env = "DRIP_EXPRESS__METRICS__PORT")]
    metrics_port: Option<u16>,

    /// Seed a demo tenant, plan, and lead on startup
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drip_express=info,drip_queue=info,drip_engine=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("DripExpress starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(workers) = cli.workers {
        config.queue.workers_per_queue = workers;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }

    info!(
        node_id = %config.node_id,
        workers_per_queue = config.queue.workers_per_queue,
        metrics_port = config.metrics.port,
        "Configuration loaded"
    );

    // Metrics exporter
    if let Err(e) = PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics.port))
        .install()
    {
        error!(error = %e, "Failed to start metrics exporter");
    }

    // Persisted stores. In-memory here; every seam takes an Arc so a
    // database-backed store slots in without touching the engine.
    let jobs = Arc::new(JobStore::new());
    let timeouts = Arc::new(TimeoutStore::new());
    let messages = Arc::new(MessageStore::new());
    let engagement = in_memory_store();
    let plans = Arc::new(PlanStore::new());
    let instances = Arc::new(InstanceStore::new());
    let leads = Arc::new(LeadStore::new());
    let contacts = Arc::new(InMemoryContacts::new());
    let suppressions = Arc::new(SuppressionList::new());
    let tenants = Arc::new(InMemoryTenantChannels::new());

    // Queue fabric, validator, scheduler, gateway, state machine.
    let broker = Arc::new(QueueBroker::new(Arc::clone(&jobs), &config.queue));
    let validator = Arc::new(EngagementValidator::new(engagement));
    let scheduler = Arc::new(TimeoutScheduler::new(
        timeouts,
        Arc::clone(&broker),
        Arc::clone(&validator),
        config.scheduler.clone(),
    ));
    let gateway = Arc::new(DispatchGateway::new(
        messages,
        Arc::clone(&tenants) as Arc<dyn TenantChannelSource>,
    ));
    gateway.register_provider(Arc::new(SendGridProvider::new(
        config.dispatch.sendgrid_api_key.clone(),
        config.dispatch.from_email.clone(),
        config.dispatch.from_name.clone(),
    )));
    gateway.register_provider(Arc::new(SmtpRelayProvider::new(
        config.dispatch.smtp_relay_url.clone(),
        config.dispatch.from_email.clone(),
    )));

    let machine = Arc::new(CampaignStateMachine::new(
        Arc::clone(&plans),
        Arc::clone(&instances),
        scheduler,
        gateway,
        validator,
        Arc::clone(&contacts) as Arc<dyn ContactDirectory>,
        suppressions,
    ));

    let default_plans = Arc::new(DefaultPlans::new());
    register_handlers(
        &broker,
        &machine,
        &leads,
        Arc::clone(&contacts) as Arc<dyn ContactDirectory>,
        Arc::new(HeuristicLeadAnalyzer::new()),
        &default_plans,
    );

    // Surface the broker's events stream as operational logs.
    let mut events = BroadcastStream::new(broker.subscribe_events());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(e) => match e.status {
                    JobEventStatus::Completed => {
                        info!(job_id = %e.job_id, queue = %e.queue, name = %e.name, "Job completed")
                    }
                    JobEventStatus::Failed => {
                        error!(
                            job_id = %e.job_id,
                            queue = %e.queue,
                            name = %e.name,
                            reason = e.failure_reason.as_deref().unwrap_or("unknown"),
                            "Job failed"
                        )
                    }
                },
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Job events stream lagged");
                }
            }
        }
    });

    broker.start();

    if cli.seed_demo {
        seed_demo_plan(&machine, &leads, &tenants, &default_plans, &broker)?;
    }

    info!("DripExpress is running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    broker.shutdown().await;
    info!("DripExpress stopped");
    Ok(())
}

/// Seed a demo tenant with a welcome drip plan and one inbound lead, so
/// a fresh process has something to execute.
fn seed_demo_plan(
    machine: &Arc<CampaignStateMachine>,
    leads: &Arc<LeadStore>,
    tenants: &Arc<InMemoryTenantChannels>,
    default_plans: &Arc<DefaultPlans>,
    broker: &Arc<QueueBroker>,
) -> anyhow::Result<()> {
    info!("Seeding demo tenant and plan");
    let tenant_id = Uuid::new_v4();
    tenants.assign(tenant_id, ChannelKind::Email, "smtp_relay");

    let now = chrono::Utc::now();
    let plan = CampaignPlan {
        id: Uuid::new_v4(),
        tenant_id,
        name: "Welcome Drip".to_string(),
        description: "Welcome email, nudge after 72h of silence".to_string(),
        status: PlanStatus::Active,
        entry_node_id: "welcome".to_string(),
        nodes: vec![
            PlanNode {
                id: "welcome".to_string(),
                kind: NodeKind::WaitNoOpen(WaitConfig {
                    template_id: "welcome-intro".to_string(),
                    channel: ChannelKind::Email,
                    timeout: Some("PT72H".to_string()),
                    on_engaged: Some("case-study".to_string()),
                    on_timed_out: Some("nudge".to_string()),
                }),
            },
            PlanNode {
                id: "case-study".to_string(),
                kind: NodeKind::Send(SendConfig {
                    template_id: "customer-case-study".to_string(),
                    channel: ChannelKind::Email,
                    next: Some("end".to_string()),
                }),
            },
            PlanNode {
                id: "nudge".to_string(),
                kind: NodeKind::WaitNoClick(WaitConfig {
                    template_id: "gentle-nudge".to_string(),
                    channel: ChannelKind::Email,
                    timeout: Some("PT24H".to_string()),
                    on_engaged: Some("end".to_string()),
                    on_timed_out: Some("end".to_string()),
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
    };
    let plan_id = machine.plans().register(plan)?;
    default_plans.assign(tenant_id, plan_id);

    let lead = Lead {
        id: Uuid::new_v4(),
        tenant_id,
        company: "Acme Corp".to_string(),
        source: "referral".to_string(),
        contacts: vec![Contact {
            id: Uuid::new_v4(),
            email: "ada@acme.example".to_string(),
            full_name: Some("Ada Lovelace".to_string()),
            title: Some("CTO".to_string()),
        }],
        created_at: now,
    };
    let lead_id = lead.id;
    leads.insert(lead);

    broker.enqueue(
        queues::LEAD_INITIAL_PROCESSING,
        queues::JOB_PROCESS,
        serde_json::to_value(LeadProcessPayload { tenant_id, lead_id })?,
        JobOptions::with_job_id(format!("lead_initial:{lead_id}")),
    );

    info!(tenant_id = %tenant_id, plan_id = %plan_id, lead_id = %lead_id, "Demo seeded");
    Ok(())
}
