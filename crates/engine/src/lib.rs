//! Campaign execution engine: plan and instance storage, the per-contact
//! state machine, the lead intake pipeline, and the queue handlers that
//! bind them to the job fabric.

pub mod handlers;
pub mod instance;
pub mod leads;
pub mod machine;
pub mod plan;
pub mod suppression;

pub use handlers::{
    register_handlers, CampaignCreatePayload, CampaignInitializePayload, DefaultPlans,
    LeadAnalysisPayload, LeadProcessPayload,
};
pub use instance::InstanceStore;
pub use leads::{
    ContactDirectory, HeuristicLeadAnalyzer, InMemoryContacts, LeadAnalyzer, LeadStore,
};
pub use machine::{CampaignStateMachine, EngagementDisposition, PlanStats, WalkOutcome};
pub use plan::PlanStore;
pub use suppression::{SuppressionEntry, SuppressionList};
