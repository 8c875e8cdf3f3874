use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A drip campaign definition: a small directed graph of send and wait
/// nodes walked independently by each enrolled contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignPlan {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: String,
    pub status: PlanStatus,
    pub entry_node_id: String,
    pub nodes: Vec<PlanNode>,
    /// When a send fails fatally, cancel the instance (true) or keep
    /// walking the graph without that message (false).
    #[serde(default = "default_cancel_on_send_failure")]
    pub cancel_on_send_failure: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u32,
}

fn default_cancel_on_send_failure() -> bool {
    true
}

/// Lifecycle status of a plan definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Active,
    Archived,
}

/// A single node within a campaign plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    pub kind: NodeKind,
}

/// The kind of work a node performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum NodeKind {
    /// Send a message and advance immediately.
    Send(SendConfig),
    /// Send a message, then hold until the contact opens it or the
    /// timeout elapses.
    WaitNoOpen(WaitConfig),
    /// Send a message, then hold until the contact clicks through or the
    /// timeout elapses.
    WaitNoClick(WaitConfig),
    /// Terminal node.
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendConfig {
    pub template_id: String,
    pub channel: ChannelKind,
    /// Missing edge completes the instance after the send.
    pub next: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    pub template_id: String,
    pub channel: ChannelKind,
    /// ISO-8601 duration (e.g. `PT72H`). Falls back to the configured
    /// default for the node's timeout kind when absent.
    pub timeout: Option<String>,
    pub on_engaged: Option<String>,
    pub on_timed_out: Option<String>,
}

impl CampaignPlan {
    pub fn node(&self, node_id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }
}

impl PlanNode {
    /// Timeout kind this node waits on, if it is a waiting node.
    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self.kind {
            NodeKind::WaitNoOpen(_) => Some(TimeoutKind::NoOpen),
            NodeKind::WaitNoClick(_) => Some(TimeoutKind::NoClick),
            _ => None,
        }
    }

    pub fn wait_config(&self) -> Option<&WaitConfig> {
        match &self.kind {
            NodeKind::WaitNoOpen(cfg) | NodeKind::WaitNoClick(cfg) => Some(cfg),
            _ => None,
        }
    }
}

/// Delivery channel for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
        }
    }
}

/// A contact's progress through one campaign plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignInstance {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub tenant_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub contact_id: Uuid,
    pub current_node_id: String,
    pub status: InstanceStatus,
    /// Nodes entered so far, in order. Edges targeting a visited node
    /// are rejected, so walks are forward-only.
    pub history: Vec<NodeVisit>,
    pub entered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
}

/// Runtime status of a campaign instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Completed,
    Canceled,
}

/// Record of one node entry for an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeVisit {
    pub node_id: String,
    pub edge: EdgeKind,
    pub entered_at: DateTime<Utc>,
}

/// Which edge was taken to reach a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Entry,
    Next,
    Engaged,
    TimedOut,
}

/// A persisted outbound send attempt, claimed by dedupe key before any
/// provider call is made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub campaign_instance_id: Uuid,
    pub node_id: String,
    pub contact_id: Uuid,
    pub channel: ChannelKind,
    pub dedupe_key: String,
    pub status: MessageStatus,
    pub provider_message_id: Option<String>,
    /// Status code of the provider response that accepted the message.
    pub response_status: Option<u16>,
    /// Response headers worth keeping for correlation and audits.
    #[serde(default)]
    pub response_headers: Vec<(String, String)>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Sent,
    Failed,
}

/// A scheduled wait-node deadline. One non-terminal row exists per
/// (instance, node) at a time; the row id is deterministic so re-arms
/// and duplicate deliveries collapse onto it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutJob {
    pub id: String,
    pub tenant_id: Uuid,
    pub campaign_instance_id: Uuid,
    pub node_id: String,
    pub contact_id: Uuid,
    pub kind: TimeoutKind,
    pub armed_at: DateTime<Utc>,
    /// Absolute deadline, computed once when the job is armed. Later
    /// configuration changes never move it.
    pub fire_at: DateTime<Utc>,
    pub status: TimeoutStatus,
    pub outcome: Option<TimeoutOutcome>,
    /// Set when a cancel arrived after the job had already fired.
    pub cancel_requested_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    NoOpen,
    NoClick,
}

impl TimeoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutKind::NoOpen => "no_open",
            TimeoutKind::NoClick => "no_click",
        }
    }

    /// The engagement kind that satisfies this wait.
    pub fn engagement_kind(&self) -> EngagementKind {
        match self {
            TimeoutKind::NoOpen => EngagementKind::Open,
            TimeoutKind::NoClick => EngagementKind::Click,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStatus {
    Scheduled,
    Canceled,
    Fired,
}

/// How a timeout job left the `Scheduled` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutOutcome {
    /// Canceled by the engagement path before the deadline.
    CanceledByCaller,
    /// The deadline passed, but the engagement window showed a
    /// qualifying event; no timed-out branch was taken.
    CanceledByEngagement,
    /// The deadline passed with no engagement; the timed-out branch ran.
    Elapsed,
}

/// An engagement signal ingested from a provider webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub contact_id: Uuid,
    /// Webhooks do not always carry the instance; routing falls back to
    /// active instances for (tenant, contact).
    pub campaign_instance_id: Option<Uuid>,
    pub kind: EngagementKind,
    pub occurred_at: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    Open,
    Click,
}

impl EngagementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementKind::Open => "open",
            EngagementKind::Click => "click",
        }
    }
}

// ─── Leads ──────────────────────────────────────────────────────────────

/// An inbound lead: a company plus the contacts discovered for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub company: String,
    pub source: String,
    pub contacts: Vec<Contact>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub title: Option<String>,
}

/// Scoring result for a lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadAnalysis {
    pub lead_id: Uuid,
    pub score: f32,
    pub qualified: bool,
    pub summary: String,
    pub analyzed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_kind_maps_to_engagement_kind() {
        assert_eq!(TimeoutKind::NoOpen.engagement_kind(), EngagementKind::Open);
        assert_eq!(TimeoutKind::NoClick.engagement_kind(), EngagementKind::Click);
    }

    #[test]
    fn test_node_timeout_kind() {
        let wait = PlanNode {
            id: "wait-1".to_string(),
            kind: NodeKind::WaitNoOpen(WaitConfig {
                template_id: "tpl-1".to_string(),
                channel: ChannelKind::Email,
                timeout: None,
                on_engaged: None,
                on_timed_out: None,
            }),
        };
        assert_eq!(wait.timeout_kind(), Some(TimeoutKind::NoOpen));

        let end = PlanNode {
            id: "end".to_string(),
            kind: NodeKind::End,
        };
        assert_eq!(end.timeout_kind(), None);
        assert!(end.wait_config().is_none());
    }
}
