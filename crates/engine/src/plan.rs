//! Campaign plan storage and validation.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use drip_core::types::{CampaignPlan, NodeKind, PlanNode, PlanStatus};
use drip_core::{duration, DripError, DripResult};

/// Registered plan definitions. A plan becomes immutable the moment the
/// first instance starts executing it; contacts mid-walk never see a
/// graph change under them.
#[derive(Default)]
pub struct PlanStore {
    plans: DashMap<Uuid, CampaignPlan>,
    executing_since: DashMap<Uuid, DateTime<Utc>>,
}

impl PlanStore {
    pub fn new() -> Self {
        Self {
            plans: DashMap::new(),
            executing_since: DashMap::new(),
        }
    }

    /// Validate and store a plan definition.
    pub fn register(&self, plan: CampaignPlan) -> DripResult<Uuid> {
        validate_plan(&plan)?;
        let id = plan.id;
        info!(plan_id = %id, name = %plan.name, nodes = plan.nodes.len(), "Registered campaign plan");
        self.plans.insert(id, plan);
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<CampaignPlan> {
        self.plans.get(&id).map(|p| p.clone())
    }

    pub fn get_required(&self, id: Uuid) -> DripResult<CampaignPlan> {
        self.get(id)
            .ok_or_else(|| DripError::NotFound(format!("campaign plan {id}")))
    }

    pub fn list(&self) -> Vec<CampaignPlan> {
        self.plans.iter().map(|p| p.value().clone()).collect()
    }

    pub fn update_status(&self, id: Uuid, status: PlanStatus) -> DripResult<()> {
        let mut entry = self
            .plans
            .get_mut(&id)
            .ok_or_else(|| DripError::NotFound(format!("campaign plan {id}")))?;
        info!(plan_id = %id, ?status, "Updating plan status");
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Replace a plan definition. Rejected once any instance has started
    /// executing it.
    pub fn update(&self, plan: CampaignPlan) -> DripResult<()> {
        if let Some(since) = self.executing_since.get(&plan.id) {
            return Err(DripError::Validation(format!(
                "plan {} is immutable: executing since {}",
                plan.id,
                *since
            )));
        }
        validate_plan(&plan)?;
        let mut entry = self
            .plans
            .get_mut(&plan.id)
            .ok_or_else(|| DripError::NotFound(format!("campaign plan {}", plan.id)))?;
        *entry = CampaignPlan {
            version: entry.version + 1,
            updated_at: Utc::now(),
            ..plan
        };
        Ok(())
    }

    /// Record that execution has begun, freezing the definition.
    pub fn mark_executing(&self, id: Uuid) {
        self.executing_since.entry(id).or_insert_with(Utc::now);
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

/// Structural checks applied at registration, so execution never has to
/// cope with a malformed graph. Timeout strings are parse-checked here;
/// the absolute deadline is still computed at arm time.
fn validate_plan(plan: &CampaignPlan) -> DripResult<()> {
    if plan.nodes.is_empty() {
        return Err(DripError::Validation(format!(
            "plan {} has no nodes",
            plan.id
        )));
    }

    let mut seen = std::collections::HashSet::new();
    for node in &plan.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(DripError::Validation(format!(
                "plan {}: duplicate node id {}",
                plan.id, node.id
            )));
        }
    }

    if plan.node(&plan.entry_node_id).is_none() {
        return Err(DripError::Validation(format!(
            "plan {}: entry node {} does not exist",
            plan.id, plan.entry_node_id
        )));
    }

    for node in &plan.nodes {
        for (edge, target) in edge_targets(node) {
            match target {
                t if t == node.id => {
                    return Err(DripError::Validation(format!(
                        "plan {}: node {} {} edge points at itself",
                        plan.id, node.id, edge
                    )))
                }
                t if plan.node(t).is_none() => {
                    return Err(DripError::Validation(format!(
                        "plan {}: node {} {} edge targets unknown node {}",
                        plan.id, node.id, edge, t
                    )))
                }
                _ => {}
            }
        }
        if let Some(config) = node.wait_config() {
            if let Some(spec) = &config.timeout {
                duration::parse(spec).map_err(|e| {
                    DripError::Validation(format!(
                        "plan {}: node {} timeout: {e}",
                        plan.id, node.id
                    ))
                })?;
            }
        }
    }

    Ok(())
}

fn edge_targets(node: &PlanNode) -> Vec<(&'static str, &str)> {
    match &node.kind {
        NodeKind::Send(cfg) => cfg
            .next
            .as_deref()
            .map(|t| ("next", t))
            .into_iter()
            .collect(),
        NodeKind::WaitNoOpen(cfg) | NodeKind::WaitNoClick(cfg) => {
            let mut targets = Vec::new();
            if let Some(t) = cfg.on_engaged.as_deref() {
                targets.push(("engaged", t));
            }
            if let Some(t) = cfg.on_timed_out.as_deref() {
                targets.push(("timed_out", t));
            }
            targets
        }
        NodeKind::End => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_core::types::{ChannelKind, SendConfig, WaitConfig};

    fn send_node(id: &str, next: Option<&str>) -> PlanNode {
        PlanNode {
            id: id.to_string(),
            kind: NodeKind::Send(SendConfig {
                template_id: format!("tpl-{id}"),
                channel: ChannelKind::Email,
                next: next.map(|n| n.to_string()),
            }),
        }
    }

    fn end_node() -> PlanNode {
        PlanNode {
            id: "end".to_string(),
            kind: NodeKind::End,
        }
    }

    fn plan_with(nodes: Vec<PlanNode>, entry: &str) -> CampaignPlan {
        let now = Utc::now();
        CampaignPlan {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "Test Plan".to_string(),
            description: "A plan for testing".to_string(),
            status: PlanStatus::Active,
            entry_node_id: entry.to_string(),
            nodes,
            cancel_on_send_failure: true,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    #[test]
    fn test_register_valid_plan() {
        let store = PlanStore::new();
        let plan = plan_with(vec![send_node("send-1", Some("end")), end_node()], "send-1");
        let id = plan.id;
        assert_eq!(store.register(plan).unwrap(), id);
        assert_eq!(store.get(id).unwrap().name, "Test Plan");
    }

    #[test]
    fn test_register_rejects_unknown_edge_target() {
        let store = PlanStore::new();
        let plan = plan_with(vec![send_node("send-1", Some("missing")), end_node()], "send-1");
        let err = store.register(plan).unwrap_err();
        assert!(matches!(err, DripError::Validation(_)));
    }

    #[test]
    fn test_register_rejects_missing_entry_node() {
        let store = PlanStore::new();
        let plan = plan_with(vec![end_node()], "send-1");
        assert!(store.register(plan).is_err());
    }

    #[test]
    fn test_register_rejects_bad_timeout_duration() {
        let store = PlanStore::new();
        let wait = PlanNode {
            id: "wait-1".to_string(),
            kind: NodeKind::WaitNoOpen(WaitConfig {
                template_id: "tpl-1".to_string(),
                channel: ChannelKind::Email,
                timeout: Some("3 days".to_string()),
                on_engaged: Some("end".to_string()),
                on_timed_out: Some("end".to_string()),
            }),
        };
        let plan = plan_with(vec![wait, end_node()], "wait-1");
        let err = store.register(plan).unwrap_err();
        assert!(matches!(err, DripError::Validation(_)));
    }

    #[test]
    fn test_register_rejects_self_edge() {
        let store = PlanStore::new();
        let plan = plan_with(vec![send_node("send-1", Some("send-1"))], "send-1");
        assert!(store.register(plan).is_err());
    }

    #[test]
    fn test_update_rejected_once_executing() {
        let store = PlanStore::new();
        let plan = plan_with(vec![send_node("send-1", Some("end")), end_node()], "send-1");
        let id = plan.id;
        store.register(plan.clone()).unwrap();

        let mut revised = plan.clone();
        revised.name = "Revised".to_string();
        store.update(revised.clone()).unwrap();
        assert_eq!(store.get(id).unwrap().version, 2);

        store.mark_executing(id);
        let err = store.update(revised).unwrap_err();
        assert!(matches!(err, DripError::Validation(_)));
    }
}
