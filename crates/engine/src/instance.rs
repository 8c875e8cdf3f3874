//! Campaign instance storage. One instance exists per (plan, contact)
//! pairing, and its node pointer only ever moves forward along plan
//! edges.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use drip_core::types::{CampaignInstance, EdgeKind, InstanceStatus, NodeVisit};
use drip_core::{DripError, DripResult};

#[derive(Default)]
pub struct InstanceStore {
    instances: DashMap<Uuid, CampaignInstance>,
    /// (plan_id, contact_id) -> instance id. Enrollment is idempotent
    /// per pairing.
    by_pairing: DashMap<(Uuid, Uuid), Uuid>,
}

impl InstanceStore {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            by_pairing: DashMap::new(),
        }
    }

    /// Enroll a contact into a plan at the entry node. A pairing that
    /// already exists returns its instance unchanged.
    pub fn create(
        &self,
        plan_id: Uuid,
        tenant_id: Uuid,
        lead_id: Option<Uuid>,
        contact_id: Uuid,
        entry_node_id: &str,
        now: DateTime<Utc>,
    ) -> (CampaignInstance, bool) {
        match self.by_pairing.entry((plan_id, contact_id)) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let id = *existing.get();
                // Pairing rows are only written after the instance row.
                let instance = self
                    .instances
                    .get(&id)
                    .map(|i| i.clone())
                    .unwrap_or_else(|| unreachable!("pairing row without instance row"));
                (instance, false)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let instance = CampaignInstance {
                    id: Uuid::new_v4(),
                    plan_id,
                    tenant_id,
                    lead_id,
                    contact_id,
                    current_node_id: entry_node_id.to_string(),
                    status: InstanceStatus::Active,
                    history: vec![NodeVisit {
                        node_id: entry_node_id.to_string(),
                        edge: EdgeKind::Entry,
                        entered_at: now,
                    }],
                    entered_at: now,
                    updated_at: now,
                    completed_at: None,
                    exit_reason: None,
                };
                self.instances.insert(instance.id, instance.clone());
                slot.insert(instance.id);
                (instance, true)
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<CampaignInstance> {
        self.instances.get(&id).map(|i| i.clone())
    }

    pub fn get_required(&self, id: Uuid) -> DripResult<CampaignInstance> {
        self.get(id)
            .ok_or_else(|| DripError::NotFound(format!("campaign instance {id}")))
    }

    /// Move the node pointer along an edge. The target must be a node
    /// this instance has never entered; walks are forward-only.
    pub fn advance(
        &self,
        id: Uuid,
        to_node_id: &str,
        edge: EdgeKind,
        now: DateTime<Utc>,
    ) -> DripResult<CampaignInstance> {
        let mut entry = self
            .instances
            .get_mut(&id)
            .ok_or_else(|| DripError::NotFound(format!("campaign instance {id}")))?;

        if entry.status != InstanceStatus::Active {
            return Err(DripError::Validation(format!(
                "instance {id} is {:?}, not active",
                entry.status
            )));
        }
        if entry.history.iter().any(|v| v.node_id == to_node_id) {
            return Err(DripError::Validation(format!(
                "instance {id} already visited node {to_node_id}"
            )));
        }

        entry.current_node_id = to_node_id.to_string();
        entry.history.push(NodeVisit {
            node_id: to_node_id.to_string(),
            edge,
            entered_at: now,
        });
        entry.updated_at = now;
        Ok(entry.clone())
    }

    /// Mark the instance completed. A no-op clone if it already left the
    /// active state, so replayed terminal steps converge.
    pub fn complete(&self, id: Uuid, now: DateTime<Utc>) -> DripResult<CampaignInstance> {
        let mut entry = self
            .instances
            .get_mut(&id)
            .ok_or_else(|| DripError::NotFound(format!("campaign instance {id}")))?;
        if entry.status == InstanceStatus::Active {
            entry.status = InstanceStatus::Completed;
            entry.completed_at = Some(now);
            entry.updated_at = now;
            info!(instance_id = %id, "Campaign instance completed");
        }
        Ok(entry.clone())
    }

    /// Cancel the instance with a reason. A no-op clone once terminal.
    pub fn cancel(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DripResult<CampaignInstance> {
        let mut entry = self
            .instances
            .get_mut(&id)
            .ok_or_else(|| DripError::NotFound(format!("campaign instance {id}")))?;
        if entry.status == InstanceStatus::Active {
            entry.status = InstanceStatus::Canceled;
            entry.exit_reason = Some(reason.to_string());
            entry.completed_at = Some(now);
            entry.updated_at = now;
            info!(instance_id = %id, reason = %reason, "Campaign instance canceled");
        }
        Ok(entry.clone())
    }

    /// Active instances for one contact, used to route engagement
    /// events that arrive without an instance id.
    pub fn active_for_contact(&self, tenant_id: Uuid, contact_id: Uuid) -> Vec<CampaignInstance> {
        self.instances
            .iter()
            .filter(|i| {
                i.tenant_id == tenant_id
                    && i.contact_id == contact_id
                    && i.status == InstanceStatus::Active
            })
            .map(|i| i.clone())
            .collect()
    }

    pub fn for_plan(&self, plan_id: Uuid) -> Vec<CampaignInstance> {
        self.instances
            .iter()
            .filter(|i| i.plan_id == plan_id)
            .map(|i| i.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
