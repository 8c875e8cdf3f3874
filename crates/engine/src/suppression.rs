//! Tenant-scoped suppression list. A suppressed contact is never
//! enrolled again and all of their in-flight instances are canceled.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SuppressionEntry {
    pub reason: String,
    pub suppressed_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct SuppressionList {
    entries: DashMap<(Uuid, Uuid), SuppressionEntry>,
}

impl SuppressionList {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Add a contact to the list. Returns false if already present.
    pub fn add(&self, tenant_id: Uuid, contact_id: Uuid, reason: &str) -> bool {
        match self.entries.entry((tenant_id, contact_id)) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(SuppressionEntry {
                    reason: reason.to_string(),
                    suppressed_at: Utc::now(),
                });
                info!(
                    tenant_id = %tenant_id,
                    contact_id = %contact_id,
                    reason = %reason,
                    "Contact suppressed"
                );
                metrics::counter!("suppressions.added").increment(1);
                true
            }
        }
    }

    pub fn contains(&self, tenant_id: Uuid, contact_id: Uuid) -> bool {
        self.entries.contains_key(&(tenant_id, contact_id))
    }

    pub fn get(&self, tenant_id: Uuid, contact_id: Uuid) -> Option<SuppressionEntry> {
        self.entries
            .get(&(tenant_id, contact_id))
            .map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
