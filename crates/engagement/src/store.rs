//! Append-only engagement event log behind a storage seam.
//!
//! Components accept an `Arc<dyn EngagementStore>`; the in-memory
//! implementation is the hermetic default, and the failing one exists
//! so callers can prove their degraded-path behavior.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use drip_core::types::{EngagementEvent, EngagementKind};
use drip_core::{DripError, DripResult};

/// Query shape for the event log. All populated fields must match.
#[derive(Debug, Clone)]
pub struct EngagementFilter {
    pub tenant_id: Uuid,
    pub contact_id: Uuid,
    /// When set, events tagged with a *different* instance are excluded;
    /// untagged events still match on (tenant, contact).
    pub campaign_instance_id: Option<Uuid>,
    pub kind: Option<EngagementKind>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait EngagementStore: Send + Sync {
    /// Append one event. Returns false when the event id was already
    /// recorded; webhook providers redeliver, the log stays append-once.
    async fn append(&self, event: EngagementEvent) -> DripResult<bool>;

    /// Matching events, newest first by occurred_at.
    async fn query(&self, filter: &EngagementFilter) -> DripResult<Vec<EngagementEvent>>;
}

/// In-memory event log keyed by event id.
#[derive(Default)]
pub struct InMemoryEngagementStore {
    events: DashMap<Uuid, EngagementEvent>,
}

impl InMemoryEngagementStore {
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl EngagementStore for InMemoryEngagementStore {
    async fn append(&self, event: EngagementEvent) -> DripResult<bool> {
        match self.events.entry(event.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                metrics::counter!("engagement.duplicate_events").increment(1);
                Ok(false)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(event);
                metrics::counter!("engagement.events_recorded").increment(1);
                Ok(true)
            }
        }
    }

    async fn query(&self, filter: &EngagementFilter) -> DripResult<Vec<EngagementEvent>> {
        let mut matches: Vec<EngagementEvent> = self
            .events
            .iter()
            .filter(|e| matches_filter(e, filter))
            .map(|e| e.clone())
            .collect();
        matches.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        Ok(matches)
    }
}

fn matches_filter(event: &EngagementEvent, filter: &EngagementFilter) -> bool {
    if event.tenant_id != filter.tenant_id || event.contact_id != filter.contact_id {
        return false;
    }
    if let Some(kind) = filter.kind {
        if event.kind != kind {
            return false;
        }
    }
    if let Some(instance_id) = filter.campaign_instance_id {
        if let Some(tagged) = event.campaign_instance_id {
            if tagged != instance_id {
                return false;
            }
        }
    }
    if let Some(start) = filter.window_start {
        if event.occurred_at < start {
            return false;
        }
    }
    if let Some(end) = filter.window_end {
        if event.occurred_at > end {
            return false;
        }
    }
    true
}

/// Store whose every call fails. Exists to exercise degraded paths.
pub struct FailingEngagementStore;

#[async_trait]
impl EngagementStore for FailingEngagementStore {
    async fn append(&self, _event: EngagementEvent) -> DripResult<bool> {
        Err(DripError::Internal(anyhow!("engagement store unavailable")))
    }

    async fn query(&self, _filter: &EngagementFilter) -> DripResult<Vec<EngagementEvent>> {
        Err(DripError::Internal(anyhow!("engagement store unavailable")))
    }
}

/// Convenience: the hermetic in-memory log.
pub fn in_memory_store() -> Arc<InMemoryEngagementStore> {
    Arc::new(InMemoryEngagementStore::new())
}

/// Convenience: a store that always fails, for degraded-path tests.
pub fn failing_store() -> Arc<dyn EngagementStore> {
    Arc::new(FailingEngagementStore)
}
