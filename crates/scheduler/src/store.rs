use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use drip_core::types::{TimeoutJob, TimeoutOutcome, TimeoutStatus};

/// Result of a cancel attempt against a timeout row.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The row was still `Scheduled`; cancellation won the race.
    Canceled(TimeoutJob),
    /// The row already fired. The late request is recorded on the row
    /// but changes nothing else.
    AlreadyFired(TimeoutJob),
    AlreadyCanceled(TimeoutJob),
    NotFound,
}

/// Persisted timeout rows keyed by their deterministic id. All status
/// transitions happen under the row's entry lock, so exactly one of
/// cancel/fire ever wins a given race.
#[derive(Default)]
pub struct TimeoutStore {
    jobs: DashMap<String, TimeoutJob>,
}

impl TimeoutStore {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }

    /// Insert a row, or return the existing one. Re-arming a pending
    /// wait collapses onto the row already there.
    pub fn insert(&self, job: TimeoutJob) -> (TimeoutJob, bool) {
        match self.jobs.entry(job.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => (existing.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(slot) => (slot.insert(job).clone(), true),
        }
    }

    pub fn get(&self, id: &str) -> Option<TimeoutJob> {
        self.jobs.get(id).map(|j| j.clone())
    }

    /// Scheduled -> Canceled with the given outcome. A row that already
    /// fired keeps its state; the request timestamp is recorded on it.
    pub fn cancel(&self, id: &str, outcome: TimeoutOutcome, now: DateTime<Utc>) -> CancelOutcome {
        let Some(mut entry) = self.jobs.get_mut(id) else {
            return CancelOutcome::NotFound;
        };
        match entry.status {
            TimeoutStatus::Scheduled => {
                entry.status = TimeoutStatus::Canceled;
                entry.outcome = Some(outcome);
                CancelOutcome::Canceled(entry.clone())
            }
            TimeoutStatus::Fired => {
                entry.cancel_requested_at.get_or_insert(now);
                CancelOutcome::AlreadyFired(entry.clone())
            }
            TimeoutStatus::Canceled => CancelOutcome::AlreadyCanceled(entry.clone()),
        }
    }

    /// Scheduled -> Fired with outcome `Elapsed`. Returns `None` when
    /// the row is missing or the transition lost to a cancel.
    pub fn mark_fired(&self, id: &str) -> Option<TimeoutJob> {
        let mut entry = self.jobs.get_mut(id)?;
        if entry.status != TimeoutStatus::Scheduled {
            return None;
        }
        entry.status = TimeoutStatus::Fired;
        entry.outcome = Some(TimeoutOutcome::Elapsed);
        Some(entry.clone())
    }

    pub fn scheduled_for_instance(&self, campaign_instance_id: Uuid) -> Vec<TimeoutJob> {
        self.jobs
            .iter()
            .filter(|j| {
                j.campaign_instance_id == campaign_instance_id
                    && j.status == TimeoutStatus::Scheduled
            })
            .map(|j| j.clone())
            .collect()
    }

    pub fn for_instance(&self, campaign_instance_id: Uuid) -> Vec<TimeoutJob> {
        self.jobs
            .iter()
            .filter(|j| j.campaign_instance_id == campaign_instance_id)
            .map(|j| j.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_core::types::TimeoutKind;

    fn job(id: &str) -> TimeoutJob {
        let now = Utc::now();
        TimeoutJob {
            id: id.to_string(),
            tenant_id: Uuid::new_v4(),
            campaign_instance_id: Uuid::new_v4(),
            node_id: "wait-1".to_string(),
            contact_id: Uuid::new_v4(),
            kind: TimeoutKind::NoOpen,
            armed_at: now,
            fire_at: now + chrono::Duration::hours(72),
            status: TimeoutStatus::Scheduled,
            outcome: None,
            cancel_requested_at: None,
        }
    }

    #[test]
    fn test_insert_is_idempotent_per_id() {
        let store = TimeoutStore::new();
        let (first, created) = store.insert(job("t-1"));
        assert!(created);

        let mut again = job("t-1");
        again.fire_at = first.fire_at + chrono::Duration::hours(1);
        let (existing, created) = store.insert(again);
        assert!(!created);
        assert_eq!(existing.fire_at, first.fire_at);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_cancel_then_fire_loses() {
        let store = TimeoutStore::new();
        store.insert(job("t-1"));

        let outcome = store.cancel("t-1", TimeoutOutcome::CanceledByCaller, Utc::now());
        assert!(matches!(outcome, CancelOutcome::Canceled(_)));
        assert!(store.mark_fired("t-1").is_none());

        let row = store.get("t-1").unwrap();
        assert_eq!(row.status, TimeoutStatus::Canceled);
        assert_eq!(row.outcome, Some(TimeoutOutcome::CanceledByCaller));
    }

    #[test]
    fn test_cancel_after_fire_records_request_only() {
        let store = TimeoutStore::new();
        store.insert(job("t-1"));
        store.mark_fired("t-1").unwrap();

        let outcome = store.cancel("t-1", TimeoutOutcome::CanceledByCaller, Utc::now());
        assert!(matches!(outcome, CancelOutcome::AlreadyFired(_)));

        let row = store.get("t-1").unwrap();
        assert_eq!(row.status, TimeoutStatus::Fired);
        assert_eq!(row.outcome, Some(TimeoutOutcome::Elapsed));
        assert!(row.cancel_requested_at.is_some());
    }
}
