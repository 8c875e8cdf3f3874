use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use drip_core::types::{EngagementEvent, EngagementKind};
use drip_core::DripResult;

use crate::store::{EngagementFilter, EngagementStore};

/// Answer to "did a qualifying engagement occur in this window".
#[derive(Debug, Clone)]
pub struct EngagementSummary {
    pub has_events: bool,
    pub count: usize,
    /// First element of the newest-first ordering.
    pub most_recent: Option<EngagementEvent>,
}

impl EngagementSummary {
    fn empty() -> Self {
        Self {
            has_events: false,
            count: 0,
            most_recent: None,
        }
    }
}

/// Read-side of the engagement log used by timeout adjudication.
pub struct EngagementValidator {
    store: Arc<dyn EngagementStore>,
}

impl EngagementValidator {
    pub fn new(store: Arc<dyn EngagementStore>) -> Self {
        Self { store }
    }

    /// Append an event to the log. Returns false for a duplicate id.
    pub async fn record(&self, event: EngagementEvent) -> DripResult<bool> {
        self.store.append(event).await
    }

    /// Check the window [window_start, window_end] for an event of the
    /// given kind. Kinds match exactly: an open never satisfies a
    /// no-click wait.
    ///
    /// Fails open: a store error reads as an empty window, because
    /// timeout processing must keep moving when the log is unavailable.
    pub async fn has_qualifying_event(
        &self,
        tenant_id: Uuid,
        contact_id: Uuid,
        campaign_instance_id: Option<Uuid>,
        kind: EngagementKind,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> EngagementSummary {
        let filter = EngagementFilter {
            tenant_id,
            contact_id,
            campaign_instance_id,
            kind: Some(kind),
            window_start: Some(window_start),
            window_end: Some(window_end),
        };

        match self.store.query(&filter).await {
            Ok(events) => EngagementSummary {
                has_events: !events.is_empty(),
                count: events.len(),
                most_recent: events.first().cloned(),
            },
            Err(e) => {
                warn!(
                    contact_id = %contact_id,
                    kind = kind.as_str(),
                    error = %e,
                    "Engagement store query failed, treating window as empty"
                );
                metrics::counter!("engagement.validator_failures").increment(1);
                EngagementSummary::empty()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{failing_store, in_memory_store};
    use chrono::Duration;

    fn open_event(
        tenant_id: Uuid,
        contact_id: Uuid,
        occurred_at: DateTime<Utc>,
    ) -> EngagementEvent {
        EngagementEvent {
            id: Uuid::new_v4(),
            tenant_id,
            contact_id,
            campaign_instance_id: None,
            kind: EngagementKind::Open,
            occurred_at,
            source: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_summary_reports_newest_match() {
        let store = in_memory_store();
        let validator = EngagementValidator::new(store.clone());
        let tenant = Uuid::new_v4();
        let contact = Uuid::new_v4();
        let armed_at = Utc::now() - Duration::hours(24);

        let older = open_event(tenant, contact, armed_at + Duration::hours(1));
        let newer = open_event(tenant, contact, armed_at + Duration::hours(2));
        validator.record(older).await.unwrap();
        validator.record(newer.clone()).await.unwrap();

        let summary = validator
            .has_qualifying_event(
                tenant,
                contact,
                None,
                EngagementKind::Open,
                armed_at,
                Utc::now(),
            )
            .await;
        assert!(summary.has_events);
        assert_eq!(summary.count, 2);
        assert_eq!(summary.most_recent.unwrap().id, newer.id);
    }

    #[tokio::test]
    async fn test_kind_must_match_exactly() {
        let store = in_memory_store();
        let validator = EngagementValidator::new(store);
        let tenant = Uuid::new_v4();
        let contact = Uuid::new_v4();
        let armed_at = Utc::now() - Duration::hours(1);

        validator
            .record(open_event(tenant, contact, Utc::now()))
            .await
            .unwrap();

        let summary = validator
            .has_qualifying_event(
                tenant,
                contact,
                None,
                EngagementKind::Click,
                armed_at,
                Utc::now(),
            )
            .await;
        assert!(!summary.has_events);
    }

    #[tokio::test]
    async fn test_store_failure_reads_as_empty_window() {
        let validator = EngagementValidator::new(failing_store());
        let summary = validator
            .has_qualifying_event(
                Uuid::new_v4(),
                Uuid::new_v4(),
                None,
                EngagementKind::Open,
                Utc::now() - Duration::hours(24),
                Utc::now(),
            )
            .await;
        assert!(!summary.has_events);
        assert_eq!(summary.count, 0);
        assert!(summary.most_recent.is_none());
    }
}
