use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use drip_core::DripResult;

use crate::job::Job;

/// Work attached to one `queue.name` job type. Implementations must be
/// idempotent: the broker re-runs jobs after crashes and retries.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> DripResult<()>;
}

/// Handler lookup by fully-qualified job name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, queue: &str, name: &str, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(format!("{queue}.{name}"), handler);
    }

    pub fn resolve(&self, job: &Job) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .get(&job.qualified_name())
            .map(|h| h.clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn handle(&self, _job: &Job) -> DripResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_resolve_by_qualified_name() {
        let registry = HandlerRegistry::new();
        registry.register("campaign_execution", "timeout", Arc::new(NoopHandler));

        let hit = Job::new(
            "campaign_execution",
            "timeout",
            serde_json::json!({}),
            &JobOptions::default(),
            5,
        );
        let miss = Job::new(
            "campaign_execution",
            "initialize",
            serde_json::json!({}),
            &JobOptions::default(),
            5,
        );
        assert!(registry.resolve(&hit).is_some());
        assert!(registry.resolve(&miss).is_none());
    }
}
