pub mod store;
pub mod validator;

pub use store::{
    failing_store, in_memory_store, EngagementFilter, EngagementStore, FailingEngagementStore,
    InMemoryEngagementStore,
};
pub use validator::{EngagementSummary, EngagementValidator};
