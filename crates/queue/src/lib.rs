pub mod broker;
pub mod handler;
pub mod job;
pub mod retry;
pub mod store;
pub mod worker;

pub use broker::QueueBroker;
pub use handler::{HandlerRegistry, JobHandler};
pub use job::{EnqueueOutcome, Job, JobEvent, JobEventStatus, JobOptions, JobState};
pub use retry::RetryPolicy;
pub use store::{JobStore, QueueCounts, RetentionPolicy};
