//! Delayed-timeout scheduling for wait nodes.
//!
//! A wait is never a blocking call: arming persists a timeout row and
//! enqueues a delayed job sharing its id. Cancellation and firing race
//! on the row's status, checked atomically at the start of the fire
//! handler.

pub mod scheduler;
pub mod store;

pub use scheduler::{FireDecision, TimeoutFirePayload, TimeoutScheduler};
pub use store::{CancelOutcome, TimeoutStore};
