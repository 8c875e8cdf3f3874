pub mod config;
pub mod duration;
pub mod error;
pub mod keys;
pub mod queues;
pub mod types;

pub use config::AppConfig;
pub use error::{DripError, DripResult};
