//! Queue and job names shared by producers and handlers. Handlers are
//! registered under the qualified `queue.job` form.

pub const LEAD_INITIAL_PROCESSING: &str = "lead_initial_processing";
pub const LEAD_ANALYSIS: &str = "lead_analysis";
pub const CAMPAIGN_CREATION: &str = "campaign_creation";
pub const CAMPAIGN_EXECUTION: &str = "campaign_execution";

pub const JOB_PROCESS: &str = "process";
pub const JOB_CREATE: &str = "create";
pub const JOB_INITIALIZE: &str = "initialize";
pub const JOB_TIMEOUT: &str = "timeout";

/// All queues the engine owns, in pipeline order.
pub const ALL_QUEUES: [&str; 4] = [
    LEAD_INITIAL_PROCESSING,
    LEAD_ANALYSIS,
    CAMPAIGN_CREATION,
    CAMPAIGN_EXECUTION,
];
