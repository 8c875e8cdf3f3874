use uuid::Uuid;

use crate::types::{ChannelKind, TimeoutKind};

/// Dedupe key for an outbound send. Globally unique per logical message;
/// the message store admits at most one `Sent` row per key.
pub fn dedupe_key(
    tenant_id: Uuid,
    contact_id: Uuid,
    plan_id: Uuid,
    node_id: &str,
    channel: ChannelKind,
) -> String {
    format!(
        "{tenant_id}:{contact_id}:{plan_id}:{node_id}:{}",
        channel.as_str()
    )
}

/// Deterministic timeout row/job id. Re-arming the same wait collapses
/// onto the same id instead of scheduling a second deadline.
pub fn timeout_job_id(
    instance_id: Uuid,
    node_id: &str,
    contact_id: Uuid,
    kind: TimeoutKind,
) -> String {
    format!(
        "timeout:{instance_id}:{node_id}:{contact_id}:{}",
        kind.as_str()
    )
}

/// Deterministic job ids for the pipeline hops, so duplicate enqueues of
/// the same logical step are dropped by the queue.
pub fn lead_analysis_job_id(lead_id: Uuid) -> String {
    format!("lead_analysis:{lead_id}")
}

pub fn campaign_creation_job_id(lead_id: Uuid, plan_id: Uuid) -> String {
    format!("campaign_creation:{lead_id}:{plan_id}")
}

pub fn campaign_initialize_job_id(instance_id: Uuid) -> String {
    format!("campaign_initialize:{instance_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_key_shape() {
        let tenant = Uuid::nil();
        let contact = Uuid::nil();
        let plan = Uuid::nil();
        let key = dedupe_key(tenant, contact, plan, "send-1", ChannelKind::Email);
        assert_eq!(
            key,
            format!("{tenant}:{contact}:{plan}:send-1:email")
        );
    }

    #[test]
    fn test_timeout_job_id_is_deterministic() {
        let instance = Uuid::new_v4();
        let contact = Uuid::new_v4();
        let a = timeout_job_id(instance, "wait-1", contact, TimeoutKind::NoOpen);
        let b = timeout_job_id(instance, "wait-1", contact, TimeoutKind::NoOpen);
        assert_eq!(a, b);
        assert!(a.starts_with("timeout:"));
        assert!(a.ends_with(":no_open"));

        let other_kind = timeout_job_id(instance, "wait-1", contact, TimeoutKind::NoClick);
        assert_ne!(a, other_kind);
    }
}
