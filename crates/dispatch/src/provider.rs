use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use drip_core::types::ChannelKind;
use drip_core::DripResult;

/// Rendered content for one outbound email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailContent {
    pub subject: String,
    pub body: String,
}

/// One send attempt as the gateway hands it to a provider.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub tenant_id: Uuid,
    pub contact_id: Uuid,
    pub plan_id: Uuid,
    pub campaign_instance_id: Uuid,
    pub node_id: String,
    pub channel: ChannelKind,
    pub to_email: String,
    pub content: EmailContent,
}

/// Provider acknowledgement persisted with the message row: the
/// provider's message id, the status of the accepting response, and
/// any response headers worth keeping.
#[derive(Debug, Clone)]
pub struct ProviderReceipt {
    pub provider_message_id: String,
    pub response_status: u16,
    pub response_headers: Vec<(String, String)>,
    pub latency_ms: u64,
}

/// Capability seam for delivery providers. Adding a provider is one new
/// implementation plus registration; the gateway never changes.
///
/// Errors use the shared taxonomy: `TransientProvider` for faults worth
/// retrying, `FatalProvider` for rejected sends, `Unconfigured` when
/// the provider cannot run at all.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Registry key, e.g. "sendgrid".
    fn name(&self) -> &'static str;

    fn channel(&self) -> ChannelKind;

    async fn deliver(&self, request: &SendRequest) -> DripResult<ProviderReceipt>;
}
