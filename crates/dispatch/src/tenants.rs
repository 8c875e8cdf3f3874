use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use drip_core::types::ChannelKind;
use drip_core::{DripError, DripResult};

/// Resolves which provider a tenant sends a channel through. Backed by
/// tenant settings in the hosting product; in-memory here.
#[async_trait]
pub trait TenantChannelSource: Send + Sync {
    /// Name of the tenant's primary provider for the channel. A tenant
    /// with nothing assigned is a hard configuration fault, never a
    /// silent skip.
    async fn primary_provider(&self, tenant_id: Uuid, channel: ChannelKind) -> DripResult<String>;
}

#[derive(Default)]
pub struct InMemoryTenantChannels {
    assignments: DashMap<(Uuid, ChannelKind), String>,
}

impl InMemoryTenantChannels {
    pub fn new() -> Self {
        Self {
            assignments: DashMap::new(),
        }
    }

    pub fn assign(&self, tenant_id: Uuid, channel: ChannelKind, provider: &str) {
        self.assignments
            .insert((tenant_id, channel), provider.to_string());
    }
}

#[async_trait]
impl TenantChannelSource for InMemoryTenantChannels {
    async fn primary_provider(&self, tenant_id: Uuid, channel: ChannelKind) -> DripResult<String> {
        self.assignments
            .get(&(tenant_id, channel))
            .map(|p| p.clone())
            .ok_or_else(|| {
                DripError::Unconfigured(format!(
                    "tenant {tenant_id} has no {} provider assigned",
                    channel.as_str()
                ))
            })
    }
}
