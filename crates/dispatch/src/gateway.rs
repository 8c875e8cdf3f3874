//! Dispatch gateway: single entry point for outbound sends. Every call
//! claims the message dedupe key first, so concurrent executions of the
//! same logical send collapse to one provider delivery. Emits
//! `dispatch.attempted`, `dispatch.sent`, `dispatch.failed`, and
//! `dispatch.deduped` counters.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use drip_core::keys;
use drip_core::types::{MessageStatus, OutboundMessage};
use drip_core::{DripError, DripResult};

use crate::messages::{ClaimOutcome, MessageStore};
use crate::provider::{ChannelProvider, SendRequest};
use crate::tenants::TenantChannelSource;

/// How a send request resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDisposition {
    /// The provider accepted the message on this call.
    Sent,
    /// A previous attempt already sent this key; the stored receipt is
    /// returned and no provider call is made.
    DedupedReplay,
    /// Another execution holds the claim right now; nothing delivered.
    DuplicateInFlight,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: OutboundMessage,
    pub disposition: SendDisposition,
}

/// Routes send requests to the tenant's configured provider.
pub struct DispatchGateway {
    messages: Arc<MessageStore>,
    tenants: Arc<dyn TenantChannelSource>,
    providers: DashMap<String, Arc<dyn ChannelProvider>>,
}

impl DispatchGateway {
    pub fn new(messages: Arc<MessageStore>, tenants: Arc<dyn TenantChannelSource>) -> Self {
        Self {
            messages,
            tenants,
            providers: DashMap::new(),
        }
    }

    /// Register a delivery provider under its registry key. Adding a
    /// provider is one implementation plus this call.
    pub fn register_provider(&self, provider: Arc<dyn ChannelProvider>) {
        info!(provider = provider.name(), "Delivery provider registered");
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn messages(&self) -> Arc<MessageStore> {
        Arc::clone(&self.messages)
    }

    /// Attempt one outbound send. Safe to call any number of times with
    /// the same logical message: the dedupe claim admits exactly one
    /// delivery per key.
    pub async fn send(&self, request: SendRequest) -> DripResult<SendOutcome> {
        let dedupe_key = keys::dedupe_key(
            request.tenant_id,
            request.contact_id,
            request.plan_id,
            &request.node_id,
            request.channel,
        );

        let candidate = OutboundMessage {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            campaign_instance_id: request.campaign_instance_id,
            node_id: request.node_id.clone(),
            contact_id: request.contact_id,
            channel: request.channel,
            dedupe_key: dedupe_key.clone(),
            status: MessageStatus::Queued,
            provider_message_id: None,
            response_status: None,
            response_headers: Vec::new(),
            error: None,
            created_at: Utc::now(),
            sent_at: None,
        };

        match self.messages.claim(candidate) {
            ClaimOutcome::AlreadySent(message) => {
                metrics::counter!("dispatch.deduped", "reason" => "already_sent").increment(1);
                info!(
                    dedupe_key = %dedupe_key,
                    provider_message_id = ?message.provider_message_id,
                    "Send already completed; replaying receipt"
                );
                return Ok(SendOutcome {
                    message,
                    disposition: SendDisposition::DedupedReplay,
                });
            }
            ClaimOutcome::InFlight(message) => {
                metrics::counter!("dispatch.deduped", "reason" => "in_flight").increment(1);
                info!(dedupe_key = %dedupe_key, "Send already in flight; skipping");
                return Ok(SendOutcome {
                    message,
                    disposition: SendDisposition::DuplicateInFlight,
                });
            }
            ClaimOutcome::Claimed(_) => {}
        }

        let provider_name = match self
            .tenants
            .primary_provider(request.tenant_id, request.channel)
            .await
        {
            Ok(name) => name,
            Err(err) => {
                self.messages.mark_failed(&dedupe_key, &err.to_string());
                warn!(
                    tenant_id = %request.tenant_id,
                    error = %err,
                    "No provider configured for tenant"
                );
                return Err(err);
            }
        };

        let provider = match self.providers.get(&provider_name) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                let err = DripError::Unconfigured(format!(
                    "provider {provider_name} is not registered"
                ));
                self.messages.mark_failed(&dedupe_key, &err.to_string());
                return Err(err);
            }
        };

        metrics::counter!("dispatch.attempted", "provider" => provider_name.clone()).increment(1);
        let start = std::time::Instant::now();

        match provider.deliver(&request).await {
            Ok(receipt) => {
                let message = self
                    .messages
                    .mark_sent(&dedupe_key, &receipt)
                    .ok_or_else(|| {
                        DripError::Internal(anyhow::anyhow!(
                            "claimed row {dedupe_key} vanished before completion"
                        ))
                    })?;
                metrics::counter!("dispatch.sent", "provider" => provider_name.clone())
                    .increment(1);
                metrics::histogram!("dispatch.latency_ms", "provider" => provider_name)
                    .record(start.elapsed().as_millis() as f64);
                info!(
                    dedupe_key = %dedupe_key,
                    provider_message_id = %receipt.provider_message_id,
                    response_status = receipt.response_status,
                    "Message sent"
                );
                Ok(SendOutcome {
                    message,
                    disposition: SendDisposition::Sent,
                })
            }
            Err(err) => {
                self.messages.mark_failed(&dedupe_key, &err.to_string());
                metrics::counter!(
                    "dispatch.failed",
                    "provider" => provider_name,
                    "retryable" => if err.is_retryable() { "true" } else { "false" }
                )
                .increment(1);
                warn!(dedupe_key = %dedupe_key, error = %err, "Provider delivery failed");
                Err(err)
            }
        }
    }
}
