//! SMTP relay provider for tenants that route through their own relay
//! instead of a hosted API.

use async_trait::async_trait;
use tracing::{debug, info};

use drip_core::types::ChannelKind;
use drip_core::{DripError, DripResult};

use crate::provider::{ChannelProvider, ProviderReceipt, SendRequest};

pub struct SmtpRelayProvider {
    relay_url: String,
    from_email: String,
}

impl SmtpRelayProvider {
    pub fn new(relay_url: String, from_email: String) -> Self {
        info!(relay = %relay_url, "SMTP relay provider initialized");
        Self {
            relay_url,
            from_email,
        }
    }

    fn build_message(&self, request: &SendRequest) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nX-Drip-Instance: {}\r\nX-Drip-Node: {}\r\nContent-Type: text/html\r\n\r\n{}",
            self.from_email,
            request.to_email,
            request.content.subject,
            request.campaign_instance_id,
            request.node_id,
            request.content.body
        )
    }
}

#[async_trait]
impl ChannelProvider for SmtpRelayProvider {
    fn name(&self) -> &'static str {
        "smtp_relay"
    }

    fn channel(&self) -> ChannelKind {
        ChannelKind::Email
    }

    /// Relay an email over SMTP.
    /// In production: open a connection to the relay and submit the message.
    async fn deliver(&self, request: &SendRequest) -> DripResult<ProviderReceipt> {
        if self.relay_url.is_empty() {
            return Err(DripError::Unconfigured(
                "smtp relay url is not set".to_string(),
            ));
        }

        let start = std::time::Instant::now();
        let message = self.build_message(request);

        debug!(
            to = %request.to_email,
            relay = %self.relay_url,
            bytes = message.len(),
            "Relaying email over SMTP"
        );
        metrics::counter!("dispatch.provider_sends", "provider" => "smtp_relay").increment(1);

        // Relay acceptance is a 250 reply quoting the queue id.
        let queue_id = format!("smtp-{}", uuid::Uuid::new_v4());
        Ok(ProviderReceipt {
            provider_message_id: queue_id.clone(),
            response_status: 250,
            response_headers: vec![(
                "smtp-reply".to_string(),
                format!("250 2.0.0 OK queued as {queue_id}"),
            )],
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::EmailContent;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_relay_includes_correlation_headers() {
        let provider = SmtpRelayProvider::new(
            "smtp://mail.internal:587".to_string(),
            "hello@dripexpress.io".to_string(),
        );
        let request = SendRequest {
            tenant_id: Uuid::new_v4(),
            contact_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            campaign_instance_id: Uuid::new_v4(),
            node_id: "wait-1".to_string(),
            channel: ChannelKind::Email,
            to_email: "grace@example.com".to_string(),
            content: EmailContent {
                subject: "Following up".to_string(),
                body: "<p>Still interested?</p>".to_string(),
            },
        };

        let message = provider.build_message(&request);
        assert!(message.contains("X-Drip-Node: wait-1"));
        assert!(message.contains("To: grace@example.com"));

        let receipt = provider.deliver(&request).await.unwrap();
        assert!(receipt.provider_message_id.starts_with("smtp-"));
        assert_eq!(receipt.response_status, 250);
        assert!(receipt.response_headers[0].1.contains(&receipt.provider_message_id));
    }
}
