use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use drip_core::types::{MessageStatus, OutboundMessage};

use crate::provider::ProviderReceipt;

/// Result of claiming a dedupe key before a provider call.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// Key claimed as Queued; the caller must attempt the send.
    Claimed(OutboundMessage),
    /// A previous attempt already sent this key; replay the receipt.
    AlreadySent(OutboundMessage),
    /// Another execution holds the Queued claim right now.
    InFlight(OutboundMessage),
}

/// Outbound message rows keyed by dedupe key. The entry lock around
/// each claim transition is the only concurrency guard on sends: at
/// most one row per key ever reaches `Sent`.
#[derive(Default)]
pub struct MessageStore {
    messages: DashMap<String, OutboundMessage>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
        }
    }

    /// Claim the candidate's dedupe key. A `Failed` row is reclaimed in
    /// place (same message id) so retries converge on one logical row.
    pub fn claim(&self, candidate: OutboundMessage) -> ClaimOutcome {
        match self.messages.entry(candidate.dedupe_key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                let row = existing.get_mut();
                match row.status {
                    MessageStatus::Sent => ClaimOutcome::AlreadySent(row.clone()),
                    MessageStatus::Queued => ClaimOutcome::InFlight(row.clone()),
                    MessageStatus::Failed => {
                        row.status = MessageStatus::Queued;
                        row.error = None;
                        ClaimOutcome::Claimed(row.clone())
                    }
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let row = slot.insert(candidate);
                ClaimOutcome::Claimed(row.clone())
            }
        }
    }

    /// Complete a claimed row with the provider's receipt. The full
    /// receipt is persisted so deduped replays return it unchanged.
    pub fn mark_sent(&self, dedupe_key: &str, receipt: &ProviderReceipt) -> Option<OutboundMessage> {
        let mut entry = self.messages.get_mut(dedupe_key)?;
        if entry.status != MessageStatus::Queued {
            return None;
        }
        entry.status = MessageStatus::Sent;
        entry.provider_message_id = Some(receipt.provider_message_id.clone());
        entry.response_status = Some(receipt.response_status);
        entry.response_headers = receipt.response_headers.clone();
        entry.sent_at = Some(Utc::now());
        entry.error = None;
        Some(entry.clone())
    }

    pub fn mark_failed(&self, dedupe_key: &str, error: &str) -> Option<OutboundMessage> {
        let mut entry = self.messages.get_mut(dedupe_key)?;
        if entry.status != MessageStatus::Queued {
            return None;
        }
        entry.status = MessageStatus::Failed;
        entry.error = Some(error.to_string());
        Some(entry.clone())
    }

    pub fn get(&self, dedupe_key: &str) -> Option<OutboundMessage> {
        self.messages.get(dedupe_key).map(|m| m.clone())
    }

    pub fn for_instance(&self, campaign_instance_id: Uuid) -> Vec<OutboundMessage> {
        self.messages
            .iter()
            .filter(|m| m.campaign_instance_id == campaign_instance_id)
            .map(|m| m.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
