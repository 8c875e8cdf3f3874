//! Lead intake collaborators: stored leads, the contact directory the
//! dispatcher reads addresses from, and the analyzer that decides which
//! leads get enrolled.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use drip_core::types::{Contact, Lead, LeadAnalysis};
use drip_core::{DripError, DripResult};

/// Read side of contact data, resolved at send time.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn get(&self, contact_id: Uuid) -> DripResult<Contact>;

    async fn upsert(&self, contact: Contact) -> DripResult<()>;
}

#[derive(Default)]
pub struct InMemoryContacts {
    contacts: DashMap<Uuid, Contact>,
}

impl InMemoryContacts {
    pub fn new() -> Self {
        Self {
            contacts: DashMap::new(),
        }
    }
}

#[async_trait]
impl ContactDirectory for InMemoryContacts {
    async fn get(&self, contact_id: Uuid) -> DripResult<Contact> {
        self.contacts
            .get(&contact_id)
            .map(|c| c.clone())
            .ok_or_else(|| DripError::NotFound(format!("contact {contact_id}")))
    }

    async fn upsert(&self, contact: Contact) -> DripResult<()> {
        self.contacts.insert(contact.id, contact);
        Ok(())
    }
}

/// Stored leads and their analysis results.
#[derive(Default)]
pub struct LeadStore {
    leads: DashMap<Uuid, Lead>,
    analyses: DashMap<Uuid, LeadAnalysis>,
}

impl LeadStore {
    pub fn new() -> Self {
        Self {
            leads: DashMap::new(),
            analyses: DashMap::new(),
        }
    }

    pub fn insert(&self, lead: Lead) {
        self.leads.insert(lead.id, lead);
    }

    pub fn get(&self, id: Uuid) -> Option<Lead> {
        self.leads.get(&id).map(|l| l.clone())
    }

    pub fn get_required(&self, id: Uuid) -> DripResult<Lead> {
        self.get(id)
            .ok_or_else(|| DripError::NotFound(format!("lead {id}")))
    }

    pub fn record_analysis(&self, analysis: LeadAnalysis) {
        self.analyses.insert(analysis.lead_id, analysis);
    }

    pub fn analysis(&self, lead_id: Uuid) -> Option<LeadAnalysis> {
        self.analyses.get(&lead_id).map(|a| a.clone())
    }

    pub fn len(&self) -> usize {
        self.leads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leads.is_empty()
    }
}

/// Decides whether a lead is worth enrolling into a drip campaign.
#[async_trait]
pub trait LeadAnalyzer: Send + Sync {
    async fn analyze(&self, lead: &Lead) -> DripResult<LeadAnalysis>;
}

/// Keyword-weighted scoring over titles and company signals. Stands in
/// for an external enrichment service behind the same trait.
pub struct HeuristicLeadAnalyzer {
    qualification_threshold: f32,
}

const SENIOR_TITLES: [&str; 6] = ["ceo", "cto", "founder", "vp", "head", "director"];

impl HeuristicLeadAnalyzer {
    pub fn new() -> Self {
        Self {
            qualification_threshold: 0.5,
        }
    }

    fn score(&self, lead: &Lead) -> f32 {
        let mut score: f32 = 0.0;

        // Reachability: leads with no contacts cannot be dripped at all.
        match lead.contacts.len() {
            0 => return 0.0,
            1 => score += 0.2,
            _ => score += 0.35,
        }

        let senior_contacts = lead
            .contacts
            .iter()
            .filter(|c| {
                c.title
                    .as_deref()
                    .map(|t| {
                        let t = t.to_lowercase();
                        SENIOR_TITLES.iter().any(|kw| t.contains(kw))
                    })
                    .unwrap_or(false)
            })
            .count();
        if senior_contacts > 0 {
            score += 0.35;
        }

        let named_contacts = lead
            .contacts
            .iter()
            .filter(|c| c.full_name.is_some())
            .count();
        if named_contacts == lead.contacts.len() {
            score += 0.15;
        }

        if lead.source == "referral" {
            score += 0.15;
        }

        score.min(1.0)
    }
}

impl Default for HeuristicLeadAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeadAnalyzer for HeuristicLeadAnalyzer {
    async fn analyze(&self, lead: &Lead) -> DripResult<LeadAnalysis> {
        let score = self.score(lead);
        let qualified = score >= self.qualification_threshold;
        debug!(
            lead_id = %lead.id,
            company = %lead.company,
            score = score,
            qualified = qualified,
            "Lead analyzed"
        );
        Ok(LeadAnalysis {
            lead_id: lead.id,
            score,
            qualified,
            summary: format!(
                "{} contact(s), source {}, score {score:.2}",
                lead.contacts.len(),
                lead.source
            ),
            analyzed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead_with_contacts(contacts: Vec<Contact>) -> Lead {
        Lead {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            company: "Acme Corp".to_string(),
            source: "webform".to_string(),
            contacts,
            created_at: Utc::now(),
        }
    }

    fn contact(title: Option<&str>) -> Contact {
        Contact {
            id: Uuid::new_v4(),
            email: "person@acme.example".to_string(),
            full_name: Some("Ada Lovelace".to_string()),
            title: title.map(|t| t.to_string()),
        }
    }

    #[tokio::test]
    async fn test_contactless_lead_is_unqualified() {
        let analyzer = HeuristicLeadAnalyzer::new();
        let analysis = analyzer
            .analyze(&lead_with_contacts(Vec::new()))
            .await
            .unwrap();
        assert_eq!(analysis.score, 0.0);
        assert!(!analysis.qualified);
    }

    #[tokio::test]
    async fn test_senior_multi_contact_lead_qualifies() {
        let analyzer = HeuristicLeadAnalyzer::new();
        let lead = lead_with_contacts(vec![
            contact(Some("CTO")),
            contact(Some("Engineering Manager")),
        ]);
        let analysis = analyzer.analyze(&lead).await.unwrap();
        assert!(analysis.qualified, "score was {}", analysis.score);
    }

    #[tokio::test]
    async fn test_directory_round_trip() {
        let directory = InMemoryContacts::new();
        let c = contact(Some("CEO"));
        let id = c.id;
        directory.upsert(c).await.unwrap();
        assert_eq!(directory.get(id).await.unwrap().email, "person@acme.example");
        assert!(directory.get(Uuid::new_v4()).await.is_err());
    }
}
