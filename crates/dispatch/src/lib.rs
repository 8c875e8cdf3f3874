//! Outbound delivery for drip sends.
//!
//! The gateway claims a per-message dedupe key before every provider
//! call, then routes to the tenant's configured provider. Providers are
//! pluggable behind [`ChannelProvider`].

pub mod gateway;
pub mod messages;
pub mod provider;
pub mod sendgrid;
pub mod smtp;
pub mod tenants;

pub use gateway::{DispatchGateway, SendDisposition, SendOutcome};
pub use messages::{ClaimOutcome, MessageStore};
pub use provider::{ChannelProvider, EmailContent, ProviderReceipt, SendRequest};
pub use sendgrid::SendGridProvider;
pub use smtp::SmtpRelayProvider;
pub use tenants::{InMemoryTenantChannels, TenantChannelSource};
