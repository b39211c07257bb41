//! A bulk WhatsApp campaign dispatch engine.
//!
//! This crate provides the **send, retry and delivery-tracking core** for
//! blast campaigns: rate-limited batch dispatch against a templated
//! messaging API, failure classification with tiered backoff, duplicate
//! suppression across restarts, asynchronous delivery-callback ingestion,
//! and a watchdog that recovers stalled campaigns without operator
//! intervention.
//!
//! ## Guarantees
//! - Effectively-once sends via application-level deduplication
//! - Monotonic per-recipient delivery state (no status regression)
//! - Bounded automatic restarts, persisted across process restarts
//! - At most one active dispatch run per campaign (store-side lease)
//!
//! ## Non-Guarantees
//! - Exactly-once delivery against the messaging provider
//! - Durability beyond the backing recipient store
//! - Multi-tenant isolation
//! - A general-purpose message queue
//!
//! The registration CRUD, ticket rendering and other surfaces around this
//! engine are external collaborators; this crate only contracts against
//! the recipient store and the provider's send and callback interfaces.

mod dedupe;
mod dispatcher;
mod error;
mod retry;
mod sender;
mod store;
mod types;
mod watchdog;
mod webhook;

#[cfg(feature = "postgres")]
mod store_postgres;

pub use dedupe::DuplicateFilter;
pub use dispatcher::{DispatchSummary, Dispatcher};
pub use error::{classify_error, DispatchError, ErrorClass, SendError, StoreError};
pub use retry::{retry_delay, RetryAction, RetryDetail, RetryOptions, RetryScheduler, RetryStats};
pub use sender::{
    adaptive_multiplier, batch_pause, jitter, message_delay, MessageSender, MultiTierLimiter,
    TemplateMessage, TokenBucket,
};
pub use store::{DeliveryApplied, InMemoryStore, RecipientStore, RetryUpdate};
pub use types::{
    canonical_phone, Campaign, CampaignId, CampaignStatus, ConfigError, DeliveryEvent,
    DeliveryEventKind, ProviderMessageId, RateLimitConfig, Recipient, RecipientId,
    RecipientStatus,
};
pub use watchdog::{Watchdog, WatchdogAction, WatchdogConfig};
pub use webhook::{
    parse_payload, parse_status_event, verify_payload_signature, verify_subscription,
    InboundMessage, InboundText, ProviderErrorPayload, StatusEvent, WebhookChange,
    WebhookChangeValue, WebhookEntry, WebhookPayload, WebhookProcessor, WebhookSummary,
};

#[cfg(feature = "http")]
pub use sender::HttpSender;

#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;
