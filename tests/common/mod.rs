#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use blast_dispatcher::{
    Campaign, CampaignId, InMemoryStore, MessageSender, ProviderMessageId, RateLimitConfig,
    Recipient, SendError, TemplateMessage,
};

/// Scripted sender: succeeds with a fresh provider id unless a failure has
/// been registered for the destination number.
#[derive(Default)]
pub struct MockSender {
    fail_always: Mutex<HashMap<String, SendError>>,
    sent: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl MockSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn fail_number(&self, phone: &str, err: SendError) {
        self.fail_always
            .lock()
            .await
            .insert(phone.to_string(), err);
    }

    pub async fn clear_failures(&self) {
        self.fail_always.lock().await.clear();
    }

    /// Destination numbers in send order, successful sends only.
    pub async fn sent_log(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl MessageSender for MockSender {
    async fn send_template(
        &self,
        message: &TemplateMessage,
    ) -> Result<ProviderMessageId, SendError> {
        if let Some(err) = self.fail_always.lock().await.get(&message.to) {
            return Err(err.clone());
        }
        self.sent.lock().await.push(message.to.clone());
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(ProviderMessageId(format!("wamid.{}", n)))
    }
}

/// Pacing config with every delay zeroed so tests run instantly.
pub fn fast_config() -> RateLimitConfig {
    RateLimitConfig {
        batch_size: 50,
        per_second: 1_000,
        per_minute: 60_000,
        per_hour: 3_600_000,
        base_delay_ms: 0,
        batch_pause_ms: 0,
        max_multiplier: 1.0,
        max_delay_ms: 0,
        send_timeout_ms: 1_000,
        version: 1,
    }
}

pub fn phone(i: usize) -> String {
    format!("62812000{:05}", i)
}

pub fn make_recipients(campaign: &CampaignId, count: usize) -> Vec<Recipient> {
    (0..count)
        .map(|i| {
            Recipient::new(
                format!("{}-r{}", campaign.0, i),
                campaign.clone(),
                phone(i),
                format!("Guest {}", i),
            )
        })
        .collect()
}

/// Seed a draft campaign with `count` pending recipients.
pub async fn seed_campaign(
    store: &Arc<InMemoryStore>,
    id: &str,
    count: usize,
) -> (Campaign, Vec<Recipient>) {
    let campaign = Campaign::new(id, format!("Campaign {}", id), "event_reminder");
    let recipients = make_recipients(&campaign.id, count);
    store.create_campaign(&campaign).await.unwrap();
    store.insert_recipients(&recipients).await.unwrap();
    (campaign, recipients)
}

// Re-export so test files get the trait methods without importing the
// store trait everywhere.
pub use blast_dispatcher::RecipientStore;
