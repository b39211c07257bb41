use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{
    Campaign, CampaignId, CampaignStatus, DeliveryEvent, ProviderMessageId, Recipient,
    RecipientId, RecipientStatus,
};

/// Result of applying a delivery callback to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryApplied {
    /// The recipient row advanced (or failed).
    Applied,

    /// The row already reflected this event; nothing beyond a possible
    /// timestamp backfill happened.
    AlreadyCurrent,

    /// No row carries this provider message id. Logged and dropped by the
    /// caller; not an error.
    NotFound,
}

/// Field updates for re-admitting a failed recipient.
#[derive(Debug, Clone)]
pub struct RetryUpdate {
    pub retry_count: u32,
    pub last_retry_at: DateTime<Utc>,

    /// Advisory earliest-resend marker for operators. Row selection does
    /// not gate on it: retry-triggered dispatch is immediate, and spacing
    /// comes from the scheduler's cooldown guard.
    pub next_retry_at: DateTime<Utc>,
    pub retry_reason: String,
}

/// Persistence seam for campaigns and recipients.
///
/// The store row is the single source of truth: every status write is a
/// conditional transition (compare-and-set on the expected prior status,
/// or a monotonic rank check), never an unconditional overwrite. This is
/// what lets multiple independent instances (a manual dispatch, the retry
/// scheduler, the watchdog) race against the same store safely.
#[async_trait]
pub trait RecipientStore: Send + Sync {
    // -- campaigns --

    async fn create_campaign(&self, campaign: &Campaign) -> Result<(), StoreError>;

    async fn campaign(&self, id: &CampaignId) -> Result<Option<Campaign>, StoreError>;

    /// Campaigns currently holding the dispatch lease.
    async fn active_campaigns(&self) -> Result<Vec<Campaign>, StoreError>;

    /// Acquire the campaign-level dispatch lease for the run identified by
    /// `token`.
    ///
    /// Conditional transition into `Dispatching`; returns `false` when the
    /// campaign is already dispatching (or missing), in which case the
    /// caller must not start a run. Records the token against the lease
    /// and sets `started_at` on first acquisition.
    async fn try_acquire_dispatch(
        &self,
        id: &CampaignId,
        token: &str,
    ) -> Result<bool, StoreError>;

    /// Release the dispatch lease into a terminal or idle status.
    ///
    /// Only applies if the campaign is still `Dispatching` and the lease
    /// is still held under `token`; a release from a runner whose lease
    /// was broken and re-acquired is a no-op.
    async fn release_dispatch(
        &self,
        id: &CampaignId,
        token: &str,
        into: CampaignStatus,
    ) -> Result<(), StoreError>;

    /// Unconditional status write, used by the watchdog to break a stale
    /// lease or to fail a campaign permanently.
    async fn set_campaign_status(
        &self,
        id: &CampaignId,
        status: CampaignStatus,
    ) -> Result<(), StoreError>;

    /// Atomically bump the persisted automatic-restart counter and return
    /// the new value.
    async fn increment_restart_count(&self, id: &CampaignId) -> Result<u32, StoreError>;

    /// Recompute campaign counters from recipient rows.
    ///
    /// Idempotent: counters are derived from the rows, never incrementally
    /// drifted.
    async fn refresh_campaign_counts(&self, id: &CampaignId) -> Result<Campaign, StoreError>;

    // -- recipients --

    async fn insert_recipients(&self, recipients: &[Recipient]) -> Result<(), StoreError>;

    async fn recipient(&self, id: &RecipientId) -> Result<Option<Recipient>, StoreError>;

    async fn recipients_by_ids(
        &self,
        ids: &[RecipientId],
    ) -> Result<Vec<Recipient>, StoreError>;

    async fn pending_recipients(
        &self,
        campaign: &CampaignId,
    ) -> Result<Vec<Recipient>, StoreError>;

    async fn has_pending(&self, campaign: &CampaignId) -> Result<bool, StoreError>;

    /// Failed recipients still under the retry bound, optionally scoped to
    /// one campaign.
    async fn failed_recipients(
        &self,
        campaign: Option<&CampaignId>,
        max_retries: u32,
    ) -> Result<Vec<Recipient>, StoreError>;

    /// Phone numbers that already reached a successful terminal status
    /// (`sent`, `delivered` or `read`), scoped to one campaign or global.
    async fn successful_phones(
        &self,
        campaign: Option<&CampaignId>,
    ) -> Result<HashSet<String>, StoreError>;

    /// Most recent successful send timestamp for a campaign, if any.
    async fn latest_sent_at(
        &self,
        campaign: &CampaignId,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Reset rows claiming `sent` without a `sent_at` timestamp back to
    /// `pending`. Such rows are corrupt leftovers of an interrupted run.
    async fn repair_corrupt_sent(&self, campaign: &CampaignId) -> Result<u32, StoreError>;

    /// CAS `pending -> sent`, recording the provider message id and send
    /// time. Returns `false` if the row was no longer pending.
    async fn mark_sent(
        &self,
        id: &RecipientId,
        message_id: &ProviderMessageId,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// CAS `pending -> failed` with the classified error text, bumping
    /// `retry_count`. Returns `false` if the row was no longer pending.
    async fn mark_send_failed(&self, id: &RecipientId, error: &str) -> Result<bool, StoreError>;

    /// Mark a duplicate candidate `skipped` with an explanatory reason, so
    /// the store reflects why it was not retried.
    async fn mark_skipped(&self, id: &RecipientId, reason: &str) -> Result<(), StoreError>;

    /// CAS `failed -> pending` with the retry bookkeeping fields set and
    /// the error message cleared. Returns `false` if the row was no longer
    /// failed.
    async fn schedule_retry(
        &self,
        id: &RecipientId,
        update: &RetryUpdate,
    ) -> Result<bool, StoreError>;

    /// Watchdog restart path: move every failed recipient of a campaign
    /// back to `pending`. Returns the number of rows reset.
    async fn reset_failed_to_pending(&self, campaign: &CampaignId) -> Result<u32, StoreError>;

    /// Apply a provider delivery callback by message id, using the
    /// monotonic state machine on the recipient row.
    async fn apply_delivery_event(
        &self,
        event: &DeliveryEvent,
    ) -> Result<DeliveryApplied, StoreError>;
}

/// In-memory store for tests and lightweight embedding.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    campaigns: HashMap<CampaignId, Campaign>,
    recipients: Vec<Recipient>,
    leases: HashMap<CampaignId, String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every recipient row, for assertions and diagnostics.
    pub async fn all_recipients(&self) -> Vec<Recipient> {
        self.inner.lock().await.recipients.clone()
    }
}

impl Inner {
    fn campaign_mut(&mut self, id: &CampaignId) -> Result<&mut Campaign, StoreError> {
        self.campaigns
            .get_mut(id)
            .ok_or_else(|| StoreError::new(format!("campaign not found: {}", id.0)))
    }

    fn recipient_mut(&mut self, id: &RecipientId) -> Result<&mut Recipient, StoreError> {
        self.recipients
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| StoreError::new(format!("recipient not found: {}", id.0)))
    }
}

#[async_trait]
impl RecipientStore for InMemoryStore {
    async fn create_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.campaigns.insert(campaign.id.clone(), campaign.clone());
        Ok(())
    }

    async fn campaign(&self, id: &CampaignId) -> Result<Option<Campaign>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.campaigns.get(id).cloned())
    }

    async fn active_campaigns(&self) -> Result<Vec<Campaign>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .campaigns
            .values()
            .filter(|c| c.status.is_active())
            .cloned()
            .collect())
    }

    async fn try_acquire_dispatch(
        &self,
        id: &CampaignId,
        token: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(campaign) = inner.campaigns.get_mut(id) else {
            return Ok(false);
        };
        if campaign.status == CampaignStatus::Dispatching {
            return Ok(false);
        }
        campaign.status = CampaignStatus::Dispatching;
        let now = Utc::now();
        campaign.started_at.get_or_insert(now);
        campaign.updated_at = now;
        inner.leases.insert(id.clone(), token.to_string());
        Ok(true)
    }

    async fn release_dispatch(
        &self,
        id: &CampaignId,
        token: &str,
        into: CampaignStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.leases.get(id).map(String::as_str) != Some(token) {
            return Ok(());
        }
        let campaign = inner.campaign_mut(id)?;
        if campaign.status == CampaignStatus::Dispatching {
            campaign.status = into;
            campaign.updated_at = Utc::now();
        }
        inner.leases.remove(id);
        Ok(())
    }

    async fn set_campaign_status(
        &self,
        id: &CampaignId,
        status: CampaignStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let campaign = inner.campaign_mut(id)?;
        campaign.status = status;
        campaign.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_restart_count(&self, id: &CampaignId) -> Result<u32, StoreError> {
        let mut inner = self.inner.lock().await;
        let campaign = inner.campaign_mut(id)?;
        campaign.restart_count += 1;
        campaign.updated_at = Utc::now();
        Ok(campaign.restart_count)
    }

    async fn refresh_campaign_counts(&self, id: &CampaignId) -> Result<Campaign, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut total = 0u32;
        let mut sent = 0u32;
        let mut failed = 0u32;
        for r in inner.recipients.iter().filter(|r| &r.campaign_id == id) {
            total += 1;
            if r.status.is_successful() {
                sent += 1;
            } else if r.status == RecipientStatus::Failed {
                failed += 1;
            }
        }
        let campaign = inner.campaign_mut(id)?;
        campaign.total_recipients = total;
        campaign.sent_count = sent;
        campaign.failed_count = failed;
        campaign.updated_at = Utc::now();
        Ok(campaign.clone())
    }

    async fn insert_recipients(&self, recipients: &[Recipient]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.recipients.extend_from_slice(recipients);
        Ok(())
    }

    async fn recipient(&self, id: &RecipientId) -> Result<Option<Recipient>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.recipients.iter().find(|r| &r.id == id).cloned())
    }

    async fn recipients_by_ids(
        &self,
        ids: &[RecipientId],
    ) -> Result<Vec<Recipient>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .recipients
            .iter()
            .filter(|r| ids.contains(&r.id))
            .cloned()
            .collect())
    }

    async fn pending_recipients(
        &self,
        campaign: &CampaignId,
    ) -> Result<Vec<Recipient>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .recipients
            .iter()
            .filter(|r| &r.campaign_id == campaign && r.status == RecipientStatus::Pending)
            .cloned()
            .collect())
    }

    async fn has_pending(&self, campaign: &CampaignId) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .recipients
            .iter()
            .any(|r| &r.campaign_id == campaign && r.status == RecipientStatus::Pending))
    }

    async fn failed_recipients(
        &self,
        campaign: Option<&CampaignId>,
        max_retries: u32,
    ) -> Result<Vec<Recipient>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .recipients
            .iter()
            .filter(|r| {
                r.status == RecipientStatus::Failed
                    && r.retry_count < max_retries
                    && campaign.map_or(true, |c| &r.campaign_id == c)
            })
            .cloned()
            .collect())
    }

    async fn successful_phones(
        &self,
        campaign: Option<&CampaignId>,
    ) -> Result<HashSet<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .recipients
            .iter()
            .filter(|r| {
                r.status.is_successful() && campaign.map_or(true, |c| &r.campaign_id == c)
            })
            .map(|r| r.phone_number.clone())
            .collect())
    }

    async fn latest_sent_at(
        &self,
        campaign: &CampaignId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .recipients
            .iter()
            .filter(|r| &r.campaign_id == campaign)
            .filter_map(|r| r.sent_at)
            .max())
    }

    async fn repair_corrupt_sent(&self, campaign: &CampaignId) -> Result<u32, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut repaired = 0;
        for r in inner
            .recipients
            .iter_mut()
            .filter(|r| &r.campaign_id == campaign)
        {
            if r.status == RecipientStatus::Sent && r.sent_at.is_none() {
                r.status = RecipientStatus::Pending;
                r.message_id = None;
                r.updated_at = Utc::now();
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    async fn mark_sent(
        &self,
        id: &RecipientId,
        message_id: &ProviderMessageId,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let r = inner.recipient_mut(id)?;
        if r.status != RecipientStatus::Pending {
            return Ok(false);
        }
        r.status = RecipientStatus::Sent;
        r.message_id = Some(message_id.clone());
        r.sent_at = Some(sent_at);
        r.error_message = None;
        r.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_send_failed(&self, id: &RecipientId, error: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let r = inner.recipient_mut(id)?;
        if r.status != RecipientStatus::Pending {
            return Ok(false);
        }
        r.status = RecipientStatus::Failed;
        r.error_message = Some(error.to_string());
        r.retry_count += 1;
        r.failed_at = Some(Utc::now());
        r.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_skipped(&self, id: &RecipientId, reason: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let r = inner.recipient_mut(id)?;
        r.status = RecipientStatus::Skipped;
        r.retry_reason = Some(reason.to_string());
        r.updated_at = Utc::now();
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: &RecipientId,
        update: &RetryUpdate,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let r = inner.recipient_mut(id)?;
        if r.status != RecipientStatus::Failed {
            return Ok(false);
        }
        r.status = RecipientStatus::Pending;
        r.retry_count = update.retry_count;
        r.last_retry_at = Some(update.last_retry_at);
        r.next_retry_at = Some(update.next_retry_at);
        r.retry_reason = Some(update.retry_reason.clone());
        r.error_message = None;
        r.updated_at = Utc::now();
        Ok(true)
    }

    async fn reset_failed_to_pending(&self, campaign: &CampaignId) -> Result<u32, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut reset = 0;
        for r in inner
            .recipients
            .iter_mut()
            .filter(|r| &r.campaign_id == campaign)
        {
            if r.status == RecipientStatus::Failed {
                r.status = RecipientStatus::Pending;
                r.updated_at = Utc::now();
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn apply_delivery_event(
        &self,
        event: &DeliveryEvent,
    ) -> Result<DeliveryApplied, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(r) = inner
            .recipients
            .iter_mut()
            .find(|r| r.message_id.as_ref() == Some(&event.message_id))
        else {
            return Ok(DeliveryApplied::NotFound);
        };
        if r.apply_delivery_event(event) {
            Ok(DeliveryApplied::Applied)
        } else {
            Ok(DeliveryApplied::AlreadyCurrent)
        }
    }
}
