use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::dedupe::DuplicateFilter;
use crate::error::{DispatchError, ErrorClass, SendError};
use crate::sender::{
    adaptive_multiplier, batch_pause, jitter, message_delay, MessageSender, MultiTierLimiter,
    TemplateMessage,
};
use crate::store::RecipientStore;
use crate::types::{
    canonical_phone, Campaign, CampaignId, CampaignStatus, RateLimitConfig, Recipient,
    RecipientStatus,
};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::counter!(name).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Counts reported by one dispatch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub batches: u32,
    pub success: u32,
    pub failed: u32,

    /// Duplicates written back as `skipped` before the run.
    pub skipped: u32,
}

/// Pacing profile for a run. Retry-triggered dispatch is deliberately
/// slower than a fresh campaign run, to avoid compounding whatever caused
/// the failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchProfile {
    Fresh,
    Retry,
}

impl DispatchProfile {
    fn effective(&self, cfg: RateLimitConfig) -> RateLimitConfig {
        match self {
            DispatchProfile::Fresh => cfg,
            DispatchProfile::Retry => cfg.retry_profile(),
        }
    }
}

struct RunOutcome {
    summary: DispatchSummary,
    final_status: CampaignStatus,
}

/// Rate-limited batch dispatcher.
///
/// One instance serves every campaign; mutual exclusion per campaign is
/// the store-side lease (`try_acquire_dispatch`), not an in-process lock,
/// so independent processes racing on the same store are safe too.
pub struct Dispatcher {
    store: Arc<dyn RecipientStore>,
    sender: Arc<dyn MessageSender>,
    config: Arc<RwLock<RateLimitConfig>>,
    filter: DuplicateFilter,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RecipientStore>,
        sender: Arc<dyn MessageSender>,
        config: RateLimitConfig,
    ) -> Self {
        let filter = DuplicateFilter::new(store.clone());
        Self {
            store,
            sender,
            config: Arc::new(RwLock::new(config)),
            filter,
        }
    }

    pub fn store(&self) -> Arc<dyn RecipientStore> {
        self.store.clone()
    }

    /// Current configuration snapshot.
    pub async fn config(&self) -> RateLimitConfig {
        self.config.read().await.clone()
    }

    /// Hot-reload the rate-limit configuration.
    ///
    /// The new value is validated before it is accepted and its version is
    /// bumped past the current one; in-flight runs pick it up at their next
    /// batch boundary.
    pub async fn update_config(&self, mut cfg: RateLimitConfig) -> Result<(), DispatchError> {
        cfg.validate()?;
        let mut guard = self.config.write().await;
        cfg.version = guard.version + 1;
        info!(version = cfg.version, "rate-limit config reloaded");
        *guard = cfg;
        Ok(())
    }

    /// Compose a campaign: deduplicate the candidate list, then persist
    /// the campaign and its recipient rows in bulk.
    ///
    /// Candidates sharing a canonical phone number are collapsed to one
    /// dispatchable row; the extras are persisted as `skipped` with an
    /// explanatory reason. Numbers that already succeeded in an earlier
    /// campaign are dropped before insertion.
    ///
    /// Returns the number of dispatchable recipients created.
    pub async fn compose_campaign(
        &self,
        mut campaign: Campaign,
        candidates: Vec<Recipient>,
    ) -> Result<u32, DispatchError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut unique = Vec::with_capacity(candidates.len());
        let mut collapsed = Vec::new();
        for mut candidate in candidates {
            if let Some(canonical) = canonical_phone(&candidate.phone_number) {
                candidate.phone_number = canonical;
            }
            // Uncanonicalizable numbers stay as-is and fail validation at
            // send time, so the row records why.

            if seen.insert(candidate.phone_number.clone()) {
                unique.push(candidate);
            } else {
                candidate.status = RecipientStatus::Skipped;
                candidate.retry_reason = Some(format!(
                    "duplicate: {} appears more than once in this campaign",
                    candidate.phone_number
                ));
                collapsed.push(candidate);
            }
        }

        let mut rows = self.filter.eligible_recipients(None, unique).await;
        let dispatchable = rows.len() as u32;
        rows.extend(collapsed);
        campaign.total_recipients = rows.len() as u32;

        self.store.create_campaign(&campaign).await?;
        self.store.insert_recipients(&rows).await?;
        info!(
            campaign = %campaign.id.0,
            recipients = dispatchable,
            collapsed = rows.len() as u32 - dispatchable,
            "campaign composed"
        );
        Ok(dispatchable)
    }

    /// Start (or resume) a campaign run.
    ///
    /// Every start goes through the duplicate filter: rows whose number
    /// already succeeded (here or in a sibling row of the same campaign)
    /// are written back as `skipped` before the remainder is dispatched.
    pub async fn start_campaign(
        &self,
        id: &CampaignId,
    ) -> Result<DispatchSummary, DispatchError> {
        let candidates = self.store.pending_recipients(id).await?;
        let (_kept, skipped) = self
            .filter
            .filter_marking_skipped(Some(id), candidates)
            .await;

        let mut summary = self.dispatch(id, DispatchProfile::Fresh).await?;
        summary.skipped += skipped;
        Ok(summary)
    }

    /// Restart a campaign after an earlier partial run. Same path as
    /// [`start_campaign`]; the name records the operator intent.
    pub async fn restart_campaign(
        &self,
        id: &CampaignId,
    ) -> Result<DispatchSummary, DispatchError> {
        self.start_campaign(id).await
    }

    /// Refresh and return campaign counters, the observability surface.
    pub async fn campaign_progress(&self, id: &CampaignId) -> Result<Campaign, DispatchError> {
        Ok(self.store.refresh_campaign_counts(id).await?)
    }

    /// Run dispatch for one campaign under the given pacing profile.
    ///
    /// Acquires the campaign lease first; a concurrent run (manual,
    /// watchdog or retry-triggered) observes the lease and declines.
    /// The lease is released on every exit path.
    pub(crate) async fn dispatch(
        &self,
        id: &CampaignId,
        profile: DispatchProfile,
    ) -> Result<DispatchSummary, DispatchError> {
        let campaign = self
            .store
            .campaign(id)
            .await?
            .ok_or_else(|| DispatchError::CampaignNotFound {
                campaign_id: id.clone(),
            })?;

        // The token ties the release to this run: if the watchdog breaks a
        // stalled lease and a new run takes over, a late release from the
        // old holder no longer matches and is a no-op.
        let token = format!("run-{:016x}", fastrand::u64(..));
        if !self.store.try_acquire_dispatch(id, &token).await? {
            metric_inc("blast.dispatch.lease_declined");
            return Err(DispatchError::AlreadyDispatching {
                campaign_id: id.clone(),
            });
        }

        info!(campaign = %id.0, profile = ?profile, "dispatch run started");
        let outcome = self.run(&campaign, profile).await;

        match outcome {
            Ok(run) => {
                self.store
                    .release_dispatch(id, &token, run.final_status)
                    .await?;
                let refreshed = self.store.refresh_campaign_counts(id).await?;
                info!(
                    campaign = %id.0,
                    status = refreshed.status.as_str(),
                    sent = refreshed.sent_count,
                    failed = refreshed.failed_count,
                    batches = run.summary.batches,
                    "dispatch run finished"
                );
                Ok(run.summary)
            }
            Err(err) => {
                // Release back to idle so the campaign stays dispatchable;
                // the error itself is surfaced to the caller.
                if let Err(release_err) = self
                    .store
                    .release_dispatch(id, &token, CampaignStatus::Draft)
                    .await
                {
                    warn!(
                        campaign = %id.0,
                        error = %release_err,
                        "failed to release dispatch lease"
                    );
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        campaign: &Campaign,
        profile: DispatchProfile,
    ) -> Result<RunOutcome, DispatchError> {
        let repaired = self.store.repair_corrupt_sent(&campaign.id).await?;
        if repaired > 0 {
            warn!(
                campaign = %campaign.id.0,
                repaired,
                "reset corrupt sent-without-timestamp rows to pending"
            );
        }

        let pending = self.store.pending_recipients(&campaign.id).await?;
        let total = pending.len();
        let mut summary = DispatchSummary::default();

        if pending.is_empty() {
            return Ok(RunOutcome {
                summary,
                final_status: CampaignStatus::Completed,
            });
        }

        let mut limiter = MultiTierLimiter::new(&profile.effective(self.config().await));
        let mut multiplier = 1.0f64;
        let mut attempted = 0usize;
        let mut cursor = 0usize;

        while cursor < total {
            // Configuration is re-read at every batch boundary, never once
            // at run start: ceilings drift with observed provider behavior.
            let cfg = profile.effective(self.config().await);
            limiter.sync_config(&cfg);

            let batch_end = (cursor + cfg.batch_size).min(total);
            let batch = &pending[cursor..batch_end];
            let mut batch_errors = 0usize;

            debug!(
                campaign = %campaign.id.0,
                batch = summary.batches + 1,
                size = batch.len(),
                config_version = cfg.version,
                "processing batch"
            );

            for recipient in batch {
                if attempted > 0 {
                    let delay = message_delay(&cfg, limiter.delay_until_ready(), multiplier);
                    if !delay.is_zero() {
                        sleep(jitter(delay)).await;
                    }
                }
                attempted += 1;

                match self.send_one(campaign, recipient, &cfg, &mut limiter).await? {
                    SendResult::Sent => summary.success += 1,
                    SendResult::Failed => {
                        summary.failed += 1;
                        batch_errors += 1;
                    }
                    SendResult::AlreadyTaken => {}
                    SendResult::Systemic(err) => {
                        // Provider unreachable or credentials rejected:
                        // fail the rest of the run and the campaign.
                        summary.failed += 1;
                        summary.batches += 1;
                        let aborted = self.fail_remaining(&pending[attempted..], &err).await?;
                        summary.failed += aborted;
                        metric_inc("blast.dispatch.aborted");
                        warn!(
                            campaign = %campaign.id.0,
                            error = %err,
                            aborted,
                            "systemic send failure, campaign failed"
                        );
                        return Ok(RunOutcome {
                            summary,
                            final_status: CampaignStatus::Failed,
                        });
                    }
                }
            }

            summary.batches += 1;
            cursor = batch_end;
            self.store.refresh_campaign_counts(&campaign.id).await?;

            let batch_error_rate = batch_errors as f64 / batch.len() as f64;
            let progress = attempted as f64 / total as f64;
            multiplier = adaptive_multiplier(batch_error_rate, progress, cfg.max_multiplier);

            if cursor < total {
                let pause = batch_pause(&cfg, multiplier);
                debug!(
                    campaign = %campaign.id.0,
                    pause_ms = pause.as_millis() as u64,
                    multiplier,
                    "inter-batch pause"
                );
                sleep(pause).await;
            }
        }

        // Pending rows may have been re-admitted concurrently (retry
        // scheduler); only a drained campaign is complete.
        let final_status = if self.store.has_pending(&campaign.id).await? {
            CampaignStatus::Draft
        } else {
            CampaignStatus::Completed
        };

        Ok(RunOutcome {
            summary,
            final_status,
        })
    }

    async fn send_one(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        cfg: &RateLimitConfig,
        limiter: &mut MultiTierLimiter,
    ) -> Result<SendResult, DispatchError> {
        let Some(phone) = canonical_phone(&recipient.phone_number) else {
            let error = format!("invalid phone format: {}", recipient.phone_number);
            self.store.mark_send_failed(&recipient.id, &error).await?;
            metric_inc("blast.send.validation_failed");
            return Ok(SendResult::Failed);
        };

        let message = TemplateMessage {
            to: phone,
            template_name: campaign.template_name.clone(),
            language: campaign.language.clone(),
            parameters: vec![recipient.name.clone()],
        };

        limiter.record_send();

        let send = self.sender.send_template(&message);
        let result = match timeout(Duration::from_millis(cfg.send_timeout_ms), send).await {
            Ok(result) => result,
            Err(_) => Err(SendError::network(format!(
                "send timed out after {}ms",
                cfg.send_timeout_ms
            ))),
        };

        match result {
            Ok(message_id) => {
                let applied = self
                    .store
                    .mark_sent(&recipient.id, &message_id, chrono::Utc::now())
                    .await?;
                if applied {
                    metric_inc("blast.send.success");
                    Ok(SendResult::Sent)
                } else {
                    // Another instance already moved this row along.
                    debug!(
                        recipient = %recipient.id.0,
                        "row advanced concurrently, send result discarded"
                    );
                    Ok(SendResult::AlreadyTaken)
                }
            }
            Err(err) if err.class == ErrorClass::Systemic => {
                // The row that surfaced the systemic error keeps the real
                // provider message; the untouched remainder gets the
                // distinguishing abort marker.
                self.store
                    .mark_send_failed(&recipient.id, &err.message)
                    .await?;
                Ok(SendResult::Systemic(err))
            }
            Err(err) => {
                self.store
                    .mark_send_failed(&recipient.id, &err.message)
                    .await?;
                metric_inc("blast.send.failed");
                debug!(
                    recipient = %recipient.id.0,
                    class = err.class.as_str(),
                    error = %err.message,
                    "send failed"
                );
                Ok(SendResult::Failed)
            }
        }
    }

    /// Mass-fail the untouched remainder of an aborted run with a
    /// distinguishing error.
    async fn fail_remaining(
        &self,
        remaining: &[Recipient],
        cause: &SendError,
    ) -> Result<u32, DispatchError> {
        let error = format!("dispatch aborted: {}", cause.message);
        let mut failed = 0;
        for recipient in remaining {
            if self.store.mark_send_failed(&recipient.id, &error).await? {
                failed += 1;
            }
        }
        Ok(failed)
    }
}

enum SendResult {
    Sent,
    Failed,
    AlreadyTaken,
    Systemic(SendError),
}
