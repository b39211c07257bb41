use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchProfile, Dispatcher};
use crate::error::{classify_error, DispatchError, ErrorClass};
use crate::store::{RecipientStore, RetryUpdate};
use crate::types::{CampaignId, Recipient, RecipientId};

/// Selection and pacing options for one retry pass.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Restrict the pass to one campaign.
    pub campaign: Option<CampaignId>,

    /// Restrict the pass to explicit recipient rows.
    pub recipient_ids: Option<Vec<RecipientId>>,

    /// Upper bound on `retry_count`; rows at or past it are never
    /// re-admitted.
    pub max_retries: u32,

    /// Standard backoff tier in minutes. Rate-limit failures wait twice
    /// this; validation failures wait zero.
    pub delay_minutes: i64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            campaign: None,
            recipient_ids: None,
            max_retries: 3,
            delay_minutes: 5,
        }
    }
}

impl RetryOptions {
    pub fn for_campaign(campaign: CampaignId) -> Self {
        Self {
            campaign: Some(campaign),
            ..Self::default()
        }
    }
}

/// What happened to one candidate during a retry pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    Scheduled,
    Skipped,
    Error,
}

/// Per-candidate record in [`RetryStats::details`].
#[derive(Debug, Clone)]
pub struct RetryDetail {
    pub recipient_id: RecipientId,
    pub phone_number: String,
    pub action: RetryAction,
    pub note: String,
}

/// Summary of one retry pass.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub total_eligible: u32,
    pub retried: u32,
    pub skipped: u32,
    pub errors: u32,
    pub details: Vec<RetryDetail>,
}

/// Backoff for a classified failure, or `None` when the error is permanent
/// and must never be retried.
///
/// - validation: zero, presumed fixed by a deployed validation change
/// - rate limit: `2 x delay_minutes`
/// - network and unclassified: `delay_minutes`
/// - permanent: never
///
/// The delay is advisory for dispatch: it is recorded on the row as
/// `next_retry_at`, but the run triggered by this scheduler pass sends
/// re-admitted rows immediately under the slower retry pacing profile.
/// What actually spaces retries out is the cooldown guard, which skips
/// rows retried less than `delay_minutes` ago on later passes.
pub fn retry_delay(class: ErrorClass, delay_minutes: i64) -> Option<Duration> {
    match class {
        ErrorClass::Validation => Some(Duration::zero()),
        ErrorClass::RateLimited => Some(Duration::minutes(2 * delay_minutes)),
        ErrorClass::Network | ErrorClass::Systemic | ErrorClass::Unknown => {
            Some(Duration::minutes(delay_minutes))
        }
        ErrorClass::Permanent => None,
    }
}

/// Re-admits eligible failed recipients and triggers a slower dispatch run
/// for the affected campaigns.
pub struct RetryScheduler {
    store: Arc<dyn RecipientStore>,
    dispatcher: Arc<Dispatcher>,
}

impl RetryScheduler {
    pub fn new(store: Arc<dyn RecipientStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Convenience wrapper: retry one campaign with default options.
    pub async fn retry_campaign(
        &self,
        campaign: &CampaignId,
    ) -> Result<RetryStats, DispatchError> {
        self.retry(RetryOptions::for_campaign(campaign.clone())).await
    }

    /// Run one retry pass.
    ///
    /// Partial-failure tolerant: a store error on one candidate is recorded
    /// in `details` and does not abort the rest of the pass.
    pub async fn retry(&self, opts: RetryOptions) -> Result<RetryStats, DispatchError> {
        let candidates = self.select_candidates(&opts).await?;
        let now = Utc::now();

        let mut stats = RetryStats {
            total_eligible: candidates.len() as u32,
            ..RetryStats::default()
        };
        let mut touched_campaigns: HashSet<CampaignId> = HashSet::new();

        for candidate in candidates {
            match self.decide(&candidate, &opts, now) {
                Decision::Schedule { delay, reason } => {
                    let update = RetryUpdate {
                        retry_count: candidate.retry_count + 1,
                        last_retry_at: now,
                        next_retry_at: now + delay,
                        retry_reason: reason.clone(),
                    };
                    match self.store.schedule_retry(&candidate.id, &update).await {
                        Ok(true) => {
                            stats.retried += 1;
                            touched_campaigns.insert(candidate.campaign_id.clone());
                            stats.details.push(RetryDetail {
                                recipient_id: candidate.id.clone(),
                                phone_number: candidate.phone_number.clone(),
                                action: RetryAction::Scheduled,
                                note: reason,
                            });
                        }
                        Ok(false) => {
                            stats.skipped += 1;
                            stats.details.push(RetryDetail {
                                recipient_id: candidate.id.clone(),
                                phone_number: candidate.phone_number.clone(),
                                action: RetryAction::Skipped,
                                note: "row no longer failed".to_string(),
                            });
                        }
                        Err(err) => {
                            stats.errors += 1;
                            stats.details.push(RetryDetail {
                                recipient_id: candidate.id.clone(),
                                phone_number: candidate.phone_number.clone(),
                                action: RetryAction::Error,
                                note: err.to_string(),
                            });
                            warn!(
                                recipient = %candidate.id.0,
                                error = %err,
                                "retry update failed, continuing pass"
                            );
                        }
                    }
                }
                Decision::Skip(note) => {
                    stats.skipped += 1;
                    stats.details.push(RetryDetail {
                        recipient_id: candidate.id.clone(),
                        phone_number: candidate.phone_number.clone(),
                        action: RetryAction::Skipped,
                        note,
                    });
                }
            }
        }

        info!(
            eligible = stats.total_eligible,
            retried = stats.retried,
            skipped = stats.skipped,
            errors = stats.errors,
            "retry pass finished"
        );

        // Retry-triggered dispatch uses the slower profile; a campaign that
        // is already dispatching picks the re-admitted rows up on its own.
        for campaign in touched_campaigns {
            match self
                .dispatcher
                .dispatch(&campaign, DispatchProfile::Retry)
                .await
            {
                Ok(summary) => {
                    debug!(
                        campaign = %campaign.0,
                        success = summary.success,
                        failed = summary.failed,
                        "retry dispatch finished"
                    );
                }
                Err(DispatchError::AlreadyDispatching { campaign_id }) => {
                    debug!(
                        campaign = %campaign_id.0,
                        "campaign already dispatching, retry rows queued"
                    );
                }
                Err(err) => {
                    warn!(campaign = %campaign.0, error = %err, "retry dispatch failed");
                    stats.errors += 1;
                }
            }
        }

        Ok(stats)
    }

    async fn select_candidates(
        &self,
        opts: &RetryOptions,
    ) -> Result<Vec<Recipient>, DispatchError> {
        if let Some(ids) = &opts.recipient_ids {
            let rows = self.store.recipients_by_ids(ids).await?;
            return Ok(rows
                .into_iter()
                .filter(|r| {
                    r.status == crate::types::RecipientStatus::Failed
                        && r.retry_count < opts.max_retries
                        && opts
                            .campaign
                            .as_ref()
                            .map_or(true, |c| &r.campaign_id == c)
                })
                .collect());
        }

        Ok(self
            .store
            .failed_recipients(opts.campaign.as_ref(), opts.max_retries)
            .await?)
    }

    fn decide(&self, candidate: &Recipient, opts: &RetryOptions, now: DateTime<Utc>) -> Decision {
        // Cooldown first: a row retried moments ago is not touched even if
        // its error class would allow an immediate retry.
        if let Some(last) = candidate.last_retry_at {
            let cooldown_until = last + Duration::minutes(opts.delay_minutes);
            if now < cooldown_until {
                return Decision::Skip(format!(
                    "too soon: retried {} seconds ago",
                    (now - last).num_seconds()
                ));
            }
        }

        let error_text = candidate.error_message.as_deref().unwrap_or("");
        let class = classify_error(error_text);

        match retry_delay(class, opts.delay_minutes) {
            Some(delay) => {
                let reason = format!(
                    "retry attempt {} after {} error: {}",
                    candidate.retry_count + 1,
                    class,
                    if error_text.is_empty() {
                        "unknown failure"
                    } else {
                        error_text
                    }
                );
                Decision::Schedule { delay, reason }
            }
            None => Decision::Skip(format!("permanent error, never retried: {}", error_text)),
        }
    }
}

enum Decision {
    Schedule { delay: Duration, reason: String },
    Skip(String),
}
