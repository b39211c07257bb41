use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::store::RecipientStore;
use crate::types::{canonical_phone, CampaignId, Recipient};

/// Prunes candidates whose phone number already reached a successful
/// terminal status (`sent`, `delivered` or `read`).
///
/// Fail-open: if the store query degrades, the candidates pass through
/// unchanged. Under-filtering only risks a duplicate notification, never
/// data loss.
pub struct DuplicateFilter {
    store: Arc<dyn RecipientStore>,
}

impl DuplicateFilter {
    pub fn new(store: Arc<dyn RecipientStore>) -> Self {
        Self { store }
    }

    /// Remove candidates already sent to, scoped to one campaign or, with
    /// no scope, globally.
    pub async fn eligible_recipients(
        &self,
        scope: Option<&CampaignId>,
        candidates: Vec<Recipient>,
    ) -> Vec<Recipient> {
        if candidates.is_empty() {
            return candidates;
        }

        let successful = match self.store.successful_phones(scope).await {
            Ok(phones) => phones,
            Err(err) => {
                warn!(error = %err, "duplicate filter degraded, passing candidates through");
                return candidates;
            }
        };

        let before = candidates.len();
        let kept: Vec<Recipient> = candidates
            .into_iter()
            .filter(|candidate| !successful.contains(&normalized(&candidate.phone_number)))
            .collect();

        if kept.len() < before {
            debug!(
                removed = before - kept.len(),
                kept = kept.len(),
                "duplicate filter pruned known-successful numbers"
            );
        }
        kept
    }

    /// Dispatch-path variant: duplicates are written back as `skipped` with
    /// an explanatory reason instead of silently dropped, so the store
    /// reflects why they were not sent.
    ///
    /// Catches two kinds of duplicate: numbers that already reached a
    /// successful status since the rows were composed, and rows within the
    /// candidate list itself that share a canonical number (only the first
    /// occurrence is kept).
    ///
    /// Returns the kept candidates and the number skipped.
    pub async fn filter_marking_skipped(
        &self,
        scope: Option<&CampaignId>,
        candidates: Vec<Recipient>,
    ) -> (Vec<Recipient>, u32) {
        if candidates.is_empty() {
            return (candidates, 0);
        }

        let successful = match self.store.successful_phones(scope).await {
            Ok(phones) => phones,
            Err(err) => {
                warn!(error = %err, "duplicate filter degraded, passing candidates through");
                return (candidates, 0);
            }
        };

        let mut seen: HashSet<String> = HashSet::new();
        let mut kept = Vec::with_capacity(candidates.len());
        let mut skipped = 0u32;
        for candidate in candidates {
            let phone = normalized(&candidate.phone_number);
            let reason = if successful.contains(&phone) {
                Some(format!(
                    "duplicate: {} already received this message",
                    candidate.phone_number
                ))
            } else if !seen.insert(phone) {
                Some(format!(
                    "duplicate: {} appears more than once in this campaign",
                    candidate.phone_number
                ))
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    if let Err(err) = self.store.mark_skipped(&candidate.id, &reason).await {
                        warn!(
                            recipient = %candidate.id.0,
                            error = %err,
                            "failed to mark duplicate as skipped"
                        );
                    }
                    skipped += 1;
                }
                None => kept.push(candidate),
            }
        }

        (kept, skipped)
    }
}

fn normalized(phone: &str) -> String {
    canonical_phone(phone).unwrap_or_else(|| phone.to_string())
}
