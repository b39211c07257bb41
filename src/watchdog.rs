use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::StoreError;
use crate::store::RecipientStore;
use crate::types::{Campaign, CampaignId, CampaignStatus};

/// Watchdog tuning.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// How often the supervisor polls for stalled campaigns.
    pub check_interval: Duration,

    /// A campaign with pending recipients and no successful send in this
    /// window is considered stalled.
    pub stuck_threshold: chrono::Duration,

    /// Automatic restarts allowed per campaign before it is failed
    /// permanently. The counter is persisted on the campaign row, so the
    /// bound survives process restarts.
    pub max_restarts: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            stuck_threshold: chrono::Duration::minutes(10),
            max_restarts: 3,
        }
    }
}

/// Action the watchdog took on one stalled campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogAction {
    /// The campaign was restarted; `restart_count` is the new persisted
    /// counter value.
    Restarted {
        campaign_id: CampaignId,
        restart_count: u32,
    },

    /// The restart budget was exhausted; the campaign is now `Failed`.
    GaveUp { campaign_id: CampaignId },
}

/// Periodic supervisor that detects campaigns with no forward progress and
/// restarts them a bounded number of times.
///
/// Timer-driven with cooperative cancellation: `start` spawns one task,
/// `shutdown` stops it cleanly and joins it. No long-lived process per
/// campaign is needed.
pub struct Watchdog {
    store: Arc<dyn RecipientStore>,
    dispatcher: Arc<Dispatcher>,
    config: WatchdogConfig,
    is_running: Arc<AtomicBool>,
    notify: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn new(
        store: Arc<dyn RecipientStore>,
        dispatcher: Arc<Dispatcher>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
            is_running: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            handle: None,
        }
    }

    /// Spawn the supervision loop. Idempotent; a second call is a no-op
    /// while the loop is running.
    pub fn start(&mut self) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let store = self.store.clone();
        let dispatcher = self.dispatcher.clone();
        let config = self.config.clone();
        let is_running = self.is_running.clone();
        let notify = self.notify.clone();

        self.handle = Some(tokio::spawn(async move {
            info!(
                interval_secs = config.check_interval.as_secs(),
                "watchdog started"
            );
            while is_running.load(Ordering::SeqCst) {
                if let Err(err) = check_once(&store, &dispatcher, &config).await {
                    warn!(error = %err, "watchdog pass failed");
                }

                tokio::select! {
                    _ = notify.notified() => {}
                    _ = sleep(config.check_interval) => {}
                }
            }
            info!("watchdog stopped");
        }));
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop the loop and join the task.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Run one supervision pass without the timer. Exposed so operators
    /// and tests can audit liveness on demand.
    pub async fn check_once(&self) -> Result<Vec<WatchdogAction>, StoreError> {
        check_once(&self.store, &self.dispatcher, &self.config).await
    }
}

async fn check_once(
    store: &Arc<dyn RecipientStore>,
    dispatcher: &Arc<Dispatcher>,
    config: &WatchdogConfig,
) -> Result<Vec<WatchdogAction>, StoreError> {
    let mut actions = Vec::new();

    for campaign in store.active_campaigns().await? {
        if !is_stalled(store, &campaign, config).await? {
            continue;
        }

        if campaign.restart_count >= config.max_restarts {
            warn!(
                campaign = %campaign.id.0,
                restarts = campaign.restart_count,
                "restart budget exhausted, failing campaign"
            );
            store
                .set_campaign_status(&campaign.id, CampaignStatus::Failed)
                .await?;
            actions.push(WatchdogAction::GaveUp {
                campaign_id: campaign.id.clone(),
            });
            continue;
        }

        let restart_count = store.increment_restart_count(&campaign.id).await?;
        if restart_count > config.max_restarts {
            // A concurrent supervisor instance used the last slot between
            // our read and the increment.
            store
                .set_campaign_status(&campaign.id, CampaignStatus::Failed)
                .await?;
            actions.push(WatchdogAction::GaveUp {
                campaign_id: campaign.id.clone(),
            });
            continue;
        }

        // Break the stale lease so a new run can acquire it, and re-admit
        // the failed rows.
        store
            .set_campaign_status(&campaign.id, CampaignStatus::Draft)
            .await?;
        let reset = store.reset_failed_to_pending(&campaign.id).await?;
        info!(
            campaign = %campaign.id.0,
            restart_count,
            reset,
            "stalled campaign restarting"
        );

        let dispatcher = dispatcher.clone();
        let campaign_id = campaign.id.clone();
        tokio::spawn(async move {
            match dispatcher.start_campaign(&campaign_id).await {
                Ok(summary) => debug!(
                    campaign = %campaign_id.0,
                    success = summary.success,
                    failed = summary.failed,
                    "watchdog restart finished"
                ),
                Err(err) => warn!(
                    campaign = %campaign_id.0,
                    error = %err,
                    "watchdog restart failed"
                ),
            }
        });

        actions.push(WatchdogAction::Restarted {
            campaign_id: campaign.id.clone(),
            restart_count,
        });
    }

    Ok(actions)
}

/// A campaign is stalled when pending recipients remain and the time since
/// the most recent successful send (or campaign creation, when nothing was
/// ever sent) exceeds the threshold.
async fn is_stalled(
    store: &Arc<dyn RecipientStore>,
    campaign: &Campaign,
    config: &WatchdogConfig,
) -> Result<bool, StoreError> {
    if !store.has_pending(&campaign.id).await? {
        return Ok(false);
    }

    let reference = store
        .latest_sent_at(&campaign.id)
        .await?
        .unwrap_or(campaign.created_at);
    let elapsed = Utc::now() - reference;

    if elapsed > config.stuck_threshold {
        debug!(
            campaign = %campaign.id.0,
            idle_secs = elapsed.num_seconds(),
            "campaign shows no forward progress"
        );
        Ok(true)
    } else {
        Ok(false)
    }
}
