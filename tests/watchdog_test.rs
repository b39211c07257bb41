mod common;

use std::sync::Arc;
use std::time::Duration;

use blast_dispatcher::{
    Campaign, CampaignStatus, Dispatcher, InMemoryStore, RecipientStatus, Watchdog,
    WatchdogAction, WatchdogConfig,
};
use common::{fast_config, make_recipients, MockSender, RecipientStore};

fn fast_watchdog() -> WatchdogConfig {
    WatchdogConfig {
        check_interval: Duration::from_millis(10),
        stuck_threshold: chrono::Duration::minutes(10),
        max_restarts: 3,
    }
}

fn harness(store: &Arc<InMemoryStore>, sender: &Arc<MockSender>) -> (Arc<Dispatcher>, Watchdog) {
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        sender.clone(),
        fast_config(),
    ));
    let watchdog = Watchdog::new(store.clone(), dispatcher.clone(), fast_watchdog());
    (dispatcher, watchdog)
}

/// Seed a campaign whose dispatch lease was taken long ago and never made
/// progress: status `dispatching`, pending rows, no successful sends.
async fn seed_stalled(store: &Arc<InMemoryStore>, id: &str, count: usize) -> Campaign {
    let campaign = Campaign::new(id, format!("Campaign {}", id), "event_reminder")
        .with_created_at(chrono::Utc::now() - chrono::Duration::minutes(11));
    store.create_campaign(&campaign).await.unwrap();
    store
        .insert_recipients(&make_recipients(&campaign.id, count))
        .await
        .unwrap();
    assert!(store
        .try_acquire_dispatch(&campaign.id, "run-stalled")
        .await
        .unwrap());
    campaign
}

#[tokio::test]
async fn stalled_campaign_is_restarted_and_finishes() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let (_dispatcher, watchdog) = harness(&store, &sender);

    let campaign = seed_stalled(&store, "stall", 5).await;

    let actions = watchdog.check_once().await.unwrap();
    assert_eq!(
        actions,
        vec![WatchdogAction::Restarted {
            campaign_id: campaign.id.clone(),
            restart_count: 1,
        }]
    );

    // The restart runs on a spawned task; give it a moment.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let refreshed = store.campaign(&campaign.id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, CampaignStatus::Completed);
    assert_eq!(refreshed.restart_count, 1);
    assert_eq!(refreshed.sent_count, 5);
    assert_eq!(sender.sent_log().await.len(), 5);
}

#[tokio::test]
async fn recent_progress_is_left_alone() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let (_dispatcher, watchdog) = harness(&store, &sender);

    let campaign = seed_stalled(&store, "live", 3).await;

    // One row was just sent, so the campaign shows forward progress.
    let rows = store.pending_recipients(&campaign.id).await.unwrap();
    store
        .mark_sent(
            &rows[0].id,
            &blast_dispatcher::ProviderMessageId("wamid.live".to_string()),
            chrono::Utc::now(),
        )
        .await
        .unwrap();

    let actions = watchdog.check_once().await.unwrap();
    assert!(actions.is_empty());

    let refreshed = store.campaign(&campaign.id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, CampaignStatus::Dispatching);
    assert_eq!(refreshed.restart_count, 0);
}

#[tokio::test]
async fn drained_campaign_is_not_stalled() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let (_dispatcher, watchdog) = harness(&store, &sender);

    // Old idle lease but nothing left to send.
    let campaign = seed_stalled(&store, "drained", 0).await;

    let actions = watchdog.check_once().await.unwrap();
    assert!(actions.is_empty());
    let refreshed = store.campaign(&campaign.id).await.unwrap().unwrap();
    assert_eq!(refreshed.restart_count, 0);
}

#[tokio::test]
async fn idle_draft_campaigns_are_outside_the_watch_scope() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let (_dispatcher, watchdog) = harness(&store, &sender);

    // Old draft with pending rows, but no lease was ever taken.
    let campaign = Campaign::new("draft", "Campaign draft", "event_reminder")
        .with_created_at(chrono::Utc::now() - chrono::Duration::minutes(60));
    store.create_campaign(&campaign).await.unwrap();
    store
        .insert_recipients(&make_recipients(&campaign.id, 2))
        .await
        .unwrap();

    let actions = watchdog.check_once().await.unwrap();
    assert!(actions.is_empty());
}

#[tokio::test]
async fn exhausted_restart_budget_fails_the_campaign() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let (_dispatcher, watchdog) = harness(&store, &sender);

    let campaign = seed_stalled(&store, "tired", 4).await;
    for _ in 0..3 {
        store.increment_restart_count(&campaign.id).await.unwrap();
    }

    let actions = watchdog.check_once().await.unwrap();
    assert_eq!(
        actions,
        vec![WatchdogAction::GaveUp {
            campaign_id: campaign.id.clone(),
        }]
    );

    let refreshed = store.campaign(&campaign.id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, CampaignStatus::Failed);
    assert_eq!(refreshed.restart_count, 3, "no restart was spent giving up");
    assert!(sender.sent_log().await.is_empty());

    // Failed campaigns leave the active set; the next pass sees nothing.
    let actions = watchdog.check_once().await.unwrap();
    assert!(actions.is_empty());
}

#[tokio::test]
async fn restart_counter_survives_across_passes() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let (_dispatcher, watchdog) = harness(&store, &sender);

    let campaign = seed_stalled(&store, "counted", 2).await;
    // Every send fails with a network error, so each restart run leaves the
    // rows failed and the campaign idle again.
    for i in 0..2 {
        sender
            .fail_number(
                &common::phone(i),
                blast_dispatcher::SendError::network("connection reset"),
            )
            .await;
    }

    for expected in 1..=3u32 {
        let actions = watchdog.check_once().await.unwrap();
        assert_eq!(
            actions,
            vec![WatchdogAction::Restarted {
                campaign_id: campaign.id.clone(),
                restart_count: expected,
            }]
        );
        // Let the spawned run finish and release the lease.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let refreshed = store.campaign(&campaign.id).await.unwrap().unwrap();
        assert_eq!(refreshed.restart_count, expected);

        // Everything failed again; make the campaign look stalled for the
        // next pass by re-taking a lease that then goes idle.
        for row in store.all_recipients().await {
            assert_eq!(row.status, RecipientStatus::Failed);
        }
        assert!(store
            .try_acquire_dispatch(&campaign.id, "run-stalled")
            .await
            .unwrap());
        store.reset_failed_to_pending(&campaign.id).await.unwrap();
    }

    let actions = watchdog.check_once().await.unwrap();
    assert_eq!(
        actions,
        vec![WatchdogAction::GaveUp {
            campaign_id: campaign.id.clone(),
        }]
    );
    let refreshed = store.campaign(&campaign.id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, CampaignStatus::Failed);
}

#[tokio::test]
async fn start_and_shutdown_are_clean_and_repeatable() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let (_dispatcher, mut watchdog) = harness(&store, &sender);

    assert!(!watchdog.is_running());
    watchdog.start();
    assert!(watchdog.is_running());
    // Second start is a no-op while running.
    watchdog.start();

    // Let the timer loop tick at least once against an empty store.
    tokio::time::sleep(Duration::from_millis(30)).await;

    watchdog.shutdown().await;
    assert!(!watchdog.is_running());

    watchdog.start();
    assert!(watchdog.is_running());
    watchdog.shutdown().await;
    assert!(!watchdog.is_running());
}
