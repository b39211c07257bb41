mod common;

use std::sync::Arc;
use std::time::Duration;

use blast_dispatcher::{
    adaptive_multiplier, message_delay, Campaign, CampaignStatus, DispatchError, Dispatcher,
    ErrorClass, InMemoryStore, RateLimitConfig, Recipient, RecipientStatus, SendError,
};
use common::{fast_config, make_recipients, phone, seed_campaign, MockSender, RecipientStore};

fn engine(store: &Arc<InMemoryStore>, sender: &Arc<MockSender>) -> Dispatcher {
    Dispatcher::new(store.clone(), sender.clone(), fast_config())
}

#[tokio::test]
async fn fresh_campaign_runs_in_three_batches() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let dispatcher = engine(&store, &sender);

    let (campaign, _) = seed_campaign(&store, "fresh", 120).await;
    let summary = dispatcher.start_campaign(&campaign.id).await.unwrap();

    assert_eq!(summary.batches, 3, "120 recipients at batch size 50");
    assert_eq!(summary.success, 120);
    assert_eq!(summary.failed, 0);

    let refreshed = store.campaign(&campaign.id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, CampaignStatus::Completed);
    assert_eq!(refreshed.sent_count, 120);
    assert_eq!(refreshed.failed_count, 0);
    assert!(refreshed.started_at.is_some());
}

#[tokio::test]
async fn restart_skips_already_successful_numbers() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let dispatcher = engine(&store, &sender);

    let campaign = Campaign::new("restart", "Restart", "event_reminder");
    store.create_campaign(&campaign).await.unwrap();

    // 40 recipients already succeeded in an earlier run.
    let mut done = make_recipients(&campaign.id, 40);
    for (i, r) in done.iter_mut().enumerate() {
        r.status = RecipientStatus::Sent;
        r.sent_at = Some(chrono::Utc::now());
        r.message_id = Some(blast_dispatcher::ProviderMessageId(format!("wamid.old{}", i)));
    }
    store.insert_recipients(&done).await.unwrap();

    // 80 still pending; 10 of them reuse phones that already succeeded.
    let mut pending = Vec::new();
    for i in 0..80 {
        let p = if i < 10 { phone(i) } else { phone(100 + i) };
        pending.push(Recipient::new(
            format!("restart-p{}", i),
            campaign.id.clone(),
            p,
            format!("Guest {}", i),
        ));
    }
    store.insert_recipients(&pending).await.unwrap();

    let summary = dispatcher.restart_campaign(&campaign.id).await.unwrap();

    assert_eq!(summary.skipped, 10, "duplicates written back as skipped");
    assert_eq!(summary.success, 70);

    // No double-success: nothing was re-sent to a number that already
    // reached a successful status.
    let sent = sender.sent_log().await;
    for i in 0..40 {
        assert!(!sent.contains(&phone(i)), "{} was sent twice", phone(i));
    }

    let rows = store.all_recipients().await;
    let skipped: Vec<_> = rows
        .iter()
        .filter(|r| r.status == RecipientStatus::Skipped)
        .collect();
    assert_eq!(skipped.len(), 10);
    for r in &skipped {
        let reason = r.retry_reason.as_deref().unwrap_or("");
        assert!(reason.contains("duplicate"), "reason explains the skip");
    }
}

#[tokio::test]
async fn second_dispatch_declines_while_lease_is_held() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let dispatcher = engine(&store, &sender);

    let (campaign, _) = seed_campaign(&store, "lease", 5).await;
    assert!(store
        .try_acquire_dispatch(&campaign.id, "run-held")
        .await
        .unwrap());

    match dispatcher.start_campaign(&campaign.id).await {
        Err(DispatchError::AlreadyDispatching { campaign_id }) => {
            assert_eq!(campaign_id, campaign.id);
        }
        other => panic!("expected AlreadyDispatching, got {:?}", other.map(|_| ())),
    }

    // Nothing was sent by the declined caller.
    assert!(sender.sent_log().await.is_empty());
}

#[tokio::test]
async fn systemic_failure_fails_the_whole_run() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let dispatcher = engine(&store, &sender);

    let (campaign, _) = seed_campaign(&store, "systemic", 10).await;
    sender
        .fail_number(&phone(0), SendError::systemic("access token rejected"))
        .await;

    let summary = dispatcher.start_campaign(&campaign.id).await.unwrap();
    assert_eq!(summary.success, 0);
    assert_eq!(summary.failed, 10);

    let refreshed = store.campaign(&campaign.id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, CampaignStatus::Failed);
    assert_eq!(refreshed.failed_count, 10);

    // Untouched recipients carry the distinguishing abort error, not the
    // original provider error.
    let rows = store.all_recipients().await;
    let aborted = rows
        .iter()
        .filter(|r| {
            r.error_message
                .as_deref()
                .map_or(false, |e| e.contains("dispatch aborted"))
        })
        .count();
    assert_eq!(aborted, 9);
}

#[tokio::test]
async fn corrupt_sent_rows_are_reset_and_resent() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let dispatcher = engine(&store, &sender);

    let campaign = Campaign::new("repair", "Repair", "event_reminder");
    store.create_campaign(&campaign).await.unwrap();

    // Sent status without a sent_at timestamp is corrupt leftover state.
    let mut corrupt = Recipient::new("repair-r0", campaign.id.clone(), phone(0), "Guest");
    corrupt.status = RecipientStatus::Sent;
    corrupt.sent_at = None;
    store.insert_recipients(&[corrupt]).await.unwrap();

    let summary = dispatcher.start_campaign(&campaign.id).await.unwrap();
    assert_eq!(summary.success, 1);

    let row = store.all_recipients().await.remove(0);
    assert_eq!(row.status, RecipientStatus::Sent);
    assert!(row.sent_at.is_some());
}

#[tokio::test]
async fn invalid_phone_is_failed_as_validation_error() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let dispatcher = engine(&store, &sender);

    let campaign = Campaign::new("badphone", "Bad phone", "event_reminder");
    store.create_campaign(&campaign).await.unwrap();
    let bad = Recipient::new("badphone-r0", campaign.id.clone(), "not-a-number", "Guest");
    store.insert_recipients(&[bad]).await.unwrap();

    let summary = dispatcher.start_campaign(&campaign.id).await.unwrap();
    assert_eq!(summary.failed, 1);

    let row = store.all_recipients().await.remove(0);
    assert_eq!(row.status, RecipientStatus::Failed);
    let error = row.error_message.unwrap();
    assert!(error.contains("invalid phone format"));
    assert_eq!(
        blast_dispatcher::classify_error(&error),
        ErrorClass::Validation
    );
}

#[tokio::test]
async fn compose_deduplicates_against_known_successes() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let dispatcher = engine(&store, &sender);

    // A number that already succeeded in an earlier campaign.
    let (old, _) = seed_campaign(&store, "old", 1).await;
    dispatcher.start_campaign(&old.id).await.unwrap();

    let fresh = Campaign::new("new", "New", "event_reminder");
    let candidates = make_recipients(&fresh.id, 3); // phones 0..3, phone(0) is a dup
    let created = dispatcher
        .compose_campaign(fresh.clone(), candidates)
        .await
        .unwrap();

    assert_eq!(created, 2);
    let stored = store.campaign(&fresh.id).await.unwrap().unwrap();
    assert_eq!(stored.total_recipients, 2);
}

#[tokio::test]
async fn same_number_candidates_collapse_to_one_send() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let dispatcher = engine(&store, &sender);

    let campaign = Campaign::new("dupes", "Dupes", "event_reminder");
    let candidates = vec![
        Recipient::new("dupes-r0", campaign.id.clone(), phone(7), "Guest A"),
        Recipient::new("dupes-r1", campaign.id.clone(), phone(7), "Guest B"),
        Recipient::new("dupes-r2", campaign.id.clone(), phone(8), "Guest C"),
    ];
    let created = dispatcher
        .compose_campaign(campaign.clone(), candidates)
        .await
        .unwrap();
    assert_eq!(created, 2, "one row per distinct number");

    let summary = dispatcher.start_campaign(&campaign.id).await.unwrap();
    assert_eq!(summary.success, 2);

    // The shared number got exactly one message.
    let sent = sender.sent_log().await;
    assert_eq!(sent.iter().filter(|p| **p == phone(7)).count(), 1);

    let rows = store.all_recipients().await;
    assert_eq!(
        rows.iter()
            .filter(|r| r.status.is_successful())
            .count(),
        2
    );
    let collapsed: Vec<_> = rows
        .iter()
        .filter(|r| r.status == RecipientStatus::Skipped)
        .collect();
    assert_eq!(collapsed.len(), 1);
    assert!(collapsed[0]
        .retry_reason
        .as_deref()
        .unwrap_or("")
        .contains("duplicate"));
}

#[tokio::test]
async fn start_skips_numbers_that_succeeded_after_compose() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let dispatcher = engine(&store, &sender);

    let campaign = Campaign::new("latedup", "Late dup", "event_reminder");
    store.create_campaign(&campaign).await.unwrap();

    // A row for phone(3) already succeeded; a second row for the same
    // number is still pending, plus one row for a fresh number.
    let mut done = Recipient::new("latedup-r0", campaign.id.clone(), phone(3), "Guest A");
    done.status = RecipientStatus::Sent;
    done.sent_at = Some(chrono::Utc::now());
    done.message_id = Some(blast_dispatcher::ProviderMessageId("wamid.done".into()));
    let stale = Recipient::new("latedup-r1", campaign.id.clone(), phone(3), "Guest A");
    let fresh = Recipient::new("latedup-r2", campaign.id.clone(), phone(4), "Guest B");
    store.insert_recipients(&[done, stale, fresh]).await.unwrap();

    let summary = dispatcher.start_campaign(&campaign.id).await.unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.success, 1);
    assert!(!sender.sent_log().await.contains(&phone(3)));

    let rows = store.all_recipients().await;
    let stale = rows.iter().find(|r| r.id.0 == "latedup-r1").unwrap();
    assert_eq!(stale.status, RecipientStatus::Skipped);
}

#[tokio::test]
async fn stale_runner_cannot_release_a_taken_over_lease() {
    let store = Arc::new(InMemoryStore::new());

    let (campaign, _) = seed_campaign(&store, "stale", 1).await;
    assert!(store
        .try_acquire_dispatch(&campaign.id, "run-old")
        .await
        .unwrap());

    // Watchdog-style takeover: break the lease, then a new run acquires.
    store
        .set_campaign_status(&campaign.id, CampaignStatus::Draft)
        .await
        .unwrap();
    assert!(store
        .try_acquire_dispatch(&campaign.id, "run-new")
        .await
        .unwrap());

    // The old holder's late release no longer matches and is a no-op.
    store
        .release_dispatch(&campaign.id, "run-old", CampaignStatus::Completed)
        .await
        .unwrap();
    let current = store.campaign(&campaign.id).await.unwrap().unwrap();
    assert_eq!(current.status, CampaignStatus::Dispatching);

    store
        .release_dispatch(&campaign.id, "run-new", CampaignStatus::Completed)
        .await
        .unwrap();
    let current = store.campaign(&campaign.id).await.unwrap().unwrap();
    assert_eq!(current.status, CampaignStatus::Completed);
}

#[tokio::test]
async fn config_reload_is_validated_and_versioned() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let dispatcher = engine(&store, &sender);

    let mut bad = fast_config();
    bad.batch_size = 0;
    assert!(dispatcher.update_config(bad).await.is_err());

    let before = dispatcher.config().await.version;
    let mut good = fast_config();
    good.batch_size = 10;
    dispatcher.update_config(good).await.unwrap();
    let after = dispatcher.config().await;
    assert_eq!(after.batch_size, 10);
    assert!(after.version > before);
}

#[tokio::test]
async fn empty_campaign_completes_immediately() {
    let store = Arc::new(InMemoryStore::new());
    let sender = MockSender::new();
    let dispatcher = engine(&store, &sender);

    let (campaign, _) = seed_campaign(&store, "empty", 0).await;
    let summary = dispatcher.start_campaign(&campaign.id).await.unwrap();
    assert_eq!(summary.batches, 0);
    assert_eq!(summary.success, 0);

    let refreshed = store.campaign(&campaign.id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, CampaignStatus::Completed);
}

#[test]
fn adaptive_multiplier_grows_with_errors_and_stays_bounded() {
    let calm = adaptive_multiplier(0.0, 0.0, 4.0);
    assert!((calm - 1.0).abs() < f64::EPSILON);

    let hostile = adaptive_multiplier(0.5, 0.5, 4.0);
    assert!(hostile > calm);

    let saturated = adaptive_multiplier(1.0, 1.0, 4.0);
    assert!((saturated - 4.0).abs() < f64::EPSILON, "capped at max");

    // Error component decays when the current batch is clean again.
    let recovered = adaptive_multiplier(0.0, 0.9, 4.0);
    assert!(recovered < hostile);
}

#[test]
fn message_delay_honors_base_ceiling_and_cap() {
    let mut cfg = RateLimitConfig::default();
    cfg.base_delay_ms = 200;
    cfg.max_delay_ms = 1_000;

    // Base delay governs when the limiter is idle.
    let idle = message_delay(&cfg, Duration::ZERO, 1.0);
    assert_eq!(idle, Duration::from_millis(200));

    // The worst rate tier governs when it exceeds the base delay.
    let limited = message_delay(&cfg, Duration::from_millis(600), 1.0);
    assert_eq!(limited, Duration::from_millis(600));

    // The multiplier scales, the cap bounds.
    let scaled = message_delay(&cfg, Duration::from_millis(600), 4.0);
    assert_eq!(scaled, Duration::from_millis(1_000));
}
