//! End-to-end walkthrough against the in-memory store: compose a campaign,
//! dispatch it, retry the failures, print progress.
//!
//! Run with: cargo run --example basic

use std::sync::Arc;

use async_trait::async_trait;
use blast_dispatcher::{
    Campaign, Dispatcher, InMemoryStore, MessageSender, ProviderMessageId, RateLimitConfig,
    Recipient, RetryScheduler, SendError, TemplateMessage,
};

/// Console sender: prints each message and fails every fifth number with a
/// transient error so the retry pass has something to do.
struct ConsoleSender;

#[async_trait]
impl MessageSender for ConsoleSender {
    async fn send_template(
        &self,
        message: &TemplateMessage,
    ) -> Result<ProviderMessageId, SendError> {
        if message.to.ends_with('5') {
            println!("  x  {} -> simulated timeout", message.to);
            return Err(SendError::network("request timed out"));
        }
        println!("  ->  {} [{}]", message.to, message.template_name);
        Ok(ProviderMessageId(format!("wamid.demo.{}", message.to)))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("blast_dispatcher=info".parse()?),
        )
        .init();

    let store = Arc::new(InMemoryStore::new());
    let mut config = RateLimitConfig::default();
    config.base_delay_ms = 50;
    config.batch_pause_ms = 200;

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        Arc::new(ConsoleSender),
        config,
    ));

    let campaign = Campaign::new("demo-1", "Launch Announcement", "launch_announcement");
    let candidates: Vec<Recipient> = (0..20)
        .map(|i| {
            Recipient::new(
                format!("demo-1-r{}", i),
                campaign.id.clone(),
                format!("+62 812-0000-{:04}", i),
                format!("Guest {}", i),
            )
        })
        .collect();

    let campaign_id = campaign.id.clone();
    let created = dispatcher
        .compose_campaign(campaign, candidates)
        .await?;
    println!("composed campaign with {} recipients", created);

    let summary = dispatcher.start_campaign(&campaign_id).await?;
    println!(
        "first run: {} sent, {} failed in {} batches",
        summary.success, summary.failed, summary.batches
    );

    let scheduler = RetryScheduler::new(store.clone(), dispatcher.clone());
    let stats = scheduler.retry_campaign(&campaign_id).await?;
    println!(
        "retry pass: {} eligible, {} rescheduled, {} skipped",
        stats.total_eligible, stats.retried, stats.skipped
    );

    let progress = dispatcher.campaign_progress(&campaign_id).await?;
    println!(
        "final: status={} sent={} failed={} of {}",
        progress.status.as_str(),
        progress.sent_count,
        progress.failed_count,
        progress.total_recipients
    );

    Ok(())
}
