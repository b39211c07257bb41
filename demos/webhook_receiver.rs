//! Webhook endpoint walkthrough: the GET verification handshake, payload
//! signature checking, and applying a provider callback batch to the store.
//!
//! The HTTP framing is left to whatever server the deployment already runs;
//! this demo feeds the raw pieces in by hand.
//!
//! Run with: cargo run --example webhook_receiver

use std::sync::Arc;

use blast_dispatcher::{
    parse_payload, verify_payload_signature, verify_subscription, Campaign, InMemoryStore,
    ProviderMessageId, Recipient, RecipientStore, WebhookProcessor,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

const APP_SECRET: &[u8] = b"demo-app-secret";
const VERIFY_TOKEN: &str = "demo-verify-token";

fn sign(body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(APP_SECRET).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("blast_dispatcher=debug".parse()?),
        )
        .init();

    // GET ?hub.mode=subscribe&hub.verify_token=...&hub.challenge=...
    match verify_subscription("subscribe", VERIFY_TOKEN, "challenge-123", VERIFY_TOKEN) {
        Some(challenge) => println!("handshake ok, echoing challenge: {}", challenge),
        None => println!("handshake rejected"),
    }

    // One recipient row already marked sent, as the dispatcher would leave it.
    let store = Arc::new(InMemoryStore::new());
    let campaign = Campaign::new("demo-wh", "Webhook Demo", "launch_announcement");
    store.create_campaign(&campaign).await?;
    let recipient = Recipient::new("demo-wh-r0", campaign.id.clone(), "6281200000001", "Guest");
    store.insert_recipients(std::slice::from_ref(&recipient)).await?;
    store
        .mark_sent(
            &recipient.id,
            &ProviderMessageId("wamid.demo.1".to_string()),
            chrono::Utc::now(),
        )
        .await?;

    // POST body as the provider would send it.
    let body = serde_json::json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "1042000000000000",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "statuses": [
                        {"id": "wamid.demo.1", "status": "delivered", "timestamp": "1700000100"},
                        {"id": "wamid.demo.1", "status": "read", "timestamp": "1700000200"},
                        {"id": "wamid.unknown", "status": "delivered", "timestamp": "1700000100"},
                    ]
                }
            }]
        }]
    })
    .to_string()
    .into_bytes();

    let signature = sign(&body);
    if !verify_payload_signature(APP_SECRET, &body, &signature) {
        println!("signature rejected, dropping body");
        return Ok(());
    }
    println!("signature ok");

    let processor = WebhookProcessor::new(store.clone());
    let summary = processor.process(&parse_payload(&body)?).await;
    println!(
        "batch processed: {} applied, {} ignored, {} unmatched, {} errors",
        summary.applied, summary.ignored, summary.unmatched, summary.errors
    );

    let row = store.recipient(&recipient.id).await?.unwrap();
    println!(
        "recipient now {} (delivered_at={:?}, read_at={:?})",
        row.status.as_str(),
        row.delivered_at,
        row.read_at
    );

    Ok(())
}
