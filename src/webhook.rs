use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::store::{DeliveryApplied, RecipientStore};
use crate::types::{DeliveryEvent, DeliveryEventKind};

/// GET handshake for webhook subscription verification.
///
/// Echoes the challenge token only when the mode is `subscribe` and the
/// shared verification secret matches.
pub fn verify_subscription(
    mode: &str,
    verify_token: &str,
    challenge: &str,
    expected_token: &str,
) -> Option<String> {
    if mode == "subscribe" && !expected_token.is_empty() && verify_token == expected_token {
        Some(challenge.to_string())
    } else {
        None
    }
}

/// Verify the provider's payload signature header (`sha256=<hex>`).
pub fn verify_payload_signature(secret: &[u8], payload: &[u8], header_value: &str) -> bool {
    let Some(signature_hex) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

/// Provider callback batch, as POSTed to the webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,

    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: String,

    pub value: WebhookChangeValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChangeValue {
    #[serde(default)]
    pub statuses: Vec<StatusEvent>,

    #[serde(default)]
    pub messages: Vec<InboundMessage>,
}

/// One delivery-status event: sent / delivered / read / failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: String,
    pub status: String,

    /// Unix seconds, as a string, per the provider's wire format.
    #[serde(default)]
    pub timestamp: String,

    #[serde(default)]
    pub errors: Vec<ProviderErrorPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderErrorPayload {
    #[serde(default)]
    pub code: Option<i64>,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub message: Option<String>,
}

/// Inbound user message (reply). Logged for observability only; no
/// business logic depends on these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub from: String,

    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub timestamp: String,

    #[serde(default, rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub text: Option<InboundText>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundText {
    #[serde(default)]
    pub body: String,
}

/// Counts from processing one callback batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookSummary {
    /// Events that advanced (or failed) a recipient row.
    pub applied: u32,

    /// Duplicate or out-of-order events that were no-ops.
    pub ignored: u32,

    /// Events with no matching recipient row; logged and dropped.
    pub unmatched: u32,

    /// Events that could not be parsed or persisted.
    pub errors: u32,

    /// Inbound user replies observed.
    pub inbound: u32,
}

/// Parse the raw POST body.
pub fn parse_payload(body: &[u8]) -> Result<WebhookPayload, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Asynchronous consumer of provider-pushed delivery callbacks.
///
/// Runs independently of the dispatcher and may race with it; every
/// transition it applies goes through the store's monotonic state machine,
/// so out-of-order and duplicate callbacks are idempotent.
pub struct WebhookProcessor {
    store: Arc<dyn RecipientStore>,
}

impl WebhookProcessor {
    pub fn new(store: Arc<dyn RecipientStore>) -> Self {
        Self { store }
    }

    /// Process one callback batch. Per-event failures never abort the
    /// batch; they are counted and logged.
    pub async fn process(&self, payload: &WebhookPayload) -> WebhookSummary {
        let mut summary = WebhookSummary::default();

        for entry in &payload.entry {
            for change in &entry.changes {
                for status in &change.value.statuses {
                    self.process_status(status, &mut summary).await;
                }
                for message in &change.value.messages {
                    summary.inbound += 1;
                    info!(
                        from = %message.from,
                        message_id = %message.id,
                        kind = %message.kind,
                        "inbound user message"
                    );
                }
            }
        }

        debug!(
            applied = summary.applied,
            ignored = summary.ignored,
            unmatched = summary.unmatched,
            errors = summary.errors,
            inbound = summary.inbound,
            "webhook batch processed"
        );
        summary
    }

    async fn process_status(&self, status: &StatusEvent, summary: &mut WebhookSummary) {
        let event = match parse_status_event(status) {
            Ok(event) => event,
            Err(reason) => {
                summary.errors += 1;
                warn!(
                    message_id = %status.id,
                    status = %status.status,
                    reason,
                    "unparseable status event dropped"
                );
                return;
            }
        };

        match self.store.apply_delivery_event(&event).await {
            Ok(DeliveryApplied::Applied) => summary.applied += 1,
            Ok(DeliveryApplied::AlreadyCurrent) => summary.ignored += 1,
            Ok(DeliveryApplied::NotFound) => {
                // The row may not be committed yet, or the message is not
                // ours. Not a processor failure.
                summary.unmatched += 1;
                debug!(
                    message_id = %event.message_id.0,
                    "no recipient row for delivery event, dropped"
                );
            }
            Err(err) => {
                summary.errors += 1;
                warn!(
                    message_id = %event.message_id.0,
                    error = %err,
                    "store rejected delivery event"
                );
            }
        }
    }
}

/// Translate a wire status event into a [`DeliveryEvent`].
pub fn parse_status_event(status: &StatusEvent) -> Result<DeliveryEvent, &'static str> {
    let kind = match status.status.as_str() {
        "sent" => DeliveryEventKind::Sent,
        "delivered" => DeliveryEventKind::Delivered,
        "read" => DeliveryEventKind::Read,
        "failed" => DeliveryEventKind::Failed,
        _ => return Err("unknown status"),
    };

    let timestamp = parse_unix_seconds(&status.timestamp).ok_or("bad timestamp")?;

    let mut event = DeliveryEvent::new(status.id.clone(), kind, timestamp);
    if let Some(first) = status.errors.first() {
        let text = first
            .message
            .clone()
            .or_else(|| first.title.clone())
            .unwrap_or_else(|| "delivery failed".to_string());
        event = event.with_error(first.code, text);
    }
    Ok(event)
}

fn parse_unix_seconds(raw: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = raw.trim().parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}
