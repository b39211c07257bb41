use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a campaign.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of campaign IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CampaignId(pub String);

/// Unique identifier for a recipient row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecipientId(pub String);

/// Message identifier assigned by the messaging provider.
///
/// Delivery callbacks are keyed by this id, not by our recipient id,
/// since the provider only knows its own identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderMessageId(pub String);

/// Campaign lifecycle status.
///
/// `Dispatching` doubles as the dispatch lease: entering it is a
/// conditional transition, and a second caller that observes it must
/// decline to start a parallel run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CampaignStatus {
    Draft,
    Dispatching,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, CampaignStatus::Dispatching)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Dispatching => "dispatching",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
        }
    }
}

/// A named bulk-send operation targeting a set of recipients with one
/// message template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,

    /// Template name registered with the messaging provider.
    pub template_name: String,

    /// Template language code, e.g. `en` or `id`.
    pub language: String,

    pub status: CampaignStatus,
    pub total_recipients: u32,
    pub sent_count: u32,
    pub failed_count: u32,

    /// Number of automatic watchdog restarts consumed so far.
    ///
    /// Persisted so the restart bound survives process restarts and holds
    /// across concurrent supervisor instances.
    pub restart_count: u32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Create a new draft campaign.
    ///
    /// Defaults:
    /// - language: `en`
    /// - status: `Draft`
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        template_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CampaignId(id.into()),
            name: name.into(),
            template_name: template_name.into(),
            language: "en".to_string(),
            status: CampaignStatus::Draft,
            total_recipients: 0,
            sent_count: 0,
            failed_count: 0,
            restart_count: 0,
            created_at: now,
            started_at: None,
            updated_at: now,
        }
    }

    /// Set the template language code.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Override the creation timestamp (useful when seeding a store).
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Per-recipient send state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
    Skipped,
}

impl RecipientStatus {
    /// Monotonic rank of the forward delivery path.
    ///
    /// `pending(0) < sent(1) < delivered(2) < read(3)`. `Failed` and
    /// `Skipped` are terminal and unranked.
    pub fn rank(&self) -> Option<u8> {
        match self {
            RecipientStatus::Pending => Some(0),
            RecipientStatus::Sent => Some(1),
            RecipientStatus::Delivered => Some(2),
            RecipientStatus::Read => Some(3),
            RecipientStatus::Failed | RecipientStatus::Skipped => None,
        }
    }

    /// Whether this status counts as a successful send for deduplication.
    pub fn is_successful(&self) -> bool {
        matches!(
            self,
            RecipientStatus::Sent | RecipientStatus::Delivered | RecipientStatus::Read
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::Sent => "sent",
            RecipientStatus::Delivered => "delivered",
            RecipientStatus::Read => "read",
            RecipientStatus::Failed => "failed",
            RecipientStatus::Skipped => "skipped",
        }
    }
}

/// One (campaign, phone number) pair and its send/delivery state.
///
/// Rows are never physically deleted by the engine; every mutation is a
/// status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub campaign_id: CampaignId,

    /// Canonical international phone number (digits only).
    pub phone_number: String,

    pub name: String,
    pub status: RecipientStatus,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub retry_reason: Option<String>,

    /// Set once the provider accepts the message.
    pub message_id: Option<ProviderMessageId>,

    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recipient {
    /// Create a pending recipient for a campaign.
    pub fn new(
        id: impl Into<String>,
        campaign_id: CampaignId,
        phone_number: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecipientId(id.into()),
            campaign_id,
            phone_number: phone_number.into(),
            name: name.into(),
            status: RecipientStatus::Pending,
            error_message: None,
            retry_count: 0,
            last_retry_at: None,
            next_retry_at: None,
            retry_reason: None,
            message_id: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an asynchronous delivery event to this row.
    ///
    /// The state machine is forward-only: an event of lower or equal rank
    /// than the current status is a no-op except for backfilling an empty
    /// timestamp field. `Failed` is reachable from any non-terminal state
    /// and carries the condensed provider error.
    ///
    /// Returns `true` when the row changed.
    pub fn apply_delivery_event(&mut self, event: &DeliveryEvent) -> bool {
        match event.kind {
            DeliveryEventKind::Failed => match self.status {
                // Read is terminal; Failed and Skipped already are.
                RecipientStatus::Read | RecipientStatus::Failed | RecipientStatus::Skipped => {
                    false
                }
                _ => {
                    self.status = RecipientStatus::Failed;
                    self.failed_at = Some(event.timestamp);
                    self.error_message = Some(event.condensed_error());
                    self.updated_at = Utc::now();
                    true
                }
            },
            DeliveryEventKind::Sent | DeliveryEventKind::Delivered | DeliveryEventKind::Read => {
                let target = event.kind.target_status();
                let target_rank = target.rank().unwrap_or(0);
                match self.status.rank() {
                    Some(current_rank) if target_rank > current_rank => {
                        self.status = target;
                        self.set_event_timestamp(event.kind, event.timestamp);
                        self.updated_at = Utc::now();
                        true
                    }
                    Some(_) => {
                        // Duplicate or out-of-order event: backfill only.
                        let backfilled = self.backfill_timestamp(event.kind, event.timestamp);
                        if backfilled {
                            self.updated_at = Utc::now();
                        }
                        backfilled
                    }
                    // Success report for a row already failed or skipped:
                    // keep the terminal status, backfill only.
                    None => self.backfill_timestamp(event.kind, event.timestamp),
                }
            }
        }
    }

    fn set_event_timestamp(&mut self, kind: DeliveryEventKind, at: DateTime<Utc>) {
        match kind {
            DeliveryEventKind::Sent => self.sent_at = Some(at),
            DeliveryEventKind::Delivered => self.delivered_at = Some(at),
            DeliveryEventKind::Read => self.read_at = Some(at),
            DeliveryEventKind::Failed => self.failed_at = Some(at),
        }
    }

    fn backfill_timestamp(&mut self, kind: DeliveryEventKind, at: DateTime<Utc>) -> bool {
        let slot = match kind {
            DeliveryEventKind::Sent => &mut self.sent_at,
            DeliveryEventKind::Delivered => &mut self.delivered_at,
            DeliveryEventKind::Read => &mut self.read_at,
            DeliveryEventKind::Failed => &mut self.failed_at,
        };
        if slot.is_none() {
            *slot = Some(at);
            true
        } else {
            false
        }
    }
}

/// Kind of delivery callback reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryEventKind {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryEventKind {
    pub fn target_status(&self) -> RecipientStatus {
        match self {
            DeliveryEventKind::Sent => RecipientStatus::Sent,
            DeliveryEventKind::Delivered => RecipientStatus::Delivered,
            DeliveryEventKind::Read => RecipientStatus::Read,
            DeliveryEventKind::Failed => RecipientStatus::Failed,
        }
    }
}

/// Delivery callback, keyed by provider message id.
///
/// Not persisted as its own entity; it is applied as a transition onto the
/// matching recipient row.
#[derive(Debug, Clone)]
pub struct DeliveryEvent {
    pub message_id: ProviderMessageId,
    pub kind: DeliveryEventKind,

    /// The provider-reported event time, not the receipt time.
    pub timestamp: DateTime<Utc>,

    pub error_code: Option<i64>,
    pub error_message: Option<String>,
}

impl DeliveryEvent {
    pub fn new(
        message_id: impl Into<String>,
        kind: DeliveryEventKind,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: ProviderMessageId(message_id.into()),
            kind,
            timestamp,
            error_code: None,
            error_message: None,
        }
    }

    pub fn with_error(mut self, code: Option<i64>, message: impl Into<String>) -> Self {
        self.error_code = code;
        self.error_message = Some(message.into());
        self
    }

    /// Condense the provider error payload into one line of text.
    pub fn condensed_error(&self) -> String {
        match (&self.error_code, &self.error_message) {
            (Some(code), Some(msg)) => format!("provider error {}: {}", code, msg),
            (None, Some(msg)) => msg.clone(),
            (Some(code), None) => format!("provider error {}", code),
            (None, None) => "delivery failed".to_string(),
        }
    }
}

/// Rate-limit and pacing configuration.
///
/// Hot-reloadable: the dispatcher re-reads the current value at the start
/// of every batch, never once at process start. Every field is
/// bounds-checked by [`RateLimitConfig::validate`] before a new version is
/// accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Recipients per batch.
    pub batch_size: usize,

    /// Messages-per-second ceiling.
    pub per_second: u32,

    /// Messages-per-minute ceiling.
    pub per_minute: u32,

    /// Messages-per-hour ceiling.
    pub per_hour: u32,

    /// Baseline inter-message delay in milliseconds.
    pub base_delay_ms: u64,

    /// Pause between batches in milliseconds, in addition to per-message
    /// pacing.
    pub batch_pause_ms: u64,

    /// Upper bound on the adaptive delay multiplier.
    pub max_multiplier: f64,

    /// Cap on any single computed delay in milliseconds.
    pub max_delay_ms: u64,

    /// Bounded timeout for one outbound send in milliseconds.
    pub send_timeout_ms: u64,

    /// Monotonic version counter, bumped on every accepted reload.
    pub version: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            per_second: 10,
            per_minute: 300,
            per_hour: 5_000,
            base_delay_ms: 300,
            batch_pause_ms: 30_000,
            max_multiplier: 4.0,
            max_delay_ms: 60_000,
            send_timeout_ms: 15_000,
            version: 1,
        }
    }
}

impl RateLimitConfig {
    /// Bounds-check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::OutOfBounds("batch_size must be at least 1"));
        }
        if self.per_second == 0 || self.per_minute == 0 || self.per_hour == 0 {
            return Err(ConfigError::OutOfBounds("rate ceilings must be positive"));
        }
        if self.per_minute < self.per_second {
            return Err(ConfigError::OutOfBounds(
                "per_minute ceiling below per_second ceiling",
            ));
        }
        if self.per_hour < self.per_minute {
            return Err(ConfigError::OutOfBounds(
                "per_hour ceiling below per_minute ceiling",
            ));
        }
        if !(self.max_multiplier >= 1.0) {
            return Err(ConfigError::OutOfBounds("max_multiplier must be >= 1.0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::OutOfBounds("max_delay_ms below base_delay_ms"));
        }
        if self.send_timeout_ms == 0 {
            return Err(ConfigError::OutOfBounds("send_timeout_ms must be positive"));
        }
        Ok(())
    }

    /// Derive the deliberately slower profile used for retry-triggered
    /// dispatch: half the batch size, doubled base delay.
    pub fn retry_profile(&self) -> Self {
        let mut cfg = self.clone();
        cfg.batch_size = (self.batch_size / 2).max(1);
        cfg.base_delay_ms = (self.base_delay_ms * 2).min(self.max_delay_ms);
        cfg
    }
}

/// Rejected configuration reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    OutOfBounds(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::OutOfBounds(reason) => {
                write!(f, "invalid rate-limit config: {}", reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Normalize a phone number to canonical international form: digits only,
/// leading `+` and separators stripped.
///
/// Returns `None` for values that cannot be a dialable international
/// number; callers surface that as a validation error.
pub fn canonical_phone(raw: &str) -> Option<String> {
    let digits: String = raw
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if !(8..=15).contains(&digits.len()) {
        return None;
    }
    Some(digits)
}
