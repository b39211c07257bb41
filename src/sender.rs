use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{classify_error, ErrorClass, SendError};
use crate::types::{ProviderMessageId, RateLimitConfig};

/// One templated outbound message.
///
/// Parameters are positional and map onto the template body in order; the
/// recipient's ticket or verification code is just another parameter
/// supplied by the caller.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TemplateMessage {
    /// Canonical international phone number.
    pub to: String,

    pub template_name: String,
    pub language: String,
    pub parameters: Vec<String>,
}

/// Outbound send seam to the messaging provider.
///
/// The dispatcher only sees this trait; tests script it, production wires
/// [`HttpSender`] (feature `http`).
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_template(
        &self,
        message: &TemplateMessage,
    ) -> Result<ProviderMessageId, SendError>;
}

/// Token bucket with fractional refill, used for each rate tier.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let cap = capacity.max(1) as f64;
        Self {
            capacity: cap,
            tokens: cap,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until one token is available. Zero when a token is ready now.
    pub fn delay_until_ready(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        }
    }

    /// Consume one token, allowing the balance to go slightly negative if
    /// the caller chose not to wait out the full delay.
    pub fn take(&mut self) {
        self.refill();
        self.tokens -= 1.0;
    }
}

/// Three concurrently-active send ceilings: per second, per minute and per
/// hour. The governing delay is the worst of the three; the per-second
/// tier is the usual binding constraint.
#[derive(Debug)]
pub struct MultiTierLimiter {
    second: TokenBucket,
    minute: TokenBucket,
    hour: TokenBucket,

    /// Config version these buckets were built from.
    version: u64,
}

impl MultiTierLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            second: TokenBucket::new(cfg.per_second, cfg.per_second as f64),
            minute: TokenBucket::new(cfg.per_minute, cfg.per_minute as f64 / 60.0),
            hour: TokenBucket::new(cfg.per_hour, cfg.per_hour as f64 / 3600.0),
            version: cfg.version,
        }
    }

    /// Rebuild the buckets when the configuration was hot-reloaded.
    pub fn sync_config(&mut self, cfg: &RateLimitConfig) {
        if cfg.version != self.version {
            *self = Self::new(cfg);
        }
    }

    /// Delay until all three tiers admit one more send.
    pub fn delay_until_ready(&mut self) -> Duration {
        self.second
            .delay_until_ready()
            .max(self.minute.delay_until_ready())
            .max(self.hour.delay_until_ready())
    }

    /// Record one send against every tier.
    pub fn record_send(&mut self) {
        self.second.take();
        self.minute.take();
        self.hour.take();
    }
}

/// Adaptive delay multiplier.
///
/// Grows with the in-run error rate (a hostile remote API gets slower
/// traffic) and with progress toward completion, bounded by `max`. The
/// error component is computed per batch, so it decays on its own once
/// errors subside.
pub fn adaptive_multiplier(batch_error_rate: f64, progress: f64, max: f64) -> f64 {
    let error_rate = batch_error_rate.clamp(0.0, 1.0);
    let progress = progress.clamp(0.0, 1.0);
    (1.0 + 3.0 * error_rate + 0.5 * progress).min(max.max(1.0))
}

/// Effective inter-message delay: the larger of the configured base delay
/// and the ceiling-derived delay, scaled by the adaptive multiplier and
/// capped at `max_delay_ms`.
pub fn message_delay(
    cfg: &RateLimitConfig,
    limiter_delay: Duration,
    multiplier: f64,
) -> Duration {
    let base = Duration::from_millis(cfg.base_delay_ms);
    let governed = base.max(limiter_delay);
    let scaled = governed.mul_f64(multiplier.max(1.0));
    scaled.min(Duration::from_millis(cfg.max_delay_ms))
}

/// Inter-batch pause, scaled like the per-message delay.
pub fn batch_pause(cfg: &RateLimitConfig, multiplier: f64) -> Duration {
    Duration::from_millis(cfg.batch_pause_ms)
        .mul_f64(multiplier.max(1.0))
        .min(Duration::from_millis(cfg.max_delay_ms.max(cfg.batch_pause_ms)))
}

/// Spread a delay by +/-15 percent so concurrent runs against the same
/// provider account do not align their sends.
pub fn jitter(delay: Duration) -> Duration {
    delay.mul_f64(0.85 + fastrand::f64() * 0.3)
}

/// HTTP sender against the provider's templated-messaging API.
#[cfg(feature = "http")]
pub struct HttpSender {
    client: reqwest::Client,
    api_base: String,
    sender_id: String,
    access_token: String,
    timeout: Duration,
}

#[cfg(feature = "http")]
impl HttpSender {
    pub fn new(
        api_base: impl Into<String>,
        sender_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            sender_id: sender_id.into(),
            access_token: access_token.into(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_body(&self, message: &TemplateMessage) -> serde_json::Value {
        let parameters: Vec<serde_json::Value> = message
            .parameters
            .iter()
            .map(|p| serde_json::json!({ "type": "text", "text": p }))
            .collect();

        serde_json::json!({
            "messaging_product": "whatsapp",
            "to": message.to,
            "type": "template",
            "template": {
                "name": message.template_name,
                "language": { "code": message.language },
                "components": [
                    { "type": "body", "parameters": parameters }
                ]
            }
        })
    }
}

#[cfg(feature = "http")]
#[derive(Debug, serde::Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
    #[serde(default)]
    error: Option<ProviderApiError>,
}

#[cfg(feature = "http")]
#[derive(Debug, serde::Deserialize)]
struct SentMessage {
    id: String,
}

#[cfg(feature = "http")]
#[derive(Debug, serde::Deserialize)]
struct ProviderApiError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[cfg(feature = "http")]
#[async_trait]
impl MessageSender for HttpSender {
    async fn send_template(
        &self,
        message: &TemplateMessage,
    ) -> Result<ProviderMessageId, SendError> {
        let url = format!("{}/{}/messages", self.api_base, self.sender_id);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .timeout(self.timeout)
            .json(&self.build_body(message))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    SendError::network("send timed out")
                } else if err.is_connect() {
                    SendError::network(format!("connection failed: {}", err))
                } else {
                    SendError::network(format!("transport error: {}", err))
                }
            })?;

        let status = response.status();
        let body: SendResponse = response
            .json()
            .await
            .map_err(|err| SendError::network(format!("unreadable provider response: {}", err)))?;

        if status.is_success() {
            if let Some(sent) = body.messages.into_iter().next() {
                return Ok(ProviderMessageId(sent.id));
            }
            return Err(SendError::new(
                ErrorClass::Unknown,
                "provider accepted the request but returned no message id",
            ));
        }

        let detail = body
            .error
            .map(|e| {
                format!(
                    "{} (code {}, type {})",
                    e.message.unwrap_or_else(|| "provider error".to_string()),
                    e.code.map(|c| c.to_string()).unwrap_or_else(|| "?".into()),
                    e.kind.unwrap_or_else(|| "?".into()),
                )
            })
            .unwrap_or_else(|| format!("provider returned HTTP {}", status.as_u16()));

        let class = if status.as_u16() == 401 || status.as_u16() == 403 {
            ErrorClass::Systemic
        } else if status.as_u16() == 429 {
            ErrorClass::RateLimited
        } else if status.is_server_error() {
            ErrorClass::Network
        } else {
            classify_error(&detail)
        };

        Err(SendError::new(class, detail))
    }
}
