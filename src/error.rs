use std::fmt;

use crate::types::{CampaignId, ConfigError};

/// Errors returned when a dispatch run cannot start or finish.
#[derive(Debug)]
pub enum DispatchError {
    /// Another dispatch run already holds the campaign lease.
    /// Caller must decline rather than start a parallel run.
    AlreadyDispatching { campaign_id: CampaignId },

    /// Campaign does not exist in the store.
    CampaignNotFound { campaign_id: CampaignId },

    /// The backing store rejected or lost an operation.
    Store(StoreError),

    /// A configuration reload was rejected.
    Config(ConfigError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::AlreadyDispatching { campaign_id } => {
                write!(f, "campaign {} is already dispatching", campaign_id.0)
            }
            DispatchError::CampaignNotFound { campaign_id } => {
                write!(f, "campaign not found: {}", campaign_id.0)
            }
            DispatchError::Store(err) => write!(f, "store error: {}", err),
            DispatchError::Config(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        DispatchError::Store(err)
    }
}

impl From<ConfigError> for DispatchError {
    fn from(err: ConfigError) -> Self {
        DispatchError::Config(err)
    }
}

/// Failure reported by the recipient store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    pub message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StoreError {}

/// Machine classification of a send or delivery failure.
///
/// Drives retry eligibility and delay (see the retry scheduler) and the
/// dispatcher's adaptive pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or unsupported phone number. Locally correctable, so
    /// retried immediately once a validation fix is presumed deployed.
    Validation,

    /// Timeout or connection failure. Retried with standard backoff.
    Network,

    /// Provider throttled us. Retried with extended backoff and fed back
    /// into adaptive pacing.
    RateLimited,

    /// Invalid or blocked number. Never retried.
    Permanent,

    /// Provider unreachable or credentials rejected. Aborts the run and
    /// fails the campaign; requires operator attention.
    Systemic,

    /// Anything we could not classify. Default retry tier.
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Network => "network",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Systemic => "systemic",
            ErrorClass::Unknown => "unknown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a persisted error message.
///
/// Errors are stored as human-readable text; this recovers the machine
/// classification from that text. Permanent markers are checked before
/// validation markers because "invalid number" and "invalid phone format"
/// overlap textually but mean different things.
pub fn classify_error(message: &str) -> ErrorClass {
    let msg = message.to_ascii_lowercase();

    if msg.contains("blocked")
        || msg.contains("invalid number")
        || msg.contains("not a whatsapp user")
        || msg.contains("recipient unavailable")
    {
        return ErrorClass::Permanent;
    }
    if msg.contains("phone format")
        || msg.contains("invalid phone")
        || msg.contains("unsupported format")
        || msg.contains("malformed")
    {
        return ErrorClass::Validation;
    }
    if msg.contains("rate limit")
        || msg.contains("too many requests")
        || msg.contains("429")
        || msg.contains("throttle")
    {
        return ErrorClass::RateLimited;
    }
    if msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("network")
        || msg.contains("connection")
        || msg.contains("unreachable")
    {
        return ErrorClass::Network;
    }
    if msg.contains("unauthorized")
        || msg.contains("credential")
        || msg.contains("authentication")
        || msg.contains("access token")
    {
        return ErrorClass::Systemic;
    }

    ErrorClass::Unknown
}

/// Failure of a single outbound send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendError {
    pub class: ErrorClass,
    pub message: String,
}

impl SendError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Network, message)
    }

    pub fn systemic(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Systemic, message)
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.class, self.message)
    }
}

impl std::error::Error for SendError {}
