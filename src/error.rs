use serde::{Deserialize, Serialize};

/// Error type for cache tier operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheError {
    /// A cache operation failed.
    #[error("[{tier}] cache error for key '{key}': {message}")]
    Operation {
        tier: String,
        key: String,
        message: String,
    },
    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    /// Create a new operation error.
    pub fn operation(
        tier: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CacheError::Operation {
            tier: tier.into(),
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Every error surfaced by the client.
///
/// The type is `Clone` so that callers collapsed onto one in-flight request
/// all observe the same outcome, errors included.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    /// No HTTP response was received.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The server answered with a non-2xx status.
    #[error("HTTP {status} {status_text}")]
    Http {
        status: u16,
        status_text: String,
        body: Option<String>,
        retry_after_ms: Option<u64>,
    },

    /// The request deadline elapsed.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The request was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,

    /// The circuit breaker rejected the call without reaching the transport.
    #[error("circuit open, retry in {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    /// The scheduler's pending list is full.
    #[error("request queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// The offline queue is full.
    #[error("offline queue full ({capacity} parked)")]
    OfflineQueueFull { capacity: usize },

    /// `cache-only` strategy found nothing.
    #[error("cache miss for '{key}'")]
    CacheMiss { key: String },

    /// A cache tier failed where no network fallback applies (`cache-only`).
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Pass-through failure from a collaborator such as an auth or encryption layer.
    #[error("{source_name}: {message}")]
    Collaborator {
        source_name: String,
        message: String,
    },
}

/// Flattened error contract for downstream consumers (auth refresh, UI banners, telemetry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub status: Option<u16>,
    pub message: String,
    pub retryable: bool,
    pub retry_after_ms: Option<u64>,
}

impl RequestError {
    pub fn transport(message: impl Into<String>) -> Self {
        RequestError::Transport {
            message: message.into(),
        }
    }

    pub fn collaborator(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        RequestError::Collaborator {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Build an HTTP error with no body.
    pub fn http(status: u16, status_text: impl Into<String>) -> Self {
        RequestError::Http {
            status,
            status_text: status_text.into(),
            body: None,
            retry_after_ms: None,
        }
    }

    /// HTTP status associated with the error, if any. Timeouts report 408.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Http { status, .. } => Some(*status),
            RequestError::Timeout { .. } => Some(408),
            _ => None,
        }
    }

    /// Server- or breaker-supplied hint for when to try again.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            RequestError::Http { retry_after_ms, .. } => *retry_after_ms,
            RequestError::CircuitOpen { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// True for both caller-initiated cancellation and deadline expiry.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RequestError::Cancelled | RequestError::Timeout { .. })
    }

    /// True when the failure says the service is degraded rather than that this call failed.
    pub fn is_service_degraded(&self) -> bool {
        matches!(
            self,
            RequestError::CircuitOpen { .. }
                | RequestError::QueueFull { .. }
                | RequestError::OfflineQueueFull { .. }
        )
    }

    /// Whether the failure should be counted by the circuit breaker.
    ///
    /// Only genuine downstream failures count: no response at all, or a
    /// server-side / availability status.
    pub fn counts_as_breaker_failure(&self) -> bool {
        match self {
            RequestError::Transport { .. } => true,
            RequestError::Http { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            _ => false,
        }
    }

    /// Whether the default retry policy would retry this error against `retryable_statuses`.
    pub fn is_retryable_with(&self, retryable_statuses: &[u16]) -> bool {
        match self {
            RequestError::Http { status, .. } => retryable_statuses.contains(status),
            _ => false,
        }
    }

    pub fn info(&self, retryable_statuses: &[u16]) -> ErrorInfo {
        ErrorInfo {
            status: self.status(),
            message: self.to_string(),
            retryable: self.is_retryable_with(retryable_statuses),
            retry_after_ms: self.retry_after_ms(),
        }
    }
}
