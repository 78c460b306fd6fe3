use std::{fmt, time::Duration};

use client_platform::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for caller-facing handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input, malformed local configuration, or a rejected request.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the homeserver.
    RateLimited,
    /// The homeserver does not advertise a required capability.
    Unsupported,
    /// The operation is not valid for the current local state.
    InvalidState,
    /// A pending send was cancelled before it reached the transport.
    Cancelled,
    /// Failure reported by the encryption capability.
    Crypto,
    /// Local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload surfaced to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ClientError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP status when the error came back from the homeserver.
    pub http_status: Option<u16>,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ClientError {
    /// Construct a new error.
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            http_status: None,
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: impl fmt::Debug, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCategory::InvalidState,
            "invalid_state_transition",
            format!("cannot run '{action}' while in state {current:?}"),
        )
    }

    /// The homeserver lacks a capability the operation depends on.
    pub fn unsupported(feature: impl Into<String>) -> Self {
        let feature = feature.into();
        Self::new(
            ErrorCategory::Unsupported,
            "unsupported_by_server",
            format!("server does not support {feature}"),
        )
    }

    /// A pending event cannot be cancelled from its current status.
    pub fn not_cancellable(txn_id: &str, status: impl fmt::Debug) -> Self {
        Self::new(
            ErrorCategory::InvalidState,
            "event_not_cancellable",
            format!("cannot cancel event {txn_id} with status {status:?}"),
        )
    }

    /// The send was cancelled at one of its checkpoints.
    pub fn cancelled(txn_id: &str) -> Self {
        Self::new(
            ErrorCategory::Cancelled,
            "send_cancelled",
            format!("send of {txn_id} was cancelled"),
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        408 | 429 => ErrorCategory::RateLimited,
        400..=499 => ErrorCategory::Config,
        500..=599 => ErrorCategory::Network,
        _ => ErrorCategory::Internal,
    }
}

/// Failure reported by the transport capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request never produced an HTTP response.
    #[error("network failure: {0}")]
    Network(String),
    /// No response arrived within the request's time bound.
    #[error("request timed out")]
    Timeout,
    /// The homeserver answered with an error status.
    #[error("http {status}: {message}")]
    Http {
        status: u16,
        errcode: Option<String>,
        message: String,
        retry_after_ms: Option<u64>,
    },
}

impl TransportError {
    pub fn http(status: u16, errcode: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            errcode: Some(errcode.into()),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn errcode(&self) -> Option<&str> {
        match self {
            Self::Http { errcode, .. } => errcode.as_deref(),
            _ => None,
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network(message) => {
                ClientError::new(ErrorCategory::Network, "network_error", message)
            }
            TransportError::Timeout => ClientError::new(
                ErrorCategory::Network,
                "request_timeout",
                "request timed out",
            ),
            TransportError::Http {
                status,
                errcode,
                message,
                retry_after_ms,
            } => {
                // The status wins over the errcode: a 429 stays rate limited even
                // when the homeserver labels it M_UNRECOGNIZED.
                let mut mapped = ClientError::new(
                    classify_http_status(status),
                    errcode.unwrap_or_else(|| "http_error".to_owned()),
                    message,
                );
                mapped.http_status = Some(status);
                mapped.retry_after_ms = retry_after_ms;
                mapped
            }
        }
    }
}

impl From<StoreError> for ClientError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => {
                ClientError::new(ErrorCategory::Storage, "store_value_missing", err.to_string())
            }
            StoreError::Unavailable(_) => {
                ClientError::new(ErrorCategory::Storage, "store_unavailable", err.to_string())
            }
            StoreError::Backend(_) => {
                ClientError::new(ErrorCategory::Storage, "store_error", err.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::new(ErrorCategory::Serialization, "serde_json_error", err.to_string())
    }
}

/// How the sync loop reacts to a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFailure {
    /// Back off, probe the keepalive endpoint and try again.
    Transient,
    /// Stop the loop for good.
    Fatal,
}

/// Classify a failed sync (or bootstrap) request.
pub fn classify_sync_failure(err: &ClientError) -> SyncFailure {
    match err.category {
        ErrorCategory::Network | ErrorCategory::RateLimited => SyncFailure::Transient,
        _ if is_probe_fallback(err) => SyncFailure::Transient,
        _ => SyncFailure::Fatal,
    }
}

/// 404/405 with `M_UNRECOGNIZED` is how homeservers reject an endpoint they do
/// not implement while capabilities are being negotiated.
fn is_probe_fallback(err: &ClientError) -> bool {
    matches!(err.http_status, Some(404 | 405)) && err.code == "M_UNRECOGNIZED"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SyncState;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), ErrorCategory::Auth);
        assert_eq!(classify_http_status(429), ErrorCategory::RateLimited);
        assert_eq!(classify_http_status(404), ErrorCategory::Config);
        assert_eq!(classify_http_status(503), ErrorCategory::Network);
        assert_eq!(classify_http_status(700), ErrorCategory::Internal);
    }

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = ClientError::invalid_state(SyncState::Syncing, "start");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, ErrorCategory::InvalidState);
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = ClientError::new(ErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }

    #[test]
    fn rate_limit_is_never_unsupported() {
        let err: ClientError =
            TransportError::http(429, "M_UNRECOGNIZED", "slow down").into();
        assert_eq!(err.category, ErrorCategory::RateLimited);
        assert_eq!(classify_sync_failure(&err), SyncFailure::Transient);
    }

    #[test]
    fn transport_http_error_keeps_status_and_retry_hint() {
        let err: ClientError = TransportError::Http {
            status: 429,
            errcode: Some("M_LIMIT_EXCEEDED".to_owned()),
            message: "too many".to_owned(),
            retry_after_ms: Some(1_500),
        }
        .into();
        assert_eq!(err.http_status, Some(429));
        assert_eq!(err.code, "M_LIMIT_EXCEEDED");
        assert_eq!(err.retry_after_ms, Some(1_500));
    }

    #[test]
    fn sync_failures_split_into_transient_and_fatal() {
        let network: ClientError = TransportError::Network("reset".into()).into();
        let gateway: ClientError = TransportError::http(502, "M_UNKNOWN", "bad gateway").into();
        let timeout: ClientError = TransportError::Timeout.into();
        let probe: ClientError = TransportError::http(404, "M_UNRECOGNIZED", "nope").into();
        let bad_request: ClientError = TransportError::http(400, "M_BAD_JSON", "bad").into();
        let auth: ClientError = TransportError::http(401, "M_UNKNOWN_TOKEN", "who").into();

        assert_eq!(classify_sync_failure(&network), SyncFailure::Transient);
        assert_eq!(classify_sync_failure(&gateway), SyncFailure::Transient);
        assert_eq!(classify_sync_failure(&timeout), SyncFailure::Transient);
        assert_eq!(classify_sync_failure(&probe), SyncFailure::Transient);
        assert_eq!(classify_sync_failure(&bad_request), SyncFailure::Fatal);
        assert_eq!(classify_sync_failure(&auth), SyncFailure::Fatal);
    }

    #[test]
    fn maps_store_errors_to_storage_category() {
        let err: ClientError = StoreError::Unavailable("disk gone".into()).into();
        assert_eq!(err.category, ErrorCategory::Storage);
        assert_eq!(err.code, "store_unavailable");
    }
}
