use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    capabilities::ServerVersions,
    error::{ClientError, TransportError},
    types::{DelayMode, DelayedEventAction, DelayedEventsPage, Notification, SyncResponse},
};

/// Parameters of one `/sync` long-poll.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncRequest {
    pub since: Option<String>,
    pub timeout_ms: u64,
    pub filter_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendEventRequest {
    pub room_id: String,
    pub event_type: String,
    pub txn_id: String,
    pub content: Value,
    /// Present for delayed sends.
    pub delay: Option<DelayMode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendStateRequest {
    pub room_id: String,
    pub event_type: String,
    pub state_key: String,
    pub content: Value,
    pub delay: Option<DelayMode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SendEventResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedactRequest {
    pub room_id: String,
    pub event_id: String,
    pub txn_id: String,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NotificationsRequest {
    pub from: Option<String>,
    pub limit: u16,
    pub only: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NotificationsResponse {
    #[serde(default)]
    pub notifications: Vec<Notification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

/// Authenticated access to the homeserver's client-server API.
///
/// Implementations own the HTTP stack and authentication. Every method maps
/// to one request; retries are the caller's business.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, TransportError>;

    async fn get_push_rules(&self) -> Result<Value, TransportError>;

    async fn get_filter(&self, user_id: &str, filter_id: &str) -> Result<Value, TransportError>;

    /// Upload a filter definition and return its id.
    async fn create_filter(&self, user_id: &str, filter: Value) -> Result<String, TransportError>;

    async fn send_event(
        &self,
        request: SendEventRequest,
    ) -> Result<SendEventResponse, TransportError>;

    async fn send_state_event(
        &self,
        request: SendStateRequest,
    ) -> Result<SendEventResponse, TransportError>;

    /// Redact an event and return the redaction's event id.
    async fn redact_event(&self, request: RedactRequest) -> Result<String, TransportError>;

    async fn get_delayed_events(
        &self,
        from: Option<&str>,
    ) -> Result<DelayedEventsPage, TransportError>;

    async fn update_delayed_event(
        &self,
        delay_id: &str,
        action: DelayedEventAction,
    ) -> Result<(), TransportError>;

    async fn put_account_data(
        &self,
        user_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<Value, TransportError>;

    async fn delete_account_data(
        &self,
        user_id: &str,
        event_type: &str,
    ) -> Result<(), TransportError>;

    async fn get_notifications(
        &self,
        request: NotificationsRequest,
    ) -> Result<NotificationsResponse, TransportError>;

    /// `GET /versions`, also used as the keepalive probe.
    async fn get_versions(&self) -> Result<ServerVersions, TransportError>;
}

/// Ciphertext ready to be sent in place of the plaintext event.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedContent {
    pub event_type: String,
    pub content: Value,
}

/// End-to-end encryption, provided by the host.
#[async_trait]
pub trait EncryptionBackend: Send + Sync {
    async fn encrypt_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<EncryptedContent, ClientError>;
}
