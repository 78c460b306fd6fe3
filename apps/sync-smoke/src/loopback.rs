//! In-process homeserver stand-in.
//!
//! Serves a handful of empty sync batches, then drops off the network so the
//! reconnect path runs too.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use client_core::{
    DelayedEventAction, DelayedEventsPage, ServerVersions, SyncResponse, Transport,
    TransportError,
    transport::{
        NotificationsRequest, NotificationsResponse, RedactRequest, SendEventRequest,
        SendEventResponse, SendStateRequest, SyncRequest,
    },
};
use serde_json::{Value, json};
use tracing::debug;

const LONG_POLL: Duration = Duration::from_millis(250);

pub struct LoopbackTransport {
    online_syncs: usize,
    syncs: AtomicUsize,
    sends: AtomicUsize,
}

impl LoopbackTransport {
    /// Answer `online_syncs` sync requests, then fail every request.
    pub fn new(online_syncs: usize) -> Self {
        Self {
            online_syncs,
            syncs: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
        }
    }

    fn online(&self) -> Result<(), TransportError> {
        if self.syncs.load(Ordering::SeqCst) > self.online_syncs {
            Err(TransportError::Network("loopback went offline".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, TransportError> {
        let n = self.syncs.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(n, since = ?request.since, "loopback sync");
        self.online()?;
        tokio::time::sleep(LONG_POLL).await;
        Ok(SyncResponse {
            next_batch: format!("s{n}"),
            ..SyncResponse::default()
        })
    }

    async fn get_push_rules(&self) -> Result<Value, TransportError> {
        self.online()?;
        Ok(json!({"global": {}}))
    }

    async fn get_filter(&self, _user_id: &str, _filter_id: &str) -> Result<Value, TransportError> {
        self.online()?;
        Ok(json!({}))
    }

    async fn create_filter(&self, _user_id: &str, _filter: Value) -> Result<String, TransportError> {
        self.online()?;
        Ok("loopback-filter".to_owned())
    }

    async fn send_event(
        &self,
        _request: SendEventRequest,
    ) -> Result<SendEventResponse, TransportError> {
        self.online()?;
        let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SendEventResponse {
            event_id: Some(format!("$loopback-{n}")),
            delay_id: None,
        })
    }

    async fn send_state_event(
        &self,
        request: SendStateRequest,
    ) -> Result<SendEventResponse, TransportError> {
        self.online()?;
        let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(if request.delay.is_some() {
            SendEventResponse {
                event_id: None,
                delay_id: Some(format!("loopback-delay-{n}")),
            }
        } else {
            SendEventResponse {
                event_id: Some(format!("$loopback-{n}")),
                delay_id: None,
            }
        })
    }

    async fn redact_event(&self, _request: RedactRequest) -> Result<String, TransportError> {
        Err(TransportError::http(405, "M_UNRECOGNIZED", "redaction not served"))
    }

    async fn get_delayed_events(
        &self,
        _from: Option<&str>,
    ) -> Result<DelayedEventsPage, TransportError> {
        self.online()?;
        Ok(DelayedEventsPage::default())
    }

    async fn update_delayed_event(
        &self,
        _delay_id: &str,
        _action: DelayedEventAction,
    ) -> Result<(), TransportError> {
        self.online()
    }

    async fn put_account_data(
        &self,
        _user_id: &str,
        _event_type: &str,
        _content: Value,
    ) -> Result<Value, TransportError> {
        self.online()?;
        Ok(json!({}))
    }

    async fn delete_account_data(
        &self,
        _user_id: &str,
        _event_type: &str,
    ) -> Result<(), TransportError> {
        self.online()
    }

    async fn get_notifications(
        &self,
        _request: NotificationsRequest,
    ) -> Result<NotificationsResponse, TransportError> {
        self.online()?;
        Ok(NotificationsResponse::default())
    }

    async fn get_versions(&self) -> Result<ServerVersions, TransportError> {
        self.online()?;
        Ok(ServerVersions {
            versions: vec!["v1.11".to_owned()],
            unstable_features: BTreeMap::new(),
        })
    }
}
