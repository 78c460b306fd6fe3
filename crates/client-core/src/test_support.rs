//! Scripted fakes of the injected capabilities.

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing_subscriber::fmt::MakeWriter;

use crate::{
    capabilities::ServerVersions,
    error::{ClientError, TransportError},
    lock,
    transport::{
        EncryptedContent, EncryptionBackend, NotificationsRequest, NotificationsResponse,
        RedactRequest, SendEventRequest, SendEventResponse, SendStateRequest, SyncRequest,
        Transport,
    },
    types::{DelayedEventAction, DelayedEventsPage, SyncResponse},
};

/// Buffer for formatted `tracing` output, installed per test thread.
#[derive(Clone, Default)]
pub(crate) struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Route events on the current thread into this buffer until the guard drops.
    pub(crate) fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&lock(&self.buffer))
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

pub(crate) struct LogCaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.buffer).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

type Scripted<T> = VecDeque<Result<T, TransportError>>;

#[derive(Default)]
struct MockState {
    calls: HashMap<&'static str, usize>,
    versions: ServerVersions,

    sync: Scripted<SyncResponse>,
    push_rules: Scripted<Value>,
    get_filter: Scripted<Value>,
    create_filter: Scripted<String>,
    send_event: Scripted<SendEventResponse>,
    send_state: Scripted<SendEventResponse>,
    redact: Scripted<String>,
    delayed_events: Scripted<DelayedEventsPage>,
    put_account_data: Scripted<Value>,
    delete_account_data: Scripted<()>,
    notifications: Scripted<NotificationsResponse>,
    get_versions: Scripted<ServerVersions>,

    sync_requests: Vec<SyncRequest>,
    sent_events: Vec<SendEventRequest>,
    sent_state: Vec<SendStateRequest>,
    redactions: Vec<RedactRequest>,
    delayed_updates: Vec<(String, DelayedEventAction)>,
    account_data_writes: Vec<(String, Value)>,
    notification_requests: Vec<NotificationsRequest>,
}

/// Transport whose responses are queued per endpoint.
///
/// An endpoint with an empty script answers with a benign default, except
/// `sync` which waits until a response is pushed.
#[derive(Default)]
pub(crate) struct MockTransport {
    state: Mutex<MockState>,
    changed: Notify,
    sync_pushed: Notify,
}

impl MockTransport {
    fn record(&self, endpoint: &'static str) {
        *lock(&self.state).calls.entry(endpoint).or_default() += 1;
        self.changed.notify_waiters();
    }

    pub(crate) fn calls(&self, endpoint: &str) -> usize {
        lock(&self.state).calls.get(endpoint).copied().unwrap_or(0)
    }

    /// Wait until `endpoint` was called at least `count` times.
    pub(crate) async fn wait_for_calls(&self, endpoint: &str, count: usize) {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.calls(endpoint) >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(3600), wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {count} calls to {endpoint}"));
    }

    pub(crate) fn set_versions(&self, versions: ServerVersions) {
        lock(&self.state).versions = versions;
    }

    pub(crate) fn enable_features(&self, flags: &[&str]) {
        let mut state = lock(&self.state);
        for flag in flags {
            state.versions.unstable_features.insert((*flag).to_owned(), true);
        }
    }

    pub(crate) fn push_versions(&self, result: Result<ServerVersions, TransportError>) {
        lock(&self.state).get_versions.push_back(result);
    }

    pub(crate) fn push_sync(&self, result: Result<SyncResponse, TransportError>) {
        lock(&self.state).sync.push_back(result);
        self.sync_pushed.notify_waiters();
    }

    pub(crate) fn push_get_filter(&self, result: Result<Value, TransportError>) {
        lock(&self.state).get_filter.push_back(result);
    }

    pub(crate) fn push_create_filter(&self, result: Result<String, TransportError>) {
        lock(&self.state).create_filter.push_back(result);
    }

    pub(crate) fn push_send_event(&self, result: Result<SendEventResponse, TransportError>) {
        lock(&self.state).send_event.push_back(result);
    }

    pub(crate) fn push_put_account_data(&self, result: Result<Value, TransportError>) {
        lock(&self.state).put_account_data.push_back(result);
    }

    pub(crate) fn push_notifications(&self, result: Result<NotificationsResponse, TransportError>) {
        lock(&self.state).notifications.push_back(result);
    }

    pub(crate) fn push_delayed_events(&self, result: Result<DelayedEventsPage, TransportError>) {
        lock(&self.state).delayed_events.push_back(result);
    }

    pub(crate) fn sync_requests(&self) -> Vec<SyncRequest> {
        lock(&self.state).sync_requests.clone()
    }

    pub(crate) fn sent_events(&self) -> Vec<SendEventRequest> {
        lock(&self.state).sent_events.clone()
    }

    pub(crate) fn sent_state(&self) -> Vec<SendStateRequest> {
        lock(&self.state).sent_state.clone()
    }

    pub(crate) fn redactions(&self) -> Vec<RedactRequest> {
        lock(&self.state).redactions.clone()
    }

    pub(crate) fn delayed_updates(&self) -> Vec<(String, DelayedEventAction)> {
        lock(&self.state).delayed_updates.clone()
    }

    pub(crate) fn account_data_writes(&self) -> Vec<(String, Value)> {
        lock(&self.state).account_data_writes.clone()
    }

    pub(crate) fn notification_requests(&self) -> Vec<NotificationsRequest> {
        lock(&self.state).notification_requests.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, TransportError> {
        lock(&self.state).sync_requests.push(request);
        self.record("sync");
        loop {
            let pushed = self.sync_pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();
            let next = lock(&self.state).sync.pop_front();
            if let Some(result) = next {
                return result;
            }
            pushed.await;
        }
    }

    async fn get_push_rules(&self) -> Result<Value, TransportError> {
        let next = lock(&self.state).push_rules.pop_front();
        self.record("get_push_rules");
        next.unwrap_or_else(|| Ok(json!({"global": {}})))
    }

    async fn get_filter(&self, _user_id: &str, _filter_id: &str) -> Result<Value, TransportError> {
        let next = lock(&self.state).get_filter.pop_front();
        self.record("get_filter");
        next.unwrap_or_else(|| Ok(json!({})))
    }

    async fn create_filter(&self, _user_id: &str, _filter: Value) -> Result<String, TransportError> {
        let next = lock(&self.state).create_filter.pop_front();
        self.record("create_filter");
        next.unwrap_or_else(|| Ok("filter-0".to_owned()))
    }

    async fn send_event(
        &self,
        request: SendEventRequest,
    ) -> Result<SendEventResponse, TransportError> {
        let (next, count) = {
            let mut state = lock(&self.state);
            state.sent_events.push(request);
            (state.send_event.pop_front(), state.sent_events.len())
        };
        self.record("send_event");
        next.unwrap_or_else(|| {
            Ok(SendEventResponse {
                event_id: Some(format!("$event-{count}")),
                delay_id: None,
            })
        })
    }

    async fn send_state_event(
        &self,
        request: SendStateRequest,
    ) -> Result<SendEventResponse, TransportError> {
        let (next, delayed, count) = {
            let mut state = lock(&self.state);
            let delayed = request.delay.is_some();
            state.sent_state.push(request);
            (state.send_state.pop_front(), delayed, state.sent_state.len())
        };
        self.record("send_state_event");
        next.unwrap_or_else(|| {
            Ok(if delayed {
                SendEventResponse {
                    event_id: None,
                    delay_id: Some(format!("delay-state-{count}")),
                }
            } else {
                SendEventResponse {
                    event_id: Some(format!("$state-{count}")),
                    delay_id: None,
                }
            })
        })
    }

    async fn redact_event(&self, request: RedactRequest) -> Result<String, TransportError> {
        let (next, count) = {
            let mut state = lock(&self.state);
            state.redactions.push(request);
            (state.redact.pop_front(), state.redactions.len())
        };
        self.record("redact_event");
        next.unwrap_or_else(|| Ok(format!("$redaction-{count}")))
    }

    async fn get_delayed_events(
        &self,
        _from: Option<&str>,
    ) -> Result<DelayedEventsPage, TransportError> {
        let next = lock(&self.state).delayed_events.pop_front();
        self.record("get_delayed_events");
        next.unwrap_or_else(|| Ok(DelayedEventsPage::default()))
    }

    async fn update_delayed_event(
        &self,
        delay_id: &str,
        action: DelayedEventAction,
    ) -> Result<(), TransportError> {
        lock(&self.state)
            .delayed_updates
            .push((delay_id.to_owned(), action));
        self.record("update_delayed_event");
        Ok(())
    }

    async fn put_account_data(
        &self,
        _user_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<Value, TransportError> {
        let next = {
            let mut state = lock(&self.state);
            state
                .account_data_writes
                .push((event_type.to_owned(), content));
            state.put_account_data.pop_front()
        };
        self.record("put_account_data");
        next.unwrap_or_else(|| Ok(json!({})))
    }

    async fn delete_account_data(
        &self,
        _user_id: &str,
        _event_type: &str,
    ) -> Result<(), TransportError> {
        let next = lock(&self.state).delete_account_data.pop_front();
        self.record("delete_account_data");
        next.unwrap_or(Ok(()))
    }

    async fn get_notifications(
        &self,
        request: NotificationsRequest,
    ) -> Result<NotificationsResponse, TransportError> {
        let next = {
            let mut state = lock(&self.state);
            state.notification_requests.push(request);
            state.notifications.pop_front()
        };
        self.record("get_notifications");
        next.unwrap_or_else(|| Ok(NotificationsResponse::default()))
    }

    async fn get_versions(&self) -> Result<ServerVersions, TransportError> {
        let next = {
            let mut state = lock(&self.state);
            let scripted = state.get_versions.pop_front();
            scripted.unwrap_or_else(|| Ok(state.versions.clone()))
        };
        self.record("get_versions");
        next
    }
}

/// Encryption fake that can hold every call until released.
#[derive(Default)]
pub(crate) struct MockEncryption {
    gated: bool,
    calls: AtomicUsize,
    pub(crate) started: Notify,
    pub(crate) release: Notify,
}

impl MockEncryption {
    pub(crate) fn gated() -> Self {
        Self {
            gated: true,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EncryptionBackend for MockEncryption {
    async fn encrypt_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<EncryptedContent, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        if self.gated {
            self.release.notified().await;
        }
        Ok(EncryptedContent {
            event_type: "m.room.encrypted".to_owned(),
            content: json!({
                "algorithm": "m.megolm.v1.aes-sha2",
                "ciphertext": format!("{room_id}|{event_type}|{content}"),
            }),
        })
    }
}
