use std::sync::{Arc, Mutex};

use client_platform::Store;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::{
    account_data::{AccountDataStore, AccountDataWrite},
    assembler,
    capabilities::CapabilityCache,
    config::ClientConfig,
    error::ClientError,
    listeners::ListenerId,
    lock,
    normalization::LocalEchoUpdate,
    notifications::NotificationTimeline,
    rooms::{Room, RoomStore},
    send::{EventSendPipeline, OutgoingEvent, RedactOptions},
    state_machine::{SyncLifecycle, SyncStateListener},
    sync::ConnectionStateMachine,
    transport::{EncryptionBackend, Transport},
    types::{
        DelayMode, DelayedEvent, DelayedEventAction, DelayedEventsPage, PendingEvent, RoomEvent,
        SyncState,
    },
};

/// One signed-in client instance.
///
/// Every piece of mutable state is owned here, so several instances can live
/// in one process.
pub struct Client {
    config: ClientConfig,
    rooms: Arc<Mutex<RoomStore>>,
    capabilities: Arc<CapabilityCache>,
    account_data: Arc<AccountDataStore>,
    sender: EventSendPipeline,
    sync: ConnectionStateMachine,
    notifications: NotificationTimeline,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Store>,
        encryption: Option<Arc<dyn EncryptionBackend>>,
    ) -> Self {
        let lifecycle = Arc::new(SyncLifecycle::default());
        let rooms = Arc::new(Mutex::new(RoomStore::new(
            config.timeline_max_items,
            config.thread_support,
        )));
        let capabilities = Arc::new(CapabilityCache::new(transport.clone()));
        let account_data = Arc::new(AccountDataStore::new(
            transport.clone(),
            config.user_id.clone(),
            capabilities.clone(),
            lifecycle.clone(),
        ));
        let sender = EventSendPipeline::new(
            transport.clone(),
            encryption,
            rooms.clone(),
            capabilities.clone(),
            config.user_id.clone(),
            config.is_guest,
        );
        let sync = ConnectionStateMachine::new(
            config.clone(),
            transport.clone(),
            store,
            lifecycle,
            rooms.clone(),
            account_data.clone(),
        );
        let notifications = NotificationTimeline::new(transport);

        Self {
            config,
            rooms,
            capabilities,
            account_data,
            sender,
            sync,
            notifications,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &CapabilityCache {
        &self.capabilities
    }

    pub fn sync(&self) -> &ConnectionStateMachine {
        &self.sync
    }

    pub fn sender(&self) -> &EventSendPipeline {
        &self.sender
    }

    pub fn notifications(&self) -> &NotificationTimeline {
        &self.notifications
    }

    pub async fn start_sync(&self) -> Result<(), ClientError> {
        self.sync.start().await
    }

    pub async fn stop_sync(&self) -> Result<(), ClientError> {
        self.sync.stop().await
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    pub fn on_sync_state(&self, listener: Arc<SyncStateListener>) -> ListenerId {
        self.sync.subscribe(listener)
    }

    pub fn retry_immediately(&self) -> bool {
        self.sync.retry_immediately()
    }

    /// Snapshot of one room.
    pub fn room(&self, room_id: &str) -> Option<Room> {
        lock(&self.rooms).get(room_id).cloned()
    }

    pub fn room_upgrade_history(&self, room_id: &str, verify_links: bool) -> Vec<String> {
        lock(&self.rooms).upgrade_history(
            room_id,
            verify_links,
            self.config.use_dynamic_predecessor,
        )
    }

    pub fn visible_rooms(&self) -> Vec<String> {
        lock(&self.rooms).visible_rooms(self.config.use_dynamic_predecessor)
    }

    pub fn partition_threaded_events(events: &[RoomEvent]) -> (Vec<RoomEvent>, Vec<RoomEvent>) {
        assembler::partition_threaded_events(events)
    }

    pub fn local_echo_updates(&self) -> broadcast::Receiver<LocalEchoUpdate> {
        self.sender.subscribe()
    }

    pub async fn send_event(&self, event: OutgoingEvent) -> Result<String, ClientError> {
        self.sender.send_event(event).await
    }

    pub fn cancel_pending_event(&self, txn_id: &str) -> Result<(), ClientError> {
        self.sender.cancel(txn_id)
    }

    pub fn pending_event(&self, txn_id: &str) -> Option<PendingEvent> {
        self.sender.pending_event(txn_id)
    }

    pub async fn send_delayed_event(
        &self,
        event: OutgoingEvent,
        delay: DelayMode,
    ) -> Result<DelayedEvent, ClientError> {
        self.sender.send_delayed_event(event, delay).await
    }

    pub async fn send_delayed_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
        delay: DelayMode,
    ) -> Result<DelayedEvent, ClientError> {
        self.sender
            .send_delayed_state_event(room_id, event_type, state_key, content, delay)
            .await
    }

    pub async fn delayed_events(&self, from: Option<&str>) -> Result<DelayedEventsPage, ClientError> {
        self.sender.list_delayed_events(from).await
    }

    pub async fn update_delayed_event(
        &self,
        delay_id: &str,
        action: DelayedEventAction,
    ) -> Result<(), ClientError> {
        self.sender.update_delayed_event(delay_id, action).await
    }

    pub async fn redact_event(
        &self,
        room_id: &str,
        event_id: &str,
        options: RedactOptions,
    ) -> Result<String, ClientError> {
        self.sender.redact_event(room_id, event_id, options).await
    }

    pub async fn set_account_data(
        &self,
        event_type: &str,
        content: Value,
    ) -> Result<AccountDataWrite, ClientError> {
        self.account_data.set_account_data(event_type, content).await
    }

    pub fn get_account_data(&self, event_type: &str) -> Option<Value> {
        self.account_data.get_account_data(event_type)
    }

    pub async fn delete_account_data(
        &self,
        event_type: &str,
    ) -> Result<AccountDataWrite, ClientError> {
        self.account_data.delete_account_data(event_type).await
    }
}
