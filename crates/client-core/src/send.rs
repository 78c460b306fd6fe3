use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    capabilities::{CapabilityCache, Feature, ServerSupport},
    error::{ClientError, ErrorCategory},
    lock,
    normalization::{LocalEchoUpdate, SendOutcome, normalize_local_echo, settle_send_outcome},
    rooms::RoomStore,
    timeline::TimelineItem,
    transport::{EncryptionBackend, RedactRequest, SendEventRequest, SendStateRequest, Transport},
    txn::TxnIdGenerator,
    types::{
        DelayMode, DelayedEvent, DelayedEventAction, DelayedEventsPage, EVENT_REACTION,
        EVENT_ROOM_MESSAGE, EVENT_ROOM_REDACTION, PendingEvent, PendingStatus, REL_TYPE_THREAD,
        RoomEvent,
    },
};

const UPDATE_CHANNEL_CAPACITY: usize = 256;
const GUEST_EVENT_TYPES: [&str; 3] = [EVENT_ROOM_MESSAGE, EVENT_REACTION, EVENT_ROOM_REDACTION];

/// Everything the caller provides for one outgoing event.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEvent {
    pub room_id: String,
    pub thread_id: Option<String>,
    pub event_type: String,
    pub content: Value,
    /// Generated when absent.
    pub txn_id: Option<String>,
}

impl OutgoingEvent {
    pub fn new(room_id: impl Into<String>, event_type: impl Into<String>, content: Value) -> Self {
        Self {
            room_id: room_id.into(),
            thread_id: None,
            event_type: event_type.into(),
            content,
            txn_id: None,
        }
    }

    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_txn_id(mut self, txn_id: impl Into<String>) -> Self {
        self.txn_id = Some(txn_id.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedactOptions {
    pub reason: Option<String>,
    /// Relation types whose related events are redacted along with the target.
    pub with_rel_types: Option<Vec<String>>,
}

/// Give `content` a thread relation pointing at `thread_id`.
///
/// An existing reply to another event is nested inside the thread relation
/// and the relation is marked as not falling back; otherwise the fallback
/// reply points at the thread root.
pub fn inject_thread_relation(content: &mut Value, thread_id: &str) -> Result<(), ClientError> {
    let Some(object) = content.as_object_mut() else {
        return Err(ClientError::new(
            ErrorCategory::Config,
            "invalid_event_content",
            "event content must be a JSON object",
        ));
    };

    let existing = object.get("m.relates_to");
    if existing
        .and_then(|relation| relation.get("rel_type"))
        .and_then(Value::as_str)
        == Some(REL_TYPE_THREAD)
    {
        return Ok(());
    }

    let reply_to = existing
        .and_then(|relation| relation.get("m.in_reply_to"))
        .and_then(|reply| reply.get("event_id"))
        .and_then(Value::as_str)
        .filter(|event_id| *event_id != thread_id)
        .map(ToOwned::to_owned);

    let relation = match reply_to {
        Some(reply_to) => json!({
            "rel_type": REL_TYPE_THREAD,
            "event_id": thread_id,
            "is_falling_back": false,
            "m.in_reply_to": {"event_id": reply_to},
        }),
        None => json!({
            "rel_type": REL_TYPE_THREAD,
            "event_id": thread_id,
            "is_falling_back": true,
            "m.in_reply_to": {"event_id": thread_id},
        }),
    };
    object.insert("m.relates_to".to_owned(), relation);
    Ok(())
}

/// Outgoing events from the send call to their settled status.
pub struct EventSendPipeline {
    transport: Arc<dyn Transport>,
    encryption: Option<Arc<dyn EncryptionBackend>>,
    rooms: Arc<Mutex<RoomStore>>,
    capabilities: Arc<CapabilityCache>,
    user_id: String,
    is_guest: bool,
    txn_ids: TxnIdGenerator,
    pending: Mutex<HashMap<String, PendingEvent>>,
    queue: Mutex<VecDeque<String>>,
    updates: broadcast::Sender<LocalEchoUpdate>,
}

impl EventSendPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        encryption: Option<Arc<dyn EncryptionBackend>>,
        rooms: Arc<Mutex<RoomStore>>,
        capabilities: Arc<CapabilityCache>,
        user_id: impl Into<String>,
        is_guest: bool,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            transport,
            encryption,
            rooms,
            capabilities,
            user_id: user_id.into(),
            is_guest,
            txn_ids: TxnIdGenerator::new(),
            pending: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            updates,
        }
    }

    /// Status changes of every outgoing event.
    pub fn subscribe(&self) -> broadcast::Receiver<LocalEchoUpdate> {
        self.updates.subscribe()
    }

    pub fn pending_event(&self, txn_id: &str) -> Option<PendingEvent> {
        lock(&self.pending).get(txn_id).cloned()
    }

    pub fn status(&self, txn_id: &str) -> Option<PendingStatus> {
        lock(&self.pending).get(txn_id).map(|pending| pending.status)
    }

    /// Transaction ids waiting for dispatch, oldest first.
    pub fn queued(&self) -> Vec<String> {
        lock(&self.queue).iter().cloned().collect()
    }

    /// Enqueue and dispatch one event, returning the server event id.
    pub async fn send_event(&self, event: OutgoingEvent) -> Result<String, ClientError> {
        let txn_id = self.enqueue(event)?;
        self.dispatch(&txn_id).await
    }

    /// Create the pending event and its local echo without touching the network.
    pub fn enqueue(&self, event: OutgoingEvent) -> Result<String, ClientError> {
        self.check_send_allowed(&event.event_type, false)?;

        let OutgoingEvent {
            room_id,
            thread_id,
            event_type,
            mut content,
            txn_id,
        } = event;
        let txn_id = txn_id.unwrap_or_else(|| self.txn_ids.next_id());

        if let Some(thread_id) = &thread_id {
            inject_thread_relation(&mut content, thread_id)?;
        }

        let mut pending = lock(&self.pending);
        if pending.contains_key(&txn_id) {
            return Err(ClientError::new(
                ErrorCategory::Config,
                "duplicate_transaction_id",
                format!("transaction id {txn_id} was already used"),
            ));
        }

        {
            let mut rooms = lock(&self.rooms);
            let room = rooms.get_mut(&room_id).ok_or_else(|| room_not_found(&room_id))?;
            let echo = RoomEvent::new(event_type.clone(), content.clone())
                .with_sender(self.user_id.clone())
                .with_unsigned(json!({"transaction_id": txn_id}));
            room.add_local_echo(
                TimelineItem::local_echo(echo, txn_id.clone()),
                thread_id.as_deref(),
            );
        }

        let event = PendingEvent {
            txn_id: txn_id.clone(),
            room_id,
            thread_id,
            event_type,
            content,
            status: PendingStatus::Queued,
            attempts: 0,
            event_id: None,
            error_code: None,
        };
        debug!(txn_id = %txn_id, room_id = %event.room_id, "queued local echo");
        let _ = self.updates.send(normalize_local_echo(&event));
        pending.insert(txn_id.clone(), event);
        drop(pending);

        lock(&self.queue).push_back(txn_id.clone());
        Ok(txn_id)
    }

    /// Encrypt (when the room requires it) and send a queued event.
    pub async fn dispatch(&self, txn_id: &str) -> Result<String, ClientError> {
        let event = self
            .pending_event(txn_id)
            .ok_or_else(|| unknown_pending_event(txn_id))?;
        match event.status {
            PendingStatus::Queued => {}
            PendingStatus::Cancelled => return Err(ClientError::cancelled(txn_id)),
            status => return Err(ClientError::invalid_state(status, "dispatch")),
        }
        lock(&self.queue).retain(|queued| queued != txn_id);

        let encrypted = lock(&self.rooms)
            .get(&event.room_id)
            .is_some_and(|room| room.is_encrypted());

        let (event_type, content) = if encrypted {
            self.advance(txn_id, PendingStatus::Encrypting)?;
            let Some(encryption) = &self.encryption else {
                let err = encryption_unavailable(&event.room_id);
                self.settle(txn_id, SendOutcome::Failure { error: err.clone() });
                return Err(err);
            };
            let result = encryption
                .encrypt_event(&event.room_id, &event.event_type, &event.content)
                .await;

            // Cancelled while encrypting: the ciphertext is dropped.
            if self.status(txn_id) == Some(PendingStatus::Cancelled) {
                debug!(txn_id, "discarding ciphertext of cancelled event");
                return Err(ClientError::cancelled(txn_id));
            }
            match result {
                Ok(encrypted) => (encrypted.event_type, encrypted.content),
                Err(err) => {
                    self.settle(txn_id, SendOutcome::Failure { error: err.clone() });
                    return Err(err);
                }
            }
        } else {
            (event.event_type.clone(), event.content.clone())
        };

        self.advance(txn_id, PendingStatus::Sending)?;
        let response = self
            .transport
            .send_event(SendEventRequest {
                room_id: event.room_id.clone(),
                event_type,
                txn_id: txn_id.to_owned(),
                content,
                delay: None,
            })
            .await;

        let outcome = match response {
            Ok(response) => match response.event_id {
                Some(event_id) => SendOutcome::Success { event_id },
                None => SendOutcome::Failure {
                    error: ClientError::new(
                        ErrorCategory::Internal,
                        "missing_event_id",
                        "send response carried no event id",
                    ),
                },
            },
            Err(err) => SendOutcome::Failure { error: err.into() },
        };

        match outcome {
            SendOutcome::Success { event_id } => {
                lock(&self.rooms).record_sent(txn_id, &event_id);
                info!(txn_id, event_id = %event_id, "event sent");
                self.settle(
                    txn_id,
                    SendOutcome::Success {
                        event_id: event_id.clone(),
                    },
                );
                Ok(event_id)
            }
            SendOutcome::Failure { error } => {
                warn!(txn_id, code = %error.code, "event not sent");
                self.settle(txn_id, SendOutcome::Failure { error: error.clone() });
                Err(error)
            }
        }
    }

    /// Cancel an event that has not reached the transport yet (or failed to).
    pub fn cancel(&self, txn_id: &str) -> Result<(), ClientError> {
        let update = {
            let mut pending = lock(&self.pending);
            let event = pending
                .get_mut(txn_id)
                .ok_or_else(|| unknown_pending_event(txn_id))?;
            if !event.status.is_cancellable() {
                return Err(ClientError::not_cancellable(txn_id, event.status));
            }
            if event.status == PendingStatus::Queued {
                lock(&self.queue).retain(|queued| queued != txn_id);
            }
            event.status = PendingStatus::Cancelled;
            normalize_local_echo(event)
        };

        debug!(txn_id, "cancelled pending event");
        self.publish(update);
        Ok(())
    }

    /// Drop settled (`Sent` or `Cancelled`) events from the pending map.
    pub fn prune_settled(&self) -> usize {
        let mut pending = lock(&self.pending);
        let before = pending.len();
        pending.retain(|_, event| {
            !matches!(event.status, PendingStatus::Sent | PendingStatus::Cancelled)
        });
        before - pending.len()
    }

    /// Schedule a room event on the server; the server answers with a delay id.
    pub async fn send_delayed_event(
        &self,
        event: OutgoingEvent,
        delay: DelayMode,
    ) -> Result<DelayedEvent, ClientError> {
        self.check_send_allowed(&event.event_type, true)?;
        self.capabilities.require(Feature::DelayedEvents).await?;

        let OutgoingEvent {
            room_id,
            thread_id,
            event_type,
            mut content,
            txn_id,
        } = event;
        let txn_id = txn_id.unwrap_or_else(|| self.txn_ids.next_id());
        if let Some(thread_id) = &thread_id {
            inject_thread_relation(&mut content, thread_id)?;
        }

        let encrypted = lock(&self.rooms)
            .get(&room_id)
            .is_some_and(|room| room.is_encrypted());
        let (wire_type, wire_content) = if encrypted {
            let encryption = self
                .encryption
                .as_ref()
                .ok_or_else(|| encryption_unavailable(&room_id))?;
            let encrypted = encryption
                .encrypt_event(&room_id, &event_type, &content)
                .await?;
            (encrypted.event_type, encrypted.content)
        } else {
            (event_type.clone(), content.clone())
        };

        let response = self
            .transport
            .send_event(SendEventRequest {
                room_id: room_id.clone(),
                event_type: wire_type,
                txn_id: txn_id.clone(),
                content: wire_content,
                delay: Some(delay.clone()),
            })
            .await?;
        let delay_id = response.delay_id.ok_or_else(missing_delay_id)?;
        info!(txn_id = %txn_id, delay_id = %delay_id, "scheduled delayed event");

        Ok(DelayedEvent {
            txn_id,
            room_id,
            event_type,
            state_key: None,
            content,
            delay,
            delay_id,
        })
    }

    /// Schedule a state event on the server.
    pub async fn send_delayed_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
        delay: DelayMode,
    ) -> Result<DelayedEvent, ClientError> {
        self.check_send_allowed(event_type, true)?;
        self.capabilities.require(Feature::DelayedEvents).await?;

        let response = self
            .transport
            .send_state_event(SendStateRequest {
                room_id: room_id.to_owned(),
                event_type: event_type.to_owned(),
                state_key: state_key.to_owned(),
                content: content.clone(),
                delay: Some(delay.clone()),
            })
            .await?;
        let delay_id = response.delay_id.ok_or_else(missing_delay_id)?;

        Ok(DelayedEvent {
            txn_id: self.txn_ids.next_id(),
            room_id: room_id.to_owned(),
            event_type: event_type.to_owned(),
            state_key: Some(state_key.to_owned()),
            content,
            delay,
            delay_id,
        })
    }

    pub async fn list_delayed_events(
        &self,
        from: Option<&str>,
    ) -> Result<DelayedEventsPage, ClientError> {
        self.capabilities.require(Feature::DelayedEvents).await?;
        Ok(self.transport.get_delayed_events(from).await?)
    }

    /// Send now, restart the timer of, or cancel a scheduled event.
    pub async fn update_delayed_event(
        &self,
        delay_id: &str,
        action: DelayedEventAction,
    ) -> Result<(), ClientError> {
        self.capabilities.require(Feature::DelayedEvents).await?;
        self.transport.update_delayed_event(delay_id, action).await?;
        debug!(delay_id, ?action, "updated delayed event");
        Ok(())
    }

    /// Redact an event. The reason always travels in clear text.
    pub async fn redact_event(
        &self,
        room_id: &str,
        event_id: &str,
        options: RedactOptions,
    ) -> Result<String, ClientError> {
        self.check_send_allowed(EVENT_ROOM_REDACTION, false)?;

        let mut body = Map::new();
        if let Some(rel_types) = options.with_rel_types {
            let key = match self
                .capabilities
                .support(Feature::RelationBasedRedactions)
                .await?
            {
                ServerSupport::Stable => "with_rel_types",
                ServerSupport::Unstable => "org.matrix.msc3912.with_relations",
                ServerSupport::Unsupported => {
                    return Err(ClientError::unsupported(
                        Feature::RelationBasedRedactions.to_string(),
                    ));
                }
            };
            body.insert(key.to_owned(), json!(rel_types));
        }
        if let Some(reason) = options.reason {
            body.insert("reason".to_owned(), Value::String(reason));
        }

        let txn_id = self.txn_ids.next_id();
        let redaction_id = self
            .transport
            .redact_event(RedactRequest {
                room_id: room_id.to_owned(),
                event_id: event_id.to_owned(),
                txn_id,
                body: Value::Object(body),
            })
            .await?;
        info!(room_id, event_id, redaction_id = %redaction_id, "event redacted");
        Ok(redaction_id)
    }

    fn check_send_allowed(&self, event_type: &str, delayed: bool) -> Result<(), ClientError> {
        if !self.is_guest {
            return Ok(());
        }
        if delayed {
            return Err(send_not_allowed("guests cannot schedule delayed events"));
        }
        if !GUEST_EVENT_TYPES.contains(&event_type) {
            return Err(send_not_allowed(format!(
                "guests cannot send {event_type} events"
            )));
        }
        Ok(())
    }

    /// Move a pending event forward, refusing anything but a forward step.
    fn advance(&self, txn_id: &str, next: PendingStatus) -> Result<(), ClientError> {
        let update = {
            let mut pending = lock(&self.pending);
            let event = pending
                .get_mut(txn_id)
                .ok_or_else(|| unknown_pending_event(txn_id))?;
            if event.status == PendingStatus::Cancelled {
                return Err(ClientError::cancelled(txn_id));
            }
            if !event.status.can_advance_to(next) {
                return Err(ClientError::invalid_state(event.status, format!("{next:?}")));
            }
            event.status = next;
            if next == PendingStatus::Sending {
                event.attempts += 1;
            }
            normalize_local_echo(event)
        };
        self.publish(update);
        Ok(())
    }

    fn settle(&self, txn_id: &str, outcome: SendOutcome) {
        let update = {
            let mut pending = lock(&self.pending);
            let Some(event) = pending.get_mut(txn_id) else {
                return;
            };
            settle_send_outcome(event, outcome)
        };
        self.publish(update);
    }

    fn publish(&self, update: LocalEchoUpdate) {
        if let Some(room) = lock(&self.rooms).get_mut(&update.room_id) {
            room.update_local_echo(&update.txn_id, update.status, update.event_id.as_deref());
        }
        let _ = self.updates.send(update);
    }
}

fn unknown_pending_event(txn_id: &str) -> ClientError {
    ClientError::new(
        ErrorCategory::InvalidState,
        "unknown_pending_event",
        format!("no pending event with transaction id {txn_id}"),
    )
}

fn room_not_found(room_id: &str) -> ClientError {
    ClientError::new(
        ErrorCategory::Config,
        "room_not_found",
        format!("room {room_id} is not known locally"),
    )
}

fn encryption_unavailable(room_id: &str) -> ClientError {
    ClientError::new(
        ErrorCategory::Crypto,
        "encryption_unavailable",
        format!("room {room_id} is encrypted but no encryption backend is set"),
    )
}

fn send_not_allowed(message: impl Into<String>) -> ClientError {
    ClientError::new(ErrorCategory::Auth, "send_not_allowed", message)
}

fn missing_delay_id() -> ClientError {
    ClientError::new(
        ErrorCategory::Internal,
        "missing_delay_id",
        "delayed send response carried no delay id",
    )
}
