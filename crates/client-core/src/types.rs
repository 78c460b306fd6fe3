use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_ROOM_CREATE: &str = "m.room.create";
pub const EVENT_ROOM_TOMBSTONE: &str = "m.room.tombstone";
pub const EVENT_ROOM_PREDECESSOR: &str = "org.matrix.msc3946.room_predecessor";
pub const EVENT_ROOM_ENCRYPTION: &str = "m.room.encryption";
pub const EVENT_ROOM_MESSAGE: &str = "m.room.message";
pub const EVENT_ROOM_REDACTION: &str = "m.room.redaction";
pub const EVENT_REACTION: &str = "m.reaction";
pub const REL_TYPE_THREAD: &str = "m.thread";

/// Connection state of the sync loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Initial and terminal state; only an explicit stop returns here.
    Stopped,
    /// The first sync cycle completed.
    Prepared,
    /// A later sync cycle completed.
    Syncing,
    /// The first failure of a failure streak.
    Error,
    /// Further failures while already erroring.
    Reconnecting,
    /// A keepalive probe reached the server; sync is being retried.
    Catchup,
}

impl SyncState {
    /// Whether the state belongs to a failure streak.
    pub fn is_erroring(self) -> bool {
        matches!(
            self,
            SyncState::Error | SyncState::Reconnecting | SyncState::Catchup
        )
    }

    pub fn can_transition_to(self, next: SyncState) -> bool {
        use SyncState::*;

        match self {
            Stopped => matches!(next, Prepared | Error),
            Prepared => matches!(next, Syncing | Error | Stopped),
            Syncing => matches!(next, Syncing | Error | Stopped),
            Error | Reconnecting => matches!(
                next,
                Reconnecting | Catchup | Prepared | Syncing | Stopped
            ),
            Catchup => matches!(next, Reconnecting | Prepared | Syncing | Stopped),
        }
    }
}

/// A room event as delivered by sync or echoed locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RoomEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub unsigned: Value,
    #[serde(default)]
    pub origin_server_ts: u64,
}

impl RoomEvent {
    pub fn new(event_type: impl Into<String>, content: Value) -> Self {
        Self {
            event_type: event_type.into(),
            content,
            ..Self::default()
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn with_state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = Some(state_key.into());
        self
    }

    pub fn with_unsigned(mut self, unsigned: Value) -> Self {
        self.unsigned = unsigned;
        self
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Root of the thread this event belongs to, when it carries a thread relation.
    pub fn thread_id(&self) -> Option<&str> {
        let relation = self.content.get("m.relates_to")?;
        if relation.get("rel_type")?.as_str()? != REL_TYPE_THREAD {
            return None;
        }
        relation.get("event_id")?.as_str()
    }

    /// Whether the server bundled a thread summary, marking this event as a thread root.
    pub fn is_thread_root(&self) -> bool {
        self.unsigned
            .get("m.relations")
            .and_then(|relations| relations.get(REL_TYPE_THREAD))
            .is_some_and(Value::is_object)
    }

    /// Transaction id the server echoes back to the sending device.
    pub fn transaction_id(&self) -> Option<&str> {
        self.unsigned.get("transaction_id")?.as_str()
    }
}

/// Events without room context: account data, presence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BasicEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl BasicEvent {
    pub fn new(event_type: impl Into<String>, content: Value) -> Self {
        Self {
            event_type: event_type.into(),
            content,
            sender: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<BasicEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StateChunk {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TimelineChunk {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JoinedRoom {
    #[serde(default)]
    pub state: StateChunk,
    #[serde(default)]
    pub timeline: TimelineChunk,
    #[serde(default)]
    pub account_data: EventList,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: BTreeMap<String, JoinedRoom>,
}

/// One long-poll sync payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
    #[serde(default)]
    pub account_data: EventList,
    #[serde(default)]
    pub presence: EventList,
}

/// Lifecycle of an outgoing event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PendingStatus {
    Queued,
    Encrypting,
    Sending,
    Sent,
    NotSent,
    Cancelled,
}

impl PendingStatus {
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            PendingStatus::Queued | PendingStatus::Encrypting | PendingStatus::NotSent
        )
    }

    /// Still travelling towards the homeserver.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            PendingStatus::Queued | PendingStatus::Encrypting | PendingStatus::Sending
        )
    }

    /// Status only moves forward; cancellation is the one escape.
    pub fn can_advance_to(self, next: PendingStatus) -> bool {
        use PendingStatus::*;

        match (self, next) {
            (_, Cancelled) => self.is_cancellable(),
            (Queued, Encrypting | Sending) => true,
            (Encrypting, Sending | NotSent) => true,
            (Sending, Sent | NotSent) => true,
            _ => false,
        }
    }
}

/// An outgoing event tracked from the send call until it settles.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub txn_id: String,
    pub room_id: String,
    pub thread_id: Option<String>,
    pub event_type: String,
    pub content: Value,
    pub status: PendingStatus,
    /// Number of transport attempts made for this event.
    pub attempts: u32,
    /// Server event id once the send succeeded.
    pub event_id: Option<String>,
    /// Stable error code of the last failure.
    pub error_code: Option<String>,
}

/// How a delayed send is scheduled on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayMode {
    /// Apply after the given duration unless restarted or cancelled.
    Timeout(Duration),
    /// Apply when the referenced delayed event is applied.
    Parent(String),
}

/// A send scheduled on the server, identified by its delay id.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayedEvent {
    pub txn_id: String,
    pub room_id: String,
    pub event_type: String,
    pub state_key: Option<String>,
    pub content: Value,
    pub delay: DelayMode,
    pub delay_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DelayedEventAction {
    Send,
    Restart,
    Cancel,
}

/// A delayed event as listed by the homeserver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ScheduledDelayedEvent {
    pub delay_id: String,
    pub room_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_delay_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_since: Option<u64>,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DelayedEventsPage {
    #[serde(default)]
    pub delayed_events: Vec<ScheduledDelayedEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_batch: Option<String>,
}

/// One entry of the `/notifications` feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Notification {
    pub room_id: String,
    pub event: RoomEvent,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub ts: u64,
    #[serde(default)]
    pub actions: Vec<Value>,
}
