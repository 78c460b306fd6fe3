use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::{debug, trace};

use crate::{
    assembler::{self, Placement, RoomGraph},
    timeline::{TimelineBuffer, TimelineItem, TimelineKey, TimelineOp},
    types::{EVENT_ROOM_ENCRYPTION, JoinedRoom, PendingStatus, RoomEvent},
};

/// Local model of one room.
#[derive(Debug, Clone)]
pub struct Room {
    room_id: String,
    state: HashMap<(String, String), RoomEvent>,
    timeline: TimelineBuffer,
    threads: BTreeMap<String, TimelineBuffer>,
    prev_batch: Option<String>,
    account_data: HashMap<String, Value>,
    max_items: usize,
}

impl Room {
    pub fn new(room_id: impl Into<String>, max_items: usize) -> Self {
        Self {
            room_id: room_id.into(),
            state: HashMap::new(),
            timeline: TimelineBuffer::new(max_items),
            threads: BTreeMap::new(),
            prev_batch: None,
            account_data: HashMap::new(),
            max_items,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn state_event(&self, event_type: &str, state_key: &str) -> Option<&RoomEvent> {
        self.state
            .get(&(event_type.to_owned(), state_key.to_owned()))
    }

    pub fn is_encrypted(&self) -> bool {
        self.state_event(EVENT_ROOM_ENCRYPTION, "").is_some()
    }

    pub fn timeline(&self) -> &[TimelineItem] {
        self.timeline.items()
    }

    pub fn thread_timeline(&self, thread_id: &str) -> Option<&[TimelineItem]> {
        self.threads.get(thread_id).map(TimelineBuffer::items)
    }

    pub fn thread_ids(&self) -> Vec<&str> {
        self.threads.keys().map(String::as_str).collect()
    }

    /// Pagination token of the oldest batch seen through sync.
    pub fn prev_batch(&self) -> Option<&str> {
        self.prev_batch.as_deref()
    }

    pub fn account_data(&self, event_type: &str) -> Option<&Value> {
        self.account_data.get(event_type)
    }

    pub fn apply_state_event(&mut self, event: RoomEvent) {
        let Some(state_key) = event.state_key.clone() else {
            return;
        };
        self.state
            .insert((event.event_type.clone(), state_key), event);
    }

    pub(crate) fn add_local_echo(&mut self, item: TimelineItem, thread_id: Option<&str>) {
        let buffer = self.buffer_mut(thread_id);
        let _ = buffer.apply_ops(&[TimelineOp::Append(item)]);
    }

    /// Mirror a pending event's status onto its local echo.
    pub(crate) fn update_local_echo(
        &mut self,
        txn_id: &str,
        status: PendingStatus,
        event_id: Option<&str>,
    ) {
        let key = TimelineKey::Txn(txn_id.to_owned());
        let buffers = std::iter::once(&mut self.timeline).chain(self.threads.values_mut());
        for buffer in buffers {
            if let Some(item) = buffer.find_mut(&key) {
                // The server copy may already have replaced the echo.
                if item.local_status.is_none() {
                    return;
                }
                item.local_status = Some(status);
                if let Some(event_id) = event_id {
                    item.event.event_id = Some(event_id.to_owned());
                }
                return;
            }
        }
    }

    /// Merge one sync batch for this room.
    ///
    /// `sent` maps event ids confirmed by the send pipeline back to their
    /// transaction ids, so an echo whose server copy lost its transaction id
    /// is still replaced rather than duplicated.
    pub(crate) fn apply_joined(
        &mut self,
        joined: &JoinedRoom,
        thread_support: bool,
        sent: &HashMap<String, String>,
    ) {
        for event in &joined.state.events {
            self.apply_state_event(event.clone());
        }

        if joined.timeline.limited {
            trace!(room_id = %self.room_id, "limited timeline, dropping cached history");
            let _ = self.timeline.apply_ops(&[TimelineOp::Clear]);
        }
        if joined.timeline.prev_batch.is_some() {
            self.prev_batch = joined.timeline.prev_batch.clone();
        }

        for event in &joined.timeline.events {
            if event.is_state() {
                self.apply_state_event(event.clone());
            }

            let placement = if thread_support {
                Placement::of(event)
            } else {
                Placement::RoomOnly
            };
            if placement.in_room() {
                Self::merge_remote(&mut self.timeline, event, sent);
            }
            if placement.in_thread() {
                let thread_id = match placement {
                    Placement::Both => event.event_id.as_deref(),
                    _ => event.thread_id(),
                };
                if let Some(thread_id) = thread_id {
                    let max_items = self.max_items;
                    let buffer = self
                        .threads
                        .entry(thread_id.to_owned())
                        .or_insert_with(|| TimelineBuffer::new(max_items));
                    Self::merge_remote(buffer, event, sent);
                }
            }
        }

        for event in &joined.account_data.events {
            self.account_data
                .insert(event.event_type.clone(), event.content.clone());
        }
    }

    fn merge_remote(buffer: &mut TimelineBuffer, event: &RoomEvent, sent: &HashMap<String, String>) {
        let txn_id = event.transaction_id().map(ToOwned::to_owned).or_else(|| {
            event
                .event_id
                .as_ref()
                .and_then(|event_id| sent.get(event_id).cloned())
        });

        let mut item = TimelineItem::remote(event.clone());
        if let Some(txn_id) = txn_id {
            let key = TimelineKey::Txn(txn_id.clone());
            if buffer.contains(&key) {
                debug!(txn_id = %txn_id, "remote echo replaces local echo");
                item.txn_id = Some(txn_id);
                let _ = buffer.apply_ops(&[TimelineOp::Replace { key, item }]);
                return;
            }
        }

        if let Some(event_id) = &event.event_id
            && buffer.contains(&TimelineKey::Event(event_id.clone()))
        {
            trace!(event_id = %event_id, "dropping duplicate event");
            return;
        }

        let _ = buffer.apply_ops(&[TimelineOp::Append(item)]);
    }

    fn buffer_mut(&mut self, thread_id: Option<&str>) -> &mut TimelineBuffer {
        match thread_id {
            Some(thread_id) => {
                let max_items = self.max_items;
                self.threads
                    .entry(thread_id.to_owned())
                    .or_insert_with(|| TimelineBuffer::new(max_items))
            }
            None => &mut self.timeline,
        }
    }
}

/// Every room known to one client instance.
#[derive(Debug, Clone)]
pub struct RoomStore {
    rooms: BTreeMap<String, Room>,
    max_items: usize,
    thread_support: bool,
    /// Confirmed sends: server event id to transaction id.
    sent: HashMap<String, String>,
}

impl RoomStore {
    pub fn new(max_items: usize, thread_support: bool) -> Self {
        Self {
            rooms: BTreeMap::new(),
            max_items,
            thread_support,
            sent: HashMap::new(),
        }
    }

    pub fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub(crate) fn get_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    /// Get a room, creating an empty one on first sight.
    pub fn ensure_room(&mut self, room_id: &str) -> &mut Room {
        let max_items = self.max_items;
        self.rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| Room::new(room_id, max_items))
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn apply_joined_room(&mut self, room_id: &str, joined: &JoinedRoom) {
        let thread_support = self.thread_support;
        let max_items = self.max_items;
        let room = self
            .rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| Room::new(room_id, max_items));
        room.apply_joined(joined, thread_support, &self.sent);
    }

    /// Record that `txn_id` was confirmed as `event_id`.
    pub(crate) fn record_sent(&mut self, txn_id: &str, event_id: &str) {
        self.sent.insert(event_id.to_owned(), txn_id.to_owned());
    }

    pub fn txn_for_event(&self, event_id: &str) -> Option<&str> {
        self.sent.get(event_id).map(String::as_str)
    }

    pub fn upgrade_history(
        &self,
        room_id: &str,
        verify_links: bool,
        use_dynamic_predecessor: bool,
    ) -> Vec<String> {
        assembler::room_upgrade_history(self, room_id, verify_links, use_dynamic_predecessor)
    }

    pub fn visible_rooms(&self, use_dynamic_predecessor: bool) -> Vec<String> {
        assembler::visible_rooms(self, use_dynamic_predecessor)
    }
}

impl RoomGraph for RoomStore {
    fn contains_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    fn room_ids(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    fn state_content(&self, room_id: &str, event_type: &str, state_key: &str) -> Option<&Value> {
        self.rooms
            .get(room_id)?
            .state_event(event_type, state_key)
            .map(|event| &event.content)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::{EVENT_ROOM_CREATE, EVENT_ROOM_TOMBSTONE, StateChunk, TimelineChunk};

    fn joined(events: Vec<RoomEvent>) -> JoinedRoom {
        JoinedRoom {
            timeline: TimelineChunk {
                events,
                ..TimelineChunk::default()
            },
            ..JoinedRoom::default()
        }
    }

    fn message(event_id: &str) -> RoomEvent {
        RoomEvent::new("m.room.message", json!({"body": event_id}))
            .with_event_id(event_id)
            .with_sender("@bob:example.org")
    }

    #[test]
    fn server_copy_with_transaction_id_replaces_local_echo() {
        let mut store = RoomStore::new(100, true);
        let room = store.ensure_room("!a:example.org");
        room.add_local_echo(
            TimelineItem::local_echo(RoomEvent::new("m.room.message", json!({"body": "hi"})), "m1.1"),
            None,
        );

        let remote = message("$1").with_unsigned(json!({"transaction_id": "m1.1"}));
        store.apply_joined_room("!a:example.org", &joined(vec![remote]));

        let timeline = store.get("!a:example.org").expect("room").timeline();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].event_id(), Some("$1"));
        assert_eq!(timeline[0].txn_id.as_deref(), Some("m1.1"));
        assert!(!timeline[0].is_pending());
    }

    #[test]
    fn confirmed_send_without_transaction_id_is_not_duplicated() {
        let mut store = RoomStore::new(100, true);
        store.ensure_room("!a").add_local_echo(
            TimelineItem::local_echo(RoomEvent::new("m.room.message", json!({"body": "hi"})), "m1.2"),
            None,
        );
        store.record_sent("m1.2", "$sent");
        store
            .get_mut("!a")
            .expect("room")
            .update_local_echo("m1.2", PendingStatus::Sent, Some("$sent"));

        store.apply_joined_room("!a", &joined(vec![message("$sent")]));
        store.apply_joined_room("!a", &joined(vec![message("$sent")]));

        let timeline = store.get("!a").expect("room").timeline();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].local_status, None);
        assert_eq!(store.txn_for_event("$sent"), Some("m1.2"));
    }

    #[test]
    fn splits_thread_events_into_thread_timelines() {
        let mut store = RoomStore::new(100, true);
        let root = message("$root").with_unsigned(json!({"m.relations": {"m.thread": {"count": 1}}}));
        let reply = RoomEvent::new(
            "m.room.message",
            json!({"body": "r", "m.relates_to": {"rel_type": "m.thread", "event_id": "$root"}}),
        )
        .with_event_id("$reply");

        store.apply_joined_room("!a", &joined(vec![message("$1"), root, reply]));

        let room = store.get("!a").expect("room");
        let room_ids: Vec<_> = room.timeline().iter().filter_map(|i| i.event_id()).collect();
        assert_eq!(room_ids, vec!["$1", "$root"]);
        let thread_ids: Vec<_> = room
            .thread_timeline("$root")
            .expect("thread")
            .iter()
            .filter_map(|i| i.event_id())
            .collect();
        assert_eq!(thread_ids, vec!["$root", "$reply"]);
    }

    #[test]
    fn thread_events_stay_in_room_without_thread_support() {
        let mut store = RoomStore::new(100, false);
        let reply = RoomEvent::new(
            "m.room.message",
            json!({"m.relates_to": {"rel_type": "m.thread", "event_id": "$root"}}),
        )
        .with_event_id("$reply");

        store.apply_joined_room("!a", &joined(vec![reply]));

        let room = store.get("!a").expect("room");
        assert_eq!(room.timeline().len(), 1);
        assert!(room.thread_ids().is_empty());
    }

    #[test]
    fn tracks_state_encryption_and_upgrade_links() {
        let mut store = RoomStore::new(100, true);
        store.apply_joined_room(
            "!old",
            &JoinedRoom {
                state: StateChunk {
                    events: vec![
                        RoomEvent::new(EVENT_ROOM_TOMBSTONE, json!({"replacement_room": "!new"}))
                            .with_state_key(""),
                    ],
                },
                ..JoinedRoom::default()
            },
        );
        store.apply_joined_room(
            "!new",
            &joined(vec![
                RoomEvent::new(EVENT_ROOM_CREATE, json!({"predecessor": {"room_id": "!old"}}))
                    .with_event_id("$create")
                    .with_state_key(""),
                RoomEvent::new(EVENT_ROOM_ENCRYPTION, json!({"algorithm": "m.megolm.v1.aes-sha2"}))
                    .with_event_id("$enc")
                    .with_state_key(""),
            ]),
        );

        assert!(store.get("!new").expect("room").is_encrypted());
        assert!(!store.get("!old").expect("room").is_encrypted());
        assert_eq!(store.upgrade_history("!new", true, false), vec!["!old", "!new"]);
        assert_eq!(store.visible_rooms(false), vec!["!new"]);
    }

    #[test]
    fn limited_timeline_resets_room_history() {
        let mut store = RoomStore::new(100, true);
        store.apply_joined_room("!a", &joined(vec![message("$1")]));
        store.apply_joined_room(
            "!a",
            &JoinedRoom {
                timeline: TimelineChunk {
                    events: vec![message("$9")],
                    limited: true,
                    prev_batch: Some("p_8".to_owned()),
                },
                ..JoinedRoom::default()
            },
        );

        let room = store.get("!a").expect("room");
        assert_eq!(room.timeline().len(), 1);
        assert_eq!(room.prev_batch(), Some("p_8"));
    }
}
