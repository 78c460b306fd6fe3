//! Pure timeline assembly: thread partitioning and room-upgrade chains.
//!
//! Nothing here performs I/O. Room state is read through [`RoomGraph`], so
//! the same walks run against the live room store and against test fixtures.

use std::collections::HashSet;

use serde_json::Value;

use crate::types::{EVENT_ROOM_CREATE, EVENT_ROOM_PREDECESSOR, EVENT_ROOM_TOMBSTONE, RoomEvent};

/// Where an event lands when a sync batch is split between timelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    RoomOnly,
    ThreadOnly,
    /// Thread roots are shown in the room and open their own thread.
    Both,
}

impl Placement {
    pub fn of(event: &RoomEvent) -> Self {
        if event.is_thread_root() {
            Placement::Both
        } else if event.thread_id().is_some() {
            Placement::ThreadOnly
        } else {
            Placement::RoomOnly
        }
    }

    pub fn in_room(self) -> bool {
        matches!(self, Placement::RoomOnly | Placement::Both)
    }

    pub fn in_thread(self) -> bool {
        matches!(self, Placement::ThreadOnly | Placement::Both)
    }
}

/// Split events into `(room_events, thread_events)`, keeping input order in both.
pub fn partition_threaded_events(events: &[RoomEvent]) -> (Vec<RoomEvent>, Vec<RoomEvent>) {
    let mut room_events = Vec::new();
    let mut thread_events = Vec::new();

    for event in events {
        let placement = Placement::of(event);
        if placement.in_room() {
            room_events.push(event.clone());
        }
        if placement.in_thread() {
            thread_events.push(event.clone());
        }
    }

    (room_events, thread_events)
}

/// Read access to locally known room state.
pub trait RoomGraph {
    fn contains_room(&self, room_id: &str) -> bool;

    /// Known room ids in a stable order.
    fn room_ids(&self) -> Vec<String>;

    fn state_content(&self, room_id: &str, event_type: &str, state_key: &str) -> Option<&Value>;
}

/// Predecessor of `room_id`, from its create event or, when asked to, from a
/// later predecessor override which then takes precedence.
pub fn find_predecessor<G: RoomGraph + ?Sized>(
    graph: &G,
    room_id: &str,
    use_dynamic_predecessor: bool,
) -> Option<String> {
    if use_dynamic_predecessor
        && let Some(dynamic) = graph
            .state_content(room_id, EVENT_ROOM_PREDECESSOR, "")
            .and_then(|content| content.get("predecessor_room_id"))
            .and_then(Value::as_str)
    {
        return Some(dynamic.to_owned());
    }

    graph
        .state_content(room_id, EVENT_ROOM_CREATE, "")
        .and_then(|content| content.get("predecessor"))
        .and_then(|predecessor| predecessor.get("room_id"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

/// Successor named by the room's current tombstone.
pub fn find_successor<G: RoomGraph + ?Sized>(graph: &G, room_id: &str) -> Option<String> {
    graph
        .state_content(room_id, EVENT_ROOM_TOMBSTONE, "")
        .and_then(|content| content.get("replacement_room"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

/// Rooms of the upgrade chain containing `room_id`, oldest first.
///
/// Each direction stops at a missing pointer, at a room that is not known
/// locally, or, with `verify_links`, at an edge the other room does not
/// confirm. An unknown starting room yields an empty chain.
pub fn room_upgrade_history<G: RoomGraph + ?Sized>(
    graph: &G,
    room_id: &str,
    verify_links: bool,
    use_dynamic_predecessor: bool,
) -> Vec<String> {
    if !graph.contains_room(room_id) {
        return Vec::new();
    }

    let mut visited = HashSet::from([room_id.to_owned()]);

    let mut older = Vec::new();
    let mut current = room_id.to_owned();
    while let Some(predecessor) = find_predecessor(graph, &current, use_dynamic_predecessor) {
        if !graph.contains_room(&predecessor) || visited.contains(&predecessor) {
            break;
        }
        if verify_links && find_successor(graph, &predecessor).as_deref() != Some(current.as_str())
        {
            break;
        }
        visited.insert(predecessor.clone());
        older.push(predecessor.clone());
        current = predecessor;
    }

    let mut newer = Vec::new();
    let mut current = room_id.to_owned();
    while let Some(successor) = find_successor(graph, &current) {
        if !graph.contains_room(&successor) || visited.contains(&successor) {
            break;
        }
        if verify_links
            && find_predecessor(graph, &successor, use_dynamic_predecessor).as_deref()
                != Some(current.as_str())
        {
            break;
        }
        visited.insert(successor.clone());
        newer.push(successor.clone());
        current = successor;
    }

    older
        .into_iter()
        .rev()
        .chain(std::iter::once(room_id.to_owned()))
        .chain(newer)
        .collect()
}

/// Known rooms minus the ones confirmed as replaced.
///
/// A room is replaced when it carries a tombstone and either the tombstone
/// names another known room or a known room claims it as predecessor.
pub fn visible_rooms<G: RoomGraph + ?Sized>(graph: &G, use_dynamic_predecessor: bool) -> Vec<String> {
    let room_ids = graph.room_ids();
    let claimed: HashSet<String> = room_ids
        .iter()
        .filter_map(|room_id| find_predecessor(graph, room_id, use_dynamic_predecessor))
        .collect();

    room_ids
        .into_iter()
        .filter(|room_id| {
            let Some(successor) = find_successor(graph, room_id) else {
                return true;
            };
            let replaced = (successor != *room_id && graph.contains_room(&successor))
                || claimed.contains(room_id);
            !replaced
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct FakeGraph {
        rooms: BTreeMap<String, BTreeMap<String, Value>>,
    }

    impl FakeGraph {
        fn room(mut self, room_id: &str) -> Self {
            self.rooms.entry(room_id.to_owned()).or_default();
            self
        }

        fn state(mut self, room_id: &str, event_type: &str, content: Value) -> Self {
            self.rooms
                .entry(room_id.to_owned())
                .or_default()
                .insert(event_type.to_owned(), content);
            self
        }

        fn created_from(self, room_id: &str, predecessor: &str) -> Self {
            self.state(
                room_id,
                EVENT_ROOM_CREATE,
                json!({"predecessor": {"room_id": predecessor}}),
            )
        }

        fn tombstoned(self, room_id: &str, successor: &str) -> Self {
            self.state(
                room_id,
                EVENT_ROOM_TOMBSTONE,
                json!({"replacement_room": successor, "body": "upgraded"}),
            )
        }
    }

    impl RoomGraph for FakeGraph {
        fn contains_room(&self, room_id: &str) -> bool {
            self.rooms.contains_key(room_id)
        }

        fn room_ids(&self) -> Vec<String> {
            self.rooms.keys().cloned().collect()
        }

        fn state_content(&self, room_id: &str, event_type: &str, state_key: &str) -> Option<&Value> {
            if !state_key.is_empty() {
                return None;
            }
            self.rooms.get(room_id)?.get(event_type)
        }
    }

    fn message(event_id: &str) -> RoomEvent {
        RoomEvent::new("m.room.message", json!({"body": event_id})).with_event_id(event_id)
    }

    fn thread_reply(event_id: &str, root: &str) -> RoomEvent {
        RoomEvent::new(
            "m.room.message",
            json!({"body": event_id, "m.relates_to": {"rel_type": "m.thread", "event_id": root}}),
        )
        .with_event_id(event_id)
    }

    fn ids(events: &[RoomEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|event| event.event_id.as_deref())
            .collect()
    }

    #[test]
    fn partitions_empty_input() {
        let (room, thread) = partition_threaded_events(&[]);
        assert!(room.is_empty());
        assert!(thread.is_empty());
    }

    #[test]
    fn thread_root_lands_in_both_outputs_in_order() {
        let root = message("$root").with_unsigned(json!({"m.relations": {"m.thread": {"count": 1}}}));
        let events = vec![
            message("$1"),
            thread_reply("$t0", "$elsewhere"),
            root,
            thread_reply("$t1", "$root"),
            message("$2"),
        ];

        let (room, thread) = partition_threaded_events(&events);
        assert_eq!(ids(&room), vec!["$1", "$root", "$2"]);
        assert_eq!(ids(&thread), vec!["$t0", "$root", "$t1"]);
    }

    #[test]
    fn asymmetric_edge_is_dropped_only_when_verifying() {
        let graph = FakeGraph::default().room("!a").created_from("!b", "!a");

        assert_eq!(room_upgrade_history(&graph, "!b", true, false), vec!["!b"]);
        assert_eq!(
            room_upgrade_history(&graph, "!b", false, false),
            vec!["!a", "!b"]
        );
    }

    #[test]
    fn symmetric_chain_is_walked_both_ways() {
        let graph = FakeGraph::default()
            .tombstoned("!a", "!b")
            .created_from("!b", "!a")
            .tombstoned("!b", "!c")
            .created_from("!c", "!b");

        assert_eq!(
            room_upgrade_history(&graph, "!b", true, false),
            vec!["!a", "!b", "!c"]
        );
        assert_eq!(
            room_upgrade_history(&graph, "!a", true, false),
            vec!["!a", "!b", "!c"]
        );
    }

    #[test]
    fn unknown_rooms_only_end_their_direction() {
        let graph = FakeGraph::default()
            .created_from("!b", "!gone")
            .tombstoned("!b", "!c")
            .created_from("!c", "!b");

        assert_eq!(
            room_upgrade_history(&graph, "!b", true, false),
            vec!["!b", "!c"]
        );
        assert!(room_upgrade_history(&graph, "!nowhere", true, false).is_empty());
    }

    #[test]
    fn forward_walk_verifies_the_successor_points_back() {
        let graph = FakeGraph::default()
            .tombstoned("!a", "!b")
            .created_from("!b", "!other")
            .room("!other");

        assert_eq!(room_upgrade_history(&graph, "!a", true, false), vec!["!a"]);
        assert_eq!(
            room_upgrade_history(&graph, "!a", false, false),
            vec!["!a", "!b"]
        );
    }

    #[test]
    fn dynamic_predecessor_overrides_create_event_when_enabled() {
        let graph = FakeGraph::default()
            .room("!old")
            .tombstoned("!dyn", "!b")
            .created_from("!b", "!old")
            .state("!b", EVENT_ROOM_PREDECESSOR, json!({"predecessor_room_id": "!dyn"}));

        assert_eq!(
            find_predecessor(&graph, "!b", false).as_deref(),
            Some("!old")
        );
        assert_eq!(find_predecessor(&graph, "!b", true).as_deref(), Some("!dyn"));
        assert_eq!(
            room_upgrade_history(&graph, "!b", true, true),
            vec!["!dyn", "!b"]
        );
        assert_eq!(room_upgrade_history(&graph, "!b", true, false), vec!["!b"]);
    }

    #[test]
    fn cyclic_links_terminate() {
        let graph = FakeGraph::default()
            .tombstoned("!a", "!b")
            .created_from("!a", "!b")
            .tombstoned("!b", "!a")
            .created_from("!b", "!a");

        assert_eq!(
            room_upgrade_history(&graph, "!a", true, false),
            vec!["!b", "!a"]
        );
    }

    #[test]
    fn hides_rooms_replaced_by_known_successors() {
        let graph = FakeGraph::default()
            .tombstoned("!a", "!b")
            .created_from("!b", "!a")
            .tombstoned("!lonely", "!unknown")
            .room("!plain");

        assert_eq!(visible_rooms(&graph, false), vec!["!b", "!lonely", "!plain"]);
    }

    #[test]
    fn dynamic_predecessor_claims_hide_tombstoned_rooms() {
        let graph = FakeGraph::default()
            .tombstoned("!a", "!unknown")
            .room("!b")
            .state("!b", EVENT_ROOM_PREDECESSOR, json!({"predecessor_room_id": "!a"}));

        assert_eq!(visible_rooms(&graph, false), vec!["!a", "!b"]);
        assert_eq!(visible_rooms(&graph, true), vec!["!b"]);
    }
}
