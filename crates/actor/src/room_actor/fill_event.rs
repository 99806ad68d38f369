//! `fill_event/1` from §4.6: stamps depth, `prev_events`, `auth_events` and
//! a resolved `state_map` onto a locally-originated, partial PDU.

use room_engine_core::event::{Event, StateMap, compute_event_auth_keys};
use room_engine_core::state_res::{EventLookup, resolve_state_maps};
use room_engine_core::{EventId, RoomVersionId, UserId};
use serde_json::Value as JsonValue;

use crate::dag::EventGraph;

pub struct Filled {
    pub depth: i64,
    pub prev_events: Vec<EventId>,
    pub auth_events: Vec<EventId>,
    pub state_map: StateMap,
}

/// Fills in the DAG-dependent fields of a locally-originated event.
/// `kind`/`sender`/`state_key`/`content` describe the event being created;
/// `graph` supplies the current leaves and their resolved state.
pub fn fill_event(
    graph: &EventGraph,
    kind: &str,
    sender: &UserId,
    state_key: Option<&str>,
    content: &JsonValue,
    room_version: RoomVersionId,
) -> Filled {
    let rules = room_version.rules();
    let parents: Vec<EventId> = graph.latest_events().iter().cloned().collect();

    let max_parent_depth = parents
        .iter()
        .filter_map(|id| graph.get(id))
        .map(|e| e.depth)
        .max()
        .unwrap_or(0);
    let depth = max_parent_depth.saturating_add(1);

    let parent_maps: Vec<StateMap> = parents
        .iter()
        .filter_map(|id| graph.get(id))
        .filter_map(|e| e.state_map.clone())
        .collect();
    let state_map = resolve_state_maps(&parent_maps, &GraphLookup(graph), &rules);

    let auth_keys = compute_event_auth_keys(kind, sender, state_key, content, &rules);
    let mut auth_events = Vec::new();
    for key in auth_keys {
        if let Some(id) = state_map.get(&key) {
            if !auth_events.contains(id) {
                auth_events.push(id.clone());
            }
        }
    }

    Filled { depth, prev_events: parents, auth_events, state_map }
}

struct GraphLookup<'a>(&'a EventGraph);

impl EventLookup for GraphLookup<'_> {
    fn get(&self, id: &EventId) -> Option<&Event> {
        self.0.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_engine_core::event::{Pdu, ROOM_CREATE};

    fn store_create(graph: &mut EventGraph, id: &str, sender: &str, room_id: &str) {
        let pdu = Pdu {
            kind: ROOM_CREATE.into(),
            room_id: room_id.into(),
            sender: sender.into(),
            depth: 0,
            auth_events: vec![],
            prev_events: vec![],
            origin_server_ts: 0,
            state_key: Some(String::new()),
            content: serde_json::json!({}),
            unsigned: Default::default(),
            redacts: None,
            rest: Default::default(),
        };
        let mut event = Event::from_pdu(pdu, EventId::new(id), RoomVersionId::V11).unwrap();
        let mut map = StateMap::new();
        map.insert((ROOM_CREATE.to_owned(), String::new()), EventId::new(id));
        event.state_map = Some(map);
        graph.store_event(event, &());
    }

    #[test]
    fn fill_event_depth_is_one_past_parent() {
        let mut graph = EventGraph::new();
        store_create(&mut graph, "$create", "@alice:x", "!r:x");
        let sender = UserId::parse("@alice:x").unwrap();
        let filled = fill_event(&graph, "m.room.message", &sender, None, &serde_json::json!({}), RoomVersionId::V11);
        assert_eq!(filled.depth, 1);
        assert_eq!(filled.prev_events, vec![EventId::new("$create")]);
    }

    #[test]
    fn fill_event_auth_events_reference_create() {
        let mut graph = EventGraph::new();
        store_create(&mut graph, "$create", "@alice:x", "!r:x");
        let sender = UserId::parse("@alice:x").unwrap();
        let filled = fill_event(&graph, "m.room.message", &sender, None, &serde_json::json!({}), RoomVersionId::V11);
        assert!(filled.auth_events.contains(&EventId::new("$create")));
    }
}
