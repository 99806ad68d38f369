//! In-memory event DAG store (C4).
//!
//! Owned exclusively by a single room actor; never shared across threads.
//! `latest_events` / `nonlatest_events` track the DAG's leaves, and
//! `simple_toposort` gives a topological order over `auth_events` pointers
//! (used by `auth_and_store_external_events` and the auth-chain walk).

use std::collections::{HashMap, HashSet, VecDeque};

use room_engine_core::event::Event;
use room_engine_core::{EventId, ProtocolError};
use tracing::trace;

/// Callback invoked after every successful `store_event`, standing in for
/// the gateway-bridge notifier (C7) — kept as a trait rather than a
/// concrete dependency so the DAG store stays free of actor/gateway
/// concerns.
pub trait StoreNotifier {
    fn notify_stored(&self, event: &Event);
}

impl StoreNotifier for () {
    fn notify_stored(&self, _event: &Event) {}
}

/// The room's event DAG: every known event, plus which of them are leaves.
#[derive(Default)]
pub struct EventGraph {
    events: HashMap<EventId, Event>,
    latest_events: HashSet<EventId>,
    nonlatest_events: HashSet<EventId>,
}

impl EventGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &EventId) -> Option<&Event> {
        self.events.get(id)
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.events.contains_key(id)
    }

    pub fn latest_events(&self) -> &HashSet<EventId> {
        &self.latest_events
    }

    pub fn events(&self) -> &HashMap<EventId, Event> {
        &self.events
    }

    /// `store_event/1` from §4.4.
    pub fn store_event(&mut self, event: Event, notifier: &impl StoreNotifier) {
        match self.events.get(&event.id) {
            Some(existing) if existing.state_map.is_none() && event.state_map.is_some() => {
                self.events.insert(event.id.clone(), event.clone());
                notifier.notify_stored(&event);
                return;
            }
            Some(_) => return,
            None => {}
        }

        let id = event.id.clone();
        for parent in &event.prev_events {
            self.latest_events.remove(parent);
            self.nonlatest_events.insert(parent.clone());
        }
        self.events.insert(id.clone(), event);
        if !self.nonlatest_events.contains(&id) {
            self.latest_events.insert(id.clone());
        }

        if let Some(stored) = self.events.get(&id) {
            notifier.notify_stored(stored);
        }
    }

    /// `simple_toposort/1` from §4.4: a Kahn/DFS toposort over `auth_events`
    /// pointers restricted to `ids`. Ancestors precede their dependents.
    /// Detects cycles via a gray-marking DFS and aborts with
    /// `loop_in_auth_chain`.
    pub fn simple_toposort(&self, ids: &[EventId]) -> Result<Vec<EventId>, ProtocolError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Gray,
            Black,
        }

        let wanted: HashSet<&EventId> = ids.iter().collect();
        let mut marks: HashMap<EventId, Mark> = HashMap::new();
        let mut out = Vec::with_capacity(ids.len());

        fn visit(
            id: &EventId,
            graph: &EventGraph,
            wanted: &HashSet<&EventId>,
            marks: &mut HashMap<EventId, Mark>,
            out: &mut Vec<EventId>,
        ) -> Result<(), ProtocolError> {
            match marks.get(id) {
                Some(Mark::Black) => return Ok(()),
                Some(Mark::Gray) => return Err(ProtocolError::LoopInAuthChain),
                None => {}
            }
            marks.insert(id.clone(), Mark::Gray);

            let auth_events = graph
                .events
                .get(id)
                .map(|e| e.auth_events.clone())
                .unwrap_or_default();
            for parent in &auth_events {
                if wanted.contains(parent) {
                    visit(parent, graph, wanted, marks, out)?;
                }
            }

            marks.insert(id.clone(), Mark::Black);
            out.push(id.clone());
            Ok(())
        }

        for id in ids {
            visit(id, self, &wanted, &mut marks, &mut out)?;
        }
        Ok(out)
    }

    /// DFS closure over `auth_events`, starting from `seeds`, used by
    /// `get_state_ids` (C6) to build an `auth_chain` response.
    pub fn auth_chain(&self, seeds: impl IntoIterator<Item = EventId>) -> Vec<EventId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<EventId> = seeds.into_iter().collect();
        let mut out = Vec::new();
        while let Some(id) = stack.pop() {
            let Some(event) = self.events.get(&id) else {
                continue;
            };
            for parent in &event.auth_events {
                if seen.insert(parent.clone()) {
                    out.push(parent.clone());
                    stack.push(parent.clone());
                }
            }
        }
        out
    }

    /// Backward BFS over `prev_events` from `latest`, used by
    /// `get_missing_events`. Stops descending past anything in `earliest`
    /// or below `min_depth`.
    pub fn ancestors_of(
        &self,
        latest: &[EventId],
        earliest: &HashSet<EventId>,
        min_depth: i64,
        limit: usize,
    ) -> Vec<EventId> {
        let mut seen: HashSet<EventId> = earliest.clone();
        let mut queue: VecDeque<EventId> = VecDeque::new();
        let mut out = Vec::new();

        for id in latest {
            if seen.insert(id.clone()) {
                queue.push_back(id.clone());
            }
        }

        while let Some(id) = queue.pop_front() {
            if out.len() >= limit {
                break;
            }
            let Some(event) = self.events.get(&id) else {
                continue;
            };
            if event.depth < min_depth {
                continue;
            }
            if !latest.contains(&id) {
                out.push(id.clone());
            }
            for parent in &event.prev_events {
                if event.depth >= min_depth && seen.insert(parent.clone()) {
                    trace!(%parent, "queueing ancestor for get_missing_events");
                    queue.push_back(parent.clone());
                }
            }
        }

        out.truncate(limit);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_engine_core::room_version::RoomVersionId;

    fn fake_event(id: &str, auth: &[&str]) -> Event {
        use room_engine_core::event::Pdu;
        let pdu = Pdu {
            kind: "m.room.message".into(),
            room_id: "!r:x".into(),
            sender: "@a:x".into(),
            depth: 1,
            auth_events: auth.iter().map(|s| s.to_string()).collect(),
            prev_events: vec![],
            origin_server_ts: 0,
            state_key: None,
            content: serde_json::json!({}),
            unsigned: Default::default(),
            redacts: None,
            rest: Default::default(),
        };
        Event::from_pdu(pdu, EventId::new(id), RoomVersionId::V11).unwrap()
    }

    #[test]
    fn toposort_orders_ancestors_first() {
        let mut graph = EventGraph::new();
        graph.store_event(fake_event("$a", &[]), &());
        graph.store_event(fake_event("$b", &["$a"]), &());
        let order = graph.simple_toposort(&[EventId::new("$b"), EventId::new("$a")]).unwrap();
        let pos_a = order.iter().position(|i| i.as_str() == "$a").unwrap();
        let pos_b = order.iter().position(|i| i.as_str() == "$b").unwrap();
        assert!(pos_a < pos_b);
    }

    #[test]
    fn toposort_detects_cycle() {
        let mut graph = EventGraph::new();
        graph.store_event(fake_event("$a", &["$b"]), &());
        graph.store_event(fake_event("$b", &["$a"]), &());
        let err = graph.simple_toposort(&[EventId::new("$a"), EventId::new("$b")]);
        assert!(matches!(err, Err(ProtocolError::LoopInAuthChain)));
    }

    #[test]
    fn store_event_upgrades_partial_to_materialised() {
        let mut graph = EventGraph::new();
        let mut partial = fake_event("$a", &[]);
        graph.store_event(partial.clone(), &());
        assert!(graph.get(&EventId::new("$a")).unwrap().state_map.is_none());

        partial.state_map = Some(Default::default());
        graph.store_event(partial, &());
        assert!(graph.get(&EventId::new("$a")).unwrap().state_map.is_some());
    }

    #[test]
    fn latest_and_nonlatest_stay_disjoint() {
        let mut graph = EventGraph::new();
        graph.store_event(fake_event("$a", &[]), &());
        graph.store_event(fake_event("$b", &[]), &());
        assert!(graph.latest_events().contains(&EventId::new("$a")));
        assert!(graph.latest_events().contains(&EventId::new("$b")));
    }
}
