//! State resolution v2 (C5).
//!
//! `resolve_state_maps` merges several branches' state maps into one,
//! following the Matrix "v2" algorithm: partition into conflicted /
//! unconflicted, compute the auth difference, order power events by
//! reverse-topological power sort, run an iterative auth pass over them,
//! mainline-order the rest, and run a second iterative auth pass.
//!
//! Dropped events during the iterative passes are logged and skipped; they
//! never abort resolution (§4.5 failure model).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use itertools::Itertools;
use tracing::debug;

use crate::auth::{StateSnapshot, check_event_auth, get_user_power_level};
use crate::event::{Event, ROOM_JOIN_RULES, ROOM_MEMBER, ROOM_POWER_LEVELS, StateKey, StateMap};
use crate::identifiers::EventId;
use crate::room_version::AuthorizationRules;

/// Read-only access to the full set of events the resolver may need to
/// dereference (auth chains can reach arbitrarily far back in the DAG).
/// Implemented by the DAG store in the actor crate; a plain `HashMap` also
/// satisfies it, which is all the unit tests here need.
pub trait EventLookup {
    fn get(&self, id: &EventId) -> Option<&Event>;
}

impl EventLookup for HashMap<EventId, Event> {
    fn get(&self, id: &EventId) -> Option<&Event> {
        HashMap::get(self, id)
    }
}

/// `resolve_state_maps([m1..mk], data) -> map`.
pub fn resolve_state_maps(
    maps: &[StateMap],
    events: &impl EventLookup,
    rules: &AuthorizationRules,
) -> StateMap {
    match maps.len() {
        0 => return StateMap::new(),
        1 => return maps[0].clone(),
        _ => {}
    }

    let (unconflicted, conflicted_ids) = partition_conflicts(maps);

    let auth_diff = auth_difference(&conflicted_ids, events);

    let mut full_conflicted: HashSet<EventId> = auth_diff;
    for ids in conflicted_ids.values() {
        full_conflicted.extend(ids.iter().cloned());
    }

    let (power_events, other_events): (Vec<EventId>, Vec<EventId>) = full_conflicted
        .iter()
        .cloned()
        .partition(|id| is_power_event(id, events));

    let creator = unconflicted
        .get(&(crate::event::ROOM_CREATE.to_owned(), String::new()))
        .cloned();

    let power_order = reverse_topological_power_sort(&power_events, events, rules, creator.as_ref());

    let mut running = unconflicted.clone();
    for id in &power_order {
        apply_iterative_auth(id, &mut running, events, rules);
    }

    let power_levels_head = running.get(&(ROOM_POWER_LEVELS.to_owned(), String::new())).cloned();
    let mainline = build_mainline(power_levels_head, events);

    let sorted_others: Vec<EventId> = other_events
        .iter()
        .cloned()
        .sorted_by_cached_key(|id| {
            let idx = mainline_index(id, &mainline, events);
            let ts = events.get(id).map(|e| e.origin_server_ts).unwrap_or(0);
            (idx, ts, id.as_str().to_owned())
        })
        .collect();

    for id in &sorted_others {
        apply_iterative_auth(id, &mut running, events, rules);
    }

    // Unconflicted wins on any collision (step 9).
    for (key, id) in unconflicted {
        running.insert(key, id);
    }
    running
}

fn partition_conflicts(maps: &[StateMap]) -> (StateMap, BTreeMap<StateKey, BTreeSet<EventId>>) {
    let mut all_keys: BTreeSet<StateKey> = BTreeSet::new();
    for m in maps {
        all_keys.extend(m.keys().cloned());
    }

    let mut unconflicted = StateMap::new();
    let mut conflicted: BTreeMap<StateKey, BTreeSet<EventId>> = BTreeMap::new();

    for key in all_keys {
        let mut values: Vec<Option<&EventId>> = Vec::with_capacity(maps.len());
        for m in maps {
            values.push(m.get(&key));
        }
        let present: Vec<&EventId> = values.iter().copied().flatten().collect();
        let all_present_and_equal =
            values.iter().all(Option::is_some) && present.iter().all(|id| *id == present[0]);

        if all_present_and_equal {
            unconflicted.insert(key, present[0].clone());
        } else {
            conflicted.insert(key, present.into_iter().cloned().collect());
        }
    }

    (unconflicted, conflicted)
}

/// Auth chain closure (DFS over `auth_events`) for a single event, not
/// including the event itself.
fn auth_chain_of(id: &EventId, events: &impl EventLookup) -> HashSet<EventId> {
    let mut seen = HashSet::new();
    let mut stack = vec![id.clone()];
    while let Some(current) = stack.pop() {
        let Some(event) = events.get(&current) else {
            continue;
        };
        for parent in &event.auth_events {
            if seen.insert(parent.clone()) {
                stack.push(parent.clone());
            }
        }
    }
    seen
}

/// Union of the conflicted events' auth chains minus their intersection.
///
/// A straightforward `O(|auth-closure| * k)` implementation; the spec notes
/// the source accepts non-optimality here in favour of the bitmask trick
/// from §9's design notes.
fn auth_difference(
    conflicted: &BTreeMap<StateKey, BTreeSet<EventId>>,
    events: &impl EventLookup,
) -> HashSet<EventId> {
    let conflicted_ids: HashSet<EventId> = conflicted.values().flatten().cloned().collect();
    if conflicted_ids.is_empty() {
        return HashSet::new();
    }

    let chains: Vec<HashSet<EventId>> = conflicted_ids
        .iter()
        .map(|id| auth_chain_of(id, events))
        .collect();

    let mut union: HashSet<EventId> = HashSet::new();
    for chain in &chains {
        union.extend(chain.iter().cloned());
    }

    let mut intersection = union.clone();
    for chain in &chains {
        intersection.retain(|id| chain.contains(id));
    }

    union.into_iter().filter(|id| !intersection.contains(id)).collect()
}

/// A "power event" per §4.5 point 4.
fn is_power_event(id: &EventId, events: &impl EventLookup) -> bool {
    let Some(event) = events.get(id) else {
        return false;
    };
    match event.kind.as_str() {
        k if k == ROOM_POWER_LEVELS && event.state_key.as_deref() == Some("") => true,
        k if k == ROOM_JOIN_RULES && event.state_key.as_deref() == Some("") => true,
        k if k == ROOM_MEMBER => {
            let target_is_sender = event.state_key.as_deref() == Some(event.sender.as_str());
            !target_is_sender
                && matches!(
                    event.membership(),
                    Some(crate::event::MembershipState::Leave) | Some(crate::event::MembershipState::Ban)
                )
        }
        _ => false,
    }
}

/// The power level attributed to `event`'s sender *at that event*: walk its
/// `auth_events` for a `(power_levels, "")`; fall back to the creator-rule
/// default.
fn sender_power_at_event(id: &EventId, events: &impl EventLookup, rules: &AuthorizationRules, creator: Option<&EventId>) -> i64 {
    let Some(event) = events.get(id) else {
        return 0;
    };

    for auth_id in &event.auth_events {
        if let Some(auth_event) = events.get(auth_id) {
            if auth_event.kind == ROOM_POWER_LEVELS && auth_event.state_key.as_deref() == Some("") {
                let mut snapshot: StateSnapshot<'_> = StateSnapshot::new();
                snapshot.insert((ROOM_POWER_LEVELS.to_owned(), String::new()), auth_event);
                return get_user_power_level(&event.sender, &snapshot, rules);
            }
        }
    }

    let is_creator = creator
        .and_then(|c| events.get(c))
        .map(|c| {
            if rules.implicit_room_creator {
                c.sender.as_str() == event.sender.as_str()
            } else {
                c.explicit_creator().unwrap_or(c.sender.as_str()) == event.sender.as_str()
            }
        })
        .unwrap_or(false);

    if is_creator {
        AuthorizationRules::CREATOR_POWER_LEVEL
    } else {
        0
    }
}

/// Generic Kahn's-algorithm toposort that, among all currently-ready nodes
/// (every dependency already emitted), picks the one with the smallest
/// `key` — the "priority-queue Kahn's algorithm" used for both the
/// reverse-topological power sort and (conceptually) `simple_toposort`.
fn lexicographic_topo_sort<K: Ord + Clone>(
    nodes: &[EventId],
    deps_of: impl Fn(&EventId) -> Vec<EventId>,
    key_of: impl Fn(&EventId) -> K,
) -> Vec<EventId> {
    let node_set: HashSet<&EventId> = nodes.iter().collect();
    let mut remaining_deps: HashMap<EventId, HashSet<EventId>> = HashMap::new();
    let mut dependents: HashMap<EventId, Vec<EventId>> = HashMap::new();

    for node in nodes {
        let deps: HashSet<EventId> = deps_of(node).into_iter().filter(|d| node_set.contains(d)).collect();
        for dep in &deps {
            dependents.entry(dep.clone()).or_default().push(node.clone());
        }
        remaining_deps.insert(node.clone(), deps);
    }

    let mut ready: BTreeSet<(K, String)> = BTreeSet::new();
    let mut by_id: HashMap<String, EventId> = HashMap::new();
    for node in nodes {
        if remaining_deps.get(node).map(HashSet::is_empty).unwrap_or(true) {
            ready.insert((key_of(node), node.as_str().to_owned()));
            by_id.insert(node.as_str().to_owned(), node.clone());
        }
    }

    let mut out = Vec::with_capacity(nodes.len());
    while let Some((k, id_str)) = ready.iter().next().cloned() {
        ready.remove(&(k, id_str.clone()));
        let node = by_id.remove(&id_str).expect("tracked in `by_id`");
        out.push(node.clone());

        if let Some(children) = dependents.get(&node) {
            for child in children.clone() {
                if let Some(set) = remaining_deps.get_mut(&child) {
                    set.remove(&node);
                    if set.is_empty() {
                        ready.insert((key_of(&child), child.as_str().to_owned()));
                        by_id.insert(child.as_str().to_owned(), child.clone());
                    }
                }
            }
        }
    }

    // A cycle leaves some nodes un-emitted; append them in input order
    // rather than silently dropping them (resolution never aborts, §4.5).
    if out.len() != nodes.len() {
        debug!(missing = nodes.len() - out.len(), "cycle in power-event auth subgraph");
        for node in nodes {
            if !out.contains(node) {
                out.push(node.clone());
            }
        }
    }

    out
}

fn reverse_topological_power_sort(
    power_events: &[EventId],
    events: &impl EventLookup,
    rules: &AuthorizationRules,
    creator: Option<&EventId>,
) -> Vec<EventId> {
    lexicographic_topo_sort(
        power_events,
        |id| events.get(id).map(|e| e.auth_events.clone()).unwrap_or_default(),
        |id| {
            let power = sender_power_at_event(id, events, rules, creator);
            let ts = events.get(id).map(|e| e.origin_server_ts).unwrap_or(0);
            (-power, ts, id.as_str().to_owned())
        },
    )
}

fn apply_iterative_auth(id: &EventId, running: &mut StateMap, events: &impl EventLookup, rules: &AuthorizationRules) {
    let Some(event) = events.get(id) else {
        debug!(%id, "dropping event missing from store during iterative auth");
        return;
    };

    let mut snapshot: StateSnapshot<'_> = StateSnapshot::new();
    for (key, existing_id) in running.iter() {
        if let Some(existing) = events.get(existing_id) {
            snapshot.insert(key.clone(), existing);
        }
    }
    for auth_id in &event.auth_events {
        if let Some(auth_event) = events.get(auth_id) {
            if let Some(key) = auth_event.state_key_pair() {
                snapshot.entry(key).or_insert(auth_event);
            }
        }
    }

    if check_event_auth(event, &snapshot, rules) {
        if let Some(key) = event.state_key_pair() {
            running.insert(key, event.id.clone());
        }
    } else {
        debug!(%id, "event dropped by iterative auth pass");
    }
}

/// The mainline: `(power_levels, "")` events reachable by following
/// `find_power_level_event`, starting from `head` and walking to the room's
/// original power levels (or its absence).
fn build_mainline(head: Option<EventId>, events: &impl EventLookup) -> Vec<EventId> {
    let mut chain = Vec::new();
    let mut current = head;
    let mut guard = 0usize;
    while let Some(id) = current {
        if chain.contains(&id) || guard > 10_000 {
            break;
        }
        guard += 1;
        chain.push(id.clone());
        current = find_power_level_event(&id, events);
    }
    chain
}

/// The `(power_levels, "")` event among `id`'s `auth_events`, if any.
fn find_power_level_event(id: &EventId, events: &impl EventLookup) -> Option<EventId> {
    let event = events.get(id)?;
    event.auth_events.iter().find_map(|auth_id| {
        let auth_event = events.get(auth_id)?;
        (auth_event.kind == ROOM_POWER_LEVELS && auth_event.state_key.as_deref() == Some(""))
            .then(|| auth_id.clone())
    })
}

/// The mainline index for `id`: the position (as a *negative* index, `0` if
/// no ancestor lands on the mainline) of the first ancestor reached by
/// repeatedly chasing `find_power_level_event`.
fn mainline_index(id: &EventId, mainline: &[EventId], events: &impl EventLookup) -> i64 {
    let mut current = Some(id.clone());
    let mut guard = 0usize;
    while let Some(cur) = current {
        if let Some(pos) = mainline.iter().position(|m| m == &cur) {
            return -(pos as i64) - 1;
        }
        guard += 1;
        if guard > 10_000 {
            break;
        }
        current = find_power_level_event(&cur, events);
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    fn lookup(events: Vec<Event>) -> HashMap<EventId, Event> {
        events.into_iter().map(|e| (e.id.clone(), e)).collect()
    }

    #[test]
    fn resolve_empty_is_empty() {
        let events: HashMap<EventId, Event> = hashmap! {};
        let rules = crate::room_version::RoomVersionId::V11.rules();
        assert!(resolve_state_maps(&[], &events, &rules).is_empty());
    }

    #[test]
    fn resolve_single_is_identity() {
        let events: HashMap<EventId, Event> = hashmap! {};
        let rules = crate::room_version::RoomVersionId::V11.rules();
        let mut map = StateMap::new();
        map.insert((crate::event::ROOM_CREATE.to_owned(), String::new()), EventId::new("$a"));
        assert_eq!(resolve_state_maps(&[map.clone()], &events, &rules), map);
    }

    #[test]
    fn unanimous_key_survives_resolution() {
        let rules = crate::room_version::RoomVersionId::V11.rules();
        let events = lookup(vec![]);
        let key = (crate::event::ROOM_CREATE.to_owned(), String::new());
        let mut m1 = StateMap::new();
        m1.insert(key.clone(), EventId::new("$create"));
        let mut m2 = StateMap::new();
        m2.insert(key.clone(), EventId::new("$create"));
        let resolved = resolve_state_maps(&[m1, m2], &events, &rules);
        assert_eq!(resolved.get(&key), Some(&EventId::new("$create")));
    }
}
