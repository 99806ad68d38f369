//! Auth engine (C3).
//!
//! `check_event_auth` decides whether an event is allowed given a state
//! snapshot. All exceptions inside rule evaluation collapse to deny — this
//! module never panics and never propagates an error out of
//! `check_event_auth` itself; malformed content is simply not-allowed.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::event::{
    Event, JoinRule, MembershipState, ROOM_CREATE, ROOM_JOIN_RULES, ROOM_MEMBER,
    ROOM_POWER_LEVELS, StateKey,
};
use crate::identifiers::UserId;
use crate::room_version::AuthorizationRules;

/// `(type, state_key) -> &Event`, the snapshot `check_event_auth` evaluates
/// against. Built by the caller (the DAG store for top-level auth, the
/// state resolver for its iterative passes) from whatever event ids are in
/// scope; this module never resolves an id itself.
pub type StateSnapshot<'a> = BTreeMap<StateKey, &'a Event>;

const DEFAULT_BAN: i64 = 50;
const DEFAULT_KICK: i64 = 50;
const DEFAULT_INVITE: i64 = 0;
const DEFAULT_EVENTS: i64 = 0;
const DEFAULT_STATE: i64 = 50;

/// Decides whether `event` is allowed given `snapshot`.
pub fn check_event_auth(event: &Event, snapshot: &StateSnapshot<'_>, rules: &AuthorizationRules) -> bool {
    if event.kind == ROOM_CREATE {
        return check_create(event, snapshot, rules);
    }

    if !snapshot.contains_key(&(ROOM_CREATE.to_owned(), String::new())) {
        return false;
    }

    if event.kind == ROOM_MEMBER {
        return check_member(event, snapshot, rules);
    }

    check_other(event, snapshot, rules)
}

fn check_create(event: &Event, snapshot: &StateSnapshot<'_>, rules: &AuthorizationRules) -> bool {
    if !snapshot.is_empty() {
        return false;
    }
    if event.sender.server_name() != event.room_id.server_name() {
        return false;
    }
    if !rules.implicit_room_creator && event.explicit_creator().is_none() {
        return false;
    }
    true
}

fn creator_of(snapshot: &StateSnapshot<'_>, rules: &AuthorizationRules) -> Option<String> {
    let create = snapshot.get(&(ROOM_CREATE.to_owned(), String::new()))?;
    if rules.implicit_room_creator {
        Some(create.sender.to_string())
    } else {
        create
            .explicit_creator()
            .map(str::to_owned)
            .or_else(|| Some(create.sender.to_string()))
    }
}

fn check_member(event: &Event, snapshot: &StateSnapshot<'_>, rules: &AuthorizationRules) -> bool {
    let Some(state_key) = event.state_key.as_deref() else {
        return false;
    };
    let Some(membership) = event.membership() else {
        return false;
    };

    match membership {
        MembershipState::Join => check_join(event, state_key, snapshot, rules),
        MembershipState::Invite => check_invite(event, state_key, snapshot, rules),
        MembershipState::Leave => check_leave(event, state_key, snapshot, rules),
        MembershipState::Ban => check_ban(event, state_key, snapshot, rules),
        MembershipState::Knock => check_knock(event, state_key, snapshot, rules),
        MembershipState::Unknown => false,
    }
}

fn is_creator_self_join(event: &Event, state_key: &str, snapshot: &StateSnapshot<'_>, rules: &AuthorizationRules) -> bool {
    if event.auth_events.len() != 1 {
        return false;
    }
    if event.sender.as_str() != state_key {
        return false;
    }
    match creator_of(snapshot, rules) {
        Some(creator) => creator == event.sender.as_str(),
        None => false,
    }
}

fn prior_membership(user: &str, snapshot: &StateSnapshot<'_>) -> Option<MembershipState> {
    snapshot
        .get(&(ROOM_MEMBER.to_owned(), user.to_owned()))
        .and_then(|e| e.membership())
}

fn current_join_rule(snapshot: &StateSnapshot<'_>) -> JoinRule {
    snapshot
        .get(&(ROOM_JOIN_RULES.to_owned(), String::new()))
        .and_then(|e| e.join_rule())
        .unwrap_or(JoinRule::Invite)
}

fn check_join(event: &Event, state_key: &str, snapshot: &StateSnapshot<'_>, rules: &AuthorizationRules) -> bool {
    if is_creator_self_join(event, state_key, snapshot, rules) {
        return true;
    }
    if event.sender.as_str() != state_key {
        return false;
    }

    let join_rule = current_join_rule(snapshot);
    match prior_membership(state_key, snapshot) {
        Some(MembershipState::Ban) => false,
        Some(MembershipState::Join) => true,
        Some(prior) => join_allows(join_rule, Some(prior), rules),
        None => join_allows(join_rule, None, rules),
    }
}

fn join_allows(join_rule: JoinRule, prior: Option<MembershipState>, rules: &AuthorizationRules) -> bool {
    match (join_rule, prior) {
        (JoinRule::Public, _) => true,
        (JoinRule::Invite, Some(MembershipState::Invite)) => true,
        (JoinRule::Knock, Some(MembershipState::Invite)) => true,
        (JoinRule::Restricted, Some(MembershipState::Invite)) => true,
        (JoinRule::KnockRestricted, Some(MembershipState::Invite)) => rules.knock_restricted_join_rule,
        // TODO: restricted/knock_restricted join rules additionally admit
        // users satisfying an `allow` rule (room membership in a named
        // space) without a prior invite. Left unimplemented per §9's open
        // question; reject rather than silently allow.
        (JoinRule::Public, None) => true,
        _ => false,
    }
}

fn check_invite(event: &Event, state_key: &str, snapshot: &StateSnapshot<'_>, rules: &AuthorizationRules) -> bool {
    if prior_membership(event.sender.as_str(), snapshot) != Some(MembershipState::Join) {
        return false;
    }
    match prior_membership(state_key, snapshot) {
        Some(MembershipState::Ban) | Some(MembershipState::Join) => return false,
        _ => {}
    }

    // TODO: `third_party_invite` flows (content.third_party_invite.signed)
    // are recognised structurally by `compute_event_auth_keys` but not
    // given a bypass here; a plain invite-power check always applies.
    let _ = event.third_party_invite_token();

    let sender_power = get_user_power_level(&event.sender, snapshot, rules);
    let invite_level = power_level_field(snapshot, "invite").unwrap_or(DEFAULT_INVITE);
    sender_power >= invite_level
}

fn check_leave(event: &Event, state_key: &str, snapshot: &StateSnapshot<'_>, rules: &AuthorizationRules) -> bool {
    if event.sender.as_str() == state_key {
        return matches!(
            prior_membership(state_key, snapshot),
            Some(MembershipState::Invite) | Some(MembershipState::Join) | Some(MembershipState::Knock)
        );
    }

    if prior_membership(event.sender.as_str(), snapshot) != Some(MembershipState::Join) {
        return false;
    }

    let sender_power = get_user_power_level(&event.sender, snapshot, rules);
    let target_power = get_user_power_level_str(state_key, snapshot, rules);
    let kick_level = power_level_field(snapshot, "kick").unwrap_or(DEFAULT_KICK);

    if sender_power < kick_level || sender_power <= target_power {
        return false;
    }

    if prior_membership(state_key, snapshot) == Some(MembershipState::Ban) {
        let ban_level = power_level_field(snapshot, "ban").unwrap_or(DEFAULT_BAN);
        if sender_power < ban_level {
            return false;
        }
    }

    true
}

fn check_ban(event: &Event, state_key: &str, snapshot: &StateSnapshot<'_>, rules: &AuthorizationRules) -> bool {
    if prior_membership(event.sender.as_str(), snapshot) != Some(MembershipState::Join) {
        return false;
    }
    let sender_power = get_user_power_level(&event.sender, snapshot, rules);
    let target_power = get_user_power_level_str(state_key, snapshot, rules);
    let ban_level = power_level_field(snapshot, "ban").unwrap_or(DEFAULT_BAN);
    sender_power >= ban_level && sender_power > target_power
}

fn check_knock(event: &Event, state_key: &str, snapshot: &StateSnapshot<'_>, rules: &AuthorizationRules) -> bool {
    if event.sender.as_str() != state_key {
        return false;
    }
    let join_rule = current_join_rule(snapshot);
    let rule_allows_knock = match join_rule {
        JoinRule::Knock => true,
        JoinRule::KnockRestricted => rules.knock_restricted_join_rule,
        _ => false,
    };
    if !rule_allows_knock {
        return false;
    }
    !matches!(
        prior_membership(state_key, snapshot),
        Some(MembershipState::Ban) | Some(MembershipState::Join)
    )
}

fn check_other(event: &Event, snapshot: &StateSnapshot<'_>, rules: &AuthorizationRules) -> bool {
    if prior_membership(event.sender.as_str(), snapshot) != Some(MembershipState::Join) {
        return false;
    }

    if let Some(state_key) = event.state_key.as_deref() {
        if state_key.starts_with('@') && state_key != event.sender.as_str() {
            return false;
        }
    }

    let sender_power = get_user_power_level(&event.sender, snapshot, rules);
    let required = required_power_for(&event.kind, snapshot);
    if sender_power < required {
        return false;
    }

    if event.kind == ROOM_POWER_LEVELS {
        return check_power_levels_delta(event, sender_power, snapshot, rules);
    }

    true
}

fn required_power_for(kind: &str, snapshot: &StateSnapshot<'_>) -> i64 {
    snapshot
        .get(&(ROOM_POWER_LEVELS.to_owned(), String::new()))
        .and_then(|e| e.power_levels_content())
        .and_then(|pl| pl.events.get(kind).and_then(get_int))
        .or_else(|| power_level_field(snapshot, "events_default"))
        .unwrap_or(DEFAULT_EVENTS)
}

fn power_level_field(snapshot: &StateSnapshot<'_>, field: &str) -> Option<i64> {
    let pl = snapshot
        .get(&(ROOM_POWER_LEVELS.to_owned(), String::new()))?
        .power_levels_content()?;
    let value = match field {
        "ban" => pl.ban,
        "kick" => pl.kick,
        "redact" => pl.redact,
        "invite" => pl.invite,
        "events_default" => pl.events_default,
        "state_default" => pl.state_default,
        "users_default" => pl.users_default,
        _ => None,
    };
    let default = match field {
        "ban" => DEFAULT_BAN,
        "kick" => DEFAULT_KICK,
        "redact" => DEFAULT_BAN,
        "invite" => DEFAULT_INVITE,
        "events_default" => DEFAULT_EVENTS,
        "state_default" => DEFAULT_STATE,
        "users_default" => DEFAULT_EVENTS,
        _ => 0,
    };
    Some(value.as_ref().and_then(get_int).unwrap_or(default))
}

/// `get_user_power_level/2`: `users[user] || users_default || 0`, with the
/// creator defaulting to 100.
pub fn get_user_power_level(user: &UserId, snapshot: &StateSnapshot<'_>, rules: &AuthorizationRules) -> i64 {
    get_user_power_level_str(user.as_str(), snapshot, rules)
}

fn get_user_power_level_str(user: &str, snapshot: &StateSnapshot<'_>, rules: &AuthorizationRules) -> i64 {
    let pl = snapshot
        .get(&(ROOM_POWER_LEVELS.to_owned(), String::new()))
        .and_then(|e| e.power_levels_content());

    if let Some(pl) = &pl {
        if let Some(v) = pl.users.get(user).and_then(get_int) {
            return v;
        }
    }

    if creator_of(snapshot, rules).as_deref() == Some(user) {
        return AuthorizationRules::CREATOR_POWER_LEVEL;
    }

    pl.as_ref()
        .and_then(|pl| pl.users_default.as_ref())
        .and_then(get_int)
        .unwrap_or(DEFAULT_EVENTS)
}

/// `get_int/1`: an integer is itself; a numeric string parses to an integer.
pub fn get_int(value: &JsonValue) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    value.as_str().and_then(|s| s.parse::<i64>().ok())
}

fn strict_int(value: &JsonValue, rules: &AuthorizationRules) -> Option<i64> {
    if rules.enforce_int_power_levels {
        value.as_i64()
    } else {
        get_int(value)
    }
}

/// The power-levels delta check from §4.3.
fn check_power_levels_delta(
    event: &Event,
    sender_power: i64,
    snapshot: &StateSnapshot<'_>,
    rules: &AuthorizationRules,
) -> bool {
    let Some(new_pl) = event.power_levels_content() else {
        return false;
    };
    let old_pl = snapshot
        .get(&(ROOM_POWER_LEVELS.to_owned(), String::new()))
        .and_then(|e| e.power_levels_content())
        .unwrap_or_default();

    for user in new_pl.users.keys() {
        if crate::identifiers::UserId::parse(user.clone()).is_err() {
            return false;
        }
    }

    let scalar_fields: [fn(&crate::event::PowerLevelsContent) -> Option<&JsonValue>; 7] = [
        |p| p.ban.as_ref(),
        |p| p.kick.as_ref(),
        |p| p.redact.as_ref(),
        |p| p.invite.as_ref(),
        |p| p.events_default.as_ref(),
        |p| p.state_default.as_ref(),
        |p| p.users_default.as_ref(),
    ];
    for field in scalar_fields {
        if let (Some(old_v), Some(new_v)) = (field(&old_pl), field(&new_pl)) {
            let (old_i, new_i) = match (strict_int(old_v, rules), strict_int(new_v, rules)) {
                (Some(o), Some(n)) => (o, n),
                _ => return false,
            };
            if old_i != new_i && (old_i > sender_power || new_i > sender_power) {
                return false;
            }
        } else if field(&old_pl).is_some() != field(&new_pl).is_some() {
            let present = field(&old_pl).or_else(|| field(&new_pl)).unwrap();
            if strict_int(present, rules).is_none_or(|v| v > sender_power) {
                return false;
            }
        }
    }

    if !check_map_delta(&old_pl.events, &new_pl.events, sender_power, sender_power, rules) {
        return false;
    }
    if !check_map_delta(&old_pl.notifications, &new_pl.notifications, sender_power, sender_power, rules) {
        return false;
    }

    for user in old_pl.users.keys().chain(new_pl.users.keys()).collect::<std::collections::BTreeSet<_>>() {
        let old_v = old_pl.users.get(user).and_then(get_int);
        let new_v = new_pl.users.get(user).and_then(get_int);
        if old_v == new_v {
            continue;
        }
        let ceiling = if user.as_str() == event.sender.as_str() {
            sender_power
        } else {
            sender_power - 1
        };
        if let Some(old_v) = old_v {
            if old_v > sender_power {
                return false;
            }
        }
        if let Some(new_v) = new_v {
            if new_v > ceiling {
                return false;
            }
        }
    }

    true
}

fn check_map_delta(
    old: &BTreeMap<String, JsonValue>,
    new: &BTreeMap<String, JsonValue>,
    old_ceiling: i64,
    new_ceiling: i64,
    rules: &AuthorizationRules,
) -> bool {
    for key in old.keys().chain(new.keys()).collect::<std::collections::BTreeSet<_>>() {
        let old_v = old.get(key).and_then(|v| strict_int(v, rules));
        let new_v = new.get(key).and_then(|v| strict_int(v, rules));
        if old_v == new_v {
            continue;
        }
        if let Some(old_v) = old_v {
            if old_v > old_ceiling {
                return false;
            }
        }
        if let Some(new_v) = new_v {
            if new_v > new_ceiling {
                return false;
            }
        }
    }
    true
}
