//! Event codec (C1).
//!
//! Decodes a wire PDU into a fully-populated, immutable [`Event`]. Signature
//! and content-hash verification are delegated to the signing service
//! collaborator (§1) — this module only shapes the trait it expects and the
//! pure, local parts of the contract (required-field checks, canonical
//! content accessors, auth-key computation).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ProtocolError;
use crate::identifiers::{EventId, RoomId, UserId};
use crate::room_version::{AuthorizationRules, RoomVersionId};

pub const ROOM_CREATE: &str = "m.room.create";
pub const ROOM_MEMBER: &str = "m.room.member";
pub const ROOM_POWER_LEVELS: &str = "m.room.power_levels";
pub const ROOM_JOIN_RULES: &str = "m.room.join_rules";
pub const ROOM_THIRD_PARTY_INVITE: &str = "m.room.third_party_invite";
pub const ROOM_MESSAGE: &str = "m.room.message";
pub const ROOM_REDACTION: &str = "m.room.redaction";

/// `(event_type, state_key)`, the unit of room state.
pub type StateKey = (String, String);

/// The resolved room state after some event: `(type, state_key) -> event_id`.
pub type StateMap = BTreeMap<StateKey, EventId>;

/// The wire shape of a PDU, as received over federation or built locally.
/// Required fields are enforced by `Event::try_from_pdu`; everything else
/// round-trips through `content`/`unsigned` untouched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pdu {
    #[serde(rename = "type")]
    pub kind: String,
    pub room_id: String,
    pub sender: String,
    pub depth: i64,
    #[serde(default)]
    pub auth_events: Vec<String>,
    #[serde(default)]
    pub prev_events: Vec<String>,
    pub origin_server_ts: i64,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: JsonValue,
    #[serde(default)]
    pub unsigned: serde_json::Map<String, JsonValue>,
    #[serde(default)]
    pub redacts: Option<String>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, JsonValue>,
}

/// The maximum representable depth, per §3 ("capped at 2^63 - 1").
pub const MAX_DEPTH: i64 = i64::MAX;

/// A fully-decoded, immutable event. `state_map` starts `None` ("known but
/// not materialised") and may only ever transition to `Some` (invariant 5).
#[derive(Clone, Debug)]
pub struct Event {
    pub id: EventId,
    pub room_id: RoomId,
    pub kind: String,
    pub state_key: Option<String>,
    pub sender: UserId,
    pub depth: i64,
    pub auth_events: Vec<EventId>,
    pub prev_events: Vec<EventId>,
    pub origin_server_ts: i64,
    pub room_version: RoomVersionId,
    pub json: Pdu,
    pub state_map: Option<StateMap>,
}

impl Event {
    /// Decodes a `Pdu` into an `Event`, performing the required-field and
    /// shape checks from §4.1. `id` is supplied by the signing-service
    /// collaborator's `get_event_id`; this function does not compute it.
    pub fn from_pdu(pdu: Pdu, id: EventId, room_version: RoomVersionId) -> Result<Self, ProtocolError> {
        let room_id = RoomId::parse(pdu.room_id.clone())
            .map_err(|_| ProtocolError::Codec(format!("invalid room_id in event {id}")))?;
        let sender = UserId::parse(pdu.sender.clone())
            .map_err(|_| ProtocolError::Codec(format!("invalid sender in event {id}")))?;
        if pdu.kind.is_empty() {
            return Err(ProtocolError::Codec(format!("missing type field in event {id}")));
        }

        let auth_events = pdu
            .auth_events
            .iter()
            .cloned()
            .map(EventId::new)
            .collect();
        let prev_events = pdu
            .prev_events
            .iter()
            .cloned()
            .map(EventId::new)
            .collect();

        Ok(Self {
            id,
            room_id,
            kind: pdu.kind.clone(),
            state_key: pdu.state_key.clone(),
            sender,
            depth: pdu.depth.clamp(0, MAX_DEPTH),
            auth_events,
            prev_events,
            origin_server_ts: pdu.origin_server_ts,
            room_version,
            json: pdu,
            state_map: None,
        })
    }

    pub fn is_state_event(&self) -> bool {
        self.state_key.is_some()
    }

    /// `(type, state_key)` for this event, if it is a state event.
    pub fn state_key_pair(&self) -> Option<StateKey> {
        self.state_key.clone().map(|sk| (self.kind.clone(), sk))
    }

    pub fn content(&self) -> &JsonValue {
        &self.json.content
    }

    pub fn membership(&self) -> Option<MembershipState> {
        self.content()
            .get("membership")
            .and_then(JsonValue::as_str)
            .map(MembershipState::from)
    }

    pub fn join_rule(&self) -> Option<JoinRule> {
        self.content()
            .get("join_rule")
            .and_then(JsonValue::as_str)
            .map(JoinRule::from)
    }

    /// The `content.creator` field, if present (pre-v11 rooms only).
    pub fn explicit_creator(&self) -> Option<&str> {
        self.content().get("creator").and_then(JsonValue::as_str)
    }

    pub fn power_levels_content(&self) -> Option<PowerLevelsContent> {
        serde_json::from_value(self.content().clone()).ok()
    }

    pub fn join_authorised_via_users_server(&self) -> Option<String> {
        self.content()
            .get("join_authorised_via_users_server")
            .and_then(JsonValue::as_str)
            .map(str::to_owned)
    }

    pub fn third_party_invite_token(&self) -> Option<String> {
        self.content()
            .get("third_party_invite")
            .and_then(|tpi| tpi.get("signed"))
            .and_then(|signed| signed.get("token"))
            .and_then(JsonValue::as_str)
            .map(str::to_owned)
    }
}

/// `content.membership` values for `m.room.member`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipState {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
    Unknown,
}

impl From<&str> for MembershipState {
    fn from(s: &str) -> Self {
        match s {
            "join" => Self::Join,
            "invite" => Self::Invite,
            "leave" => Self::Leave,
            "ban" => Self::Ban,
            "knock" => Self::Knock,
            _ => Self::Unknown,
        }
    }
}

impl MembershipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Invite => "invite",
            Self::Leave => "leave",
            Self::Ban => "ban",
            Self::Knock => "knock",
            Self::Unknown => "unknown",
        }
    }
}

/// `content.join_rule` values for `m.room.join_rules`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinRule {
    Public,
    Invite,
    Knock,
    Restricted,
    KnockRestricted,
    Private,
    Unknown,
}

impl From<&str> for JoinRule {
    fn from(s: &str) -> Self {
        match s {
            "public" => Self::Public,
            "invite" => Self::Invite,
            "knock" => Self::Knock,
            "restricted" => Self::Restricted,
            "knock_restricted" => Self::KnockRestricted,
            "private" => Self::Private,
            _ => Self::Unknown,
        }
    }
}

/// `m.room.power_levels` content, deserialised loosely (numeric-string power
/// values are accepted here; the strict-integer check lives in `auth`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PowerLevelsContent {
    #[serde(default)]
    pub ban: Option<JsonValue>,
    #[serde(default)]
    pub kick: Option<JsonValue>,
    #[serde(default)]
    pub redact: Option<JsonValue>,
    #[serde(default)]
    pub invite: Option<JsonValue>,
    #[serde(default)]
    pub events_default: Option<JsonValue>,
    #[serde(default)]
    pub state_default: Option<JsonValue>,
    #[serde(default)]
    pub users_default: Option<JsonValue>,
    #[serde(default)]
    pub events: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub users: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub notifications: BTreeMap<String, JsonValue>,
}

/// `compute_event_auth_keys/1` from §4.6's `fill_event` description: the
/// `(type, state_key)` pairs an event of this shape needs authorising
/// against.
pub fn compute_event_auth_keys(
    kind: &str,
    sender: &UserId,
    state_key: Option<&str>,
    content: &JsonValue,
    rules: &AuthorizationRules,
) -> Vec<StateKey> {
    if kind == ROOM_CREATE {
        return Vec::new();
    }

    let mut keys = vec![
        (ROOM_CREATE.to_owned(), String::new()),
        (ROOM_POWER_LEVELS.to_owned(), String::new()),
        (ROOM_MEMBER.to_owned(), sender.to_string()),
    ];

    if kind == ROOM_MEMBER {
        if let Some(state_key) = state_key {
            push_unique(&mut keys, (ROOM_MEMBER.to_owned(), state_key.to_owned()));
        }

        let membership = content
            .get("membership")
            .and_then(JsonValue::as_str)
            .map(MembershipState::from);

        match membership {
            Some(MembershipState::Join) => {
                push_unique(&mut keys, (ROOM_JOIN_RULES.to_owned(), String::new()));
                if let Some(authoriser) = content
                    .get("join_authorised_via_users_server")
                    .and_then(JsonValue::as_str)
                {
                    push_unique(&mut keys, (ROOM_MEMBER.to_owned(), authoriser.to_owned()));
                }
            }
            Some(MembershipState::Invite) => {
                push_unique(&mut keys, (ROOM_JOIN_RULES.to_owned(), String::new()));
                if let Some(token) = content
                    .get("third_party_invite")
                    .and_then(|tpi| tpi.get("signed"))
                    .and_then(|signed| signed.get("token"))
                    .and_then(JsonValue::as_str)
                {
                    push_unique(&mut keys, (ROOM_THIRD_PARTY_INVITE.to_owned(), token.to_owned()));
                }
            }
            Some(MembershipState::Knock) => {
                push_unique(&mut keys, (ROOM_JOIN_RULES.to_owned(), String::new()));
            }
            _ => {}
        }
    }

    let _ = rules;
    keys
}

fn push_unique(keys: &mut Vec<StateKey>, key: StateKey) {
    if !keys.contains(&key) {
        keys.push(key);
    }
}
