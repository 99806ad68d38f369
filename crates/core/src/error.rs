//! Error taxonomy for the room engine.
//!
//! Grouped by kind rather than by originating component, matching §7 of the
//! specification and the teacher's `MatrixError` style of named,
//! `thiserror`-derived constructors carrying just enough context to log and
//! to convert into an `(error, reason)` actor reply.

use thiserror::Error;

use crate::identifiers::EventId;

/// Top-level room-engine error.
#[derive(Debug, Error, Clone)]
pub enum RoomError {
    #[error("room not found")]
    RoomNotFound,

    #[error("event not found: {0}")]
    EventNotFound(EventId),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("transport error: {0}")]
    Transport(String),
}

impl RoomError {
    pub fn event_not_found(id: impl Into<EventId>) -> Self {
        Self::EventNotFound(id.into())
    }
}

/// Malformed or inconsistent event data — recoverable at the protocol layer
/// (log, reject the one event) rather than fatal to the actor.
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("invalid signature on event {0}")]
    InvalidSignature(EventId),

    /// Recoverable: the caller should retry with `event.json` replaced by
    /// its pruned form, per §4.1.
    #[error("mismatched content hash on event {0}")]
    MismatchedContentHash(EventId),

    #[error("event {id} has room_id {found} but expected {expected}")]
    MismatchedRoomId {
        id: EventId,
        expected: String,
        found: String,
    },

    #[error("state event {0} is missing a state_key")]
    MissedStateKey(EventId),

    #[error("event {0} has no materialised state_map")]
    MissedStateMap(EventId),

    #[error("event {0} references an unknown prev_event")]
    MissedPrevEvent(EventId),

    #[error("unknown event {0}")]
    UnknownEvent(EventId),

    #[error("loop detected in auth chain")]
    LoopInAuthChain,

    #[error("{0}")]
    Codec(String),
}

/// Authorisation-layer failures.
#[derive(Debug, Error, Clone)]
pub enum AuthError {
    #[error("event {0} failed auth checks")]
    EventAuthError(EventId),

    #[error("not invited")]
    NotInvited,

    #[error("incompatible room version: {0}")]
    IncompatibleVersion(String),

    #[error("not allowed")]
    NotAllowed,
}

pub type RoomResult<T> = Result<T, RoomError>;

/// Failure parsing a Matrix identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid identifier: {kind}")]
pub struct IdParseError {
    kind: IdParseErrorKind,
}

impl IdParseError {
    pub fn new(kind: IdParseErrorKind) -> Self {
        Self { kind }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdParseErrorKind {
    #[error("empty or too short")]
    Empty,
    #[error("missing leading sigil '{0}'")]
    MissingSigil(char),
    #[error("missing ':' separating localpart from server name")]
    MissingColon,
}
