//! Event codec, room-version profiles, auth rules and Matrix state
//! resolution v2 — the synchronous, side-effect-free core of a federation
//! room engine (C1, C2, C3, C5 from the design document).
//!
//! This crate never touches the network or the filesystem; the room actor
//! (`room-engine-actor`) drives it against an in-memory event DAG.

pub mod auth;
pub mod error;
pub mod event;
pub mod identifiers;
pub mod room_version;
pub mod state_res;

pub use error::{AuthError, ProtocolError, RoomError, RoomResult};
pub use event::{Event, Pdu, StateKey, StateMap};
pub use identifiers::{EventId, RoomId, ServerName, UserId};
pub use room_version::{AuthorizationRules, RoomVersionId, binary_to_room_version};
