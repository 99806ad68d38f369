//! The asynchronous half of the room engine: one actor per room, the
//! in-memory event DAG it owns, the crash-safe process directory, the named
//! federation collaborators, and the XMPP gateway bridge (C4, C6, C7, C8).
//!
//! `room-engine-core` never appears here except as the pure types and
//! algorithms this crate drives against a concrete, owned `EventGraph`.

pub mod collaborators;
pub mod dag;
pub mod gateway;
pub mod registry;
pub mod room_actor;

pub use collaborators::{FederationClient, RequestOpts, SigningService, TransportError};
pub use dag::{EventGraph, StoreNotifier};
pub use registry::{DirectKey, Registry, Supervisor};
pub use room_actor::{ClientState, GatewayConfig, LeaveReason, RoomActorHandle, RoomData, spawn};
