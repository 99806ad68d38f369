//! Trait boundaries for the named collaborators from §1: the federation
//! HTTP client and the signing service. Neither is implemented here — the
//! room actor only ever calls through these traits.

use std::collections::BTreeMap;

use room_engine_core::event::Pdu;
use room_engine_core::{EventId, RoomVersionId};
use serde_json::Value as JsonValue;

/// Extra per-request knobs (timeout override, retry policy, …); left opaque
/// since the federation client owns that policy.
#[derive(Clone, Debug, Default)]
pub struct RequestOpts {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request to {server} timed out")]
    Timeout { server: String },
    #[error("{server} responded {status}: {reason}")]
    NonSuccess { server: String, status: u16, reason: String },
}

/// `send_request(host, method, server, path, query, body, opts)` (§1).
/// Outgoing bodies are canonical-JSON and signed by the implementation;
/// this trait only shapes the call, per §6.
#[async_trait::async_trait]
pub trait FederationClient: Send + Sync {
    async fn send_request(
        &self,
        host: &str,
        method: http::Method,
        server: &str,
        path: &str,
        query: &BTreeMap<String, String>,
        body: Option<JsonValue>,
        opts: RequestOpts,
    ) -> Result<JsonValue, TransportError>;
}

/// `sign_event`, `check_signature`, `content_hash`, `get_event_id`,
/// `prune_event` (§1) — canonical JSON and server-key logic the signing
/// service owns; the auth engine and DAG store never reimplement it.
#[async_trait::async_trait]
pub trait SigningService: Send + Sync {
    async fn sign_event(&self, pdu: Pdu, room_version: RoomVersionId) -> Pdu;

    async fn check_signature(&self, host: &str, pdu: &Pdu, room_version: RoomVersionId) -> bool;

    fn content_hash_matches(&self, pdu: &Pdu) -> bool;

    fn get_event_id(&self, pdu: &Pdu, room_version: RoomVersionId) -> EventId;

    fn prune_event(&self, pdu: &Pdu, room_version: RoomVersionId) -> Pdu;
}

/// `check_event_sig_and_hash/2` (§4.1): verifies signatures on the pruned
/// form, then the content hash; on a hash mismatch the event is kept
/// (signature-valid) but its `json` is replaced by the pruned form.
pub async fn check_event_sig_and_hash(
    signing: &dyn SigningService,
    host: &str,
    pdu: Pdu,
    room_version: RoomVersionId,
) -> Result<Pdu, room_engine_core::ProtocolError> {
    let id = signing.get_event_id(&pdu, room_version);
    let pruned = signing.prune_event(&pdu, room_version);
    if !signing.check_signature(host, &pruned, room_version).await {
        return Err(room_engine_core::ProtocolError::InvalidSignature(id));
    }
    if signing.content_hash_matches(&pdu) {
        Ok(pdu)
    } else {
        Ok(pruned)
    }
}
