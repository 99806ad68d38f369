//! Per-remote-server outbound transaction queue (`send_txn`, §4.6).
//!
//! Single in-flight request plus an ordered queue, per target server.
//! Incoming events needing forwarding are appended to the queue; when the
//! in-flight response arrives, a `200` drains the queue as a new batch,
//! anything else schedules a resend in 30s with the *same* `txn_id` and the
//! *same* PDUs, preserving idempotency on the remote side (§5, S6).

use std::collections::HashMap;
use std::time::Duration;

use room_engine_core::event::Pdu;
use tracing::{debug, warn};

/// 30 seconds, per §4.6/§5.
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct OutgoingTxn {
    pub txn_id: String,
    pub pdus: Vec<Pdu>,
}

#[derive(Default)]
struct ServerQueue {
    inflight: Option<OutgoingTxn>,
    queue: Vec<Pdu>,
}

/// Per-server outbound state, owned by the room actor.
#[derive(Default)]
pub struct OutboundTxns {
    servers: HashMap<String, ServerQueue>,
    next_txn_seq: u64,
}

/// What the caller should do as a result of notifying/acking.
pub enum Action {
    /// Send this transaction now (there was no in-flight request).
    SendNow(OutgoingTxn),
    /// Nothing to do right now; the event was queued behind an in-flight
    /// request.
    Queued,
    /// Nothing to send.
    Idle,
}

impl OutboundTxns {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_txn_id(&mut self) -> String {
        self.next_txn_seq += 1;
        format!("txn-{}", self.next_txn_seq)
    }

    /// A PDU needs delivering to `server`.
    pub fn notify(&mut self, server: &str, pdu: Pdu) -> Action {
        let entry = self.servers.entry(server.to_owned()).or_default();
        if entry.inflight.is_some() {
            entry.queue.push(pdu);
            return Action::Queued;
        }
        let txn_id = {
            self.next_txn_seq += 1;
            format!("txn-{}", self.next_txn_seq)
        };
        let entry = self.servers.get_mut(server).expect("entry just inserted");
        let txn = OutgoingTxn { txn_id, pdus: vec![pdu] };
        entry.inflight = Some(txn.clone());
        Action::SendNow(txn)
    }

    /// The in-flight request to `server` got a `200` response: drain the
    /// queue as a fresh batch, if any.
    pub fn ack_success(&mut self, server: &str) -> Option<OutgoingTxn> {
        let entry = self.servers.get_mut(server)?;
        entry.inflight = None;
        if entry.queue.is_empty() {
            return None;
        }
        let pdus = std::mem::take(&mut entry.queue);
        let txn_id = {
            self.next_txn_seq += 1;
            format!("txn-{}", self.next_txn_seq)
        };
        let entry = self.servers.get_mut(server)?;
        let txn = OutgoingTxn { txn_id, pdus };
        entry.inflight = Some(txn.clone());
        Some(txn)
    }

    /// The in-flight request to `server` failed (non-200 or transport
    /// error): the caller should schedule `resend_txn` in [`RETRY_DELAY`]
    /// with the same transaction unchanged.
    pub fn ack_failure(&mut self, server: &str) -> Option<OutgoingTxn> {
        let entry = self.servers.get(server)?;
        warn!(%server, "outbound transaction failed, will resend in 30s");
        entry.inflight.clone()
    }

    /// Resends the still-in-flight transaction for `server`, if any (a
    /// success may have superseded it before the timer fired).
    pub fn resend(&self, server: &str) -> Option<OutgoingTxn> {
        let txn = self.servers.get(server)?.inflight.clone();
        if txn.is_some() {
            debug!(%server, "resending outbound transaction after retry delay");
        }
        txn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pdu() -> Pdu {
        Pdu {
            kind: "m.room.message".into(),
            room_id: "!r:x".into(),
            sender: "@a:x".into(),
            depth: 1,
            auth_events: vec![],
            prev_events: vec![],
            origin_server_ts: 0,
            state_key: None,
            content: serde_json::json!({}),
            unsigned: Default::default(),
            redacts: None,
            rest: Default::default(),
        }
    }

    #[test]
    fn second_notify_queues_behind_inflight() {
        let mut txns = OutboundTxns::new();
        assert!(matches!(txns.notify("remote", pdu()), Action::SendNow(_)));
        assert!(matches!(txns.notify("remote", pdu()), Action::Queued));
    }

    #[test]
    fn success_drains_queue_preserving_order() {
        let mut txns = OutboundTxns::new();
        let first = match txns.notify("remote", pdu()) {
            Action::SendNow(t) => t,
            _ => panic!("expected SendNow"),
        };
        txns.notify("remote", pdu());
        txns.notify("remote", pdu());
        let next = txns.ack_success("remote").unwrap();
        assert_ne!(next.txn_id, first.txn_id);
        assert_eq!(next.pdus.len(), 2);
    }

    #[test]
    fn failure_resends_identical_txn_id_and_pdus() {
        let mut txns = OutboundTxns::new();
        let first = match txns.notify("remote", pdu()) {
            Action::SendNow(t) => t,
            _ => panic!("expected SendNow"),
        };
        let failed = txns.ack_failure("remote").unwrap();
        assert_eq!(failed.txn_id, first.txn_id);
        let resent = txns.resend("remote").unwrap();
        assert_eq!(resent.txn_id, first.txn_id);
        assert_eq!(resent.pdus.len(), first.pdus.len());
    }
}
