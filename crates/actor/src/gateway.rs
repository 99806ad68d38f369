//! Gateway bridge (C7).
//!
//! Maps between local user ids and Matrix user ids, escapes/unescapes the
//! reserved characters used to fold a remote Matrix id into a single JID
//! localpart, and projects selected room events back to the gateway.
//!
//! The escape table and the `%` separator are bit-exact per §6 — a test
//! suite elsewhere pins them, so don't "clean up" this list.

use room_engine_core::UserId;

/// Reserved bytes escaped as `\HH` (lowercase hex), per §4.7. The backslash
/// itself is in this list, which is what keeps `unescape` unambiguous:
/// every literal backslash in the output was put there by `escape`.
const RESERVED: &[u8] = b" \"%&'/:<>@\\";

/// Reversible percent-less encoding of the reserved character set.
pub fn escape(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    for &byte in input {
        if RESERVED.contains(&byte) {
            out.push_str(&format!("\\{byte:02x}"));
        } else {
            out.push(byte as char);
        }
    }
    out
}

/// Inverse of [`escape`].
pub fn unescape(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(value) = u8::from_str_radix(hex, 16) {
                    out.push(value);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// A destination in the gateway's own addressing scheme.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Jid {
    pub user: String,
    pub host: String,
}

/// `user_id_to_jid/1` (§4.7): local users map straight through; everyone
/// else is folded into a single gateway-service JID localpart.
pub fn user_id_to_jid(user_id: &UserId, matrix_domain: &str, service_host: &str, local_host: &str) -> Jid {
    if user_id.server_name() == matrix_domain {
        Jid {
            user: user_id.localpart().to_owned(),
            host: local_host.to_owned(),
        }
    } else {
        let escaped_user = escape(user_id.localpart().as_bytes());
        let escaped_server = escape(user_id.server_name().as_bytes());
        Jid {
            user: format!("{escaped_user}%{escaped_server}"),
            host: service_host.to_owned(),
        }
    }
}

/// The seven-PDU direct-chat seed template from §9: `create`, the
/// creator's self-join, `power_levels`, `join_rules`, `history_visibility`,
/// `guest_access`, `invite`, then the opening `message`. Emitted in this
/// order; callers append their own content per slot.
pub const DIRECT_CHAT_SEED_ORDER: [&str; 8] = [
    "m.room.create",
    "m.room.member", // creator's self-join
    "m.room.power_levels",
    "m.room.join_rules",
    "m.room.history_visibility",
    "m.room.guest_access",
    "m.room.member", // invite of the remote user
    "m.room.message",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_reserved_characters() {
        let raw = b" \"%&'/:<>@\\hello".to_vec();
        assert_eq!(unescape(&escape(&raw)), raw);
    }

    #[test]
    fn roundtrip_arbitrary_bytes() {
        for sample in [
            Vec::new(),
            b"plain-ascii".to_vec(),
            b"@alice:example.org".to_vec(),
            vec![0u8, 1, 2, 255, b'\\', b'@'],
        ] {
            assert_eq!(unescape(&escape(&sample)), sample);
        }
    }

    #[test]
    fn user_id_to_jid_local_passes_through() {
        let user = UserId::parse("@alice:matrix.example").unwrap();
        let jid = user_id_to_jid(&user, "matrix.example", "gateway.example", "local.example");
        assert_eq!(jid.user, "alice");
        assert_eq!(jid.host, "local.example");
    }

    #[test]
    fn user_id_to_jid_remote_is_escaped_and_joined_with_percent() {
        let user = UserId::parse("@bob:remote.example").unwrap();
        let jid = user_id_to_jid(&user, "matrix.example", "gateway.example", "local.example");
        assert_eq!(jid.user, "bob%remote.example");
        assert_eq!(jid.host, "gateway.example");
    }

    #[test]
    fn direct_chat_seed_starts_with_create_and_ends_with_message() {
        assert_eq!(DIRECT_CHAT_SEED_ORDER[0], "m.room.create");
        assert_eq!(DIRECT_CHAT_SEED_ORDER[DIRECT_CHAT_SEED_ORDER.len() - 1], "m.room.message");
    }
}
