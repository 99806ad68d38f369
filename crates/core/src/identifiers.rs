//! Matrix identifier newtypes.
//!
//! Validated once at construction (`parse`/`FromStr`), never re-validated at
//! the point of use. Kept deliberately small: this crate only ever needs to
//! compare, hash and print identifiers, not manipulate their internals.

use std::fmt;
use std::str::FromStr;

use crate::error::{IdParseError, IdParseErrorKind};

macro_rules! opaque_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Returns the string representation.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes `self`, returning the inner `String`.
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

opaque_id!(EventId, "An opaque Matrix event id, e.g. `$abc123`.");
opaque_id!(ServerName, "A DNS name or `host:port`, e.g. `matrix.org`.");

impl FromStr for ServerName {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdParseError::new(IdParseErrorKind::Empty));
        }
        Ok(Self(s.to_owned()))
    }
}

impl EventId {
    /// Builds an event id from an already-hashed opaque string (no `$`
    /// prefix enforced — room versions differ on reference-hash framing and
    /// that framing is the signing service's concern, not ours).
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

/// A Matrix room id: `!<18 base62 chars>:<server name>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// The 52-letter alphabet used to generate the localpart, per §6.
    pub const LOCALPART_ALPHABET: &'static [u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

    /// Parses and validates a room id.
    pub fn parse(s: impl Into<String>) -> Result<Self, IdParseError> {
        let s = s.into();
        validate_sigil_id(&s, '!')?;
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after `:`, i.e. the room's origin server.
    pub fn server_name(&self) -> &str {
        server_part(&self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A Matrix user id: `@localpart:server`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn parse(s: impl Into<String>) -> Result<Self, IdParseError> {
        let s = s.into();
        validate_sigil_id(&s, '@')?;
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn server_name(&self) -> &str {
        server_part(&self.0)
    }

    pub fn localpart(&self) -> &str {
        &self.0[1..self.0.len() - self.server_name().len() - 1]
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Checks the common `<sigil><localpart>:<server>` shape shared by room and
/// user ids.
fn validate_sigil_id(s: &str, sigil: char) -> Result<(), IdParseError> {
    if !s.starts_with(sigil) {
        return Err(IdParseError::new(IdParseErrorKind::MissingSigil(sigil)));
    }
    if !s.contains(':') {
        return Err(IdParseError::new(IdParseErrorKind::MissingColon));
    }
    if s.len() < 3 {
        return Err(IdParseError::new(IdParseErrorKind::Empty));
    }
    Ok(())
}

fn server_part(s: &str) -> &str {
    match s.find(':') {
        Some(idx) => &s[idx + 1..],
        None => "",
    }
}

/// Generates a fresh room id using 18 bytes of cryptographic entropy mapped
/// onto the 52-letter alphabet, per §6.
pub fn generate_room_id(server_name: &str, mut entropy: impl FnMut(usize) -> u8) -> RoomId {
    let mut localpart = String::with_capacity(18);
    for i in 0..18 {
        let idx = (entropy(i) as usize) % RoomId::LOCALPART_ALPHABET.len();
        localpart.push(RoomId::LOCALPART_ALPHABET[idx] as char);
    }
    RoomId(format!("!{localpart}:{server_name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_parses_localpart_and_server() {
        let id = UserId::parse("@alice:example.org").unwrap();
        assert_eq!(id.localpart(), "alice");
        assert_eq!(id.server_name(), "example.org");
    }

    #[test]
    fn room_id_rejects_missing_sigil() {
        assert!(RoomId::parse("r:example.org").is_err());
    }

    #[test]
    fn generate_room_id_uses_alphabet_only() {
        let mut counter = 0u8;
        let id = generate_room_id("x", |_| {
            counter = counter.wrapping_add(7);
            counter
        });
        let local = &id.as_str()[1..id.as_str().len() - 2];
        assert_eq!(local.len(), 18);
        assert!(local.bytes().all(|b| RoomId::LOCALPART_ALPHABET.contains(&b)));
    }
}
