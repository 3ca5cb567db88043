use serde::Serialize;
use std::fmt;

use crate::errors::ConnectionError;

/// Wire value reserved to mean "no connection" / "no session".
pub const NULL_ID: u8 = 0;

macro_rules! byte_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $name(u8);

        impl $name {
            /// Wrap a raw wire id. The reserved sentinel yields `None`.
            pub const fn new(raw: u8) -> Option<Self> {
                if raw == NULL_ID {
                    None
                } else {
                    Some(Self(raw))
                }
            }

            pub const fn get(self) -> u8 {
                self.0
            }

            /// Decode an optional id from its wire byte (sentinel => `None`).
            pub const fn from_wire(raw: u8) -> Option<Self> {
                Self::new(raw)
            }

            /// Encode an optional id to its wire byte (`None` => sentinel).
            pub fn to_wire(id: Option<Self>) -> u8 {
                id.map_or(NULL_ID, Self::get)
            }
        }

        impl TryFrom<u8> for $name {
            type Error = ConnectionError;

            fn try_from(raw: u8) -> Result<Self, Self::Error> {
                Self::new(raw).ok_or(ConnectionError::ReservedId)
            }
        }

        impl From<$name> for u8 {
            fn from(id: $name) -> u8 {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $prefix, self.0)
            }
        }
    };
}

byte_id!(ConnectionId, "conn");
byte_id!(SessionId, "sess");
