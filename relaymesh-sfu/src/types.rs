//! Common identifier types used throughout the SFU implementation
//!
//! Every entity is referenced by an opaque string id and looked up through the
//! session registry; no entity holds a direct reference to another.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

define_id!(
    /// Unique identifier for an SFU room
    RoomId
);
define_id!(
    /// Unique identifier for a connected signaling peer
    PeerId
);
define_id!(
    /// Engine worker identifier
    WorkerId
);
define_id!(
    /// Engine router identifier
    RouterId
);
define_id!(
    /// Engine transport identifier
    TransportId
);
define_id!(
    /// Engine producer identifier
    ProducerId
);
define_id!(
    /// Engine consumer identifier
    ConsumerId
);

impl PeerId {
    /// Generate a fresh peer id for a newly opened channel
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }
}
