//! Identity types for threadsync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix carried by ids minted locally for unconfirmed messages.
const LOCAL_PREFIX: &str = "local:";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an id from its string form.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the string form.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Server-assigned identifier of a conversation.
    ConversationId
);

string_id!(
    /// Identifier of a message.
    ///
    /// Server-assigned once confirmed; optimistic messages carry a
    /// `local:` id until the server echo replaces them.
    MessageId
);

string_id!(
    /// Identifier of a participant.
    UserId
);

impl MessageId {
    /// Mint a local id for an optimistic message.
    pub fn local(client_id: &ClientId) -> Self {
        Self(format!("{LOCAL_PREFIX}{}", client_id.0))
    }

    /// True for ids minted by [`MessageId::local`].
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_PREFIX)
    }
}

/// Client-generated token attached to a send so its echo can be matched.
///
/// UUID v4 format.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(uuid::Uuid);

impl ClientId {
    /// Create a new random ClientId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ids_are_recognised() {
        let client = ClientId::new();
        let id = MessageId::local(&client);
        assert!(id.is_local());
        assert!(id.as_str().ends_with(&client.to_string()));
        assert!(!MessageId::new("m-1").is_local());
    }

    #[test]
    fn client_ids_are_unique() {
        assert_ne!(ClientId::new(), ClientId::new());
    }

    #[test]
    fn string_ids_serialize_transparently() {
        let id = ConversationId::new("general");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"general\"");
        let back: ConversationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn debug_names_the_kind() {
        assert_eq!(format!("{:?}", UserId::new("ada")), "UserId(ada)");
    }
}
