//! Message and conversation model.
//!
//! [`WireMessage`] is what the REST API and the realtime channel carry;
//! [`Message`] is the decrypted view model held in a snapshot.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::ids::{ClientId, ConversationId, MessageId, UserId};

/// Unix time in milliseconds.
pub type Timestamp = u64;

/// Content shown in place of a message body that could not be decrypted.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[unable to decrypt message]";

/// Ciphertext of an end-to-end encrypted message body.
///
/// Both fields are standard base64.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Ciphertext including the authentication tag.
    pub ciphertext: String,
    /// Nonce used for this ciphertext.
    pub nonce: String,
    /// Version of the conversation key that sealed this payload.
    pub key_version: u32,
}

// Don't leak ciphertext in debug output
impl std::fmt::Debug for EncryptedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedPayload")
            .field(
                "ciphertext",
                &format!("[{} chars REDACTED]", self.ciphertext.len()),
            )
            .field("key_version", &self.key_version)
            .finish()
    }
}

/// Body of a message as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageBody {
    /// Body in the clear.
    Plain(String),
    /// Body sealed with the conversation key.
    Encrypted(EncryptedPayload),
}

/// A message as delivered by the REST API or the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Server-assigned id.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Message this one replies to, if any.
    #[serde(default)]
    pub parent_id: Option<MessageId>,
    /// Author.
    pub author_id: UserId,
    /// Body, possibly encrypted.
    pub body: MessageBody,
    /// Creation time.
    pub created_at: Timestamp,
    /// Time of the last edit.
    #[serde(default)]
    pub edited_at: Option<Timestamp>,
    /// Soft-deleted on the server.
    #[serde(default)]
    pub deleted: bool,
    /// Emoji to the set of users who reacted with it.
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    /// Users who have read the message.
    #[serde(default)]
    pub read_by: BTreeSet<UserId>,
    /// Token the sender attached, echoed back by the server.
    #[serde(default)]
    pub client_id: Option<ClientId>,
}

/// Whether the server has acknowledged a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryState {
    /// Known to the server.
    #[default]
    Confirmed,
    /// Optimistic, awaiting server confirmation.
    Pending,
}

/// A message in the view model.
///
/// Children are never stored; the thread tree derives them from `parent_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message id.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Message this one replies to, if any.
    pub parent_id: Option<MessageId>,
    /// Author.
    pub author_id: UserId,
    /// Plaintext content, or [`UNDECRYPTABLE_PLACEHOLDER`].
    pub content: String,
    /// Creation time.
    pub created_at: Timestamp,
    /// Time of the last edit.
    pub edited_at: Option<Timestamp>,
    /// Tombstone flag.
    pub deleted: bool,
    /// Emoji to the set of users who reacted with it.
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    /// Users who have read the message.
    pub read_by: BTreeSet<UserId>,
    /// Ordinal by creation time across the loaded set.
    pub chrono_index: usize,
    /// Content could not be decrypted.
    pub decrypt_failed: bool,
    /// Server acknowledgement state.
    pub delivery: DeliveryState,
    /// Send token, when known.
    pub client_id: Option<ClientId>,
}

impl Message {
    /// Build a view-model message from its wire form and resolved content.
    pub fn from_wire(wire: WireMessage, content: String, decrypt_failed: bool) -> Self {
        Self {
            id: wire.id,
            conversation_id: wire.conversation_id,
            parent_id: wire.parent_id,
            author_id: wire.author_id,
            content,
            created_at: wire.created_at,
            edited_at: wire.edited_at,
            deleted: wire.deleted,
            reactions: wire.reactions,
            read_by: wire.read_by,
            chrono_index: 0,
            decrypt_failed,
            delivery: DeliveryState::Confirmed,
            client_id: wire.client_id,
        }
    }

    /// Build an optimistic message that has not reached the server yet.
    pub fn local(
        conversation_id: ConversationId,
        client_id: ClientId,
        author_id: UserId,
        parent_id: Option<MessageId>,
        content: String,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: MessageId::local(&client_id),
            conversation_id,
            parent_id,
            author_id,
            content,
            created_at,
            edited_at: None,
            deleted: false,
            reactions: BTreeMap::new(),
            read_by: BTreeSet::new(),
            chrono_index: 0,
            decrypt_failed: false,
            delivery: DeliveryState::Pending,
            client_id: Some(client_id),
        }
    }

    /// True while awaiting server confirmation.
    pub fn is_pending(&self) -> bool {
        self.delivery == DeliveryState::Pending
    }

    /// Reactions to display. A tombstone shows none but keeps its sets.
    pub fn visible_reactions(&self) -> impl Iterator<Item = (&String, &BTreeSet<UserId>)> {
        let shown = !self.deleted;
        self.reactions.iter().filter(move |_| shown)
    }

    /// True if `user` reacted with `emoji`.
    pub fn has_reaction(&self, emoji: &str, user: &UserId) -> bool {
        self.reactions
            .get(emoji)
            .is_some_and(|users| users.contains(user))
    }
}

/// Visibility of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privacy {
    /// Anyone in the workspace may join.
    #[default]
    Public,
    /// Invite only.
    Private,
    /// One-to-one or small group direct message.
    Direct,
}

/// Encryption mode of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EncryptionState {
    /// Bodies travel in the clear.
    #[default]
    Plaintext,
    /// Bodies are sealed with a versioned conversation key.
    Encrypted {
        /// Current key version for new messages.
        key_version: u32,
    },
}

impl EncryptionState {
    /// True if new messages must be encrypted.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted { .. })
    }
}

/// A conversation container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation id.
    pub id: ConversationId,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Visibility.
    #[serde(default)]
    pub privacy: Privacy,
    /// Members.
    #[serde(default)]
    pub participants: BTreeSet<UserId>,
    /// Encryption mode.
    #[serde(default)]
    pub encryption: EncryptionState,
}

impl Conversation {
    /// A plaintext public conversation with no known members.
    pub fn new(id: ConversationId) -> Self {
        Self {
            title: id.to_string(),
            id,
            privacy: Privacy::default(),
            participants: BTreeSet::new(),
            encryption: EncryptionState::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(id: &str) -> WireMessage {
        WireMessage {
            id: MessageId::new(id),
            conversation_id: ConversationId::new("c"),
            parent_id: None,
            author_id: UserId::new("ada"),
            body: MessageBody::Plain("hello".into()),
            created_at: 10,
            edited_at: None,
            deleted: false,
            reactions: BTreeMap::new(),
            read_by: BTreeSet::new(),
            client_id: None,
        }
    }

    #[test]
    fn from_wire_is_confirmed() {
        let msg = Message::from_wire(wire("m1"), "hello".into(), false);
        assert_eq!(msg.delivery, DeliveryState::Confirmed);
        assert!(!msg.is_pending());
        assert_eq!(msg.chrono_index, 0);
    }

    #[test]
    fn local_message_is_pending_with_local_id() {
        let client = ClientId::new();
        let msg = Message::local(
            ConversationId::new("c"),
            client,
            UserId::new("ada"),
            None,
            "hi".into(),
            5,
        );
        assert!(msg.is_pending());
        assert!(msg.id.is_local());
        assert_eq!(msg.client_id, Some(client));
    }

    #[test]
    fn wire_message_defaults_optional_fields() {
        let json = r#"{
            "id": "m1",
            "conversation_id": "c",
            "author_id": "ada",
            "body": {"kind": "plain", "value": "hi"},
            "created_at": 7
        }"#;
        let msg: WireMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.parent_id, None);
        assert!(!msg.deleted);
        assert!(msg.reactions.is_empty());
    }

    #[test]
    fn encrypted_payload_debug_is_redacted() {
        let payload = EncryptedPayload {
            ciphertext: "c2VjcmV0".into(),
            nonce: "bm9uY2U=".into(),
            key_version: 3,
        };
        let debug = format!("{:?}", payload);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("c2VjcmV0"));
    }

    #[test]
    fn encryption_state_round_trips_through_json() {
        let state = EncryptionState::Encrypted { key_version: 2 };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"mode":"encrypted","key_version":2}"#);
        assert!(state.is_encrypted());
    }
}
