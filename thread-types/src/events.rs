//! Realtime channel events and REST paging types.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::ids::{ClientId, ConversationId, MessageId, UserId};
use crate::model::{Conversation, MessageBody, Timestamp, WireMessage};

/// Direction of a change to a reaction or read-receipt set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetChange {
    /// The user joined the set.
    Added,
    /// The user left the set.
    Removed,
}

/// An event pushed by the server over the persistent channel.
///
/// Encoded as JSON with a kebab-case `type` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelEvent {
    /// A message was posted.
    Created {
        /// The new message.
        message: WireMessage,
    },
    /// A message body was replaced.
    Edited {
        /// Owning conversation.
        conversation_id: ConversationId,
        /// Edited message.
        message_id: MessageId,
        /// New body.
        body: MessageBody,
        /// Time of the edit.
        edited_at: Timestamp,
    },
    /// A message was deleted.
    Deleted {
        /// Owning conversation.
        conversation_id: ConversationId,
        /// Deleted message.
        message_id: MessageId,
    },
    /// A reaction was added or removed.
    ReactionChanged {
        /// Owning conversation.
        conversation_id: ConversationId,
        /// Target message.
        message_id: MessageId,
        /// Reaction emoji.
        emoji: String,
        /// Reacting user.
        user_id: UserId,
        /// Added or removed.
        change: SetChange,
    },
    /// A read receipt was added or removed.
    ReadReceiptChanged {
        /// Owning conversation.
        conversation_id: ConversationId,
        /// Target message.
        message_id: MessageId,
        /// Reader.
        user_id: UserId,
        /// Added or removed.
        change: SetChange,
    },
    /// A conversation became visible to the viewer.
    ConversationCreated {
        /// The conversation.
        conversation: Conversation,
    },
    /// A conversation was removed.
    ConversationDeleted {
        /// Removed conversation.
        conversation_id: ConversationId,
    },
    /// A user joined a conversation.
    ParticipantAdded {
        /// Conversation joined.
        conversation_id: ConversationId,
        /// New member.
        user_id: UserId,
    },
    /// A user left a conversation.
    ParticipantRemoved {
        /// Conversation left.
        conversation_id: ConversationId,
        /// Departed member.
        user_id: UserId,
    },
    /// The conversation key was rotated.
    KeyRotated {
        /// Affected conversation.
        conversation_id: ConversationId,
        /// Version of the new key.
        key_version: u32,
    },
}

impl ChannelEvent {
    /// Parse a channel frame.
    pub fn from_json(frame: &str) -> Result<Self, SyncError> {
        serde_json::from_str(frame).map_err(|e| SyncError::MalformedEvent(e.to_string()))
    }

    /// Encode as a channel frame.
    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::InvalidData(e.to_string()))
    }

    /// Conversation this event belongs to.
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::Created { message } => &message.conversation_id,
            Self::ConversationCreated { conversation } => &conversation.id,
            Self::Edited {
                conversation_id, ..
            }
            | Self::Deleted {
                conversation_id, ..
            }
            | Self::ReactionChanged {
                conversation_id, ..
            }
            | Self::ReadReceiptChanged {
                conversation_id, ..
            }
            | Self::ConversationDeleted { conversation_id }
            | Self::ParticipantAdded {
                conversation_id, ..
            }
            | Self::ParticipantRemoved {
                conversation_id, ..
            }
            | Self::KeyRotated {
                conversation_id, ..
            } => conversation_id,
        }
    }

    /// Message this event targets, for message-level events.
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Created { message } => Some(&message.id),
            Self::Edited { message_id, .. }
            | Self::Deleted { message_id, .. }
            | Self::ReactionChanged { message_id, .. }
            | Self::ReadReceiptChanged { message_id, .. } => Some(message_id),
            _ => None,
        }
    }

    /// Wire tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Edited { .. } => "edited",
            Self::Deleted { .. } => "deleted",
            Self::ReactionChanged { .. } => "reaction-changed",
            Self::ReadReceiptChanged { .. } => "read-receipt-changed",
            Self::ConversationCreated { .. } => "conversation-created",
            Self::ConversationDeleted { .. } => "conversation-deleted",
            Self::ParticipantAdded { .. } => "participant-added",
            Self::ParticipantRemoved { .. } => "participant-removed",
            Self::KeyRotated { .. } => "key-rotated",
        }
    }
}

/// Parameters of a history fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Only messages strictly older than this one. `None` fetches the newest page.
    pub before: Option<MessageId>,
    /// Maximum number of messages to return.
    pub limit: u32,
}

impl FetchRequest {
    /// The newest page.
    pub fn latest(limit: u32) -> Self {
        Self {
            before: None,
            limit,
        }
    }

    /// The page immediately older than `before`.
    pub fn older(before: MessageId, limit: u32) -> Self {
        Self {
            before: Some(before),
            limit,
        }
    }
}

/// One page of history returned by the REST API.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FetchPage {
    /// Conversation metadata, when the server includes it.
    #[serde(default)]
    pub conversation: Option<Conversation>,
    /// Messages in any order.
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    /// Current members.
    #[serde(default)]
    pub participants: Vec<UserId>,
    /// The server holds older messages.
    #[serde(default)]
    pub has_more: bool,
}

/// A message submitted for sending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Message replied to.
    pub parent_id: Option<MessageId>,
    /// Body, encrypted if the conversation requires it.
    pub body: MessageBody,
    /// Token echoed back on the created event.
    pub client_id: ClientId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kebab_case_tag() {
        let frame = r#"{
            "type": "reaction-changed",
            "conversation_id": "c",
            "message_id": "m1",
            "emoji": "+1",
            "user_id": "ada",
            "change": "added"
        }"#;
        let event = ChannelEvent::from_json(frame).unwrap();
        assert_eq!(event.kind(), "reaction-changed");
        assert_eq!(event.conversation_id(), &ConversationId::new("c"));
        assert_eq!(event.message_id(), Some(&MessageId::new("m1")));
    }

    #[test]
    fn unknown_type_is_malformed() {
        let err = ChannelEvent::from_json(r#"{"type":"typing","conversation_id":"c"}"#)
            .unwrap_err();
        assert!(matches!(err, SyncError::MalformedEvent(_)));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            ChannelEvent::from_json("not json"),
            Err(SyncError::MalformedEvent(_))
        ));
    }

    #[test]
    fn directory_events_have_no_message() {
        let event = ChannelEvent::ConversationDeleted {
            conversation_id: ConversationId::new("c"),
        };
        assert_eq!(event.message_id(), None);
        let json = event.to_json().unwrap();
        assert!(json.contains("\"type\":\"conversation-deleted\""));
    }

    #[test]
    fn fetch_request_constructors() {
        assert_eq!(FetchRequest::latest(20).before, None);
        let older = FetchRequest::older(MessageId::new("m9"), 20);
        assert_eq!(older.before, Some(MessageId::new("m9")));
        assert_eq!(older.limit, 20);
    }
}
