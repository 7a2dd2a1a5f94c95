//! Message builders shared by the unit tests.

use std::collections::HashMap;
use threadsync_types::{
    ClientId, Conversation, ConversationId, Message, MessageBody, MessageId, UserId, WireMessage,
};

use crate::snapshot::Snapshot;

pub const CONVERSATION: &str = "general";

pub fn conversation() -> Conversation {
    Conversation::new(ConversationId::new(CONVERSATION))
}

pub fn msg(id: &str, parent: Option<&str>, created_at: u64) -> Message {
    let wire = WireMessage {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(CONVERSATION),
        parent_id: parent.map(MessageId::new),
        author_id: UserId::new("ada"),
        body: MessageBody::Plain(format!("message {id}")),
        created_at,
        edited_at: None,
        deleted: false,
        reactions: Default::default(),
        read_by: Default::default(),
        client_id: None,
    };
    let content = format!("message {id}");
    Message::from_wire(wire, content, false)
}

pub fn deleted(id: &str, parent: Option<&str>, created_at: u64) -> Message {
    let mut m = msg(id, parent, created_at);
    m.deleted = true;
    m
}

pub fn pending(content: &str, parent: Option<&str>, created_at: u64) -> Message {
    Message::local(
        ConversationId::new(CONVERSATION),
        ClientId::new(),
        UserId::new("ada"),
        parent.map(MessageId::new),
        content.to_string(),
        created_at,
    )
}

pub fn map(messages: Vec<Message>) -> HashMap<MessageId, Message> {
    messages.into_iter().map(|m| (m.id.clone(), m)).collect()
}

pub fn snapshot(messages: Vec<Message>, has_more: bool) -> Snapshot {
    Snapshot::from_messages(conversation(), messages, has_more)
}

pub fn ids(list: &[MessageId]) -> Vec<&str> {
    list.iter().map(|id| id.as_str()).collect()
}
