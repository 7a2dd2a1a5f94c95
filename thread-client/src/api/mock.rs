//! In-memory REST server for testing.
//!
//! Holds per-conversation history, pages it the way a real server would,
//! assigns `srv-N` ids to sent messages, and can echo every mutation onto a
//! [`MockChannel`] like a server broadcasting to its subscribers.
//!
//! Requests can be held in flight with [`MockApi::gate_fetches`] /
//! [`MockApi::gate_sends`] and let through one at a time, which is how tests
//! stage races between responses and channel events.

use super::{ApiError, RestApi};
use crate::channel::MockChannel;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use threadsync_types::{
    ChannelEvent, Conversation, ConversationId, FetchPage, FetchRequest, MessageBody, MessageId,
    OutgoingMessage, SetChange, Timestamp, UserId, WireMessage,
};
use tokio::sync::Semaphore;

/// In-memory REST server for testing.
#[derive(Debug, Default)]
pub struct MockApi {
    inner: Arc<Mutex<MockApiInner>>,
}

#[derive(Debug)]
struct ServerConversation {
    conversation: Conversation,
    /// Sorted by `(created_at, id)`.
    messages: Vec<WireMessage>,
}

#[derive(Debug)]
struct MockApiInner {
    actor: UserId,
    conversations: HashMap<ConversationId, ServerConversation>,
    next_id: u64,
    clock: Timestamp,
    requests: Vec<(ConversationId, FetchRequest)>,
    sent: Vec<OutgoingMessage>,
    fail_next_fetch: Option<ApiError>,
    fail_next_send: Option<ApiError>,
    fail_next_mutation: Option<ApiError>,
    fetch_gate: Option<Arc<Semaphore>>,
    send_gate: Option<Arc<Semaphore>>,
    echo: Option<MockChannel>,
}

impl Default for MockApiInner {
    fn default() -> Self {
        Self {
            actor: UserId::new("me"),
            conversations: HashMap::new(),
            next_id: 1,
            clock: 0,
            requests: Vec::new(),
            sent: Vec::new(),
            fail_next_fetch: None,
            fail_next_send: None,
            fail_next_mutation: None,
            fetch_gate: None,
            send_gate: None,
            echo: None,
        }
    }
}

impl MockApiInner {
    fn tick(&mut self) -> Timestamp {
        self.clock += 1;
        self.clock
    }

    fn broadcast(&self, event: ChannelEvent) {
        if let Some(channel) = &self.echo {
            if let Ok(frame) = event.to_json() {
                channel.push_frame(frame);
            }
        }
    }

    fn message_mut(
        &mut self,
        conversation: &ConversationId,
        id: &MessageId,
    ) -> Result<&mut WireMessage, ApiError> {
        self.conversations
            .get_mut(conversation)
            .ok_or_else(|| ApiError::NotFound(format!("conversation {conversation}")))?
            .messages
            .iter_mut()
            .find(|m| &m.id == id)
            .ok_or_else(|| ApiError::NotFound(format!("message {id}")))
    }

    fn insert_sorted(&mut self, message: WireMessage) -> Result<(), ApiError> {
        self.clock = self.clock.max(message.created_at);
        let server = self
            .conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| ApiError::NotFound(format!("conversation {}", message.conversation_id)))?;
        let key = (message.created_at, message.id.clone());
        let at = server
            .messages
            .partition_point(|m| (m.created_at, m.id.clone()) < key);
        server.messages.insert(at, message);
        Ok(())
    }
}

async fn pass_gate(gate: Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        // A closed gate lets everyone through.
        if let Ok(permit) = gate.acquire().await {
            permit.forget();
        }
    }
}

impl MockApi {
    /// Create an empty server acting for user `me`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute mutations to `actor`.
    pub fn set_actor(&self, actor: UserId) {
        let mut inner = self.inner.lock().unwrap();
        inner.actor = actor;
    }

    /// Broadcast every accepted mutation onto `channel`.
    pub fn echo_to(&self, channel: MockChannel) {
        let mut inner = self.inner.lock().unwrap();
        inner.echo = Some(channel);
    }

    /// Create a conversation with existing history.
    pub fn seed(&self, conversation: Conversation, messages: Vec<WireMessage>) {
        let mut inner = self.inner.lock().unwrap();
        inner.conversations.insert(
            conversation.id.clone(),
            ServerConversation {
                conversation,
                messages: Vec::new(),
            },
        );
        for message in messages {
            // The conversation was just inserted, so this cannot miss.
            let _ = inner.insert_sorted(message);
        }
    }

    /// Store a message posted by someone else and broadcast it.
    pub fn insert_remote(&self, message: WireMessage) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.insert_sorted(message.clone())?;
        inner.broadcast(ChannelEvent::Created { message });
        Ok(())
    }

    /// Server-side history of a conversation, oldest first.
    pub fn history(&self, conversation: &ConversationId) -> Vec<WireMessage> {
        let inner = self.inner.lock().unwrap();
        inner
            .conversations
            .get(conversation)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// Every history request received, including ones still gated.
    pub fn requests(&self) -> Vec<(ConversationId, FetchRequest)> {
        let inner = self.inner.lock().unwrap();
        inner.requests.clone()
    }

    /// Number of history requests received.
    pub fn fetch_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.requests.len()
    }

    /// Every message submitted, including ones still gated.
    pub fn sent_messages(&self) -> Vec<OutgoingMessage> {
        let inner = self.inner.lock().unwrap();
        inner.sent.clone()
    }

    /// Cause the next fetch to fail with a network error.
    pub fn fail_next_fetch(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_fetch = Some(ApiError::Network(error.to_string()));
    }

    /// Cause the next send to fail with a network error.
    pub fn fail_next_send(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_send = Some(ApiError::Network(error.to_string()));
    }

    /// Cause the next edit, delete, reaction or read mark to fail.
    pub fn fail_next_mutation(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_mutation = Some(ApiError::Network(error.to_string()));
    }

    /// Hold every fetch until released.
    pub fn gate_fetches(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.fetch_gate = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `n` held fetches through, oldest first.
    pub fn release_fetches(&self, n: usize) {
        let inner = self.inner.lock().unwrap();
        if let Some(gate) = &inner.fetch_gate {
            gate.add_permits(n);
        }
    }

    /// Stop holding fetches and release every waiting one.
    pub fn open_fetches(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(gate) = inner.fetch_gate.take() {
            gate.close();
        }
    }

    /// Hold every send until released.
    pub fn gate_sends(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.send_gate = Some(Arc::new(Semaphore::new(0)));
    }

    /// Stop holding sends and release every waiting one.
    pub fn open_sends(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(gate) = inner.send_gate.take() {
            gate.close();
        }
    }
}

impl Clone for MockApi {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl RestApi for MockApi {
    async fn fetch_snapshot(
        &self,
        conversation: &ConversationId,
        request: FetchRequest,
    ) -> Result<FetchPage, ApiError> {
        let gate = {
            let mut inner = self.inner.lock().unwrap();
            inner.requests.push((conversation.clone(), request.clone()));
            inner.fetch_gate.clone()
        };
        pass_gate(gate).await;

        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.fail_next_fetch.take() {
            return Err(error);
        }
        let server = inner
            .conversations
            .get(conversation)
            .ok_or_else(|| ApiError::NotFound(format!("conversation {conversation}")))?;

        let end = match &request.before {
            None => server.messages.len(),
            Some(before) => server
                .messages
                .iter()
                .position(|m| &m.id == before)
                .ok_or_else(|| ApiError::NotFound(format!("message {before}")))?,
        };
        let start = end.saturating_sub(request.limit as usize);

        Ok(FetchPage {
            conversation: Some(server.conversation.clone()),
            messages: server.messages[start..end].to_vec(),
            participants: server.conversation.participants.iter().cloned().collect(),
            has_more: start > 0,
        })
    }

    async fn send_message(&self, message: OutgoingMessage) -> Result<WireMessage, ApiError> {
        let gate = {
            let mut inner = self.inner.lock().unwrap();
            inner.sent.push(message.clone());
            inner.send_gate.clone()
        };
        pass_gate(gate).await;

        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.fail_next_send.take() {
            return Err(error);
        }
        let id = MessageId::new(format!("srv-{}", inner.next_id));
        inner.next_id += 1;
        let wire = WireMessage {
            id,
            conversation_id: message.conversation_id,
            parent_id: message.parent_id,
            author_id: inner.actor.clone(),
            body: message.body,
            created_at: inner.tick(),
            edited_at: None,
            deleted: false,
            reactions: Default::default(),
            read_by: Default::default(),
            client_id: Some(message.client_id),
        };
        inner.insert_sorted(wire.clone())?;
        inner.broadcast(ChannelEvent::Created {
            message: wire.clone(),
        });
        Ok(wire)
    }

    async fn edit_message(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
        body: MessageBody,
    ) -> Result<Timestamp, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.fail_next_mutation.take() {
            return Err(error);
        }
        let edited_at = inner.tick();
        let message = inner.message_mut(conversation, id)?;
        message.body = body.clone();
        message.edited_at = Some(edited_at);
        inner.broadcast(ChannelEvent::Edited {
            conversation_id: conversation.clone(),
            message_id: id.clone(),
            body,
            edited_at,
        });
        Ok(edited_at)
    }

    async fn delete_message(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
    ) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.fail_next_mutation.take() {
            return Err(error);
        }
        let message = inner.message_mut(conversation, id)?;
        message.deleted = true;
        message.body = MessageBody::Plain(String::new());
        inner.broadcast(ChannelEvent::Deleted {
            conversation_id: conversation.clone(),
            message_id: id.clone(),
        });
        Ok(())
    }

    async fn set_reaction(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
        emoji: &str,
        change: SetChange,
    ) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.fail_next_mutation.take() {
            return Err(error);
        }
        let actor = inner.actor.clone();
        let message = inner.message_mut(conversation, id)?;
        match change {
            SetChange::Added => {
                message
                    .reactions
                    .entry(emoji.to_string())
                    .or_default()
                    .insert(actor.clone());
            }
            SetChange::Removed => {
                if let Some(users) = message.reactions.get_mut(emoji) {
                    users.remove(&actor);
                }
                message.reactions.retain(|_, users| !users.is_empty());
            }
        }
        inner.broadcast(ChannelEvent::ReactionChanged {
            conversation_id: conversation.clone(),
            message_id: id.clone(),
            emoji: emoji.to_string(),
            user_id: actor,
            change,
        });
        Ok(())
    }

    async fn mark_read(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
    ) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.fail_next_mutation.take() {
            return Err(error);
        }
        let actor = inner.actor.clone();
        let message = inner.message_mut(conversation, id)?;
        message.read_by.insert(actor.clone());
        inner.broadcast(ChannelEvent::ReadReceiptChanged {
            conversation_id: conversation.clone(),
            message_id: id.clone(),
            user_id: actor,
            change: SetChange::Added,
        });
        Ok(())
    }
}
