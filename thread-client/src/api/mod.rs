//! REST API abstraction.
//!
//! The engine consumes history and performs mutations through the
//! [`RestApi`] trait. The wire protocol is the implementor's business; the
//! engine only relies on the request and response shapes below.
//!
//! # Example
//!
//! ```ignore
//! let api = MockApi::new();
//! api.seed(conversation, history);
//! let page = api.fetch_snapshot(&id, FetchRequest::latest(50)).await?;
//! ```

mod mock;

pub use mock::MockApi;

use async_trait::async_trait;
use thiserror::Error;
use threadsync_types::{
    ConversationId, FetchPage, FetchRequest, MessageBody, MessageId, OutgoingMessage, SetChange,
    Timestamp, WireMessage,
};

/// REST errors.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The request did not reach the server or the response was lost.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with an error status.
    #[error("server returned {code}: {message}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Server-provided detail.
        message: String,
    },

    /// The conversation or message does not exist on the server.
    #[error("not found: {0}")]
    NotFound(String),

    /// The response body could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),
}

/// Server operations the engine depends on.
#[async_trait]
pub trait RestApi: Send + Sync {
    /// Fetch one page of history, newest first when `before` is `None`.
    async fn fetch_snapshot(
        &self,
        conversation: &ConversationId,
        request: FetchRequest,
    ) -> Result<FetchPage, ApiError>;

    /// Post a message. Returns the server's copy with its assigned id.
    async fn send_message(&self, message: OutgoingMessage) -> Result<WireMessage, ApiError>;

    /// Replace a message body. Returns the server's edit time.
    async fn edit_message(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
        body: MessageBody,
    ) -> Result<Timestamp, ApiError>;

    /// Delete a message.
    async fn delete_message(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
    ) -> Result<(), ApiError>;

    /// Add or remove the caller's reaction.
    async fn set_reaction(
        &self,
        conversation: &ConversationId,
        id: &MessageId,
        emoji: &str,
        change: SetChange,
    ) -> Result<(), ApiError>;

    /// Mark a message read by the caller.
    async fn mark_read(&self, conversation: &ConversationId, id: &MessageId)
        -> Result<(), ApiError>;
}
