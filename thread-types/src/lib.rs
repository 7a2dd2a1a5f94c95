//! # thread-types
//!
//! Data model for the threadsync message synchronization engine.
//!
//! This crate provides the foundational types used across all threadsync crates:
//! - [`ConversationId`], [`MessageId`], [`UserId`], [`ClientId`] - Identity types
//! - [`Message`], [`WireMessage`], [`Conversation`] - The view model and its wire form
//! - [`ChannelEvent`] - Tagged union delivered over the realtime channel
//! - [`FetchRequest`], [`FetchPage`] - REST history paging
//! - [`SyncError`] - Error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod events;
mod ids;
mod model;

pub use error::SyncError;
pub use events::{ChannelEvent, FetchPage, FetchRequest, OutgoingMessage, SetChange};
pub use ids::{ClientId, ConversationId, MessageId, UserId};
pub use model::{
    Conversation, DeliveryState, EncryptedPayload, EncryptionState, Message, MessageBody,
    Privacy, Timestamp, WireMessage, UNDECRYPTABLE_PLACEHOLDER,
};
