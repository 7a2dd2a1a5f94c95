//! # thread-client
//!
//! Client library for threadsync, the message sync and thread reconstruction
//! engine.
//!
//! This is the library applications embed to keep a conversation view
//! consistent with the server.
//!
//! ## Features
//!
//! - **Snapshot + Realtime Reconciliation**: REST pages and channel events
//!   converge on one thread tree
//! - **Optimistic Actions**: send, edit, delete, react and mark-read show
//!   immediately and roll back on failure
//! - **Echo Suppression**: the viewer's own round trips are not applied twice
//! - **E2E Encryption**: XChaCha20-Poly1305 bodies with per-conversation keys
//! - **Pure State Machines**: uses thread-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use threadsync_client::{EngineConfig, Keyring, MockApi, SyncEngine};
//!
//! let engine = SyncEngine::new(EngineConfig::default(), viewer, MockApi::new(), Keyring::new());
//!
//! // Load the newest page
//! engine.load_snapshot(&conversation).await?;
//!
//! // Post a reply
//! engine.optimistic_send("on it", Some(parent_id)).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod surface;

pub use api::{ApiError, MockApi, RestApi};
pub use channel::{ChannelError, ChannelPump, ChannelTransport, FrameSink, MockChannel};
pub use config::{ChannelConfig, ConfigError, EngineConfig, PlaybackConfig, SyncConfig};
pub use crypto::{CryptoError, Keyring, MessageCipher, MessageKey, KEY_SIZE, NONCE_SIZE};
pub use engine::{
    EngineError, EventDisposition, LoadOutcome, PageOutcome, SeekOutcome, SyncEngine,
};
pub use surface::MockSurface;
