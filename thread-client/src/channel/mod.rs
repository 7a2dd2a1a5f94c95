//! Realtime channel abstraction.
//!
//! The server pushes [`ChannelEvent`](threadsync_types::ChannelEvent) frames
//! as JSON text over a long-lived connection. This module provides:
//! - [`ChannelTransport`]: the connection itself (WebSocket, mock, ...)
//! - [`ChannelPump`]: the task that keeps the connection alive and hands
//!   every frame to a [`FrameSink`], usually the sync engine
//!
//! # Example
//!
//! ```ignore
//! let channel = MockChannel::new();
//! let (pump, mut status) = ChannelPump::new(channel.clone(), engine.clone(), &config.channel);
//! let (shutdown, handle) = pump.spawn();
//! channel.push_frame(frame);
//! ```

mod mock;
mod pump;

pub use mock::MockChannel;
pub use pump::{ChannelPump, FrameSink};

use async_trait::async_trait;
use thiserror::Error;

/// Channel errors.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// The server closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Sending a frame failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receiving a frame failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The heartbeat was not answered.
    #[error("heartbeat failed: {0}")]
    HeartbeatFailed(String),
}

/// Connection carrying realtime frames.
///
/// `recv` must be cancel-safe: the pump races it against timers and drops
/// the future when a timer wins.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Open the connection.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Send a text frame.
    async fn send(&self, frame: &str) -> Result<(), ChannelError>;

    /// Wait for the next text frame.
    async fn recv(&self) -> Result<String, ChannelError>;

    /// Ping the server and wait for the reply.
    async fn heartbeat(&self) -> Result<(), ChannelError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection.
    async fn close(&self) -> Result<(), ChannelError>;
}
