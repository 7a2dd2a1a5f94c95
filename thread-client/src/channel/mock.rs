//! Mock realtime channel for testing.
//!
//! Frames pushed with [`MockChannel::push_frame`] are handed out by `recv`
//! in order. `recv` waits for frames instead of failing on an empty queue,
//! so the channel behaves like a quiet live connection.

use super::{ChannelError, ChannelTransport};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Mock realtime channel for testing.
#[derive(Debug, Default)]
pub struct MockChannel {
    inner: Arc<Mutex<MockChannelInner>>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct MockChannelInner {
    connected: bool,
    connects: usize,
    heartbeats: usize,
    frames: VecDeque<String>,
    sent: Vec<String>,
    fail_next_connect: Option<String>,
    fail_next_recv: Option<String>,
    failing_heartbeats: u32,
}

impl MockChannel {
    /// Create a disconnected channel with no frames.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame from the server.
    pub fn push_frame(&self, frame: String) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.frames.push_back(frame);
        }
        self.notify.notify_waiters();
    }

    /// Drop the connection from the server side.
    pub fn disconnect(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.connected = false;
        }
        self.notify.notify_waiters();
    }

    /// Frames sent by the client.
    pub fn sent_frames(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.sent.clone()
    }

    /// Frames not yet received.
    pub fn pending_frames(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.frames.len()
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.connects
    }

    /// Answered heartbeats so far.
    pub fn heartbeat_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.heartbeats
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_connect = Some(error.to_string());
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_recv = Some(error.to_string());
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Leave the next `n` heartbeats unanswered.
    pub fn fail_heartbeats(&self, n: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.failing_heartbeats = n;
    }
}

impl Clone for MockChannel {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            notify: Arc::clone(&self.notify),
        }
    }
}

#[async_trait]
impl ChannelTransport for MockChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.fail_next_connect.take() {
            return Err(ChannelError::ConnectionFailed(error));
        }
        inner.connected = true;
        inner.connects += 1;
        Ok(())
    }

    async fn send(&self, frame: &str) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(ChannelError::NotConnected);
        }
        inner.sent.push(frame.to_string());
        Ok(())
    }

    async fn recv(&self) -> Result<String, ChannelError> {
        loop {
            // Registered before checking so a push in between is not missed.
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if !inner.connected {
                    return Err(ChannelError::ConnectionClosed);
                }
                if let Some(error) = inner.fail_next_recv.take() {
                    return Err(ChannelError::ReceiveFailed(error));
                }
                if let Some(frame) = inner.frames.pop_front() {
                    return Ok(frame);
                }
            }
            notified.await;
        }
    }

    async fn heartbeat(&self) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(ChannelError::NotConnected);
        }
        if inner.failing_heartbeats > 0 {
            inner.failing_heartbeats -= 1;
            return Err(ChannelError::HeartbeatFailed("no pong".into()));
        }
        inner.heartbeats += 1;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.connected
    }

    async fn close(&self) -> Result<(), ChannelError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.connected = false;
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_frames_in_order() {
        let channel = MockChannel::new();
        channel.connect().await.unwrap();
        channel.push_frame("one".into());
        channel.push_frame("two".into());

        assert_eq!(channel.recv().await.unwrap(), "one");
        assert_eq!(channel.recv().await.unwrap(), "two");
        assert_eq!(channel.pending_frames(), 0);
    }

    #[tokio::test]
    async fn recv_waits_for_a_frame() {
        let channel = MockChannel::new();
        channel.connect().await.unwrap();

        let reader = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.recv().await })
        };
        tokio::task::yield_now().await;
        channel.push_frame("late".into());

        let frame = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame, "late");
    }

    #[tokio::test]
    async fn disconnect_wakes_reader() {
        let channel = MockChannel::new();
        channel.connect().await.unwrap();

        let reader = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.recv().await })
        };
        tokio::task::yield_now().await;
        channel.disconnect();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ChannelError::ConnectionClosed)));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn recv_requires_connection() {
        let channel = MockChannel::new();
        channel.push_frame("queued".into());
        assert!(channel.recv().await.is_err());

        channel.connect().await.unwrap();
        assert_eq!(channel.recv().await.unwrap(), "queued");
    }

    #[tokio::test]
    async fn forced_failures_fire_once() {
        let channel = MockChannel::new();
        channel.fail_next_connect("refused");
        assert!(matches!(
            channel.connect().await,
            Err(ChannelError::ConnectionFailed(_))
        ));
        channel.connect().await.unwrap();
        assert_eq!(channel.connect_count(), 1);

        channel.fail_heartbeats(1);
        assert!(channel.heartbeat().await.is_err());
        assert!(channel.heartbeat().await.is_ok());
        assert_eq!(channel.heartbeat_count(), 1);
    }

    #[tokio::test]
    async fn send_records_frames() {
        let channel = MockChannel::new();
        assert!(matches!(
            channel.send("x").await,
            Err(ChannelError::NotConnected)
        ));
        channel.connect().await.unwrap();
        channel.send("subscribe").await.unwrap();
        assert_eq!(channel.sent_frames(), vec!["subscribe".to_string()]);
    }
}
