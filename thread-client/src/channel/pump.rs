//! Channel pump: keeps the realtime link alive and forwards frames.
//!
//! Drives [`LinkState`] from `threadsync-core`. Every transition's actions
//! are queued and executed in order; executing one may feed a new event back
//! into the state machine (a connect attempt resolving, a heartbeat timing
//! out). While the link is open the pump races the next frame against the
//! heartbeat timer and the shutdown signal.

use super::ChannelTransport;
use crate::config::ChannelConfig;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use threadsync_core::{LinkAction, LinkEvent, LinkPolicy, LinkState, LinkStatus};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

/// Receiver of realtime frames.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Handle one raw frame.
    async fn deliver(&self, frame: String);
}

/// Background task owning a [`ChannelTransport`].
pub struct ChannelPump<T, K> {
    transport: T,
    sink: Arc<K>,
    policy: LinkPolicy,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    state: LinkState,
    status: mpsc::UnboundedSender<LinkStatus>,
}

impl<T, K> ChannelPump<T, K>
where
    T: ChannelTransport + 'static,
    K: FrameSink + 'static,
{
    /// Create a pump. Link status changes arrive on the returned receiver.
    pub fn new(
        transport: T,
        sink: Arc<K>,
        config: &ChannelConfig,
    ) -> (Self, mpsc::UnboundedReceiver<LinkStatus>) {
        let (status, status_rx) = mpsc::unbounded_channel();
        let pump = Self {
            transport,
            sink,
            policy: config.link_policy(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            state: LinkState::new(),
            status,
        };
        (pump, status_rx)
    }

    /// Spawn the pump. Send `true` on the returned sender (or drop it) to
    /// close the link and stop the task.
    pub fn spawn(self) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(shutdown_rx));
        (shutdown, handle)
    }

    /// Run until shut down.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut actions = VecDeque::new();
        self.dispatch(LinkEvent::ConnectRequested, &mut actions);

        loop {
            while let Some(action) = actions.pop_front() {
                self.execute(action, &mut actions, &mut heartbeat, &mut shutdown)
                    .await;
            }

            if !self.state.is_open() {
                break;
            }

            let event = tokio::select! {
                biased;
                _ = shutdown.changed() => LinkEvent::CloseRequested,
                frame = self.transport.recv() => match frame {
                    Ok(frame) => LinkEvent::FrameReceived { frame },
                    Err(e) => LinkEvent::Disconnected { reason: e.to_string() },
                },
                _ = heartbeat.tick() => LinkEvent::HeartbeatDue,
            };
            self.dispatch(event, &mut actions);
        }

        tracing::debug!("Channel pump stopped");
    }

    fn dispatch(&mut self, event: LinkEvent, actions: &mut VecDeque<LinkAction>) {
        let state = std::mem::take(&mut self.state);
        let (next, new_actions) = state.on_event(event, &self.policy);
        self.state = next;
        actions.extend(new_actions);
    }

    async fn execute(
        &mut self,
        action: LinkAction,
        actions: &mut VecDeque<LinkAction>,
        heartbeat: &mut Interval,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        match action {
            LinkAction::Connect => {
                let event = match self.transport.connect().await {
                    Ok(()) => {
                        heartbeat.reset();
                        LinkEvent::ConnectSucceeded
                    }
                    Err(e) => LinkEvent::ConnectFailed {
                        error: e.to_string(),
                    },
                };
                self.dispatch(event, actions);
            }
            LinkAction::Close => {
                if let Err(e) = self.transport.close().await {
                    tracing::debug!("Channel close failed: {}", e);
                }
            }
            LinkAction::SendHeartbeat => {
                let event =
                    match tokio::time::timeout(self.heartbeat_timeout, self.transport.heartbeat())
                        .await
                    {
                        Ok(Ok(())) => LinkEvent::HeartbeatAcked,
                        Ok(Err(e)) => {
                            tracing::debug!("Heartbeat failed: {}", e);
                            LinkEvent::HeartbeatMissed
                        }
                        Err(_) => {
                            tracing::debug!("Heartbeat timed out");
                            LinkEvent::HeartbeatMissed
                        }
                    };
                self.dispatch(event, actions);
            }
            LinkAction::DeliverFrame(frame) => {
                self.sink.deliver(frame).await;
            }
            LinkAction::StartReconnectTimer { delay } => {
                let shutdown_requested = *shutdown.borrow();
                let event = if shutdown_requested {
                    LinkEvent::CloseRequested
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => LinkEvent::ReconnectTimer,
                        _ = shutdown.changed() => LinkEvent::CloseRequested,
                    }
                };
                self.dispatch(event, actions);
            }
            LinkAction::CancelReconnect => {}
            LinkAction::ReportStatus(status) => {
                match &status {
                    LinkStatus::Open => tracing::info!("Channel open"),
                    LinkStatus::ConnectFailed { attempt, error } => {
                        tracing::warn!("Channel connect attempt {} failed: {}", attempt, error)
                    }
                    LinkStatus::Lost { reason } => tracing::warn!("Channel lost: {}", reason),
                    LinkStatus::Closed => tracing::info!("Channel closed"),
                }
                // Nobody listening is fine.
                let _ = self.status.send(status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn frames(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FrameSink for Recorder {
        async fn deliver(&self, frame: String) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    fn start(
        channel: &MockChannel,
    ) -> (
        Arc<Recorder>,
        mpsc::UnboundedReceiver<LinkStatus>,
        watch::Sender<bool>,
        JoinHandle<()>,
    ) {
        let recorder = Arc::new(Recorder::default());
        let (pump, status) =
            ChannelPump::new(channel.clone(), recorder.clone(), &ChannelConfig::default());
        let (shutdown, handle) = pump.spawn();
        (recorder, status, shutdown, handle)
    }

    // ===========================================
    // Delivery
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn forwards_frames_in_order() {
        let channel = MockChannel::new();
        channel.push_frame("a".into());
        channel.push_frame("b".into());
        let (recorder, mut status, shutdown, handle) = start(&channel);

        assert_eq!(status.recv().await, Some(LinkStatus::Open));
        channel.push_frame("c".into());
        while recorder.frames().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.frames(), vec!["a", "b", "c"]);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(status.recv().await, Some(LinkStatus::Closed));
    }

    // ===========================================
    // Reconnection
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_server_drop() {
        let channel = MockChannel::new();
        let (_recorder, mut status, shutdown, handle) = start(&channel);
        assert_eq!(status.recv().await, Some(LinkStatus::Open));

        channel.disconnect();
        assert!(matches!(status.recv().await, Some(LinkStatus::Lost { .. })));
        assert_eq!(status.recv().await, Some(LinkStatus::Open));
        assert_eq!(channel.connect_count(), 2);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retries_failed_connect() {
        let channel = MockChannel::new();
        channel.fail_next_connect("refused");
        let (_recorder, mut status, shutdown, handle) = start(&channel);

        assert!(matches!(
            status.recv().await,
            Some(LinkStatus::ConnectFailed { attempt: 1, .. })
        ));
        assert_eq!(status.recv().await, Some(LinkStatus::Open));

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drops_link_after_missed_heartbeats() {
        let channel = MockChannel::new();
        channel.fail_heartbeats(2);
        let (_recorder, mut status, shutdown, handle) = start(&channel);
        assert_eq!(status.recv().await, Some(LinkStatus::Open));

        match status.recv().await {
            Some(LinkStatus::Lost { reason }) => assert!(reason.contains("heartbeats")),
            other => panic!("expected Lost, got {other:?}"),
        }
        assert_eq!(status.recv().await, Some(LinkStatus::Open));

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_shutdown_sender_stops_pump() {
        let channel = MockChannel::new();
        let (_recorder, mut status, shutdown, handle) = start(&channel);
        assert_eq!(status.recv().await, Some(LinkStatus::Open));

        drop(shutdown);
        handle.await.unwrap();
        assert!(!channel.is_connected());
    }
}
