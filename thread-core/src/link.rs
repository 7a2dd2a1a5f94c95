//! Realtime channel link state machine.
//!
//! Pure, side-effect-free: the channel pump in `thread-client` feeds it
//! transport events and timer ticks and carries out the returned actions.
//! Reconnects use a fixed interval, and an open link is dropped after too
//! many unanswered heartbeats.

use std::time::Duration;

/// Reconnect and heartbeat tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkPolicy {
    /// Delay before every reconnect attempt.
    pub reconnect_interval: Duration,
    /// Unanswered heartbeats tolerated before the link counts as lost.
    pub max_missed_heartbeats: u32,
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(3),
            max_missed_heartbeats: 2,
        }
    }
}

/// Link state - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Not connected and not trying.
    #[default]
    Disconnected,
    /// Connection attempt in progress.
    Connecting {
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// Connected and delivering frames.
    Open {
        /// Heartbeats sent without a reply.
        missed_heartbeats: u32,
    },
    /// Waiting for the reconnect timer.
    Reconnecting {
        /// Attempts made so far.
        attempt: u32,
    },
}

/// Inputs to the link state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Start connecting.
    ConnectRequested,
    /// Transport connected.
    ConnectSucceeded,
    /// Transport connect failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// A frame arrived.
    FrameReceived {
        /// Raw frame text.
        frame: String,
    },
    /// Heartbeat timer fired.
    HeartbeatDue,
    /// Heartbeat answered.
    HeartbeatAcked,
    /// Heartbeat failed or timed out.
    HeartbeatMissed,
    /// Transport dropped.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// Reconnect timer fired.
    ReconnectTimer,
    /// Caller asked to shut the link down.
    CloseRequested,
}

/// Status changes reported to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// The link is up.
    Open,
    /// A connect attempt failed.
    ConnectFailed {
        /// Attempt number.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
    /// An open link was lost.
    Lost {
        /// Reason for the loss.
        reason: String,
    },
    /// The link was closed on request.
    Closed,
}

/// Actions to be executed by the channel pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Open the transport.
    Connect,
    /// Close the transport.
    Close,
    /// Send a heartbeat.
    SendHeartbeat,
    /// Hand a frame to the engine.
    DeliverFrame(String),
    /// Start a timer for reconnection.
    StartReconnectTimer {
        /// Delay before attempting reconnection.
        delay: Duration,
    },
    /// Cancel any pending reconnect timer.
    CancelReconnect,
    /// Report a status change.
    ReportStatus(LinkStatus),
}

impl LinkState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: LinkEvent, policy: &LinkPolicy) -> (Self, Vec<LinkAction>) {
        let retry = LinkAction::StartReconnectTimer {
            delay: policy.reconnect_interval,
        };
        match (self, event) {
            (Self::Disconnected, LinkEvent::ConnectRequested) => {
                (Self::Connecting { attempt: 1 }, vec![LinkAction::Connect])
            }

            // From Connecting
            (Self::Connecting { .. }, LinkEvent::ConnectSucceeded) => (
                Self::Open {
                    missed_heartbeats: 0,
                },
                vec![LinkAction::ReportStatus(LinkStatus::Open)],
            ),
            (Self::Connecting { attempt }, LinkEvent::ConnectFailed { error }) => (
                Self::Reconnecting { attempt },
                vec![
                    LinkAction::ReportStatus(LinkStatus::ConnectFailed { attempt, error }),
                    retry,
                ],
            ),

            // From Open
            (Self::Open { .. }, LinkEvent::FrameReceived { frame }) => (
                Self::Open {
                    missed_heartbeats: 0,
                },
                vec![LinkAction::DeliverFrame(frame)],
            ),
            (state @ Self::Open { .. }, LinkEvent::HeartbeatDue) => {
                (state, vec![LinkAction::SendHeartbeat])
            }
            (Self::Open { .. }, LinkEvent::HeartbeatAcked) => (
                Self::Open {
                    missed_heartbeats: 0,
                },
                vec![],
            ),
            (Self::Open { missed_heartbeats }, LinkEvent::HeartbeatMissed) => {
                let missed = missed_heartbeats.saturating_add(1);
                if missed >= policy.max_missed_heartbeats {
                    (
                        Self::Reconnecting { attempt: 0 },
                        vec![
                            LinkAction::Close,
                            LinkAction::ReportStatus(LinkStatus::Lost {
                                reason: format!("{missed} heartbeats missed"),
                            }),
                            retry,
                        ],
                    )
                } else {
                    (
                        Self::Open {
                            missed_heartbeats: missed,
                        },
                        vec![],
                    )
                }
            }
            (Self::Open { .. }, LinkEvent::Disconnected { reason }) => (
                Self::Reconnecting { attempt: 0 },
                vec![LinkAction::ReportStatus(LinkStatus::Lost { reason }), retry],
            ),
            (Self::Open { .. }, LinkEvent::CloseRequested) => (
                Self::Disconnected,
                vec![
                    LinkAction::Close,
                    LinkAction::ReportStatus(LinkStatus::Closed),
                ],
            ),

            // From Reconnecting
            (Self::Reconnecting { attempt }, LinkEvent::ReconnectTimer) => (
                Self::Connecting {
                    attempt: attempt.saturating_add(1),
                },
                vec![LinkAction::Connect],
            ),
            (Self::Connecting { .. } | Self::Reconnecting { .. }, LinkEvent::CloseRequested) => {
                (Self::Disconnected, vec![LinkAction::CancelReconnect])
            }

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if currently open.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Check if currently trying to connect.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Reconnecting { .. })
    }
}
