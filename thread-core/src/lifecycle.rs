//! Conversation view lifecycle state machine.
//!
//! Pure, side-effect-free: [`SyncState::on_event`] takes an event and
//! returns the new state plus the actions the engine must carry out.
//!
//! ```text
//! Unloaded ──load──▶ Loading ──ok──▶ Ready ◀──▶ {loading-more | mutating | playing}
//!                      ▲  │                │
//!                      │  └─fail (kept)──▶ Ready
//!                      └──────reload───────┘
//! any ──unmount──▶ Unmounted
//! ```
//!
//! Background activity (older page, optimistic round trips, replay) is
//! tracked in [`Activity`] alongside the phase, so a reload does not forget
//! a replay in progress.

/// Work running on a loaded view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Activity {
    /// An older page is in flight.
    pub loading_more: bool,
    /// Optimistic round trips in flight.
    pub mutations: u32,
    /// Replay is active.
    pub playing: bool,
}

/// Phase of a conversation view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Nothing loaded yet.
    #[default]
    Unloaded,
    /// A full snapshot fetch is in flight.
    Loading {
        /// A last-good snapshot is kept and shown meanwhile.
        retained: bool,
        /// Activity carried across the reload.
        activity: Activity,
    },
    /// A snapshot is loaded.
    Ready(Activity),
    /// The view is gone; terminal.
    Unmounted,
}

/// Inputs to the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `load_snapshot` was called.
    LoadRequested,
    /// The snapshot fetch succeeded.
    LoadSucceeded,
    /// The snapshot fetch failed.
    LoadFailed {
        /// User-facing description.
        error: String,
    },
    /// `load_older` claimed a page.
    OlderRequested,
    /// The older page merged, failed or was discarded.
    OlderSettled,
    /// An optimistic round trip started.
    MutationStarted,
    /// An optimistic round trip finished.
    MutationSettled,
    /// Replay started.
    PlaybackStarted,
    /// Replay stopped.
    PlaybackStopped,
    /// A realtime event arrived for this view.
    RealtimeEvent,
    /// The view is going away.
    Unmount,
}

/// Instructions for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Issue the snapshot fetch.
    Fetch,
    /// Issue the older-page fetch.
    FetchOlder,
    /// Apply the event now.
    Apply,
    /// Hold the event until the load settles.
    Queue,
    /// Drop the event; nothing is loaded.
    Reject,
    /// Apply held events in arrival order.
    ReplayQueued,
    /// Keep showing the last-good snapshot.
    RetainLastGood,
    /// Show a non-blocking notice.
    ShowNotice(String),
    /// Clear any notice.
    ClearNotice,
    /// Drop the snapshot and pending work.
    DiscardSnapshot,
}

impl SyncState {
    /// Create a new state machine in the Unloaded state.
    pub fn new() -> Self {
        Self::Unloaded
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: LifecycleEvent) -> (Self, Vec<LifecycleAction>) {
        use LifecycleAction as A;
        use LifecycleEvent as E;

        match (self, event) {
            (Self::Unmounted, _) => (Self::Unmounted, vec![A::Reject]),
            (_, E::Unmount) => (Self::Unmounted, vec![A::DiscardSnapshot]),

            // Loading
            (Self::Unloaded, E::LoadRequested) => (
                Self::Loading {
                    retained: false,
                    activity: Activity::default(),
                },
                vec![A::Fetch],
            ),
            (Self::Ready(activity), E::LoadRequested) => (
                Self::Loading {
                    retained: true,
                    activity,
                },
                vec![A::Fetch],
            ),
            (Self::Loading { retained, activity }, E::LoadRequested) => {
                (Self::Loading { retained, activity }, vec![A::Fetch])
            }
            (Self::Loading { activity, .. }, E::LoadSucceeded) => (
                // A reload supersedes any older page in flight.
                Self::Ready(Activity {
                    loading_more: false,
                    ..activity
                }),
                vec![A::ClearNotice, A::ReplayQueued],
            ),
            (
                Self::Loading {
                    retained: true,
                    activity,
                },
                E::LoadFailed { error },
            ) => (
                Self::Ready(Activity {
                    loading_more: false,
                    ..activity
                }),
                vec![A::RetainLastGood, A::ShowNotice(error), A::ReplayQueued],
            ),
            (
                Self::Loading {
                    retained: false, ..
                },
                E::LoadFailed { error },
            ) => (Self::Unloaded, vec![A::ShowNotice(error)]),

            // Realtime events
            (state @ Self::Ready(_), E::RealtimeEvent) => (state, vec![A::Apply]),
            (state @ Self::Loading { .. }, E::RealtimeEvent) => (state, vec![A::Queue]),
            (Self::Unloaded, E::RealtimeEvent) => (Self::Unloaded, vec![A::Reject]),

            // Background activity
            (Self::Ready(activity), E::OlderRequested) => (
                Self::Ready(Activity {
                    loading_more: true,
                    ..activity
                }),
                vec![A::FetchOlder],
            ),
            (state, event @ (E::OlderSettled
            | E::MutationStarted
            | E::MutationSettled
            | E::PlaybackStarted
            | E::PlaybackStopped)) => (state.with_activity(&event), vec![]),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    fn with_activity(self, event: &LifecycleEvent) -> Self {
        let update = |mut activity: Activity| {
            match event {
                LifecycleEvent::OlderSettled => activity.loading_more = false,
                LifecycleEvent::MutationStarted => activity.mutations += 1,
                LifecycleEvent::MutationSettled => {
                    activity.mutations = activity.mutations.saturating_sub(1)
                }
                LifecycleEvent::PlaybackStarted => activity.playing = true,
                LifecycleEvent::PlaybackStopped => activity.playing = false,
                _ => {}
            }
            activity
        };
        match self {
            Self::Ready(activity) => Self::Ready(update(activity)),
            Self::Loading { retained, activity } => Self::Loading {
                retained,
                activity: update(activity),
            },
            other => other,
        }
    }

    /// True once a snapshot is loaded and no full load is running.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// True while a full load runs.
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading { .. })
    }

    /// Background activity, if loaded or loading.
    pub fn activity(&self) -> Option<Activity> {
        match self {
            Self::Ready(activity) | Self::Loading { activity, .. } => Some(*activity),
            _ => None,
        }
    }

    /// Short name of the phase, with the dominant activity for `Ready`.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading { .. } => "loading",
            Self::Ready(a) if a.playing => "playing",
            Self::Ready(a) if a.loading_more => "loading-more",
            Self::Ready(a) if a.mutations > 0 => "mutating",
            Self::Ready(_) => "ready",
            Self::Unmounted => "unmounted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> SyncState {
        SyncState::Ready(Activity::default())
    }

    #[test]
    fn starts_unloaded() {
        assert!(matches!(SyncState::new(), SyncState::Unloaded));
    }

    #[test]
    fn load_transitions_to_loading_then_ready() {
        let (state, actions) = SyncState::new().on_event(LifecycleEvent::LoadRequested);
        assert!(matches!(state, SyncState::Loading { retained: false, .. }));
        assert_eq!(actions, vec![LifecycleAction::Fetch]);

        let (state, actions) = state.on_event(LifecycleEvent::LoadSucceeded);
        assert!(state.is_ready());
        assert!(actions.contains(&LifecycleAction::ReplayQueued));
    }

    #[test]
    fn events_during_loading_are_queued() {
        let (state, _) = SyncState::new().on_event(LifecycleEvent::LoadRequested);
        let (state, actions) = state.on_event(LifecycleEvent::RealtimeEvent);
        assert!(state.is_loading());
        assert_eq!(actions, vec![LifecycleAction::Queue]);
    }

    #[test]
    fn events_when_unloaded_are_rejected() {
        let (_, actions) = SyncState::new().on_event(LifecycleEvent::RealtimeEvent);
        assert_eq!(actions, vec![LifecycleAction::Reject]);
    }

    #[test]
    fn reload_failure_retains_last_good() {
        let (state, _) = ready().on_event(LifecycleEvent::LoadRequested);
        assert!(matches!(state, SyncState::Loading { retained: true, .. }));

        let (state, actions) = state.on_event(LifecycleEvent::LoadFailed {
            error: "offline".into(),
        });
        assert!(state.is_ready());
        assert!(actions.contains(&LifecycleAction::RetainLastGood));
        assert!(actions.contains(&LifecycleAction::ShowNotice("offline".into())));
        assert!(actions.contains(&LifecycleAction::ReplayQueued));
    }

    #[test]
    fn first_load_failure_returns_to_unloaded() {
        let (state, _) = SyncState::new().on_event(LifecycleEvent::LoadRequested);
        let (state, actions) = state.on_event(LifecycleEvent::LoadFailed {
            error: "offline".into(),
        });
        assert!(matches!(state, SyncState::Unloaded));
        assert!(!actions.contains(&LifecycleAction::ReplayQueued));
    }

    #[test]
    fn activity_is_tracked_across_reload() {
        let (state, _) = ready().on_event(LifecycleEvent::PlaybackStarted);
        let (state, _) = state.on_event(LifecycleEvent::MutationStarted);
        assert_eq!(state.label(), "playing");

        let (state, _) = state.on_event(LifecycleEvent::LoadRequested);
        let (state, _) = state.on_event(LifecycleEvent::LoadSucceeded);
        let activity = state.activity().unwrap();
        assert!(activity.playing);
        assert_eq!(activity.mutations, 1);

        let (state, _) = state.on_event(LifecycleEvent::PlaybackStopped);
        assert_eq!(state.label(), "mutating");
        let (state, _) = state.on_event(LifecycleEvent::MutationSettled);
        assert_eq!(state.label(), "ready");
    }

    #[test]
    fn older_page_marks_loading_more() {
        let (state, actions) = ready().on_event(LifecycleEvent::OlderRequested);
        assert_eq!(state.label(), "loading-more");
        assert_eq!(actions, vec![LifecycleAction::FetchOlder]);

        let (state, _) = state.on_event(LifecycleEvent::OlderSettled);
        assert_eq!(state.label(), "ready");
    }

    #[test]
    fn unmount_is_terminal() {
        let (state, actions) = ready().on_event(LifecycleEvent::Unmount);
        assert!(matches!(state, SyncState::Unmounted));
        assert_eq!(actions, vec![LifecycleAction::DiscardSnapshot]);

        let (state, actions) = state.on_event(LifecycleEvent::LoadRequested);
        assert!(matches!(state, SyncState::Unmounted));
        assert_eq!(actions, vec![LifecycleAction::Reject]);
    }
}
