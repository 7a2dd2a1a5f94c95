//! Sequential replay over chronological-index space.
//!
//! With no position every message is visible. With position `p`, a message
//! is visible iff its `chrono_index <= p`.

use threadsync_types::{Message, MessageId};

use crate::chrono::ChronoIndex;
use crate::snapshot::Snapshot;

/// Replay cursor for one conversation view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackController {
    position: Option<usize>,
    preloading: bool,
}

impl PlaybackController {
    /// A controller showing everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current position, `None` when not replaying.
    pub fn position(&self) -> Option<usize> {
        self.position
    }

    /// True while replaying.
    pub fn is_active(&self) -> bool {
        self.position.is_some()
    }

    /// Mark the start of the exhaustive backward paging that precedes replay.
    ///
    /// Returns false if a preload is already running.
    pub fn begin_preload(&mut self) -> bool {
        !std::mem::replace(&mut self.preloading, true)
    }

    /// Mark the preload finished.
    pub fn finish_preload(&mut self) {
        self.preloading = false;
    }

    /// True while the history preload runs.
    pub fn is_preloading(&self) -> bool {
        self.preloading
    }

    /// Move to `target` and return the message to center on.
    ///
    /// A target past the loaded range keeps the position and centers on the
    /// newest message.
    pub fn seek(&mut self, target: Option<usize>, chrono: &ChronoIndex) -> Option<MessageId> {
        self.position = target;
        let index = target?;
        let last = chrono.len().checked_sub(1)?;
        chrono.id_at(index.min(last)).cloned()
    }

    /// Reveal one more message. Starts at the oldest message when idle.
    pub fn step(&mut self, chrono: &ChronoIndex) -> Option<MessageId> {
        let last = chrono.len().checked_sub(1)?;
        let next = match self.position {
            None => 0,
            Some(p) => p.saturating_add(1).min(last),
        };
        self.position = Some(next);
        chrono.id_at(next).cloned()
    }

    /// Leave replay; everything becomes visible.
    pub fn stop(&mut self) {
        self.position = None;
    }

    /// True if `message` is revealed at the current position.
    pub fn is_visible(&self, message: &Message) -> bool {
        self.position.map_or(true, |p| message.chrono_index <= p)
    }

    /// Revealed messages, oldest first.
    pub fn visible<'a>(&self, snapshot: &'a Snapshot) -> Vec<&'a Message> {
        snapshot
            .chronological()
            .into_iter()
            .filter(|m| self.is_visible(m))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{msg, snapshot};

    fn six() -> Snapshot {
        snapshot((0..6).map(|i| msg(&format!("m{i}"), None, i * 10)).collect(), false)
    }

    #[test]
    fn everything_visible_without_position() {
        let snap = six();
        let playback = PlaybackController::new();
        assert_eq!(playback.visible(&snap).len(), 6);
    }

    #[test]
    fn seek_reveals_up_to_index() {
        let snap = six();
        let mut playback = PlaybackController::new();

        let target = playback.seek(Some(2), snap.chrono());
        assert_eq!(target, Some(MessageId::new("m2")));
        let visible: Vec<&str> = playback.visible(&snap).iter().map(|m| m.id.as_str()).collect();
        assert_eq!(visible, vec!["m0", "m1", "m2"]);
    }

    #[test]
    fn seek_past_end_centers_on_newest() {
        let snap = six();
        let mut playback = PlaybackController::new();
        assert_eq!(playback.seek(Some(40), snap.chrono()), Some(MessageId::new("m5")));
        assert_eq!(playback.position(), Some(40));
        assert_eq!(playback.visible(&snap).len(), 6);
    }

    #[test]
    fn seek_none_stops_replay() {
        let snap = six();
        let mut playback = PlaybackController::new();
        playback.seek(Some(1), snap.chrono());
        assert_eq!(playback.seek(None, snap.chrono()), None);
        assert!(!playback.is_active());
    }

    #[test]
    fn step_walks_forward_and_clamps() {
        let snap = snapshot(vec![msg("a", None, 1), msg("b", None, 2)], false);
        let mut playback = PlaybackController::new();
        assert_eq!(playback.step(snap.chrono()), Some(MessageId::new("a")));
        assert_eq!(playback.step(snap.chrono()), Some(MessageId::new("b")));
        assert_eq!(playback.step(snap.chrono()), Some(MessageId::new("b")));
        assert_eq!(playback.position(), Some(1));
    }

    #[test]
    fn preload_is_single_flight() {
        let mut playback = PlaybackController::new();
        assert!(playback.begin_preload());
        assert!(!playback.begin_preload());
        playback.finish_preload();
        assert!(!playback.is_preloading());
    }
}
