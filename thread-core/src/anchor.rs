//! Scroll anchoring around snapshot changes the viewer did not cause.
//!
//! The engine captures the viewport before applying such a change, renders,
//! then restores before returning control, so the viewer never sees content
//! jump. Only one capture is pending at a time; a second capture before the
//! restore replaces the first.

use threadsync_types::MessageId;

use crate::snapshot::Snapshot;

/// Position and size of a scroll container.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScrollMetrics {
    /// Distance scrolled from the top.
    pub offset: f64,
    /// Total height of the scrolled content.
    pub content_height: f64,
}

/// Minimal capability the engine needs from a message list view.
pub trait ScrollSurface {
    /// Current scroll position and content height.
    fn metrics(&self) -> ScrollMetrics;

    /// Jump to `offset`.
    fn set_offset(&mut self, offset: f64);

    /// Re-render after the snapshot changed.
    fn render(&mut self, _snapshot: &Snapshot) {}

    /// Scroll so `id` is centered. Returns false if its row is not rendered yet.
    fn center_on(&mut self, _id: &MessageId) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AnchorMode {
    /// Keep the exact offset.
    Preserve,
    /// Content is being added above the viewport; shift by the height delta.
    Prepend,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Capture {
    metrics: ScrollMetrics,
    mode: AnchorMode,
}

/// Single-slot scroll anchor.
#[derive(Debug, Clone, Default)]
pub struct ScrollAnchor {
    pending: Option<Capture>,
}

impl ScrollAnchor {
    /// Create an anchor with nothing captured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the current offset, to be restored verbatim.
    pub fn capture<S: ScrollSurface + ?Sized>(&mut self, surface: &S) {
        self.pending = Some(Capture {
            metrics: surface.metrics(),
            mode: AnchorMode::Preserve,
        });
    }

    /// Remember offset and content height before older messages are
    /// prepended.
    pub fn capture_for_prepend<S: ScrollSurface + ?Sized>(&mut self, surface: &S) {
        self.pending = Some(Capture {
            metrics: surface.metrics(),
            mode: AnchorMode::Prepend,
        });
    }

    /// Apply the pending capture to a re-rendered surface.
    ///
    /// Returns the offset set, or `None` if nothing was captured.
    pub fn restore<S: ScrollSurface + ?Sized>(&mut self, surface: &mut S) -> Option<f64> {
        let capture = self.pending.take()?;
        let offset = match capture.mode {
            AnchorMode::Preserve => capture.metrics.offset,
            AnchorMode::Prepend => {
                let grown = surface.metrics().content_height - capture.metrics.content_height;
                (capture.metrics.offset + grown).max(0.0)
            }
        };
        surface.set_offset(offset);
        Some(offset)
    }

    /// Drop the pending capture.
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// True if a capture awaits restore.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Viewport {
        offset: f64,
        height: f64,
        drift: f64,
    }

    impl ScrollSurface for Viewport {
        fn metrics(&self) -> ScrollMetrics {
            ScrollMetrics {
                offset: self.offset,
                content_height: self.height,
            }
        }

        fn set_offset(&mut self, offset: f64) {
            self.offset = offset;
        }
    }

    impl Viewport {
        fn grow(&mut self, by: f64) {
            self.height += by;
            self.offset += self.drift;
        }
    }

    #[test]
    fn restores_exact_offset() {
        let mut view = Viewport {
            offset: 120.0,
            height: 1000.0,
            drift: 37.0,
        };
        let mut anchor = ScrollAnchor::new();
        anchor.capture(&view);

        view.grow(40.0);
        assert_eq!(anchor.restore(&mut view), Some(120.0));
        assert_eq!(view.offset, 120.0);
        assert!(!anchor.is_pending());
    }

    #[test]
    fn prepend_shifts_by_height_delta() {
        let mut view = Viewport {
            offset: 0.0,
            height: 500.0,
            drift: 0.0,
        };
        let mut anchor = ScrollAnchor::new();
        anchor.capture_for_prepend(&view);

        view.grow(300.0);
        assert_eq!(anchor.restore(&mut view), Some(300.0));
    }

    #[test]
    fn second_capture_overwrites_first() {
        let mut view = Viewport {
            offset: 10.0,
            height: 100.0,
            drift: 0.0,
        };
        let mut anchor = ScrollAnchor::new();
        anchor.capture(&view);
        view.offset = 55.0;
        anchor.capture(&view);

        view.offset = 0.0;
        assert_eq!(anchor.restore(&mut view), Some(55.0));
    }

    #[test]
    fn restore_without_capture_is_noop() {
        let mut view = Viewport {
            offset: 10.0,
            height: 100.0,
            drift: 0.0,
        };
        let mut anchor = ScrollAnchor::new();
        assert_eq!(anchor.restore(&mut view), None);

        anchor.capture(&view);
        anchor.cancel();
        assert_eq!(anchor.restore(&mut view), None);
        assert_eq!(view.offset, 10.0);
    }
}
