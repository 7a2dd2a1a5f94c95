//! Headless scroll surface for testing.
//!
//! Lays messages out as fixed-height rows in chronological order. Clones
//! share state, so a test can keep one handle while the engine owns another.

use std::sync::{Arc, Mutex};
use threadsync_core::{ScrollMetrics, ScrollSurface, Snapshot};
use threadsync_types::MessageId;

/// Headless scroll surface for testing.
#[derive(Debug, Default)]
pub struct MockSurface {
    inner: Arc<Mutex<MockSurfaceInner>>,
}

#[derive(Debug)]
struct MockSurfaceInner {
    row_height: f64,
    offset: f64,
    rows: Vec<MessageId>,
    renders: usize,
    offsets_set: Vec<f64>,
    centered: Vec<MessageId>,
    defer_centering: u32,
}

impl Default for MockSurfaceInner {
    fn default() -> Self {
        Self {
            row_height: 20.0,
            offset: 0.0,
            rows: Vec::new(),
            renders: 0,
            offsets_set: Vec::new(),
            centered: Vec::new(),
            defer_centering: 0,
        }
    }
}

impl MockSurface {
    /// Create a surface with 20px rows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a surface with the given row height.
    pub fn with_row_height(row_height: f64) -> Self {
        let surface = Self::default();
        surface.inner.lock().unwrap().row_height = row_height;
        surface
    }

    /// Simulate the viewer scrolling.
    pub fn scroll_to(&self, offset: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.offset = offset;
    }

    /// Current offset.
    pub fn offset(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        inner.offset
    }

    /// Rendered rows, oldest first.
    pub fn rows(&self) -> Vec<MessageId> {
        let inner = self.inner.lock().unwrap();
        inner.rows.clone()
    }

    /// Number of renders so far.
    pub fn render_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.renders
    }

    /// Offsets written by the engine, in order.
    pub fn offsets_set(&self) -> Vec<f64> {
        let inner = self.inner.lock().unwrap();
        inner.offsets_set.clone()
    }

    /// Messages successfully centered, in order.
    pub fn centered(&self) -> Vec<MessageId> {
        let inner = self.inner.lock().unwrap();
        inner.centered.clone()
    }

    /// Make the next `n` centering attempts fail as if the row were not laid
    /// out yet.
    pub fn defer_centering(&self, n: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.defer_centering = n;
    }
}

impl Clone for MockSurface {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ScrollSurface for MockSurface {
    fn metrics(&self) -> ScrollMetrics {
        let inner = self.inner.lock().unwrap();
        ScrollMetrics {
            offset: inner.offset,
            content_height: inner.rows.len() as f64 * inner.row_height,
        }
    }

    fn set_offset(&mut self, offset: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.offset = offset;
        inner.offsets_set.push(offset);
    }

    fn render(&mut self, snapshot: &Snapshot) {
        let mut inner = self.inner.lock().unwrap();
        inner.rows = snapshot
            .chronological()
            .into_iter()
            .map(|m| m.id.clone())
            .collect();
        inner.renders += 1;
    }

    fn center_on(&mut self, id: &MessageId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.defer_centering > 0 {
            inner.defer_centering -= 1;
            return false;
        }
        let Some(row) = inner.rows.iter().position(|r| r == id) else {
            return false;
        };
        inner.offset = row as f64 * inner.row_height;
        inner.centered.push(id.clone());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadsync_types::{Conversation, ConversationId, Message, MessageBody, UserId, WireMessage};

    fn snapshot(n: u64) -> Snapshot {
        let messages = (1..=n)
            .map(|i| {
                let wire = WireMessage {
                    id: MessageId::new(format!("m{i}")),
                    conversation_id: ConversationId::new("general"),
                    parent_id: None,
                    author_id: UserId::new("bob"),
                    body: MessageBody::Plain(String::new()),
                    created_at: i,
                    edited_at: None,
                    deleted: false,
                    reactions: Default::default(),
                    read_by: Default::default(),
                    client_id: None,
                };
                Message::from_wire(wire, format!("m{i}"), false)
            })
            .collect();
        Snapshot::from_messages(
            Conversation::new(ConversationId::new("general")),
            messages,
            false,
        )
    }

    #[test]
    fn content_height_follows_rows() {
        let mut surface = MockSurface::with_row_height(10.0);
        surface.render(&snapshot(4));
        assert_eq!(surface.metrics().content_height, 40.0);
        assert_eq!(surface.render_count(), 1);
    }

    #[test]
    fn centering_needs_a_rendered_row() {
        let mut surface = MockSurface::new();
        assert!(!surface.center_on(&MessageId::new("m2")));

        surface.render(&snapshot(3));
        assert!(surface.center_on(&MessageId::new("m2")));
        assert_eq!(surface.offset(), 20.0);
    }

    #[test]
    fn deferred_centering_fails_then_succeeds() {
        let mut surface = MockSurface::new();
        surface.render(&snapshot(3));
        surface.defer_centering(1);

        assert!(!surface.center_on(&MessageId::new("m1")));
        assert!(surface.center_on(&MessageId::new("m1")));
        assert_eq!(surface.centered(), vec![MessageId::new("m1")]);
    }

    #[test]
    fn clones_share_state() {
        let handle = MockSurface::new();
        let mut owned = handle.clone();
        owned.set_offset(55.0);
        assert_eq!(handle.offset(), 55.0);
        assert_eq!(handle.offsets_set(), vec![55.0]);
    }
}
